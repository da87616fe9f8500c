//! Mode tracking for one connected device.

use std::sync::Arc;

use log::debug;

use crate::channel::{CommandChannel, CommandResult};
use crate::error::SwitchError;
use crate::translate::{Params, render_template};
use crate::vendor::{Mode, VendorProfile};

/// A planned transition step with its rendered command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionStep {
    pub from: Mode,
    pub to: Mode,
    pub command: String,
}

/// Current mode of a device plus the profile that defines its legal moves.
///
/// The mode only changes after the device confirms it with a prompt of the
/// target mode.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    profile: Arc<VendorProfile>,
    mode: Mode,
}

impl SessionStateMachine {
    pub fn new(profile: Arc<VendorProfile>, mode: Mode) -> Self {
        Self { profile, mode }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn profile(&self) -> &Arc<VendorProfile> {
        &self.profile
    }

    pub fn can_reach(&self, target: Mode) -> bool {
        self.profile.path(self.mode, target).is_some()
    }

    /// Rendered steps from the current mode to `target`. Fails without side
    /// effects if no chain of edges exists or a placeholder is unbound.
    pub fn plan(&self, target: Mode, params: &Params) -> Result<Vec<TransitionStep>, SwitchError> {
        let path = self
            .profile
            .path(self.mode, target)
            .ok_or(SwitchError::InvalidTransition {
                from: self.mode,
                to: target,
            })?;
        path.into_iter()
            .map(|(from, to, template)| {
                let command = render_template(template, params).map_err(|parameter| {
                    SwitchError::MissingParameter {
                        operation: format!("transition {from} -> {to}"),
                        parameter,
                    }
                })?;
                Ok(TransitionStep { from, to, command })
            })
            .collect()
    }

    /// Adopts a mode reported by a prompt outside a transition, e.g. after
    /// the caller dispatched `end` directly. Returns the previous mode if it
    /// changed.
    pub fn observe(&mut self, mode: Mode) -> Option<Mode> {
        if mode == self.mode {
            return None;
        }
        let previous = self.mode;
        self.mode = mode;
        Some(previous)
    }

    /// Drives the device to `target`, one edge at a time.
    ///
    /// Each confirmed hop updates the mode, so a failure part way leaves the
    /// mode at the last hop the device confirmed. A hop that times out fails
    /// with `TransitionTimeout`; one that ends at another prompt fails with
    /// `UnexpectedPrompt`.
    pub async fn request_transition(
        &mut self,
        channel: &mut CommandChannel,
        target: Mode,
        params: &Params,
    ) -> Result<Vec<CommandResult>, SwitchError> {
        let steps = self.plan(target, params)?;
        let mut results = Vec::with_capacity(steps.len());

        for step in steps {
            debug!(
                "{} transition {} -> {} via {:?}",
                self.profile.id(),
                step.from,
                step.to,
                step.command
            );
            let result = match channel.send(&step.command, step.from, Some(step.to)).await {
                Ok(result) => result,
                Err(SwitchError::CommandTimeout { output, .. }) => {
                    return Err(SwitchError::TransitionTimeout {
                        target: step.to,
                        output,
                    });
                }
                Err(err) => return Err(err),
            };
            if result.mode != step.to {
                return Err(SwitchError::UnexpectedPrompt {
                    expected: step.to,
                    observed: Some(result.mode),
                    prompt: result.prompt,
                    output: result.output,
                });
            }
            self.mode = step.to;
            results.push(result);
        }
        Ok(results)
    }
}
