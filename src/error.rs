//! Error types for switch sessions, vendor profiles and translation.
//!
//! [`TransportError`] is what a transport provider reports. [`SwitchError`]
//! is what the rest of the crate returns; transport failures are wrapped into
//! it and are the only errors that take a session down.

use thiserror::Error;

use crate::vendor::{Mode, VendorId};

/// Errors reported by a byte transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The transport could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// No bytes arrived within the requested read timeout.
    ///
    /// This is a normal outcome of a bounded read, not a failure of the link.
    #[error("read timed out")]
    Timeout,

    /// Writing to the transport failed.
    #[error("write failed: {0}")]
    Write(String),

    /// The transport has been closed, either locally or by the peer.
    #[error("transport closed")]
    Closed,

    /// An I/O error occurred on the underlying stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error occurred in the async-ssh2-tokio library.
    #[error("async ssh2 error: {0}")]
    Ssh2Error(#[from] async_ssh2_tokio::Error),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    RusshError(#[from] russh::Error),
}

/// Errors that can occur while driving a switch session.
#[derive(Error, Debug)]
pub enum SwitchError {
    /// The transport is unreachable. The session never reaches `active`.
    #[error("connect error: {0}")]
    Connect(String),

    /// Two or more vendors scored equally during detection.
    ///
    /// The caller may retry with an explicit vendor selection.
    #[error("ambiguous vendor, candidates: {candidates:?}")]
    AmbiguousVendor { candidates: Vec<VendorId> },

    /// No registered vendor matched the banner or the prompt.
    #[error("unknown vendor, last prompt line: {prompt:?}")]
    UnknownVendor { prompt: String },

    /// No path of transitions leads from the current mode to the target.
    ///
    /// Session state is left untouched.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: Mode, to: Mode },

    /// A transition command did not produce any prompt in time.
    #[error("transition to {target} timed out, partial output: {output:?}")]
    TransitionTimeout { target: Mode, output: String },

    /// A prompt was observed, but it does not belong to the expected mode.
    #[error("expected {expected} prompt, got {observed:?} ({prompt:?})")]
    UnexpectedPrompt {
        expected: Mode,
        observed: Option<Mode>,
        prompt: String,
        output: String,
    },

    /// Neither the inactivity nor the absolute deadline saw a prompt.
    ///
    /// The session stays active and the partial output is returned.
    #[error("command {command:?} timed out, partial output: {output:?}")]
    CommandTimeout { command: String, output: String },

    /// The session is not in the `active` state.
    #[error("session {id} is not active ({status})")]
    SessionNotActive { id: String, status: String },

    /// No session with the given id is known, active or retired.
    #[error("session {0} not found")]
    SessionNotFound(String),

    /// The command is dangerous or unclassified and was not confirmed.
    #[error("command {command:?} is {class} and requires confirmation")]
    ConfirmationRequired { command: String, class: String },

    /// The operation name is not present in the translation table.
    #[error("unknown operation {0}")]
    UnknownOperation(String),

    /// The operation exists but the vendor has no template for it.
    #[error("operation {operation} is not supported on {vendor}")]
    OperationNotSupported { operation: String, vendor: VendorId },

    /// A template placeholder was not bound by the supplied parameters.
    #[error("operation {operation} requires parameter {parameter}")]
    MissingParameter { operation: String, parameter: String },

    /// A parameter value cannot be rendered into the template, such as a
    /// value with spaces where the command expects one token.
    #[error("operation {operation} cannot use {value:?} for parameter {parameter}")]
    InvalidParameter {
        operation: String,
        parameter: String,
        value: String,
    },

    /// No template in the table structurally matches the command.
    #[error("no equivalent found for {command:?} from {source_vendor}")]
    NoEquivalentFound {
        command: String,
        source_vendor: VendorId,
    },

    /// The in-flight operation was cancelled and the transport closed.
    #[error("cancelled")]
    Cancelled,

    /// A vendor profile failed validation.
    #[error("invalid profile {vendor}: {reason}")]
    InvalidProfile { vendor: String, reason: String },

    /// The vendor is not present in the registry.
    #[error("vendor {0} is not registered")]
    VendorNotRegistered(VendorId),

    /// A profile with the same id was already registered.
    #[error("vendor {0} is already registered")]
    DuplicateVendor(VendorId),

    /// A transport level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Internal error (lock poisoning, encode failures, worker loss).
    #[error("internal error: {0}")]
    InternalServerError(String),
}

impl SwitchError {
    /// Returns true if the error takes the session down to `failed`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SwitchError::Transport(_) | SwitchError::Cancelled | SwitchError::Connect(_)
        )
    }

    pub(crate) fn invalid_profile(vendor: impl Into<String>, reason: impl Into<String>) -> Self {
        SwitchError::InvalidProfile {
            vendor: vendor.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_and_cancellation_are_fatal() {
        assert!(SwitchError::Transport(TransportError::Closed).is_fatal());
        assert!(SwitchError::Cancelled.is_fatal());
        assert!(
            !SwitchError::CommandTimeout {
                command: "show version".to_string(),
                output: String::new(),
            }
            .is_fatal()
        );
        assert!(
            !SwitchError::InvalidTransition {
                from: Mode::User,
                to: Mode::Privileged,
            }
            .is_fatal()
        );
    }
}
