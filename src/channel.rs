//! Command channel: write a command, then read until a prompt shows up.
//!
//! The read loop runs over an accumulating byte buffer. After each chunk the
//! cleaned tail line is tested, in order, against the profile's pager
//! markers, its interactive input prompts and finally its prompt grammar.
//! Two deadlines bound the loop: silence between chunks (inactivity) and
//! total elapsed time (absolute).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use once_cell::sync::Lazy;
use regex::bytes;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::ChannelOptions;
use crate::error::{SwitchError, TransportError};
use crate::session::SessionRecorder;
use crate::transport::Transport;
use crate::vendor::{InputResponse, Mode, VendorProfile};

/// Terminal control sequences and telnet option negotiation.
pub static ANSI_ESCAPE: Lazy<bytes::Regex> = Lazy::new(|| {
    match bytes::Regex::new(
        r"(?-u)\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()][0-9A-Za-z]|\x1b[=>78DEHMNOZc]|\xff[\xfb-\xfe][\x00-\xff]|\xff[\xf0-\xfa]",
    ) {
        Ok(re) => re,
        Err(err) => panic!("invalid ANSI_ESCAPE regex: {err}"),
    }
});

/// Upper bound on literal answers to input prompts within one command.
pub const MAX_LITERAL_ANSWERS: usize = 16;

/// Outcome of one command round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CommandResult {
    /// Command text as written, without the line ending.
    pub command: String,
    /// Output with the echo line, pager markers and trailing prompt removed.
    pub output: String,
    /// Every byte received, control and telnet sequences included.
    pub raw: Vec<u8>,
    /// The prompt that ended the command.
    pub prompt: String,
    /// Mode the prompt resolved to.
    pub mode: Mode,
    /// False when the output matched one of the profile's error patterns.
    pub success: bool,
    /// First output line that matched an error pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Removes control sequences and NULs and decodes lossily.
pub fn clean_text(raw: &[u8]) -> String {
    let stripped = ANSI_ESCAPE.replace_all(raw, &b""[..]);
    String::from_utf8_lossy(&stripped).replace('\0', "")
}

/// Visible content of one line as a terminal would show it: carriage
/// returns and backspaces move the cursor and later text overwrites.
pub fn clean_line(line: &str) -> String {
    let mut cells: Vec<char> = Vec::with_capacity(line.len());
    let mut cursor = 0usize;
    for ch in line.chars() {
        match ch {
            '\r' => cursor = 0,
            '\x08' => cursor = cursor.saturating_sub(1),
            ch => {
                if cursor < cells.len() {
                    cells[cursor] = ch;
                } else {
                    cells.push(ch);
                }
                cursor += 1;
            }
        }
    }
    let visible = cells.into_iter().collect::<String>();
    visible.trim_end().to_string()
}

/// Last line of cleaned text, the candidate for prompt matching.
pub fn prompt_candidate(text: &str) -> String {
    let last = text.rsplit('\n').next().unwrap_or("");
    clean_line(last).trim_start().to_string()
}

fn render_output(profile: &VendorProfile, command: &str, raw: &[u8], drop_prompt: bool) -> String {
    let text = clean_text(raw);
    let mut lines = Vec::new();
    for line in text.split('\n') {
        let visible = clean_line(line);
        let stripped = profile.strip_more(&visible);
        if stripped.trim().is_empty() && !visible.is_empty() {
            continue;
        }
        lines.push(stripped);
    }
    if drop_prompt {
        lines.pop();
    }

    let command = command.trim();
    if !command.is_empty()
        && let Some(first) = lines.iter().position(|line| !line.trim().is_empty())
        && lines[first].trim_end().ends_with(command)
    {
        lines.drain(..=first);
    }

    let start = lines
        .iter()
        .position(|line| !line.trim().is_empty())
        .unwrap_or(lines.len());
    let end = lines
        .iter()
        .rposition(|line| !line.trim().is_empty())
        .map(|i| i + 1)
        .unwrap_or(start);
    lines[start..end.max(start)].join("\n")
}

/// Resolves once the cancel flag is raised. Never resolves if the sender
/// is gone without raising it.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

struct RawAudit {
    recorder: SessionRecorder,
    session_id: String,
}

fn audit_chunk(audit: &Option<RawAudit>, chunk: &[u8]) {
    if let Some(audit) = audit
        && let Err(err) = audit
            .recorder
            .record_raw_chunk(&audit.session_id, chunk)
    {
        warn!("{} failed to record raw chunk: {}", audit.session_id, err);
    }
}

/// Owns a transport and runs commands over it.
pub struct CommandChannel {
    transport: Option<Box<dyn Transport>>,
    label: String,
    profile: Option<Arc<VendorProfile>>,
    options: ChannelOptions,
    cancel: watch::Receiver<bool>,
    secrets: HashMap<String, String>,
    audit: Option<RawAudit>,
    bytes_read: u64,
    bytes_written: u64,
}

impl CommandChannel {
    pub fn new(transport: Box<dyn Transport>, options: ChannelOptions) -> Self {
        let (_never, cancel) = watch::channel(false);
        Self {
            label: transport.describe(),
            transport: Some(transport),
            profile: None,
            options,
            cancel,
            secrets: HashMap::new(),
            audit: None,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Observe `cancel`; raising it aborts any blocking read with `Cancelled`.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Named values for input prompts answered with a secret.
    pub fn with_secrets(mut self, secrets: HashMap<String, String>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Record every received chunk under `session_id`.
    pub fn with_recorder(mut self, recorder: SessionRecorder, session_id: impl Into<String>) -> Self {
        self.audit = Some(RawAudit {
            recorder,
            session_id: session_id.into(),
        });
        self
    }

    /// Binds the vendor profile used to recognise prompts.
    pub fn bind(&mut self, profile: Arc<VendorProfile>) {
        self.profile = Some(profile);
    }

    pub fn profile(&self) -> Option<&Arc<VendorProfile>> {
        self.profile.as_ref()
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    pub fn describe(&self) -> &str {
        &self.label
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Reads for up to `window`, returning early once `done` accepts the
    /// bytes collected so far.
    pub async fn collect<F>(&mut self, window: Duration, done: F) -> Result<Vec<u8>, SwitchError>
    where
        F: Fn(&[u8]) -> bool,
    {
        let transport = self
            .transport
            .as_mut()
            .ok_or(SwitchError::Transport(TransportError::Closed))?;
        let deadline = Instant::now() + window;
        let mut raw = Vec::new();

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let read = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return Err(SwitchError::Cancelled),
                read = transport.read(self.options.read_chunk, deadline - now) => read,
            };
            match read {
                Ok(chunk) => {
                    trace!("{} collected {} bytes", self.label, chunk.len());
                    self.bytes_read += chunk.len() as u64;
                    audit_chunk(&self.audit, &chunk);
                    raw.extend_from_slice(&chunk);
                    if done(&raw) {
                        break;
                    }
                }
                Err(TransportError::Timeout) => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(raw)
    }

    /// Writes `text` followed by the bound profile's line ending, or CRLF
    /// before a profile is bound.
    pub async fn write_line(&mut self, text: &str) -> Result<(), SwitchError> {
        let line_ending = self
            .profile
            .as_ref()
            .map(|profile| profile.line_ending().to_string())
            .unwrap_or_else(|| "\r\n".to_string());
        let payload = format!("{text}{line_ending}");
        let transport = self
            .transport
            .as_mut()
            .ok_or(SwitchError::Transport(TransportError::Closed))?;
        transport.write(payload.as_bytes()).await?;
        self.bytes_written += payload.len() as u64;
        Ok(())
    }

    /// Sends `command` from mode `current` and waits for a prompt.
    ///
    /// `expected` is the mode the caller believes the command leads to; it
    /// only breaks ties between prompt rules of equal shape. On cancellation
    /// the transport is closed before `Cancelled` is returned.
    pub async fn send(
        &mut self,
        command: &str,
        current: Mode,
        expected: Option<Mode>,
    ) -> Result<CommandResult, SwitchError> {
        let result = self.exchange(command, current, expected).await;
        if matches!(result, Err(SwitchError::Cancelled)) {
            self.close().await;
        }
        result
    }

    async fn drain(&mut self) -> Result<(), SwitchError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(SwitchError::Transport(TransportError::Closed))?;
        loop {
            match transport.read(self.options.read_chunk, Duration::ZERO).await {
                Ok(chunk) if !chunk.is_empty() => {
                    trace!("{} discarding {} residual bytes", self.label, chunk.len());
                    self.bytes_read += chunk.len() as u64;
                    audit_chunk(&self.audit, &chunk);
                }
                Ok(_) | Err(TransportError::Timeout) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn exchange(
        &mut self,
        command: &str,
        current: Mode,
        expected: Option<Mode>,
    ) -> Result<CommandResult, SwitchError> {
        let profile = self.profile.clone().ok_or_else(|| {
            SwitchError::InternalServerError("command channel has no vendor profile".to_string())
        })?;
        self.drain().await?;

        let line_ending = profile.line_ending().to_string();
        let payload = format!("{command}{line_ending}");
        let transport = self
            .transport
            .as_mut()
            .ok_or(SwitchError::Transport(TransportError::Closed))?;
        transport.write(payload.as_bytes()).await?;
        self.bytes_written += payload.len() as u64;
        debug!("{} sent {:?} in {}", self.label, command, current);

        let mut plausible = vec![current];
        plausible.extend(expected);
        plausible.extend(profile.neighbors(current));

        let started = Instant::now();
        let mut last_activity = started;
        let inactivity = self.options.inactivity_timeout();
        let absolute = self.options.absolute_timeout();

        let mut raw = Vec::new();
        let mut answered_upto = 0usize;
        let mut secrets_sent = HashSet::new();
        let mut literal_answers = 0usize;
        let mut pages = 0usize;

        loop {
            let now = Instant::now();
            let wait = absolute
                .saturating_sub(now - started)
                .min(inactivity.saturating_sub(now - last_activity));
            if wait.is_zero() {
                debug!("{} {:?} timed out after {:?}", self.label, command, now - started);
                return Err(SwitchError::CommandTimeout {
                    command: command.to_string(),
                    output: render_output(&profile, command, &raw, false),
                });
            }

            let read = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return Err(SwitchError::Cancelled),
                read = transport.read(self.options.read_chunk, wait) => read,
            };
            let chunk = match read {
                Ok(chunk) if chunk.is_empty() => continue,
                Ok(chunk) => chunk,
                Err(TransportError::Timeout) => continue,
                Err(err) => return Err(err.into()),
            };
            last_activity = Instant::now();
            self.bytes_read += chunk.len() as u64;
            audit_chunk(&self.audit, &chunk);
            raw.extend_from_slice(&chunk);

            let window_start = answered_upto.max(raw.len().saturating_sub(self.options.search_depth));
            let tail = prompt_candidate(&clean_text(&raw[window_start..]));
            if tail.is_empty() {
                continue;
            }
            trace!("{} tail {:?}", self.label, tail);

            if profile.is_more(&tail) {
                if pages < self.options.max_pages {
                    transport.write(b" ").await?;
                    self.bytes_written += 1;
                    pages += 1;
                    answered_upto = raw.len();
                } else {
                    warn!("{} {:?} exceeded {} pages", self.label, command, pages);
                }
                continue;
            }

            if let Some((index, input)) = profile.input_prompt(&tail, current) {
                let reply = match input.response() {
                    InputResponse::Secret(name) if !secrets_sent.contains(&index) => {
                        self.secrets.get(name).cloned()
                    }
                    InputResponse::Literal(text) if literal_answers < MAX_LITERAL_ANSWERS => {
                        Some(text.clone())
                    }
                    _ => None,
                };
                if let Some(reply) = reply {
                    match input.response() {
                        InputResponse::Secret(_) => {
                            secrets_sent.insert(index);
                        }
                        InputResponse::Literal(_) => literal_answers += 1,
                    }
                    debug!("{} answering input prompt {:?}", self.label, input.pattern());
                    let answer = format!("{reply}{line_ending}");
                    transport.write(answer.as_bytes()).await?;
                    self.bytes_written += answer.len() as u64;
                    answered_upto = raw.len();
                    continue;
                }
            }

            if let Some(rule) = profile
                .grammar()
                .classify_preferring(&tail, |mode| plausible.contains(&mode))
            {
                let output = render_output(&profile, command, &raw, true);
                let error = profile.error_line(&output);
                let elapsed = started.elapsed();
                debug!(
                    "{} {:?} completed in {:?}, prompt {:?} ({})",
                    self.label,
                    command,
                    elapsed,
                    tail,
                    rule.mode()
                );
                return Ok(CommandResult {
                    command: command.to_string(),
                    output,
                    raw,
                    prompt: tail,
                    mode: rule.mode(),
                    success: error.is_none(),
                    error,
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
        }
    }

    /// Releases the transport. Returns false if it was already released.
    pub async fn close(&mut self) -> bool {
        match self.transport.take() {
            Some(mut transport) => {
                if let Err(err) = transport.close().await {
                    warn!("{} close failed: {}", self.label, err);
                }
                debug!("{} transport released", self.label);
                true
            }
            None => false,
        }
    }
}
