//! Device sessions and the manager that owns them.
//!
//! Each open session owns one transport through a [`CommandChannel`] and
//! tracks its mode with a [`SessionStateMachine`]. A worker task per session
//! consumes jobs from an mpsc queue, so at most one command is in flight per
//! device while distinct devices run concurrently.
//!
//! # Main Components
//!
//! - [`SessionManager`] - Opens, drives and retires sessions (singleton via `MANAGER`)
//! - [`DeviceSession`] - Read-only snapshot of one session
//! - [`SessionRecorder`] - Structured lifecycle and command records

use chrono::{DateTime, Utc};
use log::{debug, warn};
use moka::future::Cache;
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::{mpsc, oneshot, watch};

use crate::channel::{CommandChannel, CommandResult};
use crate::classify::{self, CommandClass};
use crate::config::SessionOptions;
use crate::detect::{Confidence, VendorDetector};
use crate::error::SwitchError;
use crate::state::SessionStateMachine;
use crate::transport::{DefaultTransportProvider, TransportDescriptor, TransportProvider};
use crate::translate::{Params, RenderedOperation, Translator};
use crate::vendor::{
    BUILTIN_REGISTRY, DeviceInfo, Mode, VendorId, VendorProfile, VendorRegistry,
};

pub use recording::{SessionEvent, SessionRecordEntry, SessionRecordLevel, SessionRecorder};

mod manager;
mod recording;

/// Global session manager over the built-in registry and default transports.
pub static MANAGER: Lazy<SessionManager> = Lazy::new(SessionManager::default);

/// Opaque session identifier (UUID v4).
pub type SessionId = String;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Active,
    Closed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
            SessionStatus::Failed => "failed",
        }
    }

    /// Closed and failed sessions are kept for audit only.
    pub fn is_retired(&self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SessionStats {
    pub commands_sent: u64,
    pub commands_failed: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

/// Snapshot of one device session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSession {
    pub id: SessionId,
    /// Transport label, never containing secrets.
    pub transport: String,
    /// Set once detection completes and never changed afterwards.
    pub vendor: Option<VendorId>,
    pub mode: Option<Mode>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: SessionStatus,
    pub stats: SessionStats,
    /// Why the session failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl DeviceSession {
    fn connecting(id: SessionId, transport: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            transport,
            vendor: None,
            mode: None,
            created_at: now,
            last_activity: now,
            status: SessionStatus::Connecting,
            stats: SessionStats::default(),
            failure: None,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// Login material. Secrets never appear in `Debug` output or serialized
/// documents.
#[derive(Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Credentials {
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default, skip_serializing)]
    pub enable_secret: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
            enable_secret: None,
        }
    }

    pub fn with_enable_secret(mut self, secret: impl Into<String>) -> Self {
        self.enable_secret = Some(secret.into());
        self
    }

    /// Values for input prompts answered with a named secret.
    pub(crate) fn secrets(&self) -> HashMap<String, String> {
        let mut secrets = HashMap::new();
        if let Some(password) = &self.password {
            secrets.insert("password".to_string(), password.clone());
        }
        if let Some(secret) = &self.enable_secret {
            secrets.insert("enable_secret".to_string(), secret.clone());
        }
        secrets
    }

    /// Placeholders available to the login transition.
    pub(crate) fn params(&self) -> Params {
        Params::from([("username".to_string(), self.username.clone())])
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("enable_secret", &self.enable_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Per-call options for [`SessionManager::open_with`].
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Skip detection and commit to this vendor.
    pub vendor: Option<VendorId>,
    pub credentials: Credentials,
    /// Overrides the manager's options for this session.
    pub options: Option<SessionOptions>,
}

impl OpenOptions {
    pub fn vendor(mut self, vendor: impl Into<VendorId>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Per-call options for [`SessionManager::dispatch_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOptions {
    /// The caller reviewed a dangerous or unclassified command.
    pub confirmed: bool,
    /// Mode the caller expects the command to leave the device in.
    pub expected_mode: Option<Mode>,
}

impl DispatchOptions {
    pub fn confirmed() -> Self {
        Self {
            confirmed: true,
            expected_mode: None,
        }
    }
}

/// Work handed to a session worker.
pub(crate) enum SessionJob {
    Dispatch {
        command: String,
        expected: Option<Mode>,
        responder: oneshot::Sender<Result<CommandResult, SwitchError>>,
    },
    Transition {
        target: Mode,
        params: Params,
        responder: oneshot::Sender<Result<(), SwitchError>>,
    },
    Close {
        responder: oneshot::Sender<()>,
    },
}

/// Manager-side view of an active session.
#[derive(Clone)]
struct SessionHandle {
    record: Arc<Mutex<DeviceSession>>,
    jobs: mpsc::Sender<SessionJob>,
    cancel: Arc<watch::Sender<bool>>,
    profile: Arc<VendorProfile>,
}

type ActiveSessions = RwLock<HashMap<SessionId, SessionHandle>>;

/// What a session worker needs from its manager.
///
/// Holds the active map weakly: once every manager clone is gone the job
/// senders drop with it and the workers see their queues close.
#[derive(Clone)]
struct SessionBook {
    recorder: Option<SessionRecorder>,
    active: Weak<ActiveSessions>,
    retired: Cache<SessionId, DeviceSession>,
}

/// Owns every open session and keeps retired ones for audit.
#[derive(Clone)]
pub struct SessionManager {
    registry: Arc<VendorRegistry>,
    provider: Arc<dyn TransportProvider>,
    translator: Translator,
    options: SessionOptions,
    recorder: Option<SessionRecorder>,
    active: Arc<ActiveSessions>,
    retired: Cache<SessionId, DeviceSession>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(Arc::new(DefaultTransportProvider))
    }
}

fn lock_record(record: &Mutex<DeviceSession>) -> std::sync::MutexGuard<'_, DeviceSession> {
    match record.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_sessions(active: &ActiveSessions) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, SessionHandle>> {
    match active.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn emit(recorder: &Option<SessionRecorder>, event: SessionEvent) {
    if let Some(recorder) = recorder
        && let Err(err) = recorder.record_event(event)
    {
        warn!("failed to record session event: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_is_redacted() {
        let credentials = Credentials::new("admin", "hunter2").with_enable_secret("cisco");
        let debug = format!("{credentials:?}");
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("cisco"));
        let json = serde_json::to_string(&credentials).expect("encode");
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn credentials_map_to_named_secrets() {
        let secrets = Credentials::new("admin", "pw").with_enable_secret("en").secrets();
        assert_eq!(secrets.get("password").map(String::as_str), Some("pw"));
        assert_eq!(secrets.get("enable_secret").map(String::as_str), Some("en"));
        assert_eq!(
            Credentials::default().params().get("username").map(String::as_str),
            Some("")
        );
    }

    #[test]
    fn status_retirement() {
        assert!(SessionStatus::Closed.is_retired());
        assert!(SessionStatus::Failed.is_retired());
        assert!(!SessionStatus::Active.is_retired());
        assert_eq!(
            serde_json::to_string(&SessionStatus::Connecting).expect("encode"),
            "\"connecting\""
        );
    }
}
