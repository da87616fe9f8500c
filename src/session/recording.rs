use super::*;

/// How much of a session the recorder keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionRecordLevel {
    /// Disable recording.
    Off,
    /// Record lifecycle and command events.
    KeyEventsOnly,
    /// Record key events and raw transport chunks.
    #[default]
    Full,
}

/// One timestamped record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecordEntry {
    pub ts: DateTime<Utc>,
    pub event: SessionEvent,
}

/// Lifecycle and command events emitted by the session manager.
///
/// Every event carries the id of the session it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionOpened {
        session_id: String,
        transport: String,
    },
    VendorDetected {
        session_id: String,
        vendor: VendorId,
        confidence: Confidence,
        prompt: String,
    },
    StatusChanged {
        session_id: String,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ModeChanged {
        session_id: String,
        #[serde(default)]
        from: Option<Mode>,
        to: Mode,
    },
    CommandCompleted {
        session_id: String,
        command: String,
        mode: Mode,
        prompt: String,
        success: bool,
        output: String,
        elapsed_ms: u64,
    },
    CommandRejected {
        session_id: String,
        command: String,
        class: CommandClass,
    },
    SessionClosed {
        session_id: String,
        reason: String,
    },
    /// Bytes exactly as read from the transport, before any decoding.
    RawChunk {
        session_id: String,
        data: Vec<u8>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::SessionOpened { session_id, .. }
            | SessionEvent::VendorDetected { session_id, .. }
            | SessionEvent::StatusChanged { session_id, .. }
            | SessionEvent::ModeChanged { session_id, .. }
            | SessionEvent::CommandCompleted { session_id, .. }
            | SessionEvent::CommandRejected { session_id, .. }
            | SessionEvent::SessionClosed { session_id, .. }
            | SessionEvent::RawChunk { session_id, .. } => session_id,
        }
    }

    pub(crate) fn command_completed(session_id: &str, result: &CommandResult) -> Self {
        SessionEvent::CommandCompleted {
            session_id: session_id.to_string(),
            command: result.command.clone(),
            mode: result.mode,
            prompt: result.prompt.clone(),
            success: result.success,
            output: result.output.clone(),
            elapsed_ms: result.elapsed_ms,
        }
    }
}

/// In-memory session recorder shared by every session of a manager.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    level: SessionRecordLevel,
    entries: Arc<Mutex<Vec<SessionRecordEntry>>>,
}

fn lock_error(e: impl fmt::Display) -> SwitchError {
    SwitchError::InternalServerError(format!("record lock error: {e}"))
}

impl SessionRecorder {
    /// Empty recorder keeping events up to `level`.
    pub fn new(level: SessionRecordLevel) -> Self {
        Self {
            level,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn level(&self) -> SessionRecordLevel {
        self.level
    }

    /// Appends `event` unless recording is off.
    pub fn record_event(&self, event: SessionEvent) -> Result<(), SwitchError> {
        if self.level == SessionRecordLevel::Off {
            return Ok(());
        }
        let mut guard = self.entries.lock().map_err(lock_error)?;
        guard.push(SessionRecordEntry {
            ts: Utc::now(),
            event,
        });
        Ok(())
    }

    /// Record a raw transport chunk when the level is `Full`.
    pub fn record_raw_chunk(&self, session_id: &str, data: &[u8]) -> Result<(), SwitchError> {
        if self.level != SessionRecordLevel::Full {
            return Ok(());
        }
        self.record_event(SessionEvent::RawChunk {
            session_id: session_id.to_string(),
            data: data.to_vec(),
        })
    }

    /// Snapshot all records.
    pub fn entries(&self) -> Result<Vec<SessionRecordEntry>, SwitchError> {
        let guard = self.entries.lock().map_err(lock_error)?;
        Ok(guard.clone())
    }

    /// Records of one session, in recording order.
    pub fn entries_for(&self, session_id: &str) -> Result<Vec<SessionRecordEntry>, SwitchError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| entry.event.session_id() == session_id)
            .collect())
    }

    /// Drops every record, keeping the level.
    pub fn clear(&self) -> Result<(), SwitchError> {
        let mut guard = self.entries.lock().map_err(lock_error)?;
        guard.clear();
        Ok(())
    }

    /// One JSON object per line, oldest first.
    pub fn to_jsonl(&self) -> Result<String, SwitchError> {
        let lines = self
            .entries()?
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SwitchError::InternalServerError(format!("record encode error: {e}")))?;
        Ok(lines.join("\n"))
    }

    /// Loads records written by [`to_jsonl`](Self::to_jsonl). Blank lines
    /// are skipped.
    pub fn from_jsonl(jsonl: &str) -> Result<Self, SwitchError> {
        let parsed = jsonl
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<SessionRecordEntry>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SwitchError::InternalServerError(format!("record decode error: {e}")))?;
        let recorder = Self::default();
        if let Ok(mut guard) = recorder.entries.lock() {
            *guard = parsed;
        }
        Ok(recorder)
    }
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new(SessionRecordLevel::Full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{"ts":"2024-05-01T10:00:00Z","event":{"kind":"session_opened","session_id":"s1","transport":"tcp://10.0.0.1:2001"}}
{"ts":"2024-05-01T10:00:01Z","event":{"kind":"vendor_detected","session_id":"s1","vendor":"cisco","confidence":"high","prompt":"sw1>"}}
{"ts":"2024-05-01T10:00:02Z","event":{"kind":"raw_chunk","session_id":"s2","data":[60,72,51,67,62,255,251,1]}}
{"ts":"2024-05-01T10:00:03Z","event":{"kind":"status_changed","session_id":"s1","status":"active"}}
"#;

    #[test]
    fn jsonl_export_loads_back() {
        let recorder = SessionRecorder::new(SessionRecordLevel::Full);
        recorder
            .record_event(SessionEvent::ModeChanged {
                session_id: "s1".to_string(),
                from: Some(Mode::User),
                to: Mode::Privileged,
            })
            .expect("record mode");
        let jsonl = recorder.to_jsonl().expect("encode jsonl");
        assert!(jsonl.contains("\"kind\":\"mode_changed\""));
        let restored = SessionRecorder::from_jsonl(&jsonl).expect("decode jsonl");
        assert_eq!(
            restored.entries().expect("entries"),
            recorder.entries().expect("entries")
        );
    }

    #[test]
    fn fixture_filters_by_session() {
        let recorder = SessionRecorder::from_jsonl(FIXTURE).expect("fixture");
        assert_eq!(recorder.entries().expect("entries").len(), 4);
        let s1 = recorder.entries_for("s1").expect("s1");
        assert_eq!(s1.len(), 3);
        assert!(matches!(
            s1[1].event,
            SessionEvent::VendorDetected {
                confidence: Confidence::High,
                ..
            }
        ));
        let s2 = recorder.entries_for("s2").expect("s2");
        assert!(matches!(
            &s2[0].event,
            SessionEvent::RawChunk { data, .. } if data.as_slice() == b"<H3C>\xff\xfb\x01"
        ));
    }

    #[test]
    fn key_events_level_skips_raw_chunks() {
        let recorder = SessionRecorder::new(SessionRecordLevel::KeyEventsOnly);
        recorder
            .record_raw_chunk("s1", b"sw1#")
            .expect("raw chunk");
        recorder
            .record_event(SessionEvent::SessionClosed {
                session_id: "s1".to_string(),
                reason: "closed by caller".to_string(),
            })
            .expect("closed");
        let entries = recorder.entries().expect("entries");
        assert_eq!(entries.len(), 1);

        let off = SessionRecorder::new(SessionRecordLevel::Off);
        off.record_event(SessionEvent::SessionClosed {
            session_id: "s1".to_string(),
            reason: "x".to_string(),
        })
        .expect("off");
        assert!(off.entries().expect("entries").is_empty());
    }

    #[test]
    fn malformed_jsonl_is_reported() {
        let err = SessionRecorder::from_jsonl("{\"ts\": 1}").expect_err("bad line");
        assert!(matches!(err, SwitchError::InternalServerError(_)));
    }
}
