use super::*;
use crate::channel::cancelled;
use crate::translate::TranslationTable;
use std::sync::RwLockReadGuard;
use tokio::time::timeout;
use uuid::Uuid;

fn retired_cache(options: &SessionOptions) -> Cache<SessionId, DeviceSession> {
    Cache::builder()
        .max_capacity(options.retired_capacity)
        .time_to_live(options.retired_ttl())
        .build()
}

fn not_active(record: &Mutex<DeviceSession>) -> SwitchError {
    let session = lock_record(record);
    SwitchError::SessionNotActive {
        id: session.id.clone(),
        status: session.status.to_string(),
    }
}

fn sync_bytes(record: &Mutex<DeviceSession>, channel: &CommandChannel) {
    let mut session = lock_record(record);
    session.stats.bytes_read = channel.bytes_read();
    session.stats.bytes_written = channel.bytes_written();
    session.touch();
}

fn fatal_reason<T>(result: &Result<T, SwitchError>) -> Option<String> {
    match result {
        Err(err) if err.is_fatal() => Some(err.to_string()),
        _ => None,
    }
}

impl SessionManager {
    /// Creates a manager over the built-in vendors that connects through
    /// `provider`.
    pub fn new(provider: Arc<dyn TransportProvider>) -> Self {
        let options = SessionOptions::default();
        Self {
            registry: BUILTIN_REGISTRY.clone(),
            provider,
            translator: Translator::with_builtins(),
            recorder: None,
            active: Arc::new(RwLock::new(HashMap::new())),
            retired: retired_cache(&options),
            options,
        }
    }

    /// Detect and translate against `registry` instead of the built-ins.
    ///
    /// The translator is rebuilt over the built-in table; call
    /// [`with_translator`](Self::with_translator) afterwards for a custom one.
    pub fn with_registry(mut self, registry: Arc<VendorRegistry>) -> Self {
        self.translator = Translator::new(registry.clone(), TranslationTable::builtin());
        self.registry = registry;
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.retired = retired_cache(&options);
        self.options = options;
        self
    }

    pub fn with_translator(mut self, translator: Translator) -> Self {
        self.translator = translator;
        self
    }

    /// Emit lifecycle and command records into `recorder`.
    pub fn with_recorder(mut self, recorder: SessionRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn registry(&self) -> &Arc<VendorRegistry> {
        &self.registry
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    pub fn recorder(&self) -> Option<&SessionRecorder> {
        self.recorder.as_ref()
    }

    fn read_active(&self) -> RwLockReadGuard<'_, HashMap<SessionId, SessionHandle>> {
        match self.active.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn book(&self) -> SessionBook {
        SessionBook {
            recorder: self.recorder.clone(),
            active: Arc::downgrade(&self.active),
            retired: self.retired.clone(),
        }
    }

    fn handle(&self, id: &str) -> Option<SessionHandle> {
        self.read_active().get(id).cloned()
    }

    /// Opens a session with detection and no credentials.
    pub async fn open(&self, descriptor: &TransportDescriptor) -> Result<SessionId, SwitchError> {
        self.open_with(descriptor, OpenOptions::default()).await
    }

    /// Connects, identifies the vendor, logs in if the device asks for it
    /// and runs the profile's setup commands.
    ///
    /// Any failure releases the transport and leaves a `failed` record
    /// readable through [`session`](Self::session).
    pub async fn open_with(
        &self,
        descriptor: &TransportDescriptor,
        open: OpenOptions,
    ) -> Result<SessionId, SwitchError> {
        let options = open.options.clone().unwrap_or_else(|| self.options.clone());
        let id = Uuid::new_v4().to_string();
        let label = descriptor.label();
        let record = Arc::new(Mutex::new(DeviceSession::connecting(
            id.clone(),
            label.clone(),
        )));
        debug!("session {} connecting to {}", id, label);
        emit(
            &self.recorder,
            SessionEvent::SessionOpened {
                session_id: id.clone(),
                transport: label.clone(),
            },
        );

        let transport =
            match timeout(options.connect_timeout(), self.provider.connect(descriptor)).await {
                Ok(Ok(transport)) => transport,
                Ok(Err(err)) => {
                    let err = SwitchError::Connect(err.to_string());
                    self.book()
                        .retire(&record, SessionStatus::Failed, err.to_string())
                        .await;
                    return Err(err);
                }
                Err(_) => {
                    let err = SwitchError::Connect(format!(
                        "{} did not connect within {:?}",
                        label,
                        options.connect_timeout()
                    ));
                    self.book()
                        .retire(&record, SessionStatus::Failed, err.to_string())
                        .await;
                    return Err(err);
                }
            };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut channel = CommandChannel::new(transport, options.channel.clone())
            .with_cancel(cancel_rx.clone())
            .with_secrets(open.credentials.secrets());
        if let Some(recorder) = &self.recorder {
            channel = channel.with_recorder(recorder.clone(), id.clone());
        }

        let established = self.establish(&record, &mut channel, &open, &options).await;
        sync_bytes(&record, &channel);
        let fsm = match established {
            Ok(fsm) => fsm,
            Err(err) => {
                channel.close().await;
                self.book()
                    .retire(&record, SessionStatus::Failed, err.to_string())
                    .await;
                return Err(err);
            }
        };

        {
            let mut session = lock_record(&record);
            session.status = SessionStatus::Active;
            session.touch();
        }
        emit(
            &self.recorder,
            SessionEvent::StatusChanged {
                session_id: id.clone(),
                status: SessionStatus::Active,
                reason: None,
            },
        );

        let (jobs_tx, jobs_rx) = mpsc::channel(options.queue_depth.max(1));
        let handle = SessionHandle {
            record: record.clone(),
            jobs: jobs_tx,
            cancel: Arc::new(cancel_tx),
            profile: fsm.profile().clone(),
        };
        write_sessions(&self.active).insert(id.clone(), handle);

        let worker = Worker {
            id: id.clone(),
            record,
            channel,
            fsm,
            jobs: jobs_rx,
            cancel: cancel_rx,
            book: self.book(),
        };
        tokio::spawn(worker.run());
        debug!("session {} active", id);
        Ok(id)
    }

    async fn establish(
        &self,
        record: &Mutex<DeviceSession>,
        channel: &mut CommandChannel,
        open: &OpenOptions,
        options: &SessionOptions,
    ) -> Result<SessionStateMachine, SwitchError> {
        let id = lock_record(record).id.clone();
        let book = self.book();
        let detector = VendorDetector::new(self.registry.clone());
        let window = options.detection_window();

        let mut raw = channel
            .collect(window, |raw| detector.sees_prompt(raw))
            .await?;
        if !detector.sees_prompt(&raw) {
            debug!("session {} saw no prompt, waking the console", id);
            channel.write_line("").await?;
            let more = channel
                .collect(window, |raw| detector.sees_prompt(raw))
                .await?;
            raw.extend_from_slice(&more);
        }

        let detection = match &open.vendor {
            Some(vendor) => detector.assume(vendor, &raw)?,
            None => detector.detect(&raw)?,
        };
        let profile = self.registry.profile(&detection.vendor)?;
        channel.bind(profile.clone());
        {
            let mut session = lock_record(record);
            session.vendor = Some(detection.vendor.clone());
            session.touch();
        }
        debug!(
            "session {} is {} ({:?}), prompt {:?}",
            id, detection.vendor, detection.confidence, detection.prompt
        );
        emit(
            &self.recorder,
            SessionEvent::VendorDetected {
                session_id: id.clone(),
                vendor: detection.vendor.clone(),
                confidence: detection.confidence,
                prompt: detection.prompt.clone(),
            },
        );

        let mode = match detection.mode {
            Some(mode) => mode,
            None => {
                debug!("session {} probing mode after {:?}", id, detection.prompt);
                channel.send("", Mode::User, None).await?.mode
            }
        };
        let mut fsm = SessionStateMachine::new(profile.clone(), mode);
        book.note_mode(record, None, mode);

        if mode == Mode::Unauthenticated {
            let target = profile
                .neighbors(Mode::Unauthenticated)
                .into_iter()
                .min()
                .ok_or(SwitchError::InvalidTransition {
                    from: Mode::Unauthenticated,
                    to: Mode::User,
                })?;
            debug!(
                "session {} logging in as {:?}",
                id, open.credentials.username
            );
            book.drive(record, &mut fsm, channel, target, &open.credentials.params())
                .await?;
        }

        for setup in profile.setup_commands() {
            if let Some(required) = setup.mode
                && required != fsm.mode()
            {
                book.drive(record, &mut fsm, channel, required, &Params::new())
                    .await?;
            }
            let result = channel.send(&setup.command, fsm.mode(), None).await?;
            book.observe(record, &mut fsm, result.mode);
            if !result.success {
                warn!(
                    "session {} setup command {:?} rejected: {}",
                    id,
                    setup.command,
                    result.error.as_deref().unwrap_or_default()
                );
            }
        }
        Ok(fsm)
    }

    async fn active_handle(&self, id: &str) -> Result<SessionHandle, SwitchError> {
        if let Some(handle) = self.handle(id) {
            let status = lock_record(&handle.record).status;
            if status != SessionStatus::Active {
                return Err(SwitchError::SessionNotActive {
                    id: id.to_string(),
                    status: status.to_string(),
                });
            }
            return Ok(handle);
        }
        match self.retired.get(id).await {
            Some(session) => Err(SwitchError::SessionNotActive {
                id: id.to_string(),
                status: session.status.to_string(),
            }),
            None => Err(SwitchError::SessionNotFound(id.to_string())),
        }
    }

    async fn submit(&self, handle: &SessionHandle, job: SessionJob) -> Result<(), SwitchError> {
        handle
            .jobs
            .send(job)
            .await
            .map_err(|_| not_active(&handle.record))
    }

    /// Dispatches a safe command. See [`dispatch_with`](Self::dispatch_with).
    pub async fn dispatch(&self, id: &str, command: &str) -> Result<CommandResult, SwitchError> {
        self.dispatch_with(id, command, DispatchOptions::default())
            .await
    }

    /// Normalizes and classifies `command`, then queues it behind any
    /// command already in flight on the session.
    ///
    /// Dangerous and unclassified commands fail with `ConfirmationRequired`
    /// unless `dispatch.confirmed` is set. A `CommandTimeout` leaves the
    /// session active; a transport failure or cancellation moves it to
    /// `failed`.
    pub async fn dispatch_with(
        &self,
        id: &str,
        command: &str,
        dispatch: DispatchOptions,
    ) -> Result<CommandResult, SwitchError> {
        let handle = self.active_handle(id).await?;
        let classification = classify::inspect(&handle.profile, command);
        if !classification.class.runs_unconfirmed() && !dispatch.confirmed {
            debug!(
                "session {} rejected {:?} ({})",
                id, classification.normalized, classification.class
            );
            emit(
                &self.recorder,
                SessionEvent::CommandRejected {
                    session_id: id.to_string(),
                    command: classification.normalized.clone(),
                    class: classification.class,
                },
            );
            return Err(SwitchError::ConfirmationRequired {
                command: classification.normalized,
                class: classification.class.to_string(),
            });
        }

        let (responder, response) = oneshot::channel();
        self.submit(
            &handle,
            SessionJob::Dispatch {
                command: classification.normalized,
                expected: dispatch.expected_mode,
                responder,
            },
        )
        .await?;
        response.await.map_err(|_| not_active(&handle.record))?
    }

    /// Moves the session to `target` along the profile's transitions.
    pub async fn request_mode(&self, id: &str, target: Mode) -> Result<(), SwitchError> {
        self.request_mode_with(id, target, Params::new()).await
    }

    /// Like [`request_mode`](Self::request_mode), binding placeholders such
    /// as `{interface}` in transition commands.
    pub async fn request_mode_with(
        &self,
        id: &str,
        target: Mode,
        params: Params,
    ) -> Result<(), SwitchError> {
        let handle = self.active_handle(id).await?;
        let (responder, response) = oneshot::channel();
        self.submit(
            &handle,
            SessionJob::Transition {
                target,
                params,
                responder,
            },
        )
        .await?;
        response.await.map_err(|_| not_active(&handle.record))?
    }

    /// Closes the session after queued commands complete. Closing a retired
    /// session is a no-op.
    pub async fn close(&self, id: &str) -> Result<(), SwitchError> {
        let Some(handle) = self.handle(id) else {
            if self.retired.contains_key(id) {
                return Ok(());
            }
            return Err(SwitchError::SessionNotFound(id.to_string()));
        };
        let (responder, done) = oneshot::channel();
        if handle
            .jobs
            .send(SessionJob::Close { responder })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
        Ok(())
    }

    /// Aborts the in-flight command, if any, closes the transport and marks
    /// the session `failed`.
    pub fn cancel(&self, id: &str) -> Result<(), SwitchError> {
        match self.handle(id) {
            Some(handle) => {
                debug!("session {} cancel requested", id);
                handle.cancel.send_replace(true);
                Ok(())
            }
            None if self.retired.contains_key(id) => Ok(()),
            None => Err(SwitchError::SessionNotFound(id.to_string())),
        }
    }

    /// Snapshot of an active or retired session.
    pub async fn session(&self, id: &str) -> Result<DeviceSession, SwitchError> {
        if let Some(handle) = self.handle(id) {
            return Ok(lock_record(&handle.record).clone());
        }
        self.retired
            .get(id)
            .await
            .ok_or_else(|| SwitchError::SessionNotFound(id.to_string()))
    }

    /// Snapshots of all known sessions, oldest first.
    pub fn sessions(&self) -> Vec<DeviceSession> {
        let mut sessions = self
            .read_active()
            .values()
            .map(|handle| lock_record(&handle.record).clone())
            .collect::<Vec<_>>();
        for (id, session) in self.retired.iter() {
            if !sessions.iter().any(|known| known.id == *id) {
                sessions.push(session);
            }
        }
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        sessions
    }

    pub fn active_count(&self) -> usize {
        self.read_active().len()
    }

    /// Renders `operation` for `target` without touching any session.
    pub fn translate(
        &self,
        operation: &str,
        target: &VendorId,
        params: &Params,
    ) -> Result<Vec<String>, SwitchError> {
        self.translator.translate_operation(operation, target, params)
    }

    /// Renders `operation` for the vendor of session `id`, including the
    /// mode the commands must run in.
    pub async fn render(
        &self,
        id: &str,
        operation: &str,
        params: &Params,
    ) -> Result<RenderedOperation, SwitchError> {
        let session = self.session(id).await?;
        let vendor = session.vendor.ok_or_else(|| SwitchError::SessionNotActive {
            id: id.to_string(),
            status: session.status.to_string(),
        })?;
        self.translator.render_operation(operation, &vendor, params)
    }

    /// Runs the vendor's version command on session `id` and parses
    /// hostname, OS version, model, serial number and uptime from it.
    ///
    /// The command is queued like any other dispatch. Output the device
    /// rejects still parses, leaving the fields it lacks empty.
    pub async fn device_info(&self, id: &str) -> Result<DeviceInfo, SwitchError> {
        let handle = self.active_handle(id).await?;
        let parser = handle.profile.device_info().cloned().ok_or_else(|| {
            SwitchError::OperationNotSupported {
                operation: "device_info".to_string(),
                vendor: handle.profile.id().clone(),
            }
        })?;
        let result = self.dispatch(id, parser.command()).await?;
        if !result.success {
            warn!(
                "session {} rejected {:?}: {}",
                id,
                parser.command(),
                result.error.as_deref().unwrap_or_default()
            );
        }
        Ok(parser.parse(handle.profile.id(), &result.output, &result.prompt))
    }
}

impl SessionBook {
    fn note_mode(&self, record: &Mutex<DeviceSession>, from: Option<Mode>, to: Mode) {
        if from == Some(to) {
            return;
        }
        let id = {
            let mut session = lock_record(record);
            session.mode = Some(to);
            session.id.clone()
        };
        emit(
            &self.recorder,
            SessionEvent::ModeChanged {
                session_id: id,
                from,
                to,
            },
        );
    }

    fn observe(&self, record: &Mutex<DeviceSession>, fsm: &mut SessionStateMachine, mode: Mode) {
        if let Some(previous) = fsm.observe(mode) {
            self.note_mode(record, Some(previous), mode);
        }
    }

    async fn drive(
        &self,
        record: &Mutex<DeviceSession>,
        fsm: &mut SessionStateMachine,
        channel: &mut CommandChannel,
        target: Mode,
        params: &Params,
    ) -> Result<(), SwitchError> {
        let before = fsm.mode();
        let outcome = fsm.request_transition(channel, target, params).await;
        self.note_mode(record, Some(before), fsm.mode());
        outcome.map(|_| ())
    }

    async fn retire(&self, record: &Mutex<DeviceSession>, status: SessionStatus, reason: String) {
        let snapshot = {
            let mut session = lock_record(record);
            session.status = status;
            session.touch();
            if status == SessionStatus::Failed {
                session.failure = Some(reason.clone());
            }
            session.clone()
        };
        debug!("session {} {}: {}", snapshot.id, status, reason);
        emit(
            &self.recorder,
            SessionEvent::StatusChanged {
                session_id: snapshot.id.clone(),
                status,
                reason: Some(reason.clone()),
            },
        );
        emit(
            &self.recorder,
            SessionEvent::SessionClosed {
                session_id: snapshot.id.clone(),
                reason,
            },
        );

        let id = snapshot.id.clone();
        self.retired.insert(id.clone(), snapshot).await;
        if let Some(active) = self.active.upgrade() {
            write_sessions(&active).remove(&id);
        }
    }
}

enum Wake {
    Job(SessionJob),
    Cancelled,
    Detached,
}

/// Sole owner of a session's channel once it is active.
struct Worker {
    id: SessionId,
    record: Arc<Mutex<DeviceSession>>,
    channel: CommandChannel,
    fsm: SessionStateMachine,
    jobs: mpsc::Receiver<SessionJob>,
    cancel: watch::Receiver<bool>,
    book: SessionBook,
}

impl Worker {
    async fn run(mut self) {
        debug!("session {} worker started", self.id);
        loop {
            let wake = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => Wake::Cancelled,
                job = self.jobs.recv() => match job {
                    Some(job) => Wake::Job(job),
                    None => Wake::Detached,
                },
            };

            match wake {
                Wake::Cancelled => {
                    self.shut_down(SessionStatus::Failed, SwitchError::Cancelled.to_string())
                        .await;
                    break;
                }
                Wake::Detached => {
                    self.shut_down(SessionStatus::Closed, "session manager dropped".to_string())
                        .await;
                    break;
                }
                Wake::Job(SessionJob::Dispatch {
                    command,
                    expected,
                    responder,
                }) => {
                    let result = self.dispatch(&command, expected).await;
                    let fatal = fatal_reason(&result);
                    if let Some(reason) = &fatal {
                        self.shut_down(SessionStatus::Failed, reason.clone()).await;
                    }
                    let _ = responder.send(result);
                    if fatal.is_some() {
                        break;
                    }
                }
                Wake::Job(SessionJob::Transition {
                    target,
                    params,
                    responder,
                }) => {
                    let result = self
                        .book
                        .drive(&self.record, &mut self.fsm, &mut self.channel, target, &params)
                        .await;
                    sync_bytes(&self.record, &self.channel);
                    let fatal = fatal_reason(&result);
                    if let Some(reason) = &fatal {
                        self.shut_down(SessionStatus::Failed, reason.clone()).await;
                    }
                    let _ = responder.send(result);
                    if fatal.is_some() {
                        break;
                    }
                }
                Wake::Job(SessionJob::Close { responder }) => {
                    self.shut_down(SessionStatus::Closed, "closed by caller".to_string())
                        .await;
                    let _ = responder.send(());
                    break;
                }
            }
        }

        self.jobs.close();
        while let Ok(job) = self.jobs.try_recv() {
            match job {
                SessionJob::Dispatch { responder, .. } => {
                    let _ = responder.send(Err(not_active(&self.record)));
                }
                SessionJob::Transition { responder, .. } => {
                    let _ = responder.send(Err(not_active(&self.record)));
                }
                SessionJob::Close { responder } => {
                    let _ = responder.send(());
                }
            }
        }
        debug!("session {} worker stopped", self.id);
    }

    async fn dispatch(
        &mut self,
        command: &str,
        expected: Option<Mode>,
    ) -> Result<CommandResult, SwitchError> {
        let outcome = self.channel.send(command, self.fsm.mode(), expected).await;
        {
            let mut session = lock_record(&self.record);
            session.stats.commands_sent += 1;
            if !matches!(&outcome, Ok(result) if result.success) {
                session.stats.commands_failed += 1;
            }
        }
        sync_bytes(&self.record, &self.channel);

        if let Ok(result) = &outcome {
            self.book
                .observe(&self.record, &mut self.fsm, result.mode);
            emit(
                &self.book.recorder,
                SessionEvent::command_completed(&self.id, result),
            );
        }
        outcome
    }

    /// Releases the transport exactly once and retires the record.
    async fn shut_down(&mut self, status: SessionStatus, reason: String) {
        self.channel.close().await;
        sync_bytes(&self.record, &self.channel);
        self.book.retire(&self.record, status, reason).await;
    }
}
