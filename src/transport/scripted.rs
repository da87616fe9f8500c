use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

use super::Transport;

type Responder = Box<dyn FnMut(&str) -> Vec<u8> + Send>;

/// In-memory transport driven by a responder closure.
///
/// Every `write` hands its text, with trailing CR/LF removed, to the
/// responder; the bytes it returns become readable. A read with nothing
/// pending sleeps for the full timeout and reports `Timeout`, like a quiet
/// device.
pub struct ScriptedTransport {
    label: String,
    pending: VecDeque<u8>,
    responder: Responder,
    closed: bool,
    close_calls: Arc<AtomicUsize>,
    written: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTransport {
    pub fn new<F>(greeting: impl AsRef<[u8]>, responder: F) -> Self
    where
        F: FnMut(&str) -> Vec<u8> + Send + 'static,
    {
        Self {
            label: "scripted".to_string(),
            pending: greeting.as_ref().iter().copied().collect(),
            responder: Box::new(responder),
            closed: false,
            close_calls: Arc::new(AtomicUsize::new(0)),
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Shared counter of `close` calls.
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.close_calls)
    }

    /// Shared log of everything written, one entry per write.
    pub fn written(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.written)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn read(
        &mut self,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.pending.is_empty() {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout);
        }
        let n = max_bytes.max(1).min(self.pending.len());
        Ok(self.pending.drain(..n).collect())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let text = String::from_utf8_lossy(data);
        let input = text.trim_end_matches(['\r', '\n']);
        if let Ok(mut written) = self.written.lock() {
            written.push(input.to_string());
        }
        let reply = (self.responder)(input);
        self.pending.extend(reply);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed = true;
        self.pending.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
