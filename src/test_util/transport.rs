use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::command::{Command, CommandKind, ConnectedInfo};
use crate::error::{TransportError, TransportResult};
use crate::test_util::listener::wait_until;
use crate::transport::{FutureResponse, ListenerSlot, Transport, TransportListener};

/// An in-memory leaf transport. It records every command sent through it, and lets tests inject
///  inbound commands and failures as if they came from a broker.
pub struct RecordingTransport {
    uri: String,
    listener: ListenerSlot,
    sent: Mutex<Vec<Command>>,
    started: AtomicBool,
    closed: AtomicBool,
    fail_sends: AtomicBool,
    respond_to_requests: AtomicBool,
}

impl RecordingTransport {
    pub fn new(uri: impl Into<String>) -> Arc<RecordingTransport> {
        Arc::new(RecordingTransport {
            uri: uri.into(),
            listener: ListenerSlot::default(),
            sent: Default::default(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            respond_to_requests: AtomicBool::new(false),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn sent(&self) -> Vec<Command> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub async fn wait_for_sent(&self, n: usize, timeout: Duration) -> Vec<Command> {
        wait_until(timeout, || self.sent.lock().unwrap_or_else(PoisonError::into_inner).len() >= n).await;
        self.sent()
    }

    /// Makes every subsequent send fail with an I/O error
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Release);
    }

    /// Answers every command that requires a response, like a broker accepting everything:
    ///  `ConnectionInfo` with `Connected`, everything else with a plain response.
    pub fn respond_to_requests(&self) {
        self.respond_to_requests.store(true, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub async fn inject_command(&self, command: Command) {
        if let Some(listener) = self.listener.get() {
            listener.on_command(command).await;
        }
    }

    pub async fn inject_exception(&self, error: TransportError) {
        if let Some(listener) = self.listener.get() {
            listener.on_exception(error).await;
        }
    }

    fn response_for(command: &Command) -> Command {
        match &command.kind {
            CommandKind::ConnectionInfo(info) => Command::new(CommandKind::Connected(ConnectedInfo {
                correlation_id: command.command_id,
                version: Some("1.2".to_string()),
                session: None,
                server: None,
                heart_beat: info.heart_beat,
            })),
            _ => Command::response(command.command_id),
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn start(&self) -> TransportResult<()> {
        self.listener.require()?;
        if self.is_closed() {
            return Err(TransportError::Disposed);
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn oneway(&self, command: Command) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.fail_sends.load(Ordering::Acquire) {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "simulated send failure").into());
        }

        trace!("{}: recording {}", self.uri, command);
        let response = if command.response_required && self.respond_to_requests.load(Ordering::Acquire) {
            Some(Self::response_for(&command))
        }
        else {
            None
        };
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).push(command);

        if let (Some(response), Some(listener)) = (response, self.listener.get()) {
            tokio::spawn(async move {
                listener.on_command(response).await;
            });
        }
        Ok(())
    }

    async fn async_request(&self, _command: Command) -> TransportResult<FutureResponse> {
        Err(TransportError::invalid_operation("a leaf transport does not correlate responses"))
    }

    async fn request(&self, _command: Command, _timeout: Option<Duration>) -> TransportResult<Command> {
        Err(TransportError::invalid_operation("a leaf transport does not correlate responses"))
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        self.listener.set(listener);
    }

    fn remote_address(&self) -> Option<String> {
        Some(self.uri.clone())
    }

    fn is_connected(&self) -> bool {
        self.is_started() && !self.is_closed()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
