use std::sync::{Mutex, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::command::Command;
use crate::error::TransportError;
use crate::transport::TransportListener;

/// Records everything a transport reports upward
#[derive(Default)]
pub struct RecordingListener {
    commands: Mutex<Vec<Command>>,
    exceptions: Mutex<Vec<TransportError>>,
    num_interrupted: AtomicUsize,
    num_resumed: AtomicUsize,
}

impl RecordingListener {
    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn exceptions(&self) -> Vec<TransportError> {
        self.exceptions.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn num_interrupted(&self) -> usize {
        self.num_interrupted.load(Ordering::Acquire)
    }

    pub fn num_resumed(&self) -> usize {
        self.num_resumed.load(Ordering::Acquire)
    }

    /// Waits until at least `n` commands were received or the timeout expired, returning the
    ///  commands received so far
    pub async fn wait_for_commands(&self, n: usize, timeout: Duration) -> Vec<Command> {
        wait_until(timeout, || self.commands().len() >= n).await;
        self.commands()
    }

    pub async fn wait_for_exceptions(&self, n: usize, timeout: Duration) -> Vec<TransportError> {
        wait_until(timeout, || self.exceptions().len() >= n).await;
        self.exceptions()
    }
}

#[async_trait]
impl TransportListener for RecordingListener {
    async fn on_command(&self, command: Command) {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner).push(command);
    }

    async fn on_exception(&self, error: TransportError) {
        self.exceptions.lock().unwrap_or_else(PoisonError::into_inner).push(error);
    }

    async fn transport_interrupted(&self) {
        self.num_interrupted.fetch_add(1, Ordering::AcqRel);
    }

    async fn transport_resumed(&self) {
        self.num_resumed.fetch_add(1, Ordering::AcqRel);
    }
}

/// Polls `condition` until it holds or the timeout expires
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
