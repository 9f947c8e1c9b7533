use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::command::Command;
use crate::error::{TransportError, TransportResult};
use crate::transport::{FutureResponse, ListenerSlot, Transport, TransportListener};

/// The shared part of every filter: the wrapped transport, the listener registered from above,
///  and the default forwarding behavior. Concrete filters embed a [TransportFilter] and delegate
///  to it for everything they do not override.
///
/// Construction registers the owning filter (through a weak reference to avoid a reference
///  cycle) as the listener of the wrapped transport, so inbound traffic passes through it.
pub struct TransportFilter {
    next: Arc<dyn Transport>,
    listener: ListenerSlot,
    closed: AtomicBool,
}
impl TransportFilter {
    pub fn new<L: TransportListener>(next: Arc<dyn Transport>, owner: Weak<L>) -> TransportFilter {
        next.set_listener(Arc::new(WeakListener(owner)));
        TransportFilter {
            next,
            listener: ListenerSlot::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn next(&self) -> &Arc<dyn Transport> {
        &self.next
    }

    pub fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.get()
    }

    pub fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        self.listener.set(listener);
    }

    pub async fn start(&self) -> TransportResult<()> {
        self.listener.require()?;
        if self.is_closed() {
            return Err(TransportError::Disposed);
        }
        self.next.start().await
    }

    /// Marks the filter closed and stops the wrapped transport. Returns `false` without
    ///  touching the wrapped transport if the filter was already closed.
    pub async fn stop(&self) -> TransportResult<bool> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.next.stop().await?;
        Ok(true)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn oneway(&self, command: Command) -> TransportResult<()> {
        self.next.oneway(command).await
    }

    pub async fn async_request(&self, command: Command) -> TransportResult<FutureResponse> {
        self.next.async_request(command).await
    }

    pub async fn request(&self, command: Command, timeout: Option<Duration>) -> TransportResult<Command> {
        self.next.request(command, timeout).await
    }

    pub async fn fire_command(&self, command: Command) {
        match self.listener.get() {
            Some(listener) => listener.on_command(command).await,
            None => debug!("no listener registered - dropping inbound {}", command),
        }
    }

    pub async fn fire_exception(&self, error: TransportError) {
        match self.listener.get() {
            Some(listener) => listener.on_exception(error).await,
            None => debug!("no listener registered - dropping transport error: {}", error),
        }
    }

    pub async fn fire_interrupted(&self) {
        if let Some(listener) = self.listener.get() {
            listener.transport_interrupted().await;
        }
    }

    pub async fn fire_resumed(&self) {
        if let Some(listener) = self.listener.get() {
            listener.transport_resumed().await;
        }
    }
}


/// Registered on a wrapped transport on behalf of a filter. Events arriving after the filter
///  was dropped are discarded.
pub struct WeakListener<L: TransportListener>(pub Weak<L>);

#[async_trait]
impl <L: TransportListener> TransportListener for WeakListener<L> {
    async fn on_command(&self, command: Command) {
        if let Some(l) = self.0.upgrade() {
            l.on_command(command).await;
        }
    }

    async fn on_exception(&self, error: TransportError) {
        if let Some(l) = self.0.upgrade() {
            l.on_exception(error).await;
        }
    }

    async fn transport_interrupted(&self) {
        if let Some(l) = self.0.upgrade() {
            l.transport_interrupted().await;
        }
    }

    async fn transport_resumed(&self) {
        if let Some(l) = self.0.upgrade() {
            l.transport_resumed().await;
        }
    }
}
