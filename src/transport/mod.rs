//! The transport stack is a chain of [Transport] implementations: a leaf owning the socket at
//!  the bottom, filters adding one behavior each on top of it, and optionally the failover
//!  composite managing a changing leaf underneath.
//!
//! Outgoing commands flow down through `oneway` / `request`; inbound commands and failures flow
//!  up through the [TransportListener] each layer registers on the layer below it.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::command::Command;
use crate::error::{TransportError, TransportResult};

pub mod filter;
pub mod future_response;
pub mod stream_transport;
pub mod tls;
pub mod mutex_transport;
pub mod inactivity_monitor;
pub mod response_correlator;
pub mod logging_transport;
pub mod factory;

pub use future_response::FutureResponse;


#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Starts the transport. A listener must be registered before this is called.
    async fn start(&self) -> TransportResult<()>;

    /// Stops the transport, releasing everything that waits on it. Stopping twice is a no-op.
    async fn stop(&self) -> TransportResult<()>;

    /// Fire-and-forget send.
    async fn oneway(&self, command: Command) -> TransportResult<()>;

    /// Sends a command that requires a response, returning a handle for the response.
    async fn async_request(&self, command: Command) -> TransportResult<FutureResponse>;

    /// Sends a command and waits for its response. `None` waits without a deadline.
    async fn request(&self, command: Command, timeout: Option<Duration>) -> TransportResult<Command>;

    fn set_listener(&self, listener: Arc<dyn TransportListener>);

    fn remote_address(&self) -> Option<String>;

    fn is_fault_tolerant(&self) -> bool {
        false
    }

    fn is_connected(&self) -> bool;

    fn is_closed(&self) -> bool;
}

/// Upward notifications from a transport to the layer (or application) above it.
#[async_trait]
pub trait TransportListener: Send + Sync + 'static {
    async fn on_command(&self, command: Command);

    async fn on_exception(&self, error: TransportError);

    /// The connection was lost, and a fault tolerant transport is reconnecting.
    async fn transport_interrupted(&self) {}

    /// A fault tolerant transport reconnected after an interruption.
    async fn transport_resumed(&self) {}
}


/// Holds the listener registered on a transport. The lock is never held across an `await`.
#[derive(Default)]
pub struct ListenerSlot {
    listener: RwLock<Option<Arc<dyn TransportListener>>>,
}
impl ListenerSlot {
    pub fn set(&self, listener: Arc<dyn TransportListener>) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    pub fn get(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn require(&self) -> TransportResult<Arc<dyn TransportListener>> {
        self.get()
            .ok_or_else(|| TransportError::invalid_operation("no transport listener registered - register it before starting the transport"))
    }
}
