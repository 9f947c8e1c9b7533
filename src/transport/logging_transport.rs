use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::command::Command;
use crate::error::{TransportError, TransportResult};
use crate::transport::filter::TransportFilter;
use crate::transport::{FutureResponse, Transport, TransportListener};

/// Logs every command passing through, in both directions. Added to the stack by the `trace=true`
///  URI option.
pub struct LoggingTransport {
    filter: TransportFilter,
    remote: String,
}

impl LoggingTransport {
    pub fn new(next: Arc<dyn Transport>) -> Arc<LoggingTransport> {
        let remote = next.remote_address().unwrap_or_default();
        Arc::new_cyclic(|myself| LoggingTransport {
            filter: TransportFilter::new(next, myself.clone()),
            remote,
        })
    }
}

#[async_trait]
impl Transport for LoggingTransport {
    async fn start(&self) -> TransportResult<()> {
        self.filter.start().await
    }

    async fn stop(&self) -> TransportResult<()> {
        debug!(remote = %self.remote, "stopping");
        self.filter.stop().await?;
        Ok(())
    }

    async fn oneway(&self, command: Command) -> TransportResult<()> {
        debug!(remote = %self.remote, "SEND: {:?}", command);
        self.filter.oneway(command).await
    }

    async fn async_request(&self, command: Command) -> TransportResult<FutureResponse> {
        debug!(remote = %self.remote, "SEND (async request): {:?}", command);
        self.filter.async_request(command).await
    }

    async fn request(&self, command: Command, timeout: Option<Duration>) -> TransportResult<Command> {
        debug!(remote = %self.remote, "SEND (request): {:?}", command);
        self.filter.request(command, timeout).await
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        self.filter.set_listener(listener);
    }

    fn remote_address(&self) -> Option<String> {
        self.filter.next().remote_address()
    }

    fn is_connected(&self) -> bool {
        self.filter.next().is_connected()
    }

    fn is_closed(&self) -> bool {
        self.filter.is_closed()
    }
}

#[async_trait]
impl TransportListener for LoggingTransport {
    async fn on_command(&self, command: Command) {
        debug!(remote = %self.remote, "RECEIVED: {:?}", command);
        self.filter.fire_command(command).await;
    }

    async fn on_exception(&self, error: TransportError) {
        debug!(remote = %self.remote, "FAILURE: {}", error);
        self.filter.fire_exception(error).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::listener::RecordingListener;
    use crate::test_util::transport::RecordingTransport;

    #[tokio::test]
    async fn test_passes_everything_through() {
        let leaf = RecordingTransport::new("mock://leaf");
        let transport = LoggingTransport::new(leaf.clone());
        let listener = Arc::new(RecordingListener::default());
        transport.set_listener(listener.clone());
        transport.start().await.unwrap();

        transport.oneway(Command::keep_alive()).await.unwrap();
        leaf.inject_command(Command::response(1)).await;
        leaf.inject_exception(TransportError::Closed).await;

        assert_eq!(leaf.sent(), vec![Command::keep_alive()]);
        assert_eq!(listener.commands(), vec![Command::response(1)]);
        assert_eq!(listener.exceptions().len(), 1);
        assert_eq!(transport.remote_address().as_deref(), Some("mock://leaf"));

        transport.stop().await.unwrap();
        assert!(leaf.is_closed());
    }
}
