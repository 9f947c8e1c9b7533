use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::trace;

use crate::command::Command;
use crate::error::{TransportError, TransportResult};
use crate::transport::filter::TransportFilter;
use crate::transport::{FutureResponse, Transport, TransportListener};

/// Serializes senders: every `oneway`, `async_request` and `request` runs inside one critical
///  section, so commands reach the wire in the order their callers acquired the section.
///
/// Acquisition is bounded by the caller's timeout (for `request`) or the configured lock
///  timeout, and waiters are released with [TransportError::Disposed] when the filter stops.
pub struct MutexTransport {
    filter: TransportFilter,
    send_lock: Mutex<()>,
    lock_timeout: Option<Duration>,
    closed_sender: watch::Sender<bool>,
}

impl MutexTransport {
    pub fn new(next: Arc<dyn Transport>, lock_timeout: Option<Duration>) -> Arc<MutexTransport> {
        let (closed_sender, _) = watch::channel(false);
        Arc::new_cyclic(|myself| MutexTransport {
            filter: TransportFilter::new(next, myself.clone()),
            send_lock: Mutex::new(()),
            lock_timeout,
            closed_sender,
        })
    }

    async fn acquire(&self, timeout: Option<Duration>) -> TransportResult<MutexGuard<'_, ()>> {
        if self.filter.is_closed() {
            return Err(TransportError::Disposed);
        }

        let mut closed_receiver = self.closed_sender.subscribe();
        let locked = async {
            tokio::select! {
                guard = self.send_lock.lock() => Ok(guard),
                _ = closed_receiver.wait_for(|closed| *closed) => Err(TransportError::Disposed),
            }
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, locked).await
                .map_err(|_| {
                    trace!("could not acquire the send lock within {:?}", timeout);
                    TransportError::Timeout(timeout)
                })?,
            None => locked.await,
        }
    }
}

#[async_trait]
impl Transport for MutexTransport {
    async fn start(&self) -> TransportResult<()> {
        self.filter.start().await
    }

    async fn stop(&self) -> TransportResult<()> {
        self.closed_sender.send_replace(true);
        self.filter.stop().await?;
        Ok(())
    }

    async fn oneway(&self, command: Command) -> TransportResult<()> {
        let _guard = self.acquire(self.lock_timeout).await?;
        self.filter.oneway(command).await
    }

    async fn async_request(&self, command: Command) -> TransportResult<FutureResponse> {
        let _guard = self.acquire(self.lock_timeout).await?;
        self.filter.async_request(command).await
    }

    async fn request(&self, command: Command, timeout: Option<Duration>) -> TransportResult<Command> {
        let _guard = self.acquire(timeout).await?;
        self.filter.request(command, timeout).await
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        self.filter.set_listener(listener);
    }

    fn remote_address(&self) -> Option<String> {
        self.filter.next().remote_address()
    }

    fn is_fault_tolerant(&self) -> bool {
        self.filter.next().is_fault_tolerant()
    }

    fn is_connected(&self) -> bool {
        self.filter.next().is_connected()
    }

    fn is_closed(&self) -> bool {
        self.filter.is_closed()
    }
}

#[async_trait]
impl TransportListener for MutexTransport {
    async fn on_command(&self, command: Command) {
        self.filter.fire_command(command).await;
    }

    async fn on_exception(&self, error: TransportError) {
        self.filter.fire_exception(error).await;
    }

    async fn transport_interrupted(&self) {
        self.filter.fire_interrupted().await;
    }

    async fn transport_resumed(&self) {
        self.filter.fire_resumed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::listener::RecordingListener;
    use crate::test_util::transport::RecordingTransport;

    fn new_mutex_transport(lock_timeout: Option<Duration>) -> (Arc<MutexTransport>, Arc<RecordingTransport>) {
        let leaf = RecordingTransport::new("mock://leaf");
        let transport = MutexTransport::new(leaf.clone(), lock_timeout);
        transport.set_listener(Arc::new(RecordingListener::default()));
        (transport, leaf)
    }

    #[tokio::test]
    async fn test_start_requires_listener() {
        let transport = MutexTransport::new(RecordingTransport::new("mock://leaf"), None);
        assert!(matches!(transport.start().await, Err(TransportError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_oneway_forwards_in_order() {
        let (transport, leaf) = new_mutex_transport(None);
        transport.start().await.unwrap();

        for id in 1..=3 {
            transport.oneway(Command::response(id)).await.unwrap();
        }
        assert_eq!(leaf.sent(), vec![Command::response(1), Command::response(2), Command::response(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_timeout() {
        let (transport, _leaf) = new_mutex_transport(Some(Duration::from_millis(100)));
        transport.start().await.unwrap();

        let _guard = transport.send_lock.lock().await;
        let result = transport.oneway(Command::keep_alive()).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_stop_releases_waiters() {
        let (transport, leaf) = new_mutex_transport(None);
        transport.start().await.unwrap();

        let guard = transport.send_lock.lock().await;
        let waiter = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.oneway(Command::keep_alive()).await })
        };
        tokio::task::yield_now().await;

        transport.stop().await.unwrap();
        assert!(matches!(waiter.await.unwrap(), Err(TransportError::Disposed)));
        drop(guard);

        assert!(leaf.is_closed());
        assert!(matches!(transport.oneway(Command::keep_alive()).await, Err(TransportError::Disposed)));
        assert!(leaf.sent().is_empty());
    }
}
