use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashSet;

use crate::error::{TransportError, TransportResult};
use crate::test_util::listener::wait_until;
use crate::test_util::transport::RecordingTransport;
use crate::transport::factory::TransportFactory;
use crate::transport::Transport;
use crate::uri::EndpointUri;

/// Creates [RecordingTransport]s instead of network connections. Hosts can be marked as refusing
///  connections, and every connection attempt is recorded.
#[derive(Default)]
pub struct RecordingTransportFactory {
    created: Mutex<Vec<Arc<RecordingTransport>>>,
    attempts: Mutex<Vec<String>>,
    refused: Mutex<FxHashSet<String>>,
    auto_respond: AtomicBool,
}

impl RecordingTransportFactory {
    pub fn refuse(&self, host: &str) {
        self.refused.lock().unwrap_or_else(PoisonError::into_inner).insert(host.to_string());
    }

    pub fn accept(&self, host: &str) {
        self.refused.lock().unwrap_or_else(PoisonError::into_inner).remove(host);
    }

    /// Makes transports created from now on answer every request, see
    ///  [RecordingTransport::respond_to_requests]
    pub fn auto_respond(&self, auto_respond: bool) {
        self.auto_respond.store(auto_respond, Ordering::Release);
    }

    pub fn created(&self) -> Vec<Arc<RecordingTransport>> {
        self.created.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// the hosts of all connection attempts, refused or not
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub async fn wait_for_created(&self, n: usize, timeout: Duration) -> Vec<Arc<RecordingTransport>> {
        wait_until(timeout, || self.created.lock().unwrap_or_else(PoisonError::into_inner).len() >= n).await;
        let created = self.created();
        assert!(created.len() >= n, "expected {} transports, {} were created", n, created.len());
        created
    }

    fn create_recording(&self, uri: &EndpointUri) -> TransportResult<Arc<RecordingTransport>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner).push(uri.host.clone());
        if self.refused.lock().unwrap_or_else(PoisonError::into_inner).contains(&uri.host) {
            return Err(TransportError::ConnectionFailed(format!("{} refused the connection", uri)));
        }

        let transport = RecordingTransport::new(uri.to_string());
        if self.auto_respond.load(Ordering::Acquire) {
            transport.respond_to_requests();
        }
        self.created.lock().unwrap_or_else(PoisonError::into_inner).push(transport.clone());
        Ok(transport)
    }
}

#[async_trait]
impl TransportFactory for RecordingTransportFactory {
    async fn create(&self, uri: &EndpointUri) -> TransportResult<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = self.create_recording(uri)?;
        Ok(transport)
    }

    async fn create_composite(&self, uri: &EndpointUri) -> TransportResult<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = self.create_recording(uri)?;
        Ok(transport)
    }
}
