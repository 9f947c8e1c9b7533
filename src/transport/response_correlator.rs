use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::command::{Command, CommandId};
use crate::error::{TransportError, TransportResult};
use crate::transport::filter::TransportFilter;
use crate::transport::future_response::ResponseSlot;
use crate::transport::{FutureResponse, Transport, TransportListener};
use crate::util::id_generator::CommandIdGenerator;

#[derive(Default)]
struct CorrelatorState {
    pending: BTreeMap<CommandId, ResponseSlot>,
    /// once set, the correlator fails new requests immediately
    prior_error: Option<TransportError>,
}

/// Turns one-way dispatch into request / response. Every outgoing command gets a fresh id, and
///  inbound responses are matched to their requests by correlation id, regardless of the order
///  in which they arrive.
pub struct ResponseCorrelator {
    filter: TransportFilter,
    id_generator: Arc<CommandIdGenerator>,
    state: Mutex<CorrelatorState>,
}

impl ResponseCorrelator {
    pub fn new(next: Arc<dyn Transport>, id_generator: Arc<CommandIdGenerator>) -> Arc<ResponseCorrelator> {
        Arc::new_cyclic(|myself| ResponseCorrelator {
            filter: TransportFilter::new(next, myself.clone()),
            id_generator,
            state: Default::default(),
        })
    }

    pub fn num_pending(&self) -> usize {
        self.lock_state().pending.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CorrelatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_pending(&self, command_id: CommandId) -> Option<ResponseSlot> {
        self.lock_state().pending.remove(&command_id)
    }

    /// Completes every pending request with `error`
    fn flush_pending(&self, error: &TransportError) {
        let pending = std::mem::take(&mut self.lock_state().pending);
        if !pending.is_empty() {
            debug!("failing {} pending request(s): {}", pending.len(), error);
        }
        for slot in pending.into_values() {
            slot.complete(Err(error.clone()));
        }
    }
}

#[async_trait]
impl Transport for ResponseCorrelator {
    async fn start(&self) -> TransportResult<()> {
        self.filter.start().await
    }

    async fn stop(&self) -> TransportResult<()> {
        self.flush_pending(&TransportError::Disposed);
        self.filter.stop().await?;
        Ok(())
    }

    async fn oneway(&self, mut command: Command) -> TransportResult<()> {
        command.command_id = self.id_generator.next_id();
        command.response_required = false;
        self.filter.oneway(command).await
    }

    async fn async_request(&self, mut command: Command) -> TransportResult<FutureResponse> {
        command.command_id = self.id_generator.next_id();
        command.response_required = true;

        let (slot, future) = FutureResponse::new(command.command_id);
        {
            let mut state = self.lock_state();
            if let Some(e) = &state.prior_error {
                return Err(e.clone());
            }
            state.pending.insert(command.command_id, slot);
        }

        let command_id = command.command_id;
        trace!("sending request {}", command);
        if let Err(e) = self.filter.oneway(command).await {
            self.remove_pending(command_id);
            return Err(e);
        }
        Ok(future)
    }

    async fn request(&self, command: Command, timeout: Option<Duration>) -> TransportResult<Command> {
        let mut future = self.async_request(command).await?;
        let result = future.get(timeout).await;
        if result.is_err() {
            self.remove_pending(future.command_id());
        }
        result
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
impl TransportListener for ResponseCorrelator {
    async fn on_command(&self, command: Command) {
        let Some(correlation_id) = command.correlation_id() else {
            self.filter.fire_command(command).await;
            return;
        };

        match self.remove_pending(correlation_id) {
            Some(slot) => {
                trace!("received response {}", command);
                slot.complete(Ok(command));
            }
            None if self.filter.is_closed() || self.lock_state().prior_error.is_some() => {
                debug!("response {} arrived after the pending requests were flushed - dropping it", command);
            }
            None => warn!("no pending request for response {} - dropping it", command),
        }
    }

    async fn on_exception(&self, error: TransportError) {
        {
            let mut state = self.lock_state();
            if state.prior_error.is_none() {
                state.prior_error = Some(error.clone());
            }
        }
        self.flush_pending(&error);
        self.filter.fire_exception(error).await;
    }

    async fn transport_interrupted(&self) {
        self.filter.fire_interrupted().await;
    }

    async fn transport_resumed(&self) {
        self.filter.fire_resumed().await;
    }
}
