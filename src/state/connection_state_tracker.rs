use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, trace};

use crate::command::{Command, CommandId, CommandKind, ConnectionId, ConsumerId};
use crate::error::{TransportError, TransportResult};
use crate::state::connection_state::ConnectionState;
use crate::transport::Transport;

/// Returned by [ConnectionStateTracker::track] for commands that shape the session: the tracker
///  will replay them after a reconnect, so they need no other bookkeeping for recovery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tracked;

/// Records the session-shaping commands sent on a failover transport, mirroring the set of
///  connections, consumers and producers the broker has accepted, and replays them onto a new
///  connection after a reconnect.
#[derive(Default)]
pub struct ConnectionStateTracker {
    connections: Mutex<BTreeMap<ConnectionId, ConnectionState>>,
    shut_down: AtomicBool,
}

impl ConnectionStateTracker {
    fn connections(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, ConnectionState>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inspects an outgoing command, updating the recorded state for add / remove of
    ///  connections, consumers and producers. Consumers and producers for connections that
    ///  are not tracked are not tracked either. Fails once the tracker is shut down.
    pub fn track(&self, command: &Command) -> TransportResult<Option<Tracked>> {
        let mut connections = self.connections();
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::invalid_operation("connection state tracker is shut down"));
        }

        match &command.kind {
            CommandKind::ConnectionInfo(info) => {
                trace!("tracking connection {}", info.connection_id);
                connections.insert(info.connection_id.clone(), ConnectionState::new(info.connection_id.clone(), command.clone()));
                Ok(Some(Tracked))
            }
            CommandKind::RemoveConnection(connection_id) => {
                if let Some(mut state) = connections.remove(connection_id) {
                    trace!("no longer tracking connection {}", connection_id);
                    state.shutdown();
                }
                Ok(Some(Tracked))
            }
            CommandKind::ConsumerInfo(info) => {
                match connections.get_mut(&info.consumer_id.connection_id) {
                    Some(state) => {
                        state.add_consumer(info.consumer_id.clone(), command.clone())?;
                        Ok(Some(Tracked))
                    }
                    None => Ok(None),
                }
            }
            CommandKind::RemoveConsumer(consumer_id) => {
                match connections.get_mut(&consumer_id.connection_id) {
                    Some(state) => {
                        state.remove_consumer(consumer_id)?;
                        Ok(Some(Tracked))
                    }
                    None => Ok(None),
                }
            }
            CommandKind::ProducerInfo(info) => {
                match connections.get_mut(&info.producer_id.connection_id) {
                    Some(state) => {
                        state.add_producer(info.producer_id.clone(), command.clone())?;
                        Ok(Some(Tracked))
                    }
                    None => Ok(None),
                }
            }
            CommandKind::RemoveProducer(producer_id) => {
                match connections.get_mut(&producer_id.connection_id) {
                    Some(state) => {
                        state.remove_producer(producer_id)?;
                        Ok(Some(Tracked))
                    }
                    None => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }

    /// The broker rejected the command with the given id: forget the consumer or producer it
    ///  created, so that replay does not re-create it
    pub fn untrack_rejected(&self, command_id: CommandId) {
        for state in self.connections().values_mut() {
            if state.remove_by_command_id(command_id) {
                debug!("broker rejected command #{} - no longer tracking it", command_id);
                return;
            }
        }
    }

    /// Replays the recorded state onto a (new) transport: per connection the connect command,
    ///  then its consumers, then its producers. Returns the ids of replayed commands that will
    ///  be answered by the broker.
    pub async fn do_restore(&self, transport: &dyn Transport) -> TransportResult<Vec<CommandId>> {
        let commands = self.replay_commands();
        info!("restoring {} command(s) on {}", commands.len(), transport.remote_address().unwrap_or_default());

        let mut awaiting_response = Vec::new();
        for command in commands {
            trace!("replaying {}", command);
            if command.response_required {
                awaiting_response.push(command.command_id);
            }
            transport.oneway(command).await?;
        }
        Ok(awaiting_response)
    }

    fn replay_commands(&self) -> Vec<Command> {
        let connections = self.connections();

        let mut result = Vec::new();
        for state in connections.values() {
            result.push(state.info().clone());
            result.extend(state.consumers().map(|(_, c)| c.info().clone()));
            result.extend(state.producers().map(|(_, p)| p.info().clone()));
        }
        result
    }

    pub fn consumer_ids(&self) -> Vec<ConsumerId> {
        self.connections().values()
            .flat_map(|state| state.consumers().map(|(id, _)| id.clone()).collect::<Vec<_>>())
            .collect()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections().keys().cloned().collect()
    }

    /// Forgets all state and rejects further tracking. Idempotent.
    pub fn shutdown(&self) {
        let mut connections = self.connections();
        self.shut_down.store(true, Ordering::Release);
        for state in connections.values_mut() {
            state.shutdown();
        }
        connections.clear();
    }
}
