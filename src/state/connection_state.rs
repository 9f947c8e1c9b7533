use std::collections::BTreeMap;

use crate::command::{Command, CommandId, ConnectionId, ConsumerId, ProducerId};
use crate::error::{TransportError, TransportResult};

/// Wraps the add-consumer command that created a consumer
#[derive(Clone, Debug)]
pub struct ConsumerState {
    info: Command,
}
impl ConsumerState {
    pub fn info(&self) -> &Command {
        &self.info
    }
}

#[derive(Clone, Debug)]
pub struct ProducerState {
    info: Command,
}
impl ProducerState {
    pub fn info(&self) -> &Command {
        &self.info
    }
}

/// Everything that was established on one logical connection. The connect command is fixed for
///  the lifetime of the state; consumers and producers come and go.
///
/// Once shut down, the state is empty and rejects further changes.
#[derive(Debug)]
pub struct ConnectionState {
    connection_id: ConnectionId,
    info: Command,
    consumers: BTreeMap<ConsumerId, ConsumerState>,
    producers: BTreeMap<ProducerId, ProducerState>,
    shut_down: bool,
}

impl ConnectionState {
    pub fn new(connection_id: ConnectionId, info: Command) -> ConnectionState {
        ConnectionState {
            connection_id,
            info,
            consumers: Default::default(),
            producers: Default::default(),
            shut_down: false,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn info(&self) -> &Command {
        &self.info
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    fn check_not_shut_down(&self) -> TransportResult<()> {
        if self.shut_down {
            return Err(TransportError::invalid_operation(format!("connection {} was already removed", self.connection_id)));
        }
        Ok(())
    }

    pub fn add_consumer(&mut self, consumer_id: ConsumerId, info: Command) -> TransportResult<()> {
        self.check_not_shut_down()?;
        self.consumers.insert(consumer_id, ConsumerState { info });
        Ok(())
    }

    pub fn remove_consumer(&mut self, consumer_id: &ConsumerId) -> TransportResult<Option<ConsumerState>> {
        self.check_not_shut_down()?;
        Ok(self.consumers.remove(consumer_id))
    }

    pub fn add_producer(&mut self, producer_id: ProducerId, info: Command) -> TransportResult<()> {
        self.check_not_shut_down()?;
        self.producers.insert(producer_id, ProducerState { info });
        Ok(())
    }

    pub fn remove_producer(&mut self, producer_id: &ProducerId) -> TransportResult<Option<ProducerState>> {
        self.check_not_shut_down()?;
        Ok(self.producers.remove(producer_id))
    }

    /// Forgets whichever consumer or producer was created by the command with the given id
    pub fn remove_by_command_id(&mut self, command_id: CommandId) -> bool {
        let num_before = self.consumers.len() + self.producers.len();
        self.consumers.retain(|_, c| c.info.command_id != command_id);
        self.producers.retain(|_, p| p.info.command_id != command_id);
        self.consumers.len() + self.producers.len() != num_before
    }

    pub fn consumers(&self) -> impl Iterator<Item = (&ConsumerId, &ConsumerState)> {
        self.consumers.iter()
    }

    pub fn producers(&self) -> impl Iterator<Item = (&ProducerId, &ProducerState)> {
        self.producers.iter()
    }

    /// idempotent
    pub fn shutdown(&mut self) {
        self.shut_down = true;
        self.consumers.clear();
        self.producers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;

    fn consumer_id(n: u64) -> ConsumerId {
        ConsumerId::new(ConnectionId::from("c1"), n)
    }

    fn command(command_id: CommandId) -> Command {
        let mut command = Command::new(CommandKind::RemoveConsumer(consumer_id(99)));
        command.command_id = command_id;
        command
    }

    #[test]
    fn test_consumers() {
        let mut state = ConnectionState::new(ConnectionId::from("c1"), command(1));
        state.add_consumer(consumer_id(1), command(2)).unwrap();
        state.add_consumer(consumer_id(2), command(3)).unwrap();
        assert_eq!(state.remove_consumer(&consumer_id(1)).unwrap().unwrap().info().command_id, 2);
        assert!(state.remove_consumer(&consumer_id(1)).unwrap().is_none());

        let remaining = state.consumers().map(|(id, _)| id.clone()).collect::<Vec<_>>();
        assert_eq!(remaining, vec![consumer_id(2)]);
    }

    #[test]
    fn test_remove_by_command_id() {
        let mut state = ConnectionState::new(ConnectionId::from("c1"), command(1));
        state.add_consumer(consumer_id(1), command(2)).unwrap();
        assert!(!state.remove_by_command_id(5));
        assert!(state.remove_by_command_id(2));
        assert_eq!(state.consumers().count(), 0);
    }

    #[test]
    fn test_shutdown_rejects_changes() {
        let mut state = ConnectionState::new(ConnectionId::from("c1"), command(1));
        state.add_consumer(consumer_id(1), command(2)).unwrap();

        state.shutdown();
        state.shutdown();
        assert!(state.is_shut_down());
        assert_eq!(state.consumers().count(), 0);
        assert!(matches!(state.add_consumer(consumer_id(3), command(4)), Err(TransportError::InvalidOperation(_))));
        assert!(state.remove_consumer(&consumer_id(1)).is_err());
    }
}
