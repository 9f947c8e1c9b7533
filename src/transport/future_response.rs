use std::time::Duration;

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::command::{Command, CommandId, CommandKind};
use crate::error::{TransportError, TransportResult};

/// The completing side of a [FutureResponse]. Completing consumes it, so a response can be
///  delivered at most once.
pub struct ResponseSlot {
    command_id: CommandId,
    sender: oneshot::Sender<TransportResult<Command>>,
}
impl ResponseSlot {
    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    pub fn complete(self, response: TransportResult<Command>) {
        // the receiver is gone if the caller stopped waiting - nothing to deliver then
        let _ = self.sender.send(response);
    }
}

/// A single-slot handle for the response to one request.
pub struct FutureResponse {
    command_id: CommandId,
    receiver: oneshot::Receiver<TransportResult<Command>>,
}
impl FutureResponse {
    pub fn new(command_id: CommandId) -> (ResponseSlot, FutureResponse) {
        let (sender, receiver) = oneshot::channel();
        (ResponseSlot { command_id, sender }, FutureResponse { command_id, receiver })
    }

    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    /// Waits for the response. An exception response from the broker is returned as
    ///  [TransportError::Broker].
    pub async fn get(&mut self, timeout: Option<Duration>) -> TransportResult<Command> {
        let received = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, &mut self.receiver).await
                .map_err(|_| TransportError::Timeout(timeout))?,
            None => (&mut self.receiver).await,
        };

        match received {
            Ok(response) => Self::unwrap_broker_error(response?),
            Err(_) => Err(TransportError::Disposed),
        }
    }

    /// Returns the response if it is already there, without waiting.
    pub fn try_get(&mut self) -> Option<TransportResult<Command>> {
        match self.receiver.try_recv() {
            Ok(response) => Some(response.and_then(Self::unwrap_broker_error)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(TransportError::Disposed)),
        }
    }

    fn unwrap_broker_error(response: Command) -> TransportResult<Command> {
        match response.kind {
            CommandKind::ExceptionResponse { error, .. } => Err(TransportError::Broker(error)),
            _ => Ok(response),
        }
    }
}
