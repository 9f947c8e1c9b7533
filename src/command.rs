use std::fmt::{Debug, Display, Formatter};
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;

pub type CommandId = u32;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(pub String);
impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        ConnectionId(value.to_string())
    }
}

/// A consumer is identified by its connection and a number that is unique within that
///  connection. The STOMP subscription id is derived from both.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConsumerId {
    pub connection_id: ConnectionId,
    pub value: u64,
}
impl ConsumerId {
    pub fn new(connection_id: ConnectionId, value: u64) -> ConsumerId {
        ConsumerId { connection_id, value }
    }

    pub fn subscription_id(&self) -> String {
        format!("{}:{}", self.connection_id, self.value)
    }

    pub fn parse_subscription_id(s: &str) -> Option<ConsumerId> {
        let (connection_id, value) = s.rsplit_once(':')?;
        Some(ConsumerId {
            connection_id: ConnectionId(connection_id.to_string()),
            value: value.parse().ok()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProducerId {
    pub connection_id: ConnectionId,
    pub value: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TransactionId(pub String);


/// Heart-beat intervals as exchanged during the handshake. A zero duration means "not
///  supported / not wanted" for that direction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HeartBeat {
    pub send: Duration,
    pub receive: Duration,
}
impl HeartBeat {
    pub fn new(send: Duration, receive: Duration) -> HeartBeat {
        HeartBeat { send, receive }
    }

    /// Combines the client's and the broker's heart-beat settings into the effective
    ///  (write check, read check) intervals for the client side.
    pub fn negotiate(client: HeartBeat, broker: HeartBeat) -> (Duration, Duration) {
        fn pick(a: Duration, b: Duration) -> Duration {
            if a.is_zero() || b.is_zero() {
                Duration::ZERO
            }
            else {
                a.max(b)
            }
        }

        (pick(client.send, broker.receive), pick(client.receive, broker.send))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub client_id: Option<String>,
    pub host: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub heart_beat: HeartBeat,
}
impl ConnectionInfo {
    pub fn new(connection_id: ConnectionId) -> ConnectionInfo {
        ConnectionInfo {
            connection_id,
            client_id: None,
            host: None,
            username: None,
            password: None,
            heart_beat: HeartBeat::default(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectedInfo {
    pub correlation_id: CommandId,
    pub version: Option<String>,
    pub session: Option<String>,
    pub server: Option<String>,
    pub heart_beat: HeartBeat,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AckMode {
    Auto,
    Client,
    ClientIndividual,
}
impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }

    pub fn parse(s: &str) -> Option<AckMode> {
        match s {
            "auto" => Some(AckMode::Auto),
            "client" => Some(AckMode::Client),
            "client-individual" => Some(AckMode::ClientIndividual),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConsumerInfo {
    pub consumer_id: ConsumerId,
    pub destination: String,
    pub ack_mode: AckMode,
    pub selector: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub destination: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransactionKind {
    Begin,
    Commit,
    Rollback,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransactionInfo {
    pub connection_id: ConnectionId,
    pub transaction_id: TransactionId,
    pub kind: TransactionKind,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Message {
    pub destination: String,
    pub message_id: Option<String>,
    pub transaction_id: Option<TransactionId>,
    pub headers: FxHashMap<String, String>,
    pub body: Bytes,
}

/// An inbound message together with the routing information needed to hand it to a consumer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageDispatch {
    pub consumer_id: ConsumerId,
    pub destination: String,
    pub message: Message,
    pub redelivery_counter: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageAck {
    pub consumer_id: ConsumerId,
    pub message_id: String,
    pub transaction_id: Option<TransactionId>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BrokerError {
    pub message: String,
    pub details: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandKind {
    ConnectionInfo(ConnectionInfo),
    Connected(ConnectedInfo),
    RemoveConnection(ConnectionId),
    ConsumerInfo(ConsumerInfo),
    RemoveConsumer(ConsumerId),
    ProducerInfo(ProducerInfo),
    RemoveProducer(ProducerId),
    Transaction(TransactionInfo),
    Message(Message),
    MessageDispatch(MessageDispatch),
    MessageAck(MessageAck),
    KeepAlive,
    Shutdown,
    Response { correlation_id: CommandId },
    ExceptionResponse { correlation_id: CommandId, error: BrokerError },
}

/// A protocol command travelling through the transport stack. `command_id` is assigned by the
///  response correlator for outgoing commands; commands received from the broker carry the
///  broker-side id (or 0 if the wire format has none).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Command {
    pub command_id: CommandId,
    pub response_required: bool,
    pub kind: CommandKind,
}
impl Command {
    pub fn new(kind: CommandKind) -> Command {
        Command {
            command_id: 0,
            response_required: false,
            kind,
        }
    }

    pub fn keep_alive() -> Command {
        Command::new(CommandKind::KeepAlive)
    }

    pub fn shutdown() -> Command {
        Command::new(CommandKind::Shutdown)
    }

    pub fn response(correlation_id: CommandId) -> Command {
        Command::new(CommandKind::Response { correlation_id })
    }

    pub fn exception_response(correlation_id: CommandId, message: impl Into<String>) -> Command {
        Command::new(CommandKind::ExceptionResponse {
            correlation_id,
            error: BrokerError {
                message: message.into(),
                details: None,
            },
        })
    }

    pub fn is_response(&self) -> bool {
        self.correlation_id().is_some()
    }

    pub fn correlation_id(&self) -> Option<CommandId> {
        match &self.kind {
            CommandKind::Response { correlation_id } => Some(*correlation_id),
            CommandKind::ExceptionResponse { correlation_id, .. } => Some(*correlation_id),
            CommandKind::Connected(info) => Some(info.correlation_id),
            _ => None,
        }
    }

    pub fn is_remove(&self) -> bool {
        matches!(self.kind, CommandKind::RemoveConnection(_) | CommandKind::RemoveConsumer(_) | CommandKind::RemoveProducer(_))
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self.kind, CommandKind::Shutdown)
    }

    pub fn is_keep_alive(&self) -> bool {
        matches!(self.kind, CommandKind::KeepAlive)
    }

    pub fn is_message_dispatch(&self) -> bool {
        matches!(self.kind, CommandKind::MessageDispatch(_))
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            CommandKind::ConnectionInfo(_) => "ConnectionInfo",
            CommandKind::Connected(_) => "Connected",
            CommandKind::RemoveConnection(_) => "RemoveConnection",
            CommandKind::ConsumerInfo(_) => "ConsumerInfo",
            CommandKind::RemoveConsumer(_) => "RemoveConsumer",
            CommandKind::ProducerInfo(_) => "ProducerInfo",
            CommandKind::RemoveProducer(_) => "RemoveProducer",
            CommandKind::Transaction(_) => "Transaction",
            CommandKind::Message(_) => "Message",
            CommandKind::MessageDispatch(_) => "MessageDispatch",
            CommandKind::MessageAck(_) => "MessageAck",
            CommandKind::KeepAlive => "KeepAlive",
            CommandKind::Shutdown => "Shutdown",
            CommandKind::Response { .. } => "Response",
            CommandKind::ExceptionResponse { .. } => "ExceptionResponse",
        }
    }
}
impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.name(), self.command_id)?;
        if self.response_required {
            write!(f, "(response required)")?;
        }
        if let Some(correlation_id) = self.correlation_id() {
            write!(f, "->#{}", correlation_id)?;
        }
        Ok(())
    }
}
