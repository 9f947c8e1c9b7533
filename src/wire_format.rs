//! The byte-level codec used by leaf transports. The transport stack treats a [WireFormat] as
//!  an opaque, order-preserving codec; [StompWireFormat] is the STOMP 1.2 text framing.
//!
//! STOMP frame layout:
//! ```ascii
//! COMMAND\n
//! header1:value1\n
//! header2:value2\n
//! \n
//! body\0
//! ```
//! A bare `\n` outside a frame is a heart-beat.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::trace;

use crate::command::*;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 16*1024*1024;

#[async_trait]
pub trait WireFormat: Send + Sync + 'static {
    /// Appends the wire representation of a command to `buf`. Commands without a wire
    ///  representation append nothing.
    fn marshal(&self, command: &Command, buf: &mut BytesMut) -> anyhow::Result<()>;

    /// Reads exactly one command from the stream, waiting until it is complete.
    async fn unmarshal(&self, source: &mut (dyn AsyncBufRead + Send + Unpin)) -> anyhow::Result<Command>;
}

/// A wire format may keep per-connection state, so every leaf transport gets its own instance.
pub trait WireFormatFactory: Send + Sync + 'static {
    fn create(&self, max_frame_size: usize) -> Arc<dyn WireFormat>;
}

#[derive(Default)]
pub struct StompWireFormatFactory;
impl WireFormatFactory for StompWireFormatFactory {
    fn create(&self, max_frame_size: usize) -> Arc<dyn WireFormat> {
        Arc::new(StompWireFormat::new(max_frame_size))
    }
}


pub struct StompWireFormat {
    max_frame_size: usize,
    /// STOMP brokers do not send a receipt for CONNECT, so the CONNECTED frame is correlated
    ///  to the most recent CONNECT sent on this connection.
    last_connect_id: AtomicU32,
}

impl StompWireFormat {
    pub fn new(max_frame_size: usize) -> StompWireFormat {
        StompWireFormat {
            max_frame_size,
            last_connect_id: AtomicU32::new(0),
        }
    }

    fn to_frame(&self, command: &Command) -> Option<StompFrame> {
        let mut frame = match &command.kind {
            CommandKind::ConnectionInfo(info) => {
                self.last_connect_id.store(command.command_id, Ordering::Release);
                let mut frame = StompFrame::new("CONNECT");
                frame.header("accept-version", "1.1,1.2");
                frame.opt_header("host", info.host.as_deref());
                frame.opt_header("login", info.username.as_deref());
                frame.opt_header("passcode", info.password.as_deref());
                frame.opt_header("client-id", info.client_id.as_deref());
                frame.header("heart-beat", &format_heart_beat(info.heart_beat));
                frame
            }
            CommandKind::Connected(info) => {
                let mut frame = StompFrame::new("CONNECTED");
                frame.opt_header("version", info.version.as_deref());
                frame.opt_header("session", info.session.as_deref());
                frame.opt_header("server", info.server.as_deref());
                frame.header("heart-beat", &format_heart_beat(info.heart_beat));
                frame.header("receipt-id", &info.correlation_id.to_string());
                return Some(frame);
            }
            CommandKind::RemoveConnection(_) => StompFrame::new("DISCONNECT"),
            CommandKind::ConsumerInfo(info) => {
                let mut frame = StompFrame::new("SUBSCRIBE");
                frame.header("id", &info.consumer_id.subscription_id());
                frame.header("destination", &info.destination);
                frame.header("ack", info.ack_mode.as_str());
                frame.opt_header("selector", info.selector.as_deref());
                frame
            }
            CommandKind::RemoveConsumer(consumer_id) => {
                let mut frame = StompFrame::new("UNSUBSCRIBE");
                frame.header("id", &consumer_id.subscription_id());
                frame
            }
            CommandKind::Transaction(info) => {
                let mut frame = StompFrame::new(match info.kind {
                    TransactionKind::Begin => "BEGIN",
                    TransactionKind::Commit => "COMMIT",
                    TransactionKind::Rollback => "ABORT",
                });
                frame.header("transaction", &info.transaction_id.0);
                frame
            }
            CommandKind::Message(msg) => {
                let mut frame = StompFrame::new("SEND");
                frame.header("destination", &msg.destination);
                frame.opt_header("transaction", msg.transaction_id.as_ref().map(|t| t.0.as_str()));
                frame.add_message_headers(msg);
                frame
            }
            CommandKind::MessageDispatch(dispatch) => {
                let mut frame = StompFrame::new("MESSAGE");
                frame.header("subscription", &dispatch.consumer_id.subscription_id());
                frame.header("destination", &dispatch.destination);
                frame.opt_header("message-id", dispatch.message.message_id.as_deref());
                if dispatch.redelivery_counter > 0 {
                    frame.header("redelivered", "true");
                }
                frame.add_message_headers(&dispatch.message);
                return Some(frame);
            }
            CommandKind::MessageAck(ack) => {
                let mut frame = StompFrame::new("ACK");
                frame.header("id", &ack.message_id);
                frame.header("subscription", &ack.consumer_id.subscription_id());
                frame.opt_header("transaction", ack.transaction_id.as_ref().map(|t| t.0.as_str()));
                frame
            }
            CommandKind::Response { correlation_id } => {
                let mut frame = StompFrame::new("RECEIPT");
                frame.header("receipt-id", &correlation_id.to_string());
                return Some(frame);
            }
            CommandKind::ExceptionResponse { correlation_id, error } => {
                let mut frame = StompFrame::new("ERROR");
                frame.header("receipt-id", &correlation_id.to_string());
                frame.header("message", &error.message);
                if let Some(details) = &error.details {
                    frame.body = Bytes::copy_from_slice(details.as_bytes());
                }
                return Some(frame);
            }
            // STOMP has no frames for these: producers are a client-side concept, and shutdown
            //  is implied by closing the socket
            CommandKind::ProducerInfo(_) | CommandKind::RemoveProducer(_) | CommandKind::Shutdown => return None,
            CommandKind::KeepAlive => return None,
        };

        if command.response_required {
            frame.header("receipt", &command.command_id.to_string());
        }
        Some(frame)
    }

    fn to_command(&self, frame: StompFrame) -> anyhow::Result<Command> {
        let receipt = match frame.get("receipt") {
            Some(r) => Some(parse_id(r)?),
            None => None,
        };

        let kind = match frame.verb.as_str() {
            "CONNECT" | "STOMP" => CommandKind::ConnectionInfo(ConnectionInfo {
                connection_id: ConnectionId(frame.get("client-id").unwrap_or_default().to_string()),
                client_id: frame.get("client-id").map(str::to_string),
                host: frame.get("host").map(str::to_string),
                username: frame.get("login").map(str::to_string),
                password: frame.get("passcode").map(str::to_string),
                heart_beat: parse_heart_beat(frame.get("heart-beat"))?,
            }),
            "CONNECTED" => {
                let correlation_id = match frame.get("receipt-id") {
                    Some(r) => parse_id(r)?,
                    None => self.last_connect_id.load(Ordering::Acquire),
                };
                CommandKind::Connected(ConnectedInfo {
                    correlation_id,
                    version: frame.get("version").map(str::to_string),
                    session: frame.get("session").map(str::to_string),
                    server: frame.get("server").map(str::to_string),
                    heart_beat: parse_heart_beat(frame.get("heart-beat"))?,
                })
            }
            "DISCONNECT" => CommandKind::RemoveConnection(ConnectionId(String::new())),
            "SUBSCRIBE" => CommandKind::ConsumerInfo(ConsumerInfo {
                consumer_id: frame.require_consumer_id("id")?,
                destination: frame.require("destination")?.to_string(),
                ack_mode: match frame.get("ack") {
                    Some(ack) => AckMode::parse(ack).ok_or_else(|| anyhow!("invalid ack mode {:?}", ack))?,
                    None => AckMode::Auto,
                },
                selector: frame.get("selector").map(str::to_string),
            }),
            "UNSUBSCRIBE" => CommandKind::RemoveConsumer(frame.require_consumer_id("id")?),
            "BEGIN" | "COMMIT" | "ABORT" => CommandKind::Transaction(TransactionInfo {
                connection_id: ConnectionId(String::new()),
                transaction_id: TransactionId(frame.require("transaction")?.to_string()),
                kind: match frame.verb.as_str() {
                    "BEGIN" => TransactionKind::Begin,
                    "COMMIT" => TransactionKind::Commit,
                    _ => TransactionKind::Rollback,
                },
            }),
            "SEND" => CommandKind::Message(frame.to_message()?),
            "MESSAGE" => {
                let consumer_id = frame.require_consumer_id("subscription")?;
                let redelivered = frame.get("redelivered") == Some("true");
                let message = frame.to_message()?;
                CommandKind::MessageDispatch(MessageDispatch {
                    consumer_id,
                    destination: message.destination.clone(),
                    message,
                    redelivery_counter: if redelivered { 1 } else { 0 },
                })
            }
            "ACK" => CommandKind::MessageAck(MessageAck {
                consumer_id: frame.require_consumer_id("subscription")?,
                message_id: frame.require("id")?.to_string(),
                transaction_id: frame.get("transaction").map(|t| TransactionId(t.to_string())),
            }),
            "RECEIPT" => CommandKind::Response {
                correlation_id: parse_id(frame.require("receipt-id")?)?,
            },
            "ERROR" => CommandKind::ExceptionResponse {
                correlation_id: match frame.get("receipt-id") {
                    Some(r) => parse_id(r)?,
                    None => 0,
                },
                error: BrokerError {
                    message: frame.get("message").unwrap_or("broker reported an error").to_string(),
                    details: if frame.body.is_empty() { None } else { Some(String::from_utf8_lossy(&frame.body).into_owned()) },
                },
            },
            other => bail!("unsupported STOMP command {:?}", other),
        };

        Ok(Command {
            command_id: receipt.unwrap_or(0),
            response_required: receipt.is_some(),
            kind,
        })
    }

    async fn read_line(&self, source: &mut (dyn AsyncBufRead + Send + Unpin), buf: &mut Vec<u8>) -> anyhow::Result<()> {
        buf.clear();
        let limit = self.max_frame_size as u64 + 1;
        let num_read = (&mut *source).take(limit).read_until(b'\n', buf).await?;
        if num_read == 0 {
            bail!("connection closed by peer");
        }
        if buf.last() != Some(&b'\n') {
            if buf.len() > self.max_frame_size {
                bail!("frame header exceeds the maximum frame size of {} bytes", self.max_frame_size);
            }
            bail!("connection closed in the middle of a frame");
        }
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        Ok(())
    }

    async fn read_body(&self, source: &mut (dyn AsyncBufRead + Send + Unpin), content_length: Option<usize>) -> anyhow::Result<Bytes> {
        match content_length {
            Some(len) => {
                if len > self.max_frame_size {
                    bail!("received a frame body of {} bytes, exceeding the maximum of {} - closing connection", len, self.max_frame_size);
                }
                let mut body = vec![0u8; len];
                source.read_exact(&mut body).await?;
                if source.read_u8().await? != 0 {
                    bail!("frame body is not terminated by a NUL byte");
                }
                Ok(body.into())
            }
            None => {
                let mut body = Vec::new();
                let limit = self.max_frame_size as u64 + 1;
                (&mut *source).take(limit).read_until(0, &mut body).await?;
                if body.last() != Some(&0) {
                    bail!("frame body exceeds the maximum frame size or the connection was closed");
                }
                body.pop();
                Ok(body.into())
            }
        }
    }
}

#[async_trait]
impl WireFormat for StompWireFormat {
    fn marshal(&self, command: &Command, buf: &mut BytesMut) -> anyhow::Result<()> {
        if command.is_keep_alive() {
            buf.put_u8(b'\n');
            return Ok(());
        }

        match self.to_frame(command) {
            Some(frame) => {
                trace!("marshalling {} as {}", command, frame.verb);
                frame.ser(buf);
            }
            None => trace!("{} has no STOMP representation - not sent", command),
        }
        Ok(())
    }

    async fn unmarshal(&self, source: &mut (dyn AsyncBufRead + Send + Unpin)) -> anyhow::Result<Command> {
        let mut line = Vec::new();
        self.read_line(source, &mut line).await?;
        if line.is_empty() {
            return Ok(Command::keep_alive());
        }

        let verb = String::from_utf8(line.clone())?;
        let escaped = verb != "CONNECT" && verb != "CONNECTED";
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut header_bytes = 0;

        loop {
            self.read_line(source, &mut line).await?;
            if line.is_empty() {
                break;
            }
            header_bytes += line.len();
            if header_bytes > self.max_frame_size {
                bail!("frame headers exceed the maximum frame size of {} bytes", self.max_frame_size);
            }

            let header_line = std::str::from_utf8(&line)?;
            let (key, value) = header_line.split_once(':')
                .ok_or_else(|| anyhow!("malformed header line {:?}", header_line))?;
            let (key, value) = if escaped {
                (unescape(key)?, unescape(value)?)
            }
            else {
                (key.to_string(), value.to_string())
            };

            // NB: if a header is repeated, only the first occurrence counts
            if !headers.iter().any(|(k, _)| k == &key) {
                headers.push((key, value));
            }
        }

        let content_length = match headers.iter().find(|(k, _)| k == "content-length") {
            Some((_, len)) => Some(len.parse::<usize>()?),
            None => None,
        };
        let body = self.read_body(source, content_length).await?;

        self.to_command(StompFrame { verb, headers, body })
    }
}


struct StompFrame {
    verb: String,
    headers: Vec<(String, String)>,
    body: Bytes,
}
impl StompFrame {
    fn new(verb: &str) -> StompFrame {
        StompFrame {
            verb: verb.to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    fn header(&mut self, key: &str, value: &str) {
        self.headers.push((key.to_string(), value.to_string()));
    }

    fn opt_header(&mut self, key: &str, value: Option<&str>) {
        if let Some(value) = value {
            self.header(key, value);
        }
    }

    fn add_message_headers(&mut self, msg: &Message) {
        let mut custom = msg.headers.iter().collect::<Vec<_>>();
        custom.sort();
        for (k, v) in custom {
            self.header(k, v);
        }
        self.header("content-length", &msg.body.len().to_string());
        self.body = msg.body.clone();
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn require(&self, key: &str) -> anyhow::Result<&str> {
        self.get(key)
            .ok_or_else(|| anyhow!("{} frame without required header {:?}", self.verb, key))
    }

    fn require_consumer_id(&self, key: &str) -> anyhow::Result<ConsumerId> {
        let raw = self.require(key)?;
        ConsumerId::parse_subscription_id(raw)
            .ok_or_else(|| anyhow!("{} frame has a malformed subscription id {:?}", self.verb, raw))
    }

    fn to_message(&self) -> anyhow::Result<Message> {
        const RESERVED: [&str; 7] = ["destination", "transaction", "message-id", "subscription", "content-length", "receipt", "redelivered"];

        let headers: FxHashMap<String, String> = self.headers.iter()
            .filter(|(k, _)| !RESERVED.contains(&k.as_str()))
            .cloned()
            .collect();

        Ok(Message {
            destination: self.require("destination")?.to_string(),
            message_id: self.get("message-id").map(str::to_string),
            transaction_id: self.get("transaction").map(|t| TransactionId(t.to_string())),
            headers,
            body: self.body.clone(),
        })
    }

    fn ser(&self, buf: &mut BytesMut) {
        let escaped = self.verb != "CONNECT" && self.verb != "CONNECTED";

        buf.put_slice(self.verb.as_bytes());
        buf.put_u8(b'\n');
        for (k, v) in &self.headers {
            if escaped {
                buf.put_slice(escape(k).as_bytes());
                buf.put_u8(b':');
                buf.put_slice(escape(v).as_bytes());
            }
            else {
                buf.put_slice(k.as_bytes());
                buf.put_u8(b':');
                buf.put_slice(v.as_bytes());
            }
            buf.put_u8(b'\n');
        }
        buf.put_u8(b'\n');
        buf.put_slice(&self.body);
        buf.put_u8(0);
    }
}

fn format_heart_beat(heart_beat: HeartBeat) -> String {
    format!("{},{}", heart_beat.send.as_millis(), heart_beat.receive.as_millis())
}

fn parse_heart_beat(raw: Option<&str>) -> anyhow::Result<HeartBeat> {
    let Some(raw) = raw else {
        return Ok(HeartBeat::default());
    };
    let (send, receive) = raw.split_once(',')
        .ok_or_else(|| anyhow!("malformed heart-beat header {:?}", raw))?;
    Ok(HeartBeat {
        send: Duration::from_millis(send.trim().parse()?),
        receive: Duration::from_millis(receive.trim().parse()?),
    })
}

fn parse_id(raw: &str) -> anyhow::Result<CommandId> {
    raw.parse()
        .map_err(|e| anyhow!("receipt id {:?} is not numeric: {}", raw, e))
}

fn escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            ':' => result.push_str("\\c"),
            c => result.push(c),
        }
    }
    result
}

fn unescape(s: &str) -> anyhow::Result<String> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => result.push('\\'),
            Some('n') => result.push('\n'),
            Some('r') => result.push('\r'),
            Some('c') => result.push(':'),
            other => bail!("invalid escape sequence \\{:?} in header {:?}", other, s),
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn marshal(command: &Command) -> Vec<u8> {
        let mut buf = BytesMut::new();
        StompWireFormat::new(DEFAULT_MAX_FRAME_SIZE).marshal(command, &mut buf).unwrap();
        buf.to_vec()
    }

    async fn unmarshal_all(wire_format: &StompWireFormat, mut raw: &[u8]) -> Vec<Command> {
        let mut result = Vec::new();
        while !raw.is_empty() {
            result.push(wire_format.unmarshal(&mut raw).await.unwrap());
        }
        result
    }

    #[test]
    fn test_marshal_subscribe() {
        let mut command = Command::new(CommandKind::ConsumerInfo(ConsumerInfo {
            consumer_id: ConsumerId::new(ConnectionId::from("c1"), 4),
            destination: "/queue/a".to_string(),
            ack_mode: AckMode::Client,
            selector: None,
        }));
        command.command_id = 17;
        command.response_required = true;

        assert_eq!(
            marshal(&command),
            b"SUBSCRIBE\nid:c1\\c4\ndestination:/queue/a\nack:client\nreceipt:17\n\n\0".to_vec(),
        );
    }

    #[test]
    fn test_marshal_connect_is_not_escaped() {
        let mut info = ConnectionInfo::new(ConnectionId::from("c1"));
        info.username = Some("us:er".to_string());
        info.heart_beat = HeartBeat::new(Duration::from_millis(1000), Duration::from_millis(2000));

        assert_eq!(
            marshal(&Command::new(CommandKind::ConnectionInfo(info))),
            b"CONNECT\naccept-version:1.1,1.2\nlogin:us:er\nheart-beat:1000,2000\n\n\0".to_vec(),
        );
    }

    #[rstest]
    #[case::keep_alive(Command::keep_alive(), b"\n".to_vec())]
    #[case::shutdown(Command::shutdown(), vec![])]
    #[case::producer(Command::new(CommandKind::RemoveProducer(ProducerId { connection_id: ConnectionId::from("c"), value: 1 })), vec![])]
    fn test_marshal_special(#[case] command: Command, #[case] expected: Vec<u8>) {
        assert_eq!(marshal(&command), expected);
    }

    #[tokio::test]
    async fn test_unmarshal_connected_correlates_to_last_connect() {
        let wire_format = StompWireFormat::new(DEFAULT_MAX_FRAME_SIZE);
        let mut connect = Command::new(CommandKind::ConnectionInfo(ConnectionInfo::new(ConnectionId::from("c1"))));
        connect.command_id = 9;
        wire_format.marshal(&connect, &mut BytesMut::new()).unwrap();

        let commands = unmarshal_all(&wire_format, b"CONNECTED\nversion:1.2\nheart-beat:0,500\n\n\0\n").await;
        assert_eq!(commands.len(), 2);
        match &commands[0].kind {
            CommandKind::Connected(info) => {
                assert_eq!(info.correlation_id, 9);
                assert_eq!(info.heart_beat, HeartBeat::new(Duration::ZERO, Duration::from_millis(500)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(commands[1].is_keep_alive());
    }

    #[tokio::test]
    async fn test_unmarshal_message_with_content_length() {
        let wire_format = StompWireFormat::new(DEFAULT_MAX_FRAME_SIZE);
        let raw = b"MESSAGE\nsubscription:c1:2\ndestination:/topic/t\nmessage-id:m-1\nx\\cy:a\\nb\ncontent-length:5\n\nab\0cd\0";
        let commands = unmarshal_all(&wire_format, raw).await;

        match &commands[..] {
            [Command { kind: CommandKind::MessageDispatch(dispatch), .. }] => {
                assert_eq!(dispatch.consumer_id, ConsumerId::new(ConnectionId::from("c1"), 2));
                assert_eq!(dispatch.destination, "/topic/t");
                assert_eq!(dispatch.message.message_id.as_deref(), Some("m-1"));
                assert_eq!(dispatch.message.headers.get("x:y").map(String::as_str), Some("a\nb"));
                assert_eq!(dispatch.message.body.as_ref(), b"ab\0cd");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unmarshal_receipt_and_error() {
        let wire_format = StompWireFormat::new(DEFAULT_MAX_FRAME_SIZE);
        let commands = unmarshal_all(&wire_format, b"RECEIPT\nreceipt-id:12\n\n\0ERROR\nreceipt-id:13\nmessage:denied\n\nno access\0").await;

        assert_eq!(commands[0], Command::response(12));
        assert_eq!(commands[1].kind, CommandKind::ExceptionResponse {
            correlation_id: 13,
            error: BrokerError { message: "denied".to_string(), details: Some("no access".to_string()) },
        });
    }

    #[tokio::test]
    async fn test_marshalled_send_is_read_back() {
        let wire_format = StompWireFormat::new(DEFAULT_MAX_FRAME_SIZE);
        let mut headers = FxHashMap::default();
        headers.insert("colour".to_string(), "blue".to_string());
        let mut command = Command::new(CommandKind::Message(Message {
            destination: "/queue/q".to_string(),
            message_id: None,
            transaction_id: Some(TransactionId("tx-1".to_string())),
            headers,
            body: Bytes::from_static(b"payload"),
        }));
        command.command_id = 3;
        command.response_required = true;

        let mut buf = BytesMut::new();
        wire_format.marshal(&command, &mut buf).unwrap();
        let read_back = unmarshal_all(&wire_format, &buf).await;
        assert_eq!(read_back, vec![command]);
    }

    #[rstest]
    #[case::eof(b"".as_slice())]
    #[case::truncated(b"RECEIPT\nreceipt-id:1\n".as_slice())]
    #[case::unknown_verb(b"HELLO\n\n\0".as_slice())]
    #[case::bad_header(b"RECEIPT\nno-colon\n\n\0".as_slice())]
    #[case::bad_escape(b"RECEIPT\nreceipt-id:1\\x\n\n\0".as_slice())]
    #[case::missing_nul(b"SEND\ndestination:/q\ncontent-length:2\n\nabX".as_slice())]
    fn test_unmarshal_errors(#[case] raw: &[u8]) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async move {
            let mut raw = raw;
            let wire_format = StompWireFormat::new(DEFAULT_MAX_FRAME_SIZE);
            assert!(wire_format.unmarshal(&mut raw).await.is_err());
        });
    }

    #[tokio::test]
    async fn test_max_frame_size() {
        let wire_format = StompWireFormat::new(8);
        let mut raw = b"SEND\ndestination:/q\ncontent-length:20\n\n01234567890123456789\0".as_slice();
        assert!(wire_format.unmarshal(&mut raw).await.is_err());
    }
}
