use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};

use crate::command::Command;
use crate::error::{TransportError, TransportResult};
use crate::transport::{FutureResponse, ListenerSlot, Transport, TransportListener};
use crate::wire_format::WireFormat;

type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Upper bound for waiting on an in-flight write when closing
const CLOSE_WRITER_TIMEOUT: Duration = Duration::from_secs(1);

/// The leaf of every transport stack: owns a byte stream (plain TCP, TLS, or an in-memory
///  pipe in tests) and the wire format that turns it into commands.
///
/// Starting the transport spawns a read loop that unmarshals inbound commands and hands them
///  to the listener in arrival order. The read loop reports at most one failure, and none at
///  all if the failure follows a deliberate close or a `Shutdown` command.
pub struct StreamTransport {
    myself: Weak<StreamTransport>,
    remote_address: String,
    wire_format: Arc<dyn WireFormat>,
    listener: ListenerSlot,
    reader: Mutex<Option<BoxedReader>>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    cancel_sender: broadcast::Sender<()>,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown_sent: AtomicBool,
    exception_fired: AtomicBool,
}

impl StreamTransport {
    pub fn new<S>(stream: S, wire_format: Arc<dyn WireFormat>, remote_address: impl Into<String>) -> Arc<StreamTransport>
    where S: AsyncRead + AsyncWrite + Send + Unpin + 'static
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
        let writer: BoxedWriter = Box::new(write_half);
        let (cancel_sender, _) = broadcast::channel(1);

        Arc::new_cyclic(|myself| StreamTransport {
            myself: myself.clone(),
            remote_address: remote_address.into(),
            wire_format,
            listener: ListenerSlot::default(),
            reader: Mutex::new(Some(BufReader::new(reader))),
            writer: tokio::sync::Mutex::new(Some(writer)),
            cancel_sender,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown_sent: AtomicBool::new(false),
            exception_fired: AtomicBool::new(false),
        })
    }

    async fn read_loop(self: Arc<Self>, mut reader: BoxedReader, mut cancel_receiver: broadcast::Receiver<()>) {
        debug!("starting read loop for {}", self.remote_address);

        loop {
            tokio::select! {
                r = self.wire_format.unmarshal(&mut reader) => {
                    match r {
                        Ok(command) => {
                            trace!("received {} from {}", command, self.remote_address);
                            match self.listener.get() {
                                Some(listener) => listener.on_command(command).await,
                                None => warn!("no listener for inbound {} - dropping", command),
                            }
                        }
                        Err(e) => {
                            self.on_read_error(e).await;
                            break;
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        debug!("read loop for {} terminated", self.remote_address);
    }

    async fn on_read_error(&self, e: anyhow::Error) {
        if self.is_closed() || self.shutdown_sent.load(Ordering::Acquire) {
            debug!("read loop for {} ended after close: {:#}", self.remote_address, e);
            return;
        }
        if self.exception_fired.swap(true, Ordering::AcqRel) {
            return;
        }

        let error = match e.downcast::<std::io::Error>() {
            Ok(io_error) => TransportError::from(io_error),
            Err(e) => TransportError::wire_format(e),
        };
        error!("error reading from {}: {}", self.remote_address, error);

        self.close().await;
        match self.listener.get() {
            Some(listener) => listener.on_exception(error).await,
            None => warn!("no listener to report the read failure to"),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing transport to {}", self.remote_address);

        // no receivers means the read loop was never started or already terminated
        let _ = self.cancel_sender.send(());

        match tokio::time::timeout(CLOSE_WRITER_TIMEOUT, self.writer.lock()).await {
            Ok(mut writer) => {
                if let Some(mut writer) = writer.take() {
                    if let Err(e) = writer.shutdown().await {
                        debug!("error shutting down the connection to {}: {}", self.remote_address, e);
                    }
                }
            }
            Err(_) => warn!("a write to {} is still blocked - dropping the connection without shutdown", self.remote_address),
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn start(&self) -> TransportResult<()> {
        self.listener.require()?;
        if self.is_closed() {
            return Err(TransportError::Disposed);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take()
            .ok_or_else(|| TransportError::invalid_operation("stream transport can only be started once"))?;
        let myself = self.myself.upgrade()
            .ok_or(TransportError::Disposed)?;

        let cancel_receiver = self.cancel_sender.subscribe();
        tokio::spawn(myself.read_loop(reader, cancel_receiver));
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        self.close().await;
        Ok(())
    }

    async fn oneway(&self, command: Command) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut buf = BytesMut::new();
        self.wire_format.marshal(&command, &mut buf)
            .map_err(|e| TransportError::invalid_operation(format!("cannot marshal {}: {:#}", command, e)))?;

        if command.is_shutdown() {
            self.shutdown_sent.store(true, Ordering::Release);
        }
        if buf.is_empty() {
            return Ok(());
        }

        trace!("sending {} to {}", command, self.remote_address);
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut()
            .ok_or(TransportError::Closed)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn async_request(&self, _command: Command) -> TransportResult<FutureResponse> {
        Err(TransportError::invalid_operation("a stream transport does not correlate responses"))
    }

    async fn request(&self, _command: Command, _timeout: Option<Duration>) -> TransportResult<Command> {
        Err(TransportError::invalid_operation("a stream transport does not correlate responses"))
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        self.listener.set(listener);
    }

    fn remote_address(&self) -> Option<String> {
        Some(self.remote_address.clone())
    }

    fn is_connected(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.is_closed()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
