use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::TcpTransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::failover::FailoverTransport;
use crate::transport::inactivity_monitor::InactivityMonitor;
use crate::transport::logging_transport::LoggingTransport;
use crate::transport::mutex_transport::MutexTransport;
use crate::transport::response_correlator::ResponseCorrelator;
use crate::transport::stream_transport::StreamTransport;
use crate::transport::tls::{ByteStream, StreamSecurer};
use crate::transport::Transport;
use crate::uri::{BrokerUri, EndpointUri, Scheme};
use crate::util::id_generator::CommandIdGenerator;
use crate::wire_format::{StompWireFormatFactory, WireFormatFactory};

/// Builds transport stacks for single broker addresses.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    /// The complete stack for a broker: response correlation and send serialization on top of
    ///  [TransportFactory::create_composite]
    async fn create(&self, uri: &EndpointUri) -> TransportResult<Arc<dyn Transport>>;

    /// The connection-level part of the stack: a connected leaf transport with its filters, but
    ///  without request / response support. Failover transports manage these.
    async fn create_composite(&self, uri: &EndpointUri) -> TransportResult<Arc<dyn Transport>>;
}


/// Creates `tcp://` and `ssl://` connections. `ssl://` requires a [StreamSecurer].
pub struct TcpTransportFactory {
    wire_format_factory: Arc<dyn WireFormatFactory>,
    securer: Option<Arc<dyn StreamSecurer>>,
    id_generator: Arc<CommandIdGenerator>,
}

impl Default for TcpTransportFactory {
    fn default() -> Self {
        TcpTransportFactory::new(Arc::new(StompWireFormatFactory))
    }
}

impl TcpTransportFactory {
    pub fn new(wire_format_factory: Arc<dyn WireFormatFactory>) -> TcpTransportFactory {
        TcpTransportFactory {
            wire_format_factory,
            securer: None,
            id_generator: Default::default(),
        }
    }

    pub fn with_securer(mut self, securer: Arc<dyn StreamSecurer>) -> TcpTransportFactory {
        self.securer = Some(securer);
        self
    }

    async fn connect_stream(&self, uri: &EndpointUri, config: &TcpTransportConfig) -> TransportResult<Box<dyn ByteStream>> {
        let address = uri.socket_address();
        debug!("connecting to {}", address);

        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&address)).await
            .map_err(|_| TransportError::ConnectionFailed(format!("connecting to {} timed out after {:?}", address, config.connect_timeout)))?
            .map_err(|e| TransportError::ConnectionFailed(format!("connecting to {} failed: {}", address, e)))?;
        stream.set_nodelay(config.tcp_no_delay)?;

        match uri.scheme {
            Scheme::Tcp => Ok(Box::new(stream)),
            Scheme::Ssl => {
                let securer = self.securer.as_ref()
                    .ok_or_else(|| TransportError::Config(format!("{} requires TLS, but no stream securer is configured", uri)))?;
                tokio::time::timeout(config.connect_timeout, securer.secure(&uri.host, stream)).await
                    .map_err(|_| TransportError::ConnectionFailed(format!("TLS handshake with {} timed out", address)))?
            }
        }
    }

    async fn build_composite(&self, uri: &EndpointUri, config: &TcpTransportConfig) -> TransportResult<Arc<dyn Transport>> {
        let stream = self.connect_stream(uri, config).await?;
        info!("connected to {}", uri);

        let wire_format = self.wire_format_factory.create(config.max_frame_size);
        let mut transport: Arc<dyn Transport> = StreamTransport::new(stream, wire_format, uri.to_string());
        if config.trace {
            transport = LoggingTransport::new(transport);
        }
        if config.inactivity_monitor {
            transport = InactivityMonitor::new(transport, config);
        }
        Ok(transport)
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    async fn create(&self, uri: &EndpointUri) -> TransportResult<Arc<dyn Transport>> {
        let config = TcpTransportConfig::from_params(&uri.params)?;
        let composite = self.build_composite(uri, &config).await?;
        let mutex = MutexTransport::new(composite, config.lock_timeout);
        Ok(ResponseCorrelator::new(mutex, self.id_generator.clone()))
    }

    async fn create_composite(&self, uri: &EndpointUri) -> TransportResult<Arc<dyn Transport>> {
        let config = TcpTransportConfig::from_params(&uri.params)?;
        self.build_composite(uri, &config).await
    }
}


/// Creates failover stacks: response correlation and send serialization on top of a
///  [FailoverTransport], which uses a nested factory for the connections it manages.
pub struct FailoverTransportFactory {
    composite_factory: Arc<dyn TransportFactory>,
    id_generator: Arc<CommandIdGenerator>,
}

impl FailoverTransportFactory {
    pub fn new(composite_factory: Arc<dyn TransportFactory>) -> FailoverTransportFactory {
        FailoverTransportFactory {
            composite_factory,
            id_generator: Default::default(),
        }
    }

    pub fn create(&self, uri: &BrokerUri) -> TransportResult<Arc<dyn Transport>> {
        let failover = match uri {
            BrokerUri::Failover { uris, params } => FailoverTransport::from_params(uris.clone(), params, self.composite_factory.clone())?,
            BrokerUri::Single(uri) => FailoverTransport::from_params(vec![uri.clone()], &Default::default(), self.composite_factory.clone())?,
        };
        let mutex = MutexTransport::new(failover, None);
        Ok(ResponseCorrelator::new(mutex, self.id_generator.clone()))
    }
}


/// Creates the transport stack for a broker URI. The returned transport is not started yet:
///  register a listener, then call `start`.
pub async fn connect(uri: &str, factory: Arc<dyn TransportFactory>) -> TransportResult<Arc<dyn Transport>> {
    let uri = uri.parse::<BrokerUri>()?;
    match &uri {
        BrokerUri::Single(endpoint) => factory.create(endpoint).await,
        BrokerUri::Failover { .. } => FailoverTransportFactory::new(factory).create(&uri),
    }
}
