//! A client-side transport stack for STOMP message brokers: framed TCP / TLS connections with
//!  heart-beat monitoring, request / response correlation, and failover with transparent
//!  reconnect and session replay.
//!
//! Use [connect] with a broker URI to build a stack, register a [TransportListener] (typically a
//!  [DispatchRouter]), and start it.

pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod failover;
pub mod state;
pub mod transport;
pub mod uri;
pub mod util;
pub mod wire_format;
pub mod test_util;

pub use dispatch::{DispatchRouter, MessageDispatchChannel};
pub use error::{TransportError, TransportResult};
pub use transport::factory::{connect, TcpTransportFactory, TransportFactory};
pub use transport::{Transport, TransportListener};
