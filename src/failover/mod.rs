//! Fault tolerance: a transport that reconnects to one of several brokers when its connection
//!  is lost, and restores the session state on the new connection.

pub mod failover_transport;
pub mod reconnect_backoff;
pub mod uri_pool;

pub use failover_transport::{FailoverState, FailoverTransport};
