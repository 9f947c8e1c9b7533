//! Session state that has to survive a reconnect: which connections, consumers and producers
//!  the broker knows about, recorded from the commands that created them.

pub mod connection_state;
pub mod connection_state_tracker;

pub use connection_state::ConnectionState;
pub use connection_state_tracker::{ConnectionStateTracker, Tracked};
