//! In-memory stand-ins for the parts of a transport stack, for testing code built on top of it.
//!  They are used by this crate's own tests, but they are also exported for application testing,
//!  which is why they are part of the regular (non-#[cfg(test)]) code.

pub mod transport;
pub mod listener;
pub mod factory;
