//! Delivery of inbound messages to consumers.

pub mod dispatch_router;
pub mod message_dispatch_channel;

pub use dispatch_router::{DispatchRouter, MessageListener};
pub use message_dispatch_channel::MessageDispatchChannel;
