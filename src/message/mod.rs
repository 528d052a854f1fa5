//! This module exports a minimal message-passing API, which is encapsulated
//! by a `Communicator` trait. Implementors only need to write `send` and
//! `recv` operations for a given transport layer (an in-process channel
//! transport is included). The trait then provides default implementations
//! for broadcast, reduce, all-reduce and all-gather. On top of that sit the
//! generation-ordered `Inbox` for point-to-point traffic, and the `Link`
//! that bundles both for one partition.
//!

mod channel;
pub mod comm;
mod link;
mod ordered;

pub use channel::{ChannelComm, ChannelHost, Teardown};
pub use comm::Communicator;
pub use link::Link;
pub use ordered::{Body, Envelope, Inbox};
