//! Multiplexed TCP tunnelling over a single reconnectable WebSocket.
//!
//! A [`session::Session`] owns one client transport and any number of outbound
//! [`conn::Conn`]s keyed by logical id; the [`registry::Registry`] lets a client
//! reattach to its session after the transport drops.

pub mod conn;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;
