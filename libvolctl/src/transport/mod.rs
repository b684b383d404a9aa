//! QUIC transport layer for controller messages.
//!
//! This module provides [`RpcClient`](client::RpcClient) and
//! [`RpcServer`](server::RpcServer), which exchange
//! [`RpcMessage`](crate::message::RpcMessage) values over QUIC
//! bi-directional streams using `quinn`, plus
//! [`QuicRegistryDialer`](client::QuicRegistryDialer) for registering with a
//! registry that speaks the same protocol.

pub mod client;
pub mod server;

/// Upper bound for one JSON message on a stream.
pub(crate) const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
