#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Networking: encrypted libp2p transport, wire protocol, peer registry,
//! privacy overlay, rate limiting, and the bootstrap REST client.

pub mod bootstrap;
pub mod identity;
pub mod p2p;
pub mod peer_registry;
pub mod privacy;
pub mod protocol;
pub mod rate_limit;
pub mod server;
