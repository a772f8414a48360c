// Copyright (c) 2026 Dignode
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Dignode - peer-to-peer synchronization of content-addressed `.dig`
//! archives.
//!
//! This crate provides:
//! - A store registry indexing `.dig` archives by hex store id
//! - Encrypted P2P transport (libp2p Noise + Yamux) with a JSON
//!   request/response protocol for listing, finding and fetching stores
//! - A privacy overlay: crypto-IPv6 addressing, gossip discovery, and
//!   encrypted address records in the DHT
//! - A sync scheduler and a multi-strategy download orchestrator with
//!   parallel byte-range fetch and resumable `.part` sidecars
//! - Monitoring via Prometheus metrics and structured logging

/// Core primitives (types, config, addressing, sessions, errors).
pub mod core;
/// Observability (metrics, exposition endpoint).
pub mod monitoring;
/// Node lifecycle orchestration.
pub mod node;
/// P2P networking stack (transport, protocol, overlay, bootstrap).
pub mod networking;
/// Local store registry and download pipeline.
pub mod store;
/// Periodic store reconciliation.
pub mod sync;
