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

//! Prometheus metrics for the node, served on `/metrics` when a metrics
//! listen address is configured.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus")]
    Prom,
    #[error("bind metrics listener")]
    Bind,
}

/// Metrics container.
#[derive(Clone)]
pub struct Metrics {
    /// Registry.
    pub registry: Registry,

    /// Connected peers gauge.
    pub p2p_peers: IntGauge,
    /// Stores held locally.
    pub store_count: IntGauge,
    /// Completed sync cycles.
    pub sync_cycles_total: IntCounter,

    /// Downloads completed over a direct stream.
    pub downloads_via_direct: IntCounter,
    /// Downloads completed after a DHT lookup.
    pub downloads_via_dht: IntCounter,
    /// Downloads completed via gossip-discovered holders.
    pub downloads_via_gossip: IntCounter,
    /// Downloads completed through a peer TURN relay.
    pub downloads_via_peer_turn: IntCounter,
    /// Downloads completed via mesh routing.
    pub downloads_via_mesh: IntCounter,
    /// Downloads completed through the bootstrap TURN relay.
    pub downloads_via_bootstrap_turn: IntCounter,
    /// Downloads completed via the bootstrap direct proxy.
    pub downloads_via_bootstrap: IntCounter,
    /// Downloads that exhausted every strategy.
    pub downloads_failed_total: IntCounter,

    /// Requests dropped by the per-peer token bucket.
    pub rate_limited_total: IntCounter,
    /// Undecodable or invalid inbound messages.
    pub invalid_msg_total: IntCounter,
    /// Handshakes whose public key did not match the advertised address.
    pub handshake_unverified_total: IntCounter,
    /// Integrity failures after download assembly.
    pub integrity_failures_total: IntCounter,
}

macro_rules! reg {
    ($registry:expr, $metric:expr) => {
        $registry
            .register(Box::new($metric.clone()))
            .map_err(|_| MetricsError::Prom)?;
    };
}

impl Metrics {
    /// Create and register metrics.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let p2p_peers =
            IntGauge::new("dig_p2p_peers", "Connected peers").map_err(|_| MetricsError::Prom)?;
        let store_count =
            IntGauge::new("dig_store_count", "Stores held locally").map_err(|_| MetricsError::Prom)?;
        let sync_cycles_total =
            IntCounter::new("dig_sync_cycles_total", "Completed sync cycles")
                .map_err(|_| MetricsError::Prom)?;

        let downloads_via_direct =
            IntCounter::new("dig_downloads_via_direct", "Downloads over a direct stream")
                .map_err(|_| MetricsError::Prom)?;
        let downloads_via_dht =
            IntCounter::new("dig_downloads_via_dht", "Downloads after a DHT lookup")
                .map_err(|_| MetricsError::Prom)?;
        let downloads_via_gossip =
            IntCounter::new("dig_downloads_via_gossip", "Downloads via gossip holders")
                .map_err(|_| MetricsError::Prom)?;
        let downloads_via_peer_turn =
            IntCounter::new("dig_downloads_via_peer_turn", "Downloads through a peer relay")
                .map_err(|_| MetricsError::Prom)?;
        let downloads_via_mesh =
            IntCounter::new("dig_downloads_via_mesh", "Downloads via mesh routing")
                .map_err(|_| MetricsError::Prom)?;
        let downloads_via_bootstrap_turn = IntCounter::new(
            "dig_downloads_via_bootstrap_turn",
            "Downloads through the bootstrap relay",
        )
        .map_err(|_| MetricsError::Prom)?;
        let downloads_via_bootstrap = IntCounter::new(
            "dig_downloads_via_bootstrap",
            "Downloads proxied by the bootstrap service",
        )
        .map_err(|_| MetricsError::Prom)?;
        let downloads_failed_total =
            IntCounter::new("dig_downloads_failed_total", "Downloads that exhausted the cascade")
                .map_err(|_| MetricsError::Prom)?;

        let rate_limited_total =
            IntCounter::new("dig_rate_limited_total", "Requests dropped by rate limiting")
                .map_err(|_| MetricsError::Prom)?;
        let invalid_msg_total =
            IntCounter::new("dig_invalid_msg_total", "Invalid inbound messages")
                .map_err(|_| MetricsError::Prom)?;
        let handshake_unverified_total = IntCounter::new(
            "dig_handshake_unverified_total",
            "Handshakes with a crypto-IPv6 mismatch",
        )
        .map_err(|_| MetricsError::Prom)?;
        let integrity_failures_total =
            IntCounter::new("dig_integrity_failures_total", "Post-download hash mismatches")
                .map_err(|_| MetricsError::Prom)?;

        reg!(registry, p2p_peers);
        reg!(registry, store_count);
        reg!(registry, sync_cycles_total);
        reg!(registry, downloads_via_direct);
        reg!(registry, downloads_via_dht);
        reg!(registry, downloads_via_gossip);
        reg!(registry, downloads_via_peer_turn);
        reg!(registry, downloads_via_mesh);
        reg!(registry, downloads_via_bootstrap_turn);
        reg!(registry, downloads_via_bootstrap);
        reg!(registry, downloads_failed_total);
        reg!(registry, rate_limited_total);
        reg!(registry, invalid_msg_total);
        reg!(registry, handshake_unverified_total);
        reg!(registry, integrity_failures_total);

        Ok(Self {
            registry,
            p2p_peers,
            store_count,
            sync_cycles_total,
            downloads_via_direct,
            downloads_via_dht,
            downloads_via_gossip,
            downloads_via_peer_turn,
            downloads_via_mesh,
            downloads_via_bootstrap_turn,
            downloads_via_bootstrap,
            downloads_failed_total,
            rate_limited_total,
            invalid_msg_total,
            handshake_unverified_total,
            integrity_failures_total,
        })
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if encoder.encode(&families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

/// Serve `/metrics` and `/healthz` on `addr` until the task is aborted.
pub async fn serve(addr: String, metrics: Arc<Metrics>) -> Result<(), MetricsError> {
    use axum::{extract::State, routing::get, Router};

    async fn metrics_handler(State(m): State<Arc<Metrics>>) -> String {
        m.render()
    }
    async fn healthz() -> &'static str {
        "ok"
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|_| MetricsError::Bind)?;
    axum::serve(listener, app).await.map_err(|_| MetricsError::Bind)
}
