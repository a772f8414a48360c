#![forbid(unsafe_code)]

//! Observability: Prometheus metrics and the HTTP exposition endpoint.

pub mod metrics;
