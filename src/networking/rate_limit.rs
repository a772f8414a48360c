// Copyright (c) 2026 Dignode
// Licensed under the Apache License, Version 2.0

//! Per-peer token buckets guarding the request handlers.
//! Deterministic integer arithmetic; the clock is injected for tests.

#![forbid(unsafe_code)]

use libp2p::PeerId;
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

/// Bucket parameters: capacity tokens refill over one minute.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitParams {
    pub capacity: u32,
}

impl Default for RateLimitParams {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

/// Outcome of admitting one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Drop,
}

#[derive(Clone, Debug)]
struct Bucket {
    // Token count scaled by 1_000_000 so refill stays in integers.
    micro_tokens: u64,
    last: Instant,
}

const MICRO: u64 = 1_000_000;

/// Token-bucket rate limiter keyed by remote peer id.
pub struct RateLimiter {
    params: RateLimitParams,
    buckets: BTreeMap<PeerId, Bucket>,
}

impl RateLimiter {
    pub fn new(params: RateLimitParams) -> Self {
        Self { params, buckets: BTreeMap::new() }
    }

    /// Admit or drop one request from `peer` at time `now`.
    pub fn admit(&mut self, peer: PeerId, now: Instant) -> Admission {
        let capacity_micro = u64::from(self.params.capacity) * MICRO;
        let st = self.buckets.entry(peer).or_insert(Bucket {
            micro_tokens: capacity_micro,
            last: now,
        });

        // Refill: capacity tokens per 60 seconds, pro-rated.
        let elapsed = now.saturating_duration_since(st.last);
        let refill = capacity_micro.saturating_mul(elapsed.as_millis() as u64) / 60_000;
        st.micro_tokens = st.micro_tokens.saturating_add(refill).min(capacity_micro);
        st.last = now;

        if st.micro_tokens >= MICRO {
            st.micro_tokens -= MICRO;
            Admission::Allow
        } else {
            Admission::Drop
        }
    }

    /// Forget buckets idle longer than `idle`; keeps the map bounded.
    pub fn prune(&mut self, now: Instant, idle: Duration) {
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.last) < idle);
    }

    /// Number of tracked peers.
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}

// saturating_duration_since needs a helper on older toolchains.
trait InstantExt {
    fn saturating_duration_since(&self, earlier: Instant) -> Duration;
}

impl InstantExt for Instant {
    fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        self.checked_duration_since(earlier)
            .unwrap_or(Duration::from_secs(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_admits_capacity_then_drops() {
        let mut rl = RateLimiter::new(RateLimitParams { capacity: 100 });
        let peer = PeerId::random();
        let t0 = Instant::now();
        for _ in 0..100 {
            assert_eq!(rl.admit(peer, t0), Admission::Allow);
        }
        assert_eq!(rl.admit(peer, t0), Admission::Drop);
    }

    #[test]
    fn refill_restores_tokens() {
        let mut rl = RateLimiter::new(RateLimitParams { capacity: 60 });
        let peer = PeerId::random();
        let t0 = Instant::now();
        for _ in 0..60 {
            rl.admit(peer, t0);
        }
        assert_eq!(rl.admit(peer, t0), Admission::Drop);
        // One second refills one token at 60/min.
        assert_eq!(rl.admit(peer, t0 + Duration::from_secs(1)), Admission::Allow);
    }

    #[test]
    fn peers_do_not_share_buckets() {
        let mut rl = RateLimiter::new(RateLimitParams { capacity: 1 });
        let t0 = Instant::now();
        let a = PeerId::random();
        let b = PeerId::random();
        assert_eq!(rl.admit(a, t0), Admission::Allow);
        assert_eq!(rl.admit(a, t0), Admission::Drop);
        assert_eq!(rl.admit(b, t0), Admission::Allow);
    }
}
