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

//! Crypto-IPv6 overlay addressing.
//!
//! An overlay address is `0xfd || SHA-256(public_key)[1..16]`: a stable
//! 128-bit identifier derived from a peer's overlay public key, rendered as
//! a normal IPv6 address whose first byte is always `0xfd`. The `fd00::/8`
//! prefix is an identifier namespace, never a routable transport address.

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use ring::digest;
use std::net::Ipv6Addr;

/// Derive the crypto-IPv6 identifier for an overlay public key.
///
/// Deterministic: the first byte is forced to `0xfd`, the remaining 15
/// bytes are `SHA-256(public_key)[1..16]`.
pub fn derive(public_key: &[u8]) -> Ipv6Addr {
    let hash = digest::digest(&digest::SHA256, public_key);
    let mut octets = [0u8; 16];
    octets[0] = 0xfd;
    octets[1..16].copy_from_slice(&hash.as_ref()[1..16]);
    Ipv6Addr::from(octets)
}

/// True iff the multiaddress is an overlay address (`/ip6/fd.../...`).
pub fn is_overlay(addr: &Multiaddr) -> bool {
    matches!(addr.iter().next(), Some(Protocol::Ip6(ip)) if ip.octets()[0] == 0xfd)
}

/// Build the canonical overlay multiaddress
/// `/ip6/<ipv6>/tcp/<port>/p2p/<peer-id>`.
pub fn format_overlay(ipv6: Ipv6Addr, port: u16, peer_id: &PeerId) -> Multiaddr {
    Multiaddr::empty()
        .with(Protocol::Ip6(ipv6))
        .with(Protocol::Tcp(port))
        .with(Protocol::P2p(*peer_id))
}

/// WebSocket variant of [`format_overlay`]:
/// `/ip6/<ipv6>/tcp/<port>/ws/p2p/<peer-id>`.
pub fn format_overlay_ws(ipv6: Ipv6Addr, port: u16, peer_id: &PeerId) -> Multiaddr {
    Multiaddr::empty()
        .with(Protocol::Ip6(ipv6))
        .with(Protocol::Tcp(port))
        .with(Protocol::Ws("/".into()))
        .with(Protocol::P2p(*peer_id))
}

/// Extract `(crypto_ipv6, peer_id)` from an overlay multiaddress.
///
/// Returns `None` for anything that is not `/ip6/fd.../.../p2p/<id>`.
pub fn overlay_target(addr: &Multiaddr) -> Option<(Ipv6Addr, PeerId)> {
    let mut ip = None;
    let mut peer = None;
    for proto in addr.iter() {
        match proto {
            Protocol::Ip6(v6) if v6.octets()[0] == 0xfd => ip = Some(v6),
            Protocol::P2p(pid) => peer = Some(pid),
            _ => {}
        }
    }
    match (ip, peer) {
        (Some(ip), Some(peer)) => Some((ip, peer)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic_and_prefixed() {
        let pk = [7u8; 32];
        let a = derive(&pk);
        let b = derive(&pk);
        assert_eq!(a, b);

        // 0xfd followed by bytes 1..16 of the key hash, nothing else.
        let hash = digest::digest(&digest::SHA256, &pk);
        assert_eq!(a.octets()[0], 0xfd);
        assert_eq!(&a.octets()[1..], &hash.as_ref()[1..16]);
    }

    #[test]
    fn overlay_roundtrip() {
        let pk = [1u8; 32];
        let ip = derive(&pk);
        let pid = PeerId::random();
        let ma = format_overlay(ip, 4861, &pid);
        assert!(is_overlay(&ma));
        let (got_ip, got_pid) = overlay_target(&ma).unwrap();
        assert_eq!(got_ip, ip);
        assert_eq!(got_pid, pid);
    }
}
