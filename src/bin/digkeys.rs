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

//! Generate or inspect a node's key material: transport peer id, overlay
//! public key, and the crypto-IPv6 derived from it.

use anyhow::Result;
use dignode::core::addressing;
use dignode::core::session::SessionKeyring;
use dignode::networking::identity;

fn main() -> Result<()> {
    let key_dir = std::env::args()
        .nth(1)
        .unwrap_or_else(|| ".keys".to_string());

    let (peer_id, _keys) = identity::load_or_create_identity(&key_dir)
        .map_err(|e| anyhow::anyhow!("identity: {e:?}"))?;
    let overlay_secret = identity::load_or_create_overlay_secret(&key_dir)
        .map_err(|e| anyhow::anyhow!("overlay key: {e:?}"))?;

    let keyring = SessionKeyring::new(overlay_secret);
    let public_key = keyring.public_key();
    let crypto_ipv6 = addressing::derive(&public_key);

    println!("peer_id:     {peer_id}");
    println!("public_key:  {}", hex::encode(public_key));
    println!("crypto_ipv6: {crypto_ipv6}");
    Ok(())
}
