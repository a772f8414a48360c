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

//! Per-peer session secrets and sealed artifacts.
//!
//! A session secret is derived once per handshake from X25519 agreement
//! between the two overlay keys and is immutable for the session; a
//! re-handshake replaces it atomically. Secrets seal small per-peer
//! artifacts (encrypted address records) beyond the transport encryption.
//!
//! ## Sealed record format
//! `MAGIC(8) || NONCE(12) || CIPHERTEXT+TAG(..)` with AES-256-GCM.

use libp2p::PeerId;
use ring::rand::{SecureRandom, SystemRandom};
use ring::{aead, digest};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

const SEAL_MAGIC: &[u8] = b"DIGSEAL1";
const NONCE_LEN: usize = 12;

/// Domain separator folded into the KDF so transport and overlay keys can
/// never produce the same symmetric key.
const KDF_DOMAIN: &[u8] = b"dig-session-v1";

/// Session crypto errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Ciphertext malformed or authentication failed.
    #[error("open sealed record")]
    Open,
    /// RNG or AEAD failure while sealing.
    #[error("seal record")]
    Seal,
    /// Peer public key is not 32 bytes.
    #[error("invalid session public key")]
    InvalidKey,
}

/// Symmetric secret shared with one peer for the lifetime of a session.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionSecret([u8; 32]);

impl SessionSecret {
    /// Seal a plaintext under this secret.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let rng = SystemRandom::new();
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill(&mut nonce).map_err(|_| SessionError::Seal)?;

        let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &self.0)
            .map_err(|_| SessionError::Seal)?;
        let key = aead::LessSafeKey::new(unbound);

        let mut buf = plaintext.to_vec();
        key.seal_in_place_append_tag(
            aead::Nonce::assume_unique_for_key(nonce),
            aead::Aad::empty(),
            &mut buf,
        )
        .map_err(|_| SessionError::Seal)?;

        let mut out = Vec::with_capacity(SEAL_MAGIC.len() + NONCE_LEN + buf.len());
        out.extend_from_slice(SEAL_MAGIC);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&buf);
        Ok(out)
    }

    /// Open a sealed record. Fails on wrong key, truncation, or tampering.
    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, SessionError> {
        if blob.len() < SEAL_MAGIC.len() + NONCE_LEN + aead::AES_256_GCM.tag_len()
            || &blob[..SEAL_MAGIC.len()] != SEAL_MAGIC
        {
            return Err(SessionError::Open);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&blob[SEAL_MAGIC.len()..SEAL_MAGIC.len() + NONCE_LEN]);

        let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &self.0)
            .map_err(|_| SessionError::Open)?;
        let key = aead::LessSafeKey::new(unbound);

        let mut buf = blob[SEAL_MAGIC.len() + NONCE_LEN..].to_vec();
        let plain = key
            .open_in_place(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::empty(),
                &mut buf,
            )
            .map_err(|_| SessionError::Open)?;
        Ok(plain.to_vec())
    }
}

/// The node's overlay keypair plus the table of established session secrets.
pub struct SessionKeyring {
    secret: StaticSecret,
    public: PublicKey,
    sessions: RwLock<HashMap<PeerId, SessionSecret>>,
}

impl SessionKeyring {
    /// Wrap a persisted 32-byte X25519 secret.
    pub fn new(secret_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret_bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public, sessions: RwLock::new(HashMap::new()) }
    }

    /// Overlay public key bytes; this is the key crypto-IPv6 derives from.
    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Derive and store the session secret for a peer from its handshake
    /// public key. A repeated handshake replaces the previous secret.
    pub fn establish(&self, peer: PeerId, peer_public: &[u8]) -> Result<(), SessionError> {
        let pk: [u8; 32] = peer_public.try_into().map_err(|_| SessionError::InvalidKey)?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(pk));
        let secret = kdf(shared.as_bytes());
        self.sessions
            .write()
            .expect("session table lock poisoned")
            .insert(peer, secret);
        Ok(())
    }

    /// Session secret for a peer, if a handshake completed.
    pub fn session(&self, peer: &PeerId) -> Option<SessionSecret> {
        self.sessions
            .read()
            .expect("session table lock poisoned")
            .get(peer)
            .cloned()
    }

    /// Peers with an established session.
    pub fn session_peers(&self) -> Vec<PeerId> {
        self.sessions
            .read()
            .expect("session table lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Drop the session for a departed peer.
    pub fn forget(&self, peer: &PeerId) {
        self.sessions
            .write()
            .expect("session table lock poisoned")
            .remove(peer);
    }

    /// Secret used to seal the node's own address record ("encrypted for
    /// self"): the DH of the overlay key with itself, through the same KDF.
    pub fn self_secret(&self) -> SessionSecret {
        let shared = self.secret.diffie_hellman(&self.public);
        kdf(shared.as_bytes())
    }
}

fn kdf(shared: &[u8]) -> SessionSecret {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(KDF_DOMAIN);
    ctx.update(shared);
    let out = ctx.finish();
    let mut key = [0u8; 32];
    key.copy_from_slice(out.as_ref());
    SessionSecret(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyring(seed: u8) -> SessionKeyring {
        SessionKeyring::new([seed; 32])
    }

    #[test]
    fn agreement_is_symmetric() {
        let a = keyring(1);
        let b = keyring(2);
        let peer = PeerId::random();
        a.establish(peer, &b.public_key()).unwrap();
        b.establish(peer, &a.public_key()).unwrap();

        let sealed = a.session(&peer).unwrap().seal(b"addrs").unwrap();
        let opened = b.session(&peer).unwrap().open(&sealed).unwrap();
        assert_eq!(opened, b"addrs");
    }

    #[test]
    fn wrong_key_fails_open() {
        let a = keyring(1);
        let sealed = a.self_secret().seal(b"private").unwrap();
        assert!(keyring(9).self_secret().open(&sealed).is_err());
        assert_eq!(a.self_secret().open(&sealed).unwrap(), b"private");
    }

    #[test]
    fn truncated_blob_rejected() {
        let a = keyring(3);
        let sealed = a.self_secret().seal(b"x").unwrap();
        assert!(a.self_secret().open(&sealed[..10]).is_err());
    }
}
