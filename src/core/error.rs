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

//! Error taxonomy shared across the node.
//!
//! Per-request failures travel on the wire as `{success:false, error:..}`
//! with the short messages below; nothing else (no stack traces, no peer
//! internals) is ever serialized. Background loops log and continue; only
//! startup failures before the transport is bound abort the process.

use thiserror::Error;

/// Failures of a served request, returned to the remote peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// URN rejected at the boundary.
    #[error("Invalid URN")]
    InvalidUrn,
    /// Envelope rejected at the boundary (missing/malformed fields).
    #[error("Invalid request")]
    InvalidRequest,
    /// Unknown request type.
    #[error("Unsupported request")]
    UnsupportedRequest,
    /// Store is not held locally.
    #[error("Store not found")]
    StoreNotFound,
    /// Byte range falls outside the store.
    #[error("Range out of bounds")]
    RangeOutOfBounds,
    /// URN pinned a root hash that does not match the local copy.
    #[error("Version mismatch: requested {requested}, available {available}")]
    VersionMismatch {
        /// Root hash pinned by the URN.
        requested: String,
        /// Hash of the local copy.
        available: String,
    },
}

/// Reachability and acquisition failures, local to the node.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// No transport address could be resolved for a crypto-IPv6 target.
    #[error("resolution unavailable")]
    ResolutionUnavailable,
    /// Outbound dial exceeded its deadline.
    #[error("dial timeout")]
    DialTimeout,
    /// No relay (peer or bootstrap) would carry the request.
    #[error("relay unavailable")]
    RelayUnavailable,
    /// Every cascade strategy failed for the store.
    #[error("download failed")]
    DownloadFailed,
    /// Assembled bytes did not hash to a usable root.
    #[error("integrity failure")]
    IntegrityFailure,
    /// Connection dropped mid-request.
    #[error("transport closed")]
    TransportClosed,
}

/// Connection-level policy failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Remote refused or failed the encrypted handshake.
    #[error("encryption required")]
    EncryptionRequired,
    /// Connection closed before the exchange completed.
    #[error("transport closed")]
    Closed,
}
