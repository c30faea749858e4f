// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Error kinds raised by the bootstrap subsystem (spec §7).

use crate::app::bootstrap::delta::DeltaError;
use std::net::SocketAddr;
use thiserror::Error;

/// Fatal and non-fatal errors the bootstrap driver and handlers can raise.
///
/// Per-file streaming I/O failures are deliberately *not* a variant here:
/// spec §4.4/§7 treat those as logged-and-retried, never as a value that
/// aborts the whole session.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// No peer has reported load; join-time fatal error (spec §4.1/§8
    /// scenario 5).
    #[error("no bootstrap sources: load balancer reported no peers")]
    NoSources,
    /// The token-request RPC to the most-loaded peer never returned within
    /// the configured deadline.
    #[error("token request to {peer} timed out")]
    TokenRequestTimedOut {
        /// The peer that was asked for a split point.
        peer: SocketAddr,
    },
    /// A network string failed UTF-8 decoding; treated as bit corruption,
    /// not a programming error, per spec §9's "exception-as-assertion" note.
    #[error("malformed message from {peer}: {reason}")]
    MalformedMessage {
        /// The peer the malformed message came from.
        peer: SocketAddr,
        /// Why it failed to decode.
        reason: String,
    },
    /// The ring delta calculator rejected the proposed topology change.
    #[error(transparent)]
    Delta(#[from] DeltaError),
    /// A collaborator (partitioner, store, transport) reported a failure
    /// this crate doesn't have a more specific variant for.
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
    /// An invariant a collaborator is expected to uphold was violated —
    /// e.g. a partitioner's `getSplits(2)` returning a count other than
    /// three. These indicate a bug in a collaborator, not a runtime
    /// condition, and are surfaced as fatal (spec §7).
    #[error("collaborator invariant violated: {0}")]
    Assertion(String),
}
