// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]
//! The storage node application.
mod application;

/// Node-join bootstrap: ring delta computation, the streaming state
/// machine, and the source/newcomer verb handlers.
pub mod bootstrap;
/// Cluster topology tracking and the per-node reaction to ring deltas.
pub mod cluster;
/// Inbound connection listener and the outbound messaging transport.
pub mod listener;
/// A supervised handle to one peer.
pub mod node;
/// The token ring: tokens, ranges, and the arithmetic over them.
pub mod ring;

pub use application::{
    StorageService,
    StorageServiceEvent,
};
