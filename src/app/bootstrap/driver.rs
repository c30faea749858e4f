// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Orchestrates one node's join (spec §4.6) and the independent reaction
//! every existing replica has to it (spec §4.2, §4.3): the ring delta
//! calculator is pure and deterministic, so each node computes the same
//! plan from its own metadata snapshot and acts on the subset naming it as
//! a source — no single coordinator pushes work around.

use crate::app::{
    bootstrap::{
        chooser,
        context::{
            set_bootstrap_mode,
            BootstrapContext,
        },
        error::BootstrapError,
        source::dispatch_assigned_ranges,
    },
    ring::Token,
};
use std::net::SocketAddr;

/// Run this node's bootstrap sequence end to end (spec §4.6):
///
/// 1. Choose a token (chooser, or the configured override).
/// 2. Register it as bootstrapping and publish `BOOTSTRAP_MODE` via gossip
///    so the rest of the cluster knows not to count it as a replica yet.
/// 3. Wait [`crate::app::bootstrap::context::BootstrapConfig::load_info_settle_delay`]
///    for load/ownership gossip to settle before any source computes its
///    plan against this node's new token.
/// 4. Wait until every tracked source session is done.
/// 5. Promote the token to live and clear `BOOTSTRAP_MODE`.
///
/// Returns the token this node now owns.
pub async fn run_bootstrap(context: &BootstrapContext) -> Result<Token, BootstrapError> {
    let token = chooser::choose_token(context).await?;

    context.metadata.add_bootstrap_token(token, context.local_endpoint).await;
    set_bootstrap_mode(context.gossip.as_ref(), true).await;

    tokio::time::sleep(context.config.load_info_settle_delay).await;

    while !context.streams.all_done().await {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    context.metadata.finish_bootstrap(token).await;
    set_bootstrap_mode(context.gossip.as_ref(), false).await;

    Ok(token)
}

/// React to learning that `newcomer` claimed `token` (spec §4.2/§4.3): every
/// node runs the same deterministic delta calculation against its own
/// metadata snapshot, and ships whatever ranges name it as a source. Nodes
/// that aren't a source for anything in the plan do nothing.
pub async fn on_peer_joined(context: &BootstrapContext, table: &str, token: Token, newcomer: SocketAddr) -> Result<(), BootstrapError> {
    let snapshot = context.metadata.snapshot().await;
    let plan = crate::app::bootstrap::delta::compute_plan(&snapshot, &[(token, newcomer)], context.replication.as_ref())?;
    dispatch_assigned_ranges(context, table, &plan, &context.source_streams).await
}
