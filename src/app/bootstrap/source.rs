// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Source-side bootstrap handlers (spec §4.3, §4.5): answer a peer's token
//! request, ship ranges the delta calculator assigned to this node, and
//! react to the per-file verdicts that come back.

use crate::app::{
    bootstrap::{
        context::BootstrapContext,
        delta::BootstrapSourceTarget,
        error::BootstrapError,
        verbs::{
            BootstrapInitiateMessage,
            Messaging,
            StreamAction,
            StreamContext,
            StreamStatusMessage,
            Verb,
        },
    },
    ring::Range,
};
use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};
use tokio::sync::RwLock;

/// Answer a peer's `BOOTSTRAP_TOKEN` request with the midpoint of this
/// node's primary range (spec §4.1: `getSplits(2)`'s middle element).
pub async fn handle_bootstrap_token_request(context: &BootstrapContext) -> Result<Verb, BootstrapError> {
    let splits = context.partitioner.get_splits(2);
    let midpoint = splits.get(1).ok_or_else(|| {
        BootstrapError::Assertion(format!("getSplits(2) returned {} tokens, expected 3", splits.len()))
    })?;
    Ok(Verb::BootstrapTokenReply(midpoint.to_string()))
}

/// What a peer still hasn't acknowledged, and what to do when it does.
#[derive(Debug)]
pub enum TerminateOutcome {
    /// The file was acknowledged; if this was the peer's last outstanding
    /// file, the peer is now fully served.
    Retired { peer_done: bool },
    /// The peer asked for a re-send; the caller is responsible for
    /// re-initiating the transfer for this one file (spec §4.5).
    Repeat(StreamContext),
    /// No context was being tracked for this (peer, file) pair.
    Unknown,
}

/// Tracks, per peer, which files this node has shipped and not yet had
/// acknowledged with `DELETE` (spec §3, §4.5).
#[derive(Clone, Default)]
pub struct SourceStreamManager {
    outstanding: Arc<RwLock<HashMap<SocketAddr, HashMap<PathBuf, StreamContext>>>>,
}

impl SourceStreamManager {
    /// A manager tracking nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `peer` has been offered `contexts` and none are
    /// acknowledged yet.
    pub async fn track(&self, peer: SocketAddr, contexts: &[StreamContext]) {
        let mut outstanding = self.outstanding.write().await;
        let entry = outstanding.entry(peer).or_default();
        for context in contexts {
            entry.insert(context.target_file_path.clone(), context.clone());
        }
    }

    /// Apply a `BootstrapTerminate` verdict from `peer` (spec §4.5):
    /// `DELETE` retires the file and frees its slot; `STREAM` hands the
    /// context back to the caller to re-enqueue.
    pub async fn handle_terminate(&self, peer: SocketAddr, status: &StreamStatusMessage) -> TerminateOutcome {
        let mut outstanding = self.outstanding.write().await;
        let Some(files) = outstanding.get_mut(&peer) else {
            return TerminateOutcome::Unknown;
        };
        match status.action {
            StreamAction::Delete => {
                if files.remove(&status.file).is_none() {
                    return TerminateOutcome::Unknown;
                }
                let peer_done = files.is_empty();
                if peer_done {
                    outstanding.remove(&peer);
                }
                TerminateOutcome::Retired { peer_done }
            }
            StreamAction::Stream => match files.get(&status.file) {
                Some(context) => TerminateOutcome::Repeat(context.clone()),
                None => TerminateOutcome::Unknown,
            },
        }
    }

    /// True once `peer` has no outstanding files (or never had any).
    pub async fn is_peer_done(&self, peer: SocketAddr) -> bool {
        self.outstanding.read().await.get(&peer).map(|files| files.is_empty()).unwrap_or(true)
    }
}

/// Send `contexts` to `target` as one `BootstrapInitiateMessage` and verify
/// the `bootstrapInitiateDone` ack (spec §4.3/§4.4).
async fn send_initiate(context: &BootstrapContext, target: SocketAddr, contexts: Vec<StreamContext>) -> Result<(), BootstrapError> {
    let reply = context
        .messaging
        .send_rr(target, Verb::BootstrapInitiate(BootstrapInitiateMessage { contexts }))
        .await
        .map_err(BootstrapError::Collaborator)?;
    if !matches!(reply, Verb::BootstrapInitiateDone) {
        return Err(BootstrapError::MalformedMessage {
            peer: target,
            reason: format!("expected BootstrapInitiateDone ack, got {reply:?}"),
        });
    }
    Ok(())
}

/// Group the delta plan's `(range -> [source, target])` pairs this node is
/// a source for into one `BootstrapInitiateMessage` per target, enumerate
/// the files each range actually needs via the column family store, and
/// dispatch them (spec §4.3).
pub async fn dispatch_assigned_ranges(
    context: &BootstrapContext,
    table: &str,
    plan: &BTreeMap<Range, Vec<BootstrapSourceTarget>>,
    stream_manager: &SourceStreamManager,
) -> Result<(), BootstrapError> {
    let mut by_target: HashMap<SocketAddr, Vec<StreamContext>> = HashMap::new();
    for (range, pairs) in plan {
        for pair in pairs {
            if pair.source != context.local_endpoint {
                continue;
            }
            let files = context.store.files_for_range(table, *range).await;
            by_target.entry(pair.target).or_default().extend(files);
        }
    }

    for (target, contexts) in by_target {
        if contexts.is_empty() {
            continue;
        }
        stream_manager.track(target, &contexts).await;
        send_initiate(context, target, contexts).await?;
    }
    Ok(())
}

/// Re-send a single file to `peer` after it reported a `STREAM` verdict
/// (spec §4.5: "re-enqueue the file for re-transmission (`repeat`) to the
/// same peer"). The file is already tracked as outstanding in
/// [`SourceStreamManager`] — `handle_terminate` never removed it on a
/// `STREAM` verdict — so this only needs to re-offer it over the wire.
pub async fn repeat_file(context: &BootstrapContext, peer: SocketAddr, stream_context: StreamContext) -> Result<(), BootstrapError> {
    send_initiate(context, peer, vec![stream_context]).await
}
