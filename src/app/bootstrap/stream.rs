// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The newcomer-side stream context manager: per-source outstanding file
//! sets, completion handlers, and the `AWAITING_INITIATE → FILES_ALLOCATED
//! → STREAMING → DONE` state machine (spec §3, §4.4).

use crate::app::bootstrap::verbs::{
    StreamAction,
    StreamContext,
    StreamStatusMessage,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};
use tokio::sync::RwLock;

/// The newcomer-side session state for one source peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamSessionState {
    /// Nothing received yet for this source.
    AwaitingInitiate,
    /// `BootstrapInitiateMessage` processed, local filenames allocated.
    FilesAllocated,
    /// Ready-to-receive ack sent; bytes may now arrive.
    Streaming,
    /// Every file for this source has a `DELETE` verdict.
    Done,
}

/// Invoked once a file's bytes have fully arrived. One implementation for
/// bootstrap; spec §9 notes this capability set generalizes to other
/// consumers (e.g. repair) elsewhere.
///
/// The handler, not the manager, decides the final verdict: a byte count
/// match is necessary but not sufficient (e.g. installing a `Data.db` can
/// still fail on I/O grounds), so the handler returns the
/// [`StreamStatusMessage`] that gets sent back to the source and that
/// governs retirement from the outstanding set.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    /// `host` shipped `context`; `bytes_received` is what the transport
    /// reports actually arrived.
    async fn on_file_complete(&self, host: SocketAddr, context: StreamContext, bytes_received: u64) -> StreamStatusMessage;
}

/// The fallback verdict when no handler is registered: a byte count match
/// is treated as sufficient.
fn default_verdict(context: &StreamContext, bytes_received: u64) -> StreamStatusMessage {
    let action = if bytes_received == context.expected_bytes { StreamAction::Delete } else { StreamAction::Stream };
    StreamStatusMessage { file: context.target_file_path.clone(), bytes_received, action }
}

struct PeerSession {
    state: StreamSessionState,
    outstanding: HashMap<PathBuf, (StreamContext, StreamStatusMessage)>,
    handler: Option<Arc<dyn CompletionHandler>>,
}

impl PeerSession {
    fn new() -> Self {
        Self { state: StreamSessionState::AwaitingInitiate, outstanding: HashMap::new(), handler: None }
    }
}

/// Per-host outstanding `StreamContext` sets plus completion handlers
/// (spec §3 "Per-peer stream set", §6 `addStreamContext` /
/// `registerStreamCompletionHandler` / `isDone`).
#[derive(Clone, Default)]
pub struct StreamContextManager {
    sessions: Arc<RwLock<HashMap<SocketAddr, PeerSession>>>,
}

impl StreamContextManager {
    /// A manager with no sessions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file as outstanding for `host`, paired with a fresh
    /// pending status (`bytes_received = 0`, provisional `STREAM`
    /// action — overwritten once the real verdict is known).
    pub async fn add_stream_context(&self, host: SocketAddr, context: StreamContext) {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(host).or_insert_with(PeerSession::new);
        let pending = StreamStatusMessage {
            file: context.target_file_path.clone(),
            bytes_received: 0,
            action: StreamAction::Stream,
        };
        session.outstanding.insert(context.target_file_path.clone(), (context, pending));
    }

    /// Advance `host`'s session to `state`.
    pub async fn set_state(&self, host: SocketAddr, state: StreamSessionState) {
        let mut sessions = self.sessions.write().await;
        sessions.entry(host).or_insert_with(PeerSession::new).state = state;
    }

    /// `host`'s current session state, or `AwaitingInitiate` if no session
    /// exists yet.
    pub async fn state_of(&self, host: SocketAddr) -> StreamSessionState {
        self.sessions.read().await.get(&host).map(|s| s.state).unwrap_or(StreamSessionState::AwaitingInitiate)
    }

    /// Register the completion handler invoked when a file from `host`
    /// finishes.
    pub async fn register_stream_completion_handler(&self, host: SocketAddr, handler: Arc<dyn CompletionHandler>) {
        let mut sessions = self.sessions.write().await;
        sessions.entry(host).or_insert_with(PeerSession::new).handler = Some(handler);
    }

    /// `host` is done when its outstanding set is empty (spec §3).
    pub async fn is_done(&self, host: SocketAddr) -> bool {
        self.sessions.read().await.get(&host).map(|s| s.outstanding.is_empty()).unwrap_or(true)
    }

    /// True once every registered source session is done.
    pub async fn all_done(&self) -> bool {
        self.sessions.read().await.values().all(|s| s.outstanding.is_empty())
    }

    /// Remove `host`'s session entirely once it is done, per the "remove
    /// from the bootstrap-sources registry" step of spec §4.4.
    pub async fn remove_if_done(&self, host: SocketAddr) -> bool {
        let mut sessions = self.sessions.write().await;
        let done = sessions.get(&host).map(|s| s.outstanding.is_empty()).unwrap_or(true);
        if done {
            sessions.remove(&host);
        }
        done
    }

    /// Called by the transport (out of scope here) once `path`'s bytes
    /// have arrived from `host`. Computes the verdict, invokes the
    /// completion handler, and — on `DELETE` — retires the file from the
    /// outstanding set. On `STREAM` the file stays outstanding: it will be
    /// re-delivered and must complete again before the peer can be done.
    pub async fn complete_file(&self, host: SocketAddr, path: &std::path::Path, bytes_received: u64) {
        let entry = {
            let sessions = self.sessions.read().await;
            sessions.get(&host).and_then(|s| s.outstanding.get(path)).map(|(ctx, _)| ctx.clone())
        };
        let Some(context) = entry else {
            log::warn!("completion reported for untracked file {path:?} from {host}");
            return;
        };

        let handler = {
            let sessions = self.sessions.read().await;
            sessions.get(&host).and_then(|s| s.handler.clone())
        };
        let status = match &handler {
            Some(handler) => handler.on_file_complete(host, context.clone(), bytes_received).await,
            None => default_verdict(&context, bytes_received),
        };

        if matches!(status.action, StreamAction::Delete) {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(&host) {
                session.outstanding.remove(path);
                if session.outstanding.is_empty() {
                    session.state = StreamSessionState::Done;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{
        AtomicUsize,
        Ordering,
    };

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn context(path: &str, expected: u64) -> StreamContext {
        StreamContext { table: "keyspace1".to_owned(), target_file_path: PathBuf::from(path), expected_bytes: expected }
    }

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionHandler for CountingHandler {
        async fn on_file_complete(&self, _host: SocketAddr, context: StreamContext, bytes_received: u64) -> StreamStatusMessage {
            self.calls.fetch_add(1, Ordering::SeqCst);
            default_verdict(&context, bytes_received)
        }
    }

    #[tokio::test]
    async fn file_with_matching_bytes_is_deleted_and_retired() {
        let manager = StreamContextManager::new();
        let host = addr(1);
        manager.add_stream_context(host, context("/data/ks-7-Data.db", 100)).await;
        manager.complete_file(host, std::path::Path::new("/data/ks-7-Data.db"), 100).await;
        assert!(manager.is_done(host).await);
    }

    #[tokio::test]
    async fn file_with_short_bytes_stays_outstanding_until_retry_succeeds() {
        let manager = StreamContextManager::new();
        let host = addr(1);
        manager.add_stream_context(host, context("/data/ks-7-Data.db", 100)).await;

        manager.complete_file(host, std::path::Path::new("/data/ks-7-Data.db"), 40).await;
        assert!(!manager.is_done(host).await, "a STREAM verdict must not retire the file");

        manager.complete_file(host, std::path::Path::new("/data/ks-7-Data.db"), 100).await;
        assert!(manager.is_done(host).await);
    }

    #[tokio::test]
    async fn peer_is_done_only_once_every_file_is_deleted() {
        let manager = StreamContextManager::new();
        let host = addr(1);
        manager.add_stream_context(host, context("/data/ks-7-Data.db", 100)).await;
        manager.add_stream_context(host, context("/data/ks-7-Index.db", 10)).await;

        manager.complete_file(host, std::path::Path::new("/data/ks-7-Index.db"), 10).await;
        assert!(!manager.is_done(host).await);

        manager.complete_file(host, std::path::Path::new("/data/ks-7-Data.db"), 100).await;
        assert!(manager.is_done(host).await);
        assert!(manager.remove_if_done(host).await);
    }

    #[tokio::test]
    async fn completion_handler_is_invoked_regardless_of_verdict() {
        let manager = StreamContextManager::new();
        let host = addr(1);
        let handler = Arc::new(CountingHandler { calls: AtomicUsize::new(0) });
        manager.register_stream_completion_handler(host, handler.clone()).await;
        manager.add_stream_context(host, context("/data/ks-7-Data.db", 100)).await;
        manager.complete_file(host, std::path::Path::new("/data/ks-7-Data.db"), 40).await;
        manager.complete_file(host, std::path::Path::new("/data/ks-7-Data.db"), 100).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn completion_order_permutation_does_not_change_final_outcome() {
        for order in [["Data", "Index"], ["Index", "Data"]] {
            let manager = StreamContextManager::new();
            let host = addr(1);
            manager.add_stream_context(host, context("/data/ks-7-Data.db", 100)).await;
            manager.add_stream_context(host, context("/data/ks-7-Index.db", 10)).await;
            for kind in order {
                let (path, bytes) = if kind == "Data" { ("/data/ks-7-Data.db", 100) } else { ("/data/ks-7-Index.db", 10) };
                manager.complete_file(host, std::path::Path::new(path), bytes).await;
            }
            assert!(manager.is_done(host).await);
        }
    }
}
