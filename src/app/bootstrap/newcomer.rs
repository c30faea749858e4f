// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Newcomer-side bootstrap handlers (spec §4.4): accept a source's file
//! offer, allocate local names, and install completed transfers.

use crate::app::bootstrap::{
    context::BootstrapContext,
    error::BootstrapError,
    stream::{
        CompletionHandler,
        StreamSessionState,
    },
    verbs::{
        BootstrapInitiateMessage,
        Messaging,
        SSTableFileName,
        StreamAction,
        StreamContext,
        StreamStatusMessage,
        Verb,
    },
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
};

/// Accept a `BOOTSTRAP_INITIATE` offer from `source` (spec §4.4):
///
/// 1. Group the offered files by `(cf, generation)` so files that belong to
///    the same table generation share one locally-allocated stem.
/// 2. Rewrite each `target_file_path` to a local temp name.
/// 3. Register every rewritten context with the stream manager and point
///    its completion handler at `handler`.
/// 4. Move the session to `FilesAllocated`, then `Streaming`.
///
/// Returns the rewritten contexts (what the transport, out of scope here,
/// will actually write to) and the ack to send back.
pub async fn handle_initiate(
    context: &BootstrapContext,
    source: SocketAddr,
    message: BootstrapInitiateMessage,
    handler: Arc<dyn CompletionHandler>,
) -> Result<(Vec<StreamContext>, Verb), BootstrapError> {
    context.streams.set_state(source, StreamSessionState::AwaitingInitiate).await;

    let mut stems: HashMap<(String, u64), String> = HashMap::new();
    let mut rewritten = Vec::with_capacity(message.contexts.len());

    for incoming in &message.contexts {
        let parsed = SSTableFileName::parse(&incoming.target_file_path).ok_or_else(|| BootstrapError::MalformedMessage {
            peer: source,
            reason: format!("not a valid sstable filename: {:?}", incoming.target_file_path),
        })?;
        let key = parsed.distinct_entry();
        let stem = match stems.get(&key) {
            Some(stem) => stem.clone(),
            None => {
                let stem = context.store.get_temp_sstable_file_name().await;
                stems.insert(key, stem.clone());
                stem
            }
        };
        let local_name = parsed.with_stem(&stem, 0);
        let local_context = StreamContext {
            table: incoming.table.clone(),
            target_file_path: context.store.local_path(&local_name),
            expected_bytes: incoming.expected_bytes,
        };
        context.streams.add_stream_context(source, local_context.clone()).await;
        rewritten.push(local_context);
    }

    context.streams.register_stream_completion_handler(source, handler).await;
    context.streams.set_state(source, StreamSessionState::FilesAllocated).await;
    context.streams.set_state(source, StreamSessionState::Streaming).await;

    Ok((rewritten, Verb::BootstrapInitiateDone))
}

/// The default completion handler (spec §4.4): install `Data.db` files,
/// verify the byte count, and report `DELETE`/`STREAM` back to the source.
/// Install failures are logged and downgrade the verdict to `STREAM`
/// rather than aborting the session (spec §9).
pub struct InstallingCompletionHandler {
    store: Arc<dyn crate::app::bootstrap::context::ColumnFamilyStore>,
    messaging: Arc<dyn crate::app::bootstrap::verbs::Messaging>,
}

impl InstallingCompletionHandler {
    /// A handler that installs into `store` and replies via `messaging`.
    pub fn new(
        store: Arc<dyn crate::app::bootstrap::context::ColumnFamilyStore>,
        messaging: Arc<dyn crate::app::bootstrap::verbs::Messaging>,
    ) -> Self {
        Self { store, messaging }
    }
}

#[async_trait]
impl CompletionHandler for InstallingCompletionHandler {
    async fn on_file_complete(&self, host: SocketAddr, context: StreamContext, bytes_received: u64) -> StreamStatusMessage {
        let action = if bytes_received != context.expected_bytes {
            StreamAction::Stream
        } else {
            match self.store.install(&context.target_file_path).await {
                Ok(()) => StreamAction::Delete,
                Err(error) => {
                    log::warn!("failed to install {:?} from {host}: {error}", context.target_file_path);
                    if let Err(discard_error) = self.store.discard_temp_file(&context.target_file_path).await {
                        log::warn!("failed to discard temp file {:?} after failed install: {discard_error}", context.target_file_path);
                    }
                    StreamAction::Stream
                }
            }
        };
        let status = StreamStatusMessage { file: context.target_file_path.clone(), bytes_received, action };
        if let Err(error) = self.messaging.send_one_way(host, Verb::BootstrapTerminate(status.clone())).await {
            log::error!("failed to send stream terminate verdict to {host}: {error}");
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::bootstrap::{
        context::{
            BootstrapConfig,
            FsColumnFamilyStore,
            InMemoryGossip,
            InMemoryPartitioner,
            StaticLoadBalancer,
        },
        delta::SimpleStrategy,
        metadata::TokenMetadata,
        stream::StreamContextManager,
    };
    use std::path::PathBuf;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    struct NullMessaging;

    #[async_trait]
    impl Messaging for NullMessaging {
        async fn send_rr(&self, _to: SocketAddr, verb: Verb) -> anyhow::Result<Verb> {
            Ok(verb)
        }

        async fn send_one_way(&self, _to: SocketAddr, _verb: Verb) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_context() -> BootstrapContext {
        BootstrapContext {
            local_endpoint: addr(0),
            metadata: TokenMetadata::new(),
            streams: StreamContextManager::new(),
            source_streams: crate::app::bootstrap::source::SourceStreamManager::new(),
            messaging: Arc::new(NullMessaging),
            load_balancer: Arc::new(StaticLoadBalancer::new(HashMap::new())),
            gossip: Arc::new(InMemoryGossip::new()),
            partitioner: Arc::new(InMemoryPartitioner::new()),
            replication: Arc::new(SimpleStrategy { replication_factor: 1 }),
            store: Arc::new(FsColumnFamilyStore::new(std::env::temp_dir())),
            config: BootstrapConfig::default(),
        }
    }

    #[tokio::test]
    async fn files_sharing_a_generation_get_the_same_local_stem() {
        let context = test_context();
        let handler = Arc::new(InstallingCompletionHandler::new(context.store.clone(), context.messaging.clone()));
        let source = addr(1);
        let message = BootstrapInitiateMessage {
            contexts: vec![
                StreamContext { table: "keyspace1".to_owned(), target_file_path: PathBuf::from("keyspace1-7-Data.db"), expected_bytes: 100 },
                StreamContext { table: "keyspace1".to_owned(), target_file_path: PathBuf::from("keyspace1-7-Index.db"), expected_bytes: 10 },
            ],
        };
        let (rewritten, ack) = handle_initiate(&context, source, message, handler).await.unwrap();
        assert!(matches!(ack, Verb::BootstrapInitiateDone));
        assert_eq!(rewritten.len(), 2);
        let stem_of = |p: &std::path::Path| p.file_stem().unwrap().to_str().unwrap().rsplit_once('-').unwrap().0.to_owned();
        assert_eq!(stem_of(&rewritten[0].target_file_path), stem_of(&rewritten[1].target_file_path));
    }

    #[tokio::test]
    async fn malformed_filename_is_reported_as_malformed_message() {
        let context = test_context();
        let handler = Arc::new(InstallingCompletionHandler::new(context.store.clone(), context.messaging.clone()));
        let message = BootstrapInitiateMessage {
            contexts: vec![StreamContext { table: "keyspace1".to_owned(), target_file_path: PathBuf::from("not-a-table-file"), expected_bytes: 1 }],
        };
        let error = handle_initiate(&context, addr(1), message, handler).await.unwrap_err();
        assert!(matches!(error, BootstrapError::MalformedMessage { .. }));
    }

    #[tokio::test]
    async fn matching_byte_count_installs_and_reports_delete() {
        let context = test_context();
        let handler = InstallingCompletionHandler::new(context.store.clone(), context.messaging.clone());
        let stream_context = StreamContext { table: "keyspace1".to_owned(), target_file_path: PathBuf::from("keyspace1-0-Data.db"), expected_bytes: 100 };
        let status = handler.on_file_complete(addr(1), stream_context, 100).await;
        assert_eq!(status.action, StreamAction::Delete);
    }

    #[tokio::test]
    async fn short_byte_count_reports_stream() {
        let context = test_context();
        let handler = InstallingCompletionHandler::new(context.store.clone(), context.messaging.clone());
        let stream_context = StreamContext { table: "keyspace1".to_owned(), target_file_path: PathBuf::from("keyspace1-0-Data.db"), expected_bytes: 100 };
        let status = handler.on_file_complete(addr(1), stream_context, 40).await;
        assert_eq!(status.action, StreamAction::Stream);
    }
}
