// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Collaborator traits named as out-of-scope in spec §6, plus the simple
//! in-process implementations this crate needs to be runnable and
//! testable, and the `BootstrapContext` that threads them through the
//! driver and handlers instead of looking them up from global state
//! (spec §9's "explicit context" redesign).

use crate::app::{
    bootstrap::delta::ReplicationStrategy,
    bootstrap::verbs::{
        Messaging,
        StreamContext,
    },
    ring::{
        Range,
        Token,
        TokenParseError,
    },
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{
        Path,
        PathBuf,
    },
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};
use tokio::sync::RwLock;

/// `tokenFactory.fromString` / `getSplits(n)` (spec §6).
pub trait Partitioner: Send + Sync {
    /// Parse a canonical token string. Failures are bit corruption, not
    /// programming errors (spec §9).
    fn from_string(&self, s: &str) -> Result<Token, TokenParseError>;
    /// `n + 1` tokens partitioning this node's current primary range into
    /// `n` roughly-equal shards.
    fn get_splits(&self, n: usize) -> Vec<Token>;
}

/// A partitioner backed by a single locally-tracked primary range, enough
/// for a single-process node to answer `getSplits` for its own data.
pub struct InMemoryPartitioner {
    primary_range: std::sync::RwLock<Option<Range>>,
}

impl InMemoryPartitioner {
    /// A partitioner with no primary range set yet.
    pub fn new() -> Self {
        Self { primary_range: std::sync::RwLock::new(None) }
    }

    /// Record (or replace) the range this node is currently primary for.
    /// Called whenever the local token changes, e.g. after bootstrap.
    pub fn set_primary_range(&self, range: Range) {
        *self.primary_range.write().unwrap() = Some(range);
    }
}

impl Default for InMemoryPartitioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Partitioner for InMemoryPartitioner {
    fn from_string(&self, s: &str) -> Result<Token, TokenParseError> {
        s.parse()
    }

    fn get_splits(&self, n: usize) -> Vec<Token> {
        assert!(n > 0, "get_splits requires at least one shard");
        let range = self.primary_range.read().unwrap().expect("primary range must be set before splitting");
        let span = range.start().distance_to(range.end()) as u128;
        (0..=n)
            .map(|k| {
                let offset = (span * k as u128) / n as u128;
                Token(((range.start().0 as i128 + offset as i128) % (1i128 << 64)) as i64)
            })
            .collect()
    }
}

/// `waitForLoadInfo` / `getLoadInfo` (spec §6). Production code would feed
/// this from gossip, which is out of scope here; this crate's
/// implementation is fed directly by whoever constructs it (tests, or a
/// future gossip integration).
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Block until at least one peer has reported load.
    async fn wait_for_load_info(&self);
    /// Current per-endpoint load snapshot.
    async fn get_load_info(&self) -> HashMap<SocketAddr, f64>;
}

/// A load balancer whose readings are set directly rather than learned
/// from gossip.
#[derive(Default)]
pub struct StaticLoadBalancer {
    load: RwLock<HashMap<SocketAddr, f64>>,
}

impl StaticLoadBalancer {
    /// A load balancer pre-seeded with `load`.
    pub fn new(load: HashMap<SocketAddr, f64>) -> Self {
        Self { load: RwLock::new(load) }
    }

    /// Report (or update) `endpoint`'s load.
    pub async fn report(&self, endpoint: SocketAddr, load: f64) {
        self.load.write().await.insert(endpoint, load);
    }
}

#[async_trait]
impl LoadBalancer for StaticLoadBalancer {
    async fn wait_for_load_info(&self) {
        // Load is supplied synchronously by the test/caller; nothing to await.
    }

    async fn get_load_info(&self) -> HashMap<SocketAddr, f64> {
        self.load.read().await.clone()
    }
}

/// `addApplicationState` (spec §6): the cluster-visible gossip channel
/// that carries `BOOTSTRAP_MODE`.
#[async_trait]
pub trait Gossip: Send + Sync {
    /// Publish `value` for `key`, visible cluster-wide.
    async fn add_application_state(&self, key: &str, value: String);
}

/// An in-memory stand-in for the gossip service, sufficient for a single
/// process (and for tests to observe what was published).
#[derive(Default)]
pub struct InMemoryGossip {
    state: RwLock<HashMap<String, String>>,
}

impl InMemoryGossip {
    /// A gossip service with no published state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read back a previously published value.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.state.read().await.get(key).cloned()
    }
}

#[async_trait]
impl Gossip for InMemoryGossip {
    async fn add_application_state(&self, key: &str, value: String) {
        self.state.write().await.insert(key.to_owned(), value);
    }
}

/// The cluster-visible marker that the local node is bootstrapping (spec
/// §3, §6).
pub const BOOTSTRAP_MODE_KEY: &str = "BOOTSTRAP_MODE";

/// Publish `BOOTSTRAP_MODE` via gossip.
pub async fn set_bootstrap_mode(gossip: &dyn Gossip, active: bool) {
    gossip.add_application_state(BOOTSTRAP_MODE_KEY, active.to_string()).await;
}

/// `getTempSSTableFileName` / `addSSTable` / `renameAndOpen`, folded into
/// one seam: the per-column-family store that owns on-disk table files
/// (spec §6).
#[async_trait]
pub trait ColumnFamilyStore: Send + Sync {
    /// Allocate a fresh, unique temporary SSTable filename stem.
    async fn get_temp_sstable_file_name(&self) -> String;
    /// Rename-and-open the file at `final_path`, then install it into the
    /// store (the source system's `renameAndOpen` + `addSSTable`, folded
    /// into one step since this crate does not model a separate reader
    /// object).
    async fn install(&self, final_path: &Path) -> anyhow::Result<()>;
    /// Release a temp file that will never be installed, so install
    /// failures don't leak disk space (spec §9 open question, resolved).
    async fn discard_temp_file(&self, path: &Path) -> anyhow::Result<()>;
    /// The local path `name` resolves to under this store's data directory.
    fn local_path(&self, name: &str) -> PathBuf;
    /// The on-disk tables this store currently holds that overlap `range`,
    /// as the [`StreamContext`]s a source would offer a newcomer for it.
    /// The out-of-scope "which SSTables cover this range" lookup (spec §6);
    /// a real implementation walks the store's manifest, which this crate
    /// does not model.
    async fn files_for_range(&self, table: &str, range: Range) -> Vec<StreamContext>;
}

/// A filesystem-backed column family store scoped to what bootstrap
/// needs: unique temp names, install-by-presence, and discard.
pub struct FsColumnFamilyStore {
    data_dir: PathBuf,
    counter: AtomicU64,
    installed: tokio::sync::Mutex<Vec<PathBuf>>,
}

impl FsColumnFamilyStore {
    /// A store rooted at `data_dir`.
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir, counter: AtomicU64::new(0), installed: tokio::sync::Mutex::new(Vec::new()) }
    }

    /// The configured data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Tables this store has installed so far (test/ops introspection).
    pub async fn installed_tables(&self) -> Vec<PathBuf> {
        self.installed.lock().await.clone()
    }
}

#[async_trait]
impl ColumnFamilyStore for FsColumnFamilyStore {
    async fn get_temp_sstable_file_name(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("tmp-{n:x}")
    }

    async fn install(&self, final_path: &Path) -> anyhow::Result<()> {
        self.installed.lock().await.push(final_path.to_path_buf());
        Ok(())
    }

    async fn discard_temp_file(&self, path: &Path) -> anyhow::Result<()> {
        if tokio::fs::metadata(path).await.is_ok() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    fn local_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    async fn files_for_range(&self, _table: &str, _range: Range) -> Vec<StreamContext> {
        // This crate does not model an on-disk SSTable manifest; a real
        // store would consult one here. Tests that exercise the source
        // side of streaming supply their own `ColumnFamilyStore`.
        Vec::new()
    }
}

/// Timeouts and overrides for the bootstrap sequence (spec §4.1, §4.6).
#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    /// Skip the token chooser entirely if set (spec §4.1 short-circuit).
    pub initial_token: Option<Token>,
    /// How long the token-request RPC waits before failing (spec §9: the
    /// source design has no timeout; this crate adds one).
    pub token_request_timeout: Duration,
    /// The pre-load-info settle delay (spec §4.6: ~30s in the source
    /// system; overridden to near-zero in tests).
    pub load_info_settle_delay: Duration,
    /// Replication factor handed to the default [`crate::app::bootstrap::delta::SimpleStrategy`].
    pub replication_factor: usize,
    /// Whether this node should run the bootstrap driver (spec §4.6) on
    /// startup. `false` for a node joining an empty/seed ring or one that
    /// already owns its tokens; `true` for a node joining an existing,
    /// live cluster.
    pub join_on_start: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            initial_token: None,
            token_request_timeout: Duration::from_secs(10),
            load_info_settle_delay: Duration::from_secs(30),
            replication_factor: 3,
            join_on_start: false,
        }
    }
}

/// Bundles every collaborator the bootstrap driver and verb handlers need,
/// passed by reference rather than looked up from process-wide statics
/// (spec §9).
#[derive(Clone)]
pub struct BootstrapContext {
    /// This node's own address.
    pub local_endpoint: SocketAddr,
    /// The authoritative token→endpoint map.
    pub metadata: crate::app::bootstrap::metadata::TokenMetadata,
    /// The stream context manager tracking outstanding per-host transfers
    /// this node is receiving, as a newcomer.
    pub streams: crate::app::bootstrap::stream::StreamContextManager,
    /// Tracks outstanding per-peer transfers this node is shipping, as a
    /// source. Shared (not locally owned by the cluster actor) so the
    /// listener can relay `BootstrapTerminate` verdicts to it directly.
    pub source_streams: crate::app::bootstrap::source::SourceStreamManager,
    /// Point-to-point messaging.
    pub messaging: Arc<dyn Messaging>,
    /// Peer load reporting.
    pub load_balancer: Arc<dyn LoadBalancer>,
    /// Cluster-visible application state.
    pub gossip: Arc<dyn Gossip>,
    /// Token parsing and local-range splitting.
    pub partitioner: Arc<dyn Partitioner>,
    /// Range → replica-set computation.
    pub replication: Arc<dyn ReplicationStrategy>,
    /// On-disk table installation.
    pub store: Arc<dyn ColumnFamilyStore>,
    /// Tunables.
    pub config: BootstrapConfig,
}
