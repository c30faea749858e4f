// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Wire messages and filename conventions for bootstrap streaming (spec §3,
//! §6).

use async_trait::async_trait;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    net::SocketAddr,
    path::{
        Path,
        PathBuf,
    },
};

/// A single on-disk table artifact in flight. `target_file_path` is the
/// *source's* filename at creation time; the newcomer rewrites it to its
/// own local path on receipt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamContext {
    /// The keyspace/table this file belongs to.
    pub table: String,
    /// Filename at the sender, following `<cf>-<generation>-<kind>.db`.
    pub target_file_path: PathBuf,
    /// Bytes the receiver should expect for this file.
    pub expected_bytes: u64,
}

/// Parsed `<cf>-<generation>-<kind>.db` filename components.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SSTableFileName {
    /// Column family (table) name.
    pub cf: String,
    /// Table generation number.
    pub generation: u64,
    /// `Data`, `Index`, `Filter`, ... — the artifact kind.
    pub kind: String,
}

impl SSTableFileName {
    /// `(cf, generation)` — the key distinct files of the same generation
    /// share, used to group `StreamContext`s onto one local name.
    pub fn distinct_entry(&self) -> (String, u64) {
        (self.cf.clone(), self.generation)
    }

    /// Parse `<cf>-<generation>-<kind>.db`. Malformed names surface as
    /// `None`, which callers turn into `BootstrapError::MalformedMessage`
    /// rather than panicking (spec §9).
    pub fn parse(path: &Path) -> Option<Self> {
        let stem = path.file_name()?.to_str()?;
        let stem = stem.strip_suffix(".db")?;
        let mut parts = stem.rsplitn(2, '-');
        let kind = parts.next()?.to_owned();
        let rest = parts.next()?;
        let mut rest_parts = rest.rsplitn(2, '-');
        let generation: u64 = rest_parts.next()?.parse().ok()?;
        let cf = rest_parts.next()?.to_owned();
        Some(Self { cf, generation, kind })
    }

    /// Render with a substituted `(cf, generation)` stem, preserving this
    /// file's kind suffix. Used by the newcomer to rewrite the source's
    /// filename to its own locally-generated name.
    pub fn with_stem(&self, cf: &str, generation: u64) -> String {
        format!("{cf}-{generation}-{kind}.db", kind = self.kind)
    }
}

/// Post-transfer verdict for one file (spec §3, §4.4/§4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamAction {
    /// The file arrived intact; the source may discard its copy.
    Delete,
    /// Ask the source to re-send this file.
    Stream,
}

/// Carries the per-file verdict from newcomer back to source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatusMessage {
    /// The file this verdict concerns, by its final (post-rewrite) path.
    pub file: PathBuf,
    /// How many bytes were actually received for it.
    pub bytes_received: u64,
    /// `DELETE` or `STREAM`.
    pub action: StreamAction,
}

/// `[StreamContext]` sent source → newcomer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapInitiateMessage {
    /// The files this source is offering to ship.
    pub contexts: Vec<StreamContext>,
}

/// The five wire verbs of spec §6, as one dispatchable envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
    /// newcomer → most-loaded peer, empty body.
    BootstrapToken,
    /// reply to `BootstrapToken`: a UTF-8 token string.
    BootstrapTokenReply(String),
    /// source → newcomer: the files this source is shipping.
    BootstrapInitiate(BootstrapInitiateMessage),
    /// newcomer → source: ready to receive, empty body.
    BootstrapInitiateDone,
    /// newcomer → source: per-file verdict.
    BootstrapTerminate(StreamStatusMessage),
}

/// The out-of-scope "low-level messaging transport" collaborator (spec
/// §1, §6): point-to-point request/response and one-way send, keyed by
/// verb. Concrete transport is provided by `app::listener` /
/// `InProcessMessaging`; this trait is the seam the bootstrap logic is
/// written against.
#[async_trait]
pub trait Messaging: Send + Sync {
    /// Request/response: send `verb` to `to` and await its reply.
    async fn send_rr(&self, to: SocketAddr, verb: Verb) -> anyhow::Result<Verb>;
    /// Fire-and-forget: send `verb` to `to`, no reply expected.
    async fn send_one_way(&self, to: SocketAddr, verb: Verb) -> anyhow::Result<()>;
}
