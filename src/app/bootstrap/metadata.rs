// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! `TokenMetadata`: the authoritative token→endpoint mapping, plus the
//! parallel bootstrapping-tokens mapping so that newcomers don't count as
//! replicas until they're done.

use crate::app::ring::Token;
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::Arc,
};
use tokio::sync::RwLock;

/// A point-in-time, read-only copy of [`TokenMetadata`], safe to hand to
/// pure algorithms like the ring delta calculator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenMetadataSnapshot {
    /// Live, non-bootstrapping token owners.
    pub tokens: BTreeMap<Token, SocketAddr>,
    /// Tokens claimed by nodes that are still bootstrapping.
    pub bootstrapping: BTreeMap<Token, SocketAddr>,
}

impl TokenMetadataSnapshot {
    /// All tokens, live and bootstrapping, as a single sorted set. Used to
    /// enumerate ranges over the augmented ring in the delta calculator.
    pub fn all_tokens(&self) -> Vec<Token> {
        let mut all: Vec<Token> = self.tokens.keys().chain(self.bootstrapping.keys()).copied().collect();
        all.sort();
        all.dedup();
        all
    }
}

/// Shared, mutated-only-by-membership-events store of the ring's live
/// topology. Mirrors the source system's `TokenMetadata`: one mapping for
/// settled replicas, one for nodes currently bootstrapping.
#[derive(Clone, Default)]
pub struct TokenMetadata {
    inner: Arc<RwLock<TokenMetadataSnapshot>>,
}

impl TokenMetadata {
    /// A fresh, empty metadata store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint` as the live owner of `token`.
    pub async fn add_endpoint(&self, token: Token, endpoint: SocketAddr) {
        self.inner.write().await.tokens.insert(token, endpoint);
    }

    /// Mark `(token, endpoint)` as a bootstrapping (not-yet-replica) pair.
    pub async fn add_bootstrap_token(&self, token: Token, endpoint: SocketAddr) {
        self.inner.write().await.bootstrapping.insert(token, endpoint);
    }

    /// Promote a bootstrapping token to a live, replica-counting one, once
    /// its session completes.
    pub async fn finish_bootstrap(&self, token: Token) {
        let mut guard = self.inner.write().await;
        if let Some(endpoint) = guard.bootstrapping.remove(&token) {
            guard.tokens.insert(token, endpoint);
        }
    }

    /// An owned, read-only copy for pure algorithms.
    pub async fn snapshot(&self) -> TokenMetadataSnapshot {
        self.inner.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn bootstrap_token_promotes_to_live_on_finish() {
        let metadata = TokenMetadata::new();
        metadata.add_bootstrap_token(Token(15), addr(1)).await;
        let snap = metadata.snapshot().await;
        assert!(snap.tokens.is_empty());
        assert_eq!(snap.bootstrapping.get(&Token(15)), Some(&addr(1)));

        metadata.finish_bootstrap(Token(15)).await;
        let snap = metadata.snapshot().await;
        assert_eq!(snap.tokens.get(&Token(15)), Some(&addr(1)));
        assert!(snap.bootstrapping.is_empty());
    }

    #[tokio::test]
    async fn all_tokens_merges_and_dedups_both_maps() {
        let metadata = TokenMetadata::new();
        metadata.add_endpoint(Token(10), addr(1)).await;
        metadata.add_endpoint(Token(20), addr(2)).await;
        metadata.add_bootstrap_token(Token(15), addr(3)).await;
        let snap = metadata.snapshot().await;
        assert_eq!(snap.all_tokens(), vec![Token(10), Token(15), Token(20)]);
    }
}
