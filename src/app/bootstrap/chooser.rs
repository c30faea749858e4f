// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The newcomer-side token chooser (spec §4.1): pick the most-loaded peer,
//! ask it for a split point, and turn that into the local bootstrap token.

use crate::app::{
    bootstrap::{
        context::BootstrapContext,
        error::BootstrapError,
        verbs::{
            Messaging,
            Verb,
        },
    },
    ring::Token,
};
use std::net::SocketAddr;

/// The most-loaded peer by [`crate::app::bootstrap::context::LoadBalancer`]
/// readings, ties broken by address ordering for determinism.
async fn most_loaded_peer(context: &BootstrapContext) -> Result<SocketAddr, BootstrapError> {
    context.load_balancer.wait_for_load_info().await;
    let load = context.load_balancer.get_load_info().await;
    load.into_iter()
        .max_by(|(a_addr, a_load), (b_addr, b_load)| {
            a_load.partial_cmp(b_load).unwrap_or(std::cmp::Ordering::Equal).then_with(|| b_addr.cmp(a_addr))
        })
        .map(|(addr, _)| addr)
        .ok_or(BootstrapError::NoSources)
}

/// Ask `peer` for the token that splits its primary range in half, via a
/// request/response `BOOTSTRAP_TOKEN` RPC bounded by
/// [`crate::app::bootstrap::context::BootstrapConfig::token_request_timeout`].
async fn request_token(context: &BootstrapContext, peer: SocketAddr) -> Result<Token, BootstrapError> {
    let reply = tokio::time::timeout(context.config.token_request_timeout, context.messaging.send_rr(peer, Verb::BootstrapToken))
        .await
        .map_err(|_| BootstrapError::TokenRequestTimedOut { peer })?
        .map_err(BootstrapError::Collaborator)?;

    match reply {
        Verb::BootstrapTokenReply(raw) => {
            context.partitioner.from_string(&raw).map_err(|e| BootstrapError::MalformedMessage { peer, reason: e.to_string() })
        }
        other => Err(BootstrapError::MalformedMessage { peer, reason: format!("unexpected reply verb {other:?}") }),
    }
}

/// Choose this node's bootstrap token: the configured override if present
/// (spec §4.1 short-circuit), otherwise the most-loaded peer's split point.
pub async fn choose_token(context: &BootstrapContext) -> Result<Token, BootstrapError> {
    if let Some(token) = context.config.initial_token {
        return Ok(token);
    }
    let peer = most_loaded_peer(context).await?;
    request_token(context, peer).await
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
    use async_trait::async_trait;
    use std::{
        collections::HashMap,
        sync::Arc,
    };

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    struct FakeMessaging {
        reply: Verb,
    }

    #[async_trait]
    impl Messaging for FakeMessaging {
        async fn send_rr(&self, _to: SocketAddr, _verb: Verb) -> anyhow::Result<Verb> {
            Ok(self.reply.clone())
        }

        async fn send_one_way(&self, _to: SocketAddr, _verb: Verb) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn context_with(messaging: Arc<dyn Messaging>, load: HashMap<SocketAddr, f64>) -> BootstrapContext {
        BootstrapContext {
            local_endpoint: addr(0),
            metadata: TokenMetadata::new(),
            streams: StreamContextManager::new(),
            source_streams: crate::app::bootstrap::source::SourceStreamManager::new(),
            messaging,
            load_balancer: Arc::new(StaticLoadBalancer::new(load)),
            gossip: Arc::new(InMemoryGossip::new()),
            partitioner: Arc::new(InMemoryPartitioner::new()),
            replication: Arc::new(SimpleStrategy { replication_factor: 1 }),
            store: Arc::new(FsColumnFamilyStore::new(std::env::temp_dir())),
            config: BootstrapConfig::default(),
        }
    }

    #[tokio::test]
    async fn initial_token_override_skips_the_network() {
        let context = BootstrapContext {
            config: BootstrapConfig { initial_token: Some(Token(42)), ..BootstrapConfig::default() },
            ..context_with(Arc::new(FakeMessaging { reply: Verb::BootstrapTokenReply("0".to_owned()) }), HashMap::new())
        };
        assert_eq!(choose_token(&context).await.unwrap(), Token(42));
    }

    #[tokio::test]
    async fn no_peers_reporting_load_is_fatal() {
        let context = context_with(Arc::new(FakeMessaging { reply: Verb::BootstrapTokenReply("0".to_owned()) }), HashMap::new());
        assert!(matches!(choose_token(&context).await.unwrap_err(), BootstrapError::NoSources));
    }

    #[tokio::test]
    async fn most_loaded_peer_is_asked_and_its_reply_parsed() {
        let load = HashMap::from([(addr(1), 1.0), (addr(2), 9.0), (addr(3), 5.0)]);
        let context = context_with(Arc::new(FakeMessaging { reply: Verb::BootstrapTokenReply("55".to_owned()) }), load);
        assert_eq!(choose_token(&context).await.unwrap(), Token(55));
    }

    #[tokio::test]
    async fn malformed_reply_is_reported_as_malformed_message() {
        let load = HashMap::from([(addr(1), 1.0)]);
        let context = context_with(Arc::new(FakeMessaging { reply: Verb::BootstrapTokenReply("not-a-number".to_owned()) }), load);
        assert!(matches!(choose_token(&context).await.unwrap_err(), BootstrapError::MalformedMessage { .. }));
    }

    struct SlowMessaging;

    #[async_trait]
    impl Messaging for SlowMessaging {
        async fn send_rr(&self, _to: SocketAddr, _verb: Verb) -> anyhow::Result<Verb> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            unreachable!("timeout should fire first")
        }

        async fn send_one_way(&self, _to: SocketAddr, _verb: Verb) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_peer_times_out() {
        let load = HashMap::from([(addr(1), 1.0)]);
        let context = BootstrapContext {
            config: BootstrapConfig { token_request_timeout: std::time::Duration::from_millis(50), ..BootstrapConfig::default() },
            ..context_with(Arc::new(SlowMessaging), load)
        };
        let peer = addr(1);
        assert!(matches!(
            choose_token(&context).await.unwrap_err(),
            BootstrapError::TokenRequestTimedOut { peer: p } if p == peer
        ));
    }

    #[tokio::test]
    async fn wrong_reply_verb_is_malformed() {
        let load = HashMap::from([(addr(1), 1.0)]);
        let context = context_with(Arc::new(FakeMessaging { reply: Verb::BootstrapInitiateDone }), load);
        assert!(matches!(choose_token(&context).await.unwrap_err(), BootstrapError::MalformedMessage { .. }));
    }
}
