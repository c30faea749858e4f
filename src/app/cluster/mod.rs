// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The cluster topology actor: tracks known peers and reacts to a
//! newcomer's token claim by computing this node's role in the resulting
//! ring delta (spec §4.2/§4.3) — every node runs the same deterministic
//! calculation independently; there is no coordinator.

use super::node::Node;
use crate::app::bootstrap::{
    driver,
    BootstrapContext,
};
use async_trait::async_trait;
use backstage::core::{
    Actor,
    ActorError,
    ActorResult,
    Rt,
    ScopeId,
    Service,
    ServiceStatus,
    StreamExt,
    SupHandle,
    UnboundedChannel,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
};

/// `NodeInfo` identifies one peer this cluster actor has spawned a
/// supervised handle for.
pub struct NodeInfo {
    /// The scope id of the spawned [`Node`] actor.
    pub(crate) scope_id: ScopeId,
    /// The peer's address.
    pub(crate) address: SocketAddr,
}

/// Cluster topology event.
pub enum Topology {
    /// A peer claimed `token` and is now bootstrapping. Every node reacts
    /// by computing the ring delta against its own metadata and, if it
    /// names itself as a source, ships the ranges it owns.
    AddNode {
        /// The newcomer's address.
        address: SocketAddr,
        /// The token the newcomer claimed.
        token: crate::app::ring::Token,
    },
    /// An existing peer has left the cluster.
    RemoveNode(SocketAddr),
}

/// Cluster event type.
#[backstage::core::supervise]
pub enum ClusterEvent {
    /// Topology configuration.
    Topology(Topology),
    /// Used by a [`Node`] to keep the cluster up to date with its service.
    #[report]
    #[eol]
    Microservice(ScopeId, Service),
    /// Shutdown signal.
    #[shutdown]
    Shutdown,
}

/// Cluster state: known peers plus the collaborators bootstrap reactions
/// need.
pub struct Cluster {
    nodes: HashMap<SocketAddr, NodeInfo>,
    context: BootstrapContext,
    /// The keyspace/table bootstrap reactions apply to. This crate does
    /// not model multiple keyspaces; a production node would key this off
    /// the topology event instead.
    table: String,
}

impl Cluster {
    /// A cluster actor with no known peers, reacting to topology changes
    /// using `context`'s collaborators.
    pub fn new(context: BootstrapContext) -> Self {
        Self { nodes: HashMap::new(), context, table: "keyspace1".to_owned() }
    }
}

/// The Cluster actor lifecycle implementation
#[async_trait]
impl<S> Actor<S> for Cluster
where
    S: SupHandle<Self>,
{
    type Data = ();
    type Channel = UnboundedChannel<ClusterEvent>;

    async fn init(&mut self, _rt: &mut Rt<Self, S>) -> ActorResult<Self::Data> {
        Ok(())
    }

    async fn run(&mut self, rt: &mut Rt<Self, S>, _: Self::Data) -> ActorResult<()> {
        while let Some(event) = rt.inbox_mut().next().await {
            match event {
                ClusterEvent::Topology(topology) => {
                    if rt.service().is_stopping() {
                        continue;
                    }
                    match topology {
                        Topology::AddNode { address, token } => {
                            if self.nodes.contains_key(&address) {
                                continue;
                            }
                            match rt.start(address.to_string(), Node::new(address)).await {
                                Ok(handle) => {
                                    self.nodes.insert(address, NodeInfo { scope_id: handle.scope_id(), address });
                                }
                                Err(error) => {
                                    log::error!("failed to spawn peer handle for {address}: {error}");
                                    continue;
                                }
                            }
                            if let Err(error) = driver::on_peer_joined(&self.context, &self.table, token, address).await {
                                log::error!("bootstrap reaction to {address} joining at {token} failed: {error}");
                            }
                        }
                        Topology::RemoveNode(address) => {
                            if let Some(node_info) = self.nodes.remove(&address) {
                                rt.shutdown_child(&node_info.scope_id).await;
                            } else {
                                log::warn!("cannot remove unknown peer {address}");
                            }
                        }
                    }
                }
                ClusterEvent::Microservice(scope_id, service) => {
                    if service.is_stopped() {
                        rt.remove_microservice(scope_id);
                        let address = service
                            .directory()
                            .as_ref()
                            .and_then(|directory| directory.parse::<SocketAddr>().ok())
                            .ok_or_else(|| ActorError::exit_msg("peer service reported without a parsable address directory"))?;
                        self.nodes.remove(&address);
                    } else {
                        rt.upsert_microservice(scope_id, service);
                    }
                    if !rt.service().is_stopping() {
                        if rt.microservices_all(|node| node.is_running()) {
                            rt.update_status(ServiceStatus::Running).await;
                        } else if rt.microservices_all(|node| node.is_maintenance()) {
                            rt.update_status(ServiceStatus::Maintenance).await;
                        } else {
                            rt.update_status(ServiceStatus::Degraded).await;
                        }
                    } else {
                        rt.update_status(ServiceStatus::Stopping).await;
                        if rt.microservices_stopped() {
                            rt.inbox_mut().close();
                        }
                    }
                }
                ClusterEvent::Shutdown => {
                    rt.stop().await;
                    if rt.microservices_stopped() {
                        rt.inbox_mut().close();
                    }
                }
            }
        }
        Ok(())
    }
}
