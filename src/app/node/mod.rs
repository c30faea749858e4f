// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A supervised handle to one peer, live for as long as this node is
//! either streaming data to it (as a source) or receiving data from it
//! (as a newcomer's source peer). No children of its own; it exists so
//! the cluster actor can track and shut down a peer's lifecycle
//! independently of the streams it's involved in.

use async_trait::async_trait;
use backstage::core::{
    Actor,
    ActorResult,
    Rt,
    ServiceStatus,
    StreamExt,
    SupHandle,
    UnboundedChannel,
};
use std::net::SocketAddr;

/// Node event enum.
#[backstage::core::supervise]
pub enum NodeEvent {
    #[shutdown]
    /// Shutdown signal.
    Shutdown,
}

/// One peer this node is currently bootstrapping with, either as the
/// source shipping ranges or as the newcomer receiving them.
pub struct Node {
    address: SocketAddr,
}

impl Node {
    /// A handle to the peer at `address`.
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }
}

/// The Node actor lifecycle implementation
#[async_trait]
impl<S> Actor<S> for Node
where
    S: SupHandle<Self>,
{
    type Data = ();
    type Channel = UnboundedChannel<NodeEvent>;

    async fn init(&mut self, _rt: &mut Rt<Self, S>) -> ActorResult<Self::Data> {
        Ok(())
    }

    async fn run(&mut self, rt: &mut Rt<Self, S>, _: Self::Data) -> ActorResult<()> {
        rt.update_status(ServiceStatus::Running).await;
        log::info!("{} peer session is {}", self.address, rt.service().status());
        while let Some(event) = rt.inbox_mut().next().await {
            match event {
                NodeEvent::Shutdown => {
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
