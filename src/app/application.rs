// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The top-level supervisor actor: owns this node's [`BootstrapContext`]
//! and spawns the [`Cluster`] (topology tracking and ring-delta reaction)
//! and [`Listener`] (inbound verb transport) actors beneath it.

use crate::app::{
    bootstrap::{
        self,
        BootstrapContext,
    },
    cluster::Cluster,
    listener::Listener,
};
use async_trait::async_trait;
use backstage::core::{
    Actor,
    ActorResult,
    Rt,
    ScopeId,
    Service,
    ServiceStatus,
    StreamExt,
    SupHandle,
    UnboundedChannel,
};
use std::net::SocketAddr;

/// Top-level application event.
#[backstage::core::supervise]
pub enum StorageServiceEvent {
    #[report]
    #[eol]
    /// Keeps this actor's service status in sync with its children.
    Microservice(ScopeId, Service),
    #[shutdown]
    /// Shutdown signal.
    Shutdown,
}

/// The storage node application: this node's address and bootstrap
/// collaborators, supervising the cluster topology actor and the inbound
/// transport listener.
pub struct StorageService {
    local_endpoint: SocketAddr,
    listen_address: SocketAddr,
    context: BootstrapContext,
}

impl StorageService {
    /// A service for `local_endpoint`, listening on `listen_address`, using
    /// `context` for its collaborators.
    pub fn new(local_endpoint: SocketAddr, listen_address: SocketAddr, context: BootstrapContext) -> Self {
        Self { local_endpoint, listen_address, context }
    }
}

/// The application actor lifecycle implementation
#[async_trait]
impl<S> Actor<S> for StorageService
where
    S: SupHandle<Self>,
{
    type Data = ();
    type Channel = UnboundedChannel<StorageServiceEvent>;

    async fn init(&mut self, rt: &mut Rt<Self, S>) -> ActorResult<Self::Data> {
        rt.start("cluster".to_string(), Cluster::new(self.context.clone())).await?;
        rt.start("listener".to_string(), Listener::new(self.listen_address, self.context.clone())).await?;

        if self.context.config.join_on_start {
            // Spec §4.6: the driver runs asynchronously to completion, driven
            // from here on by incoming message arrivals, not by this init call.
            let context = self.context.clone();
            tokio::spawn(async move {
                log::info!("starting bootstrap");
                match bootstrap::run_bootstrap(&context).await {
                    Ok(token) => log::info!("bootstrap complete, now owning token {token}"),
                    Err(error) => log::error!("bootstrap failed: {error}"),
                }
            });
        }

        Ok(())
    }

    async fn run(&mut self, rt: &mut Rt<Self, S>, _: Self::Data) -> ActorResult<()> {
        log::info!("{} storage service is {}", self.local_endpoint, rt.service().status());
        while let Some(event) = rt.inbox_mut().next().await {
            match event {
                StorageServiceEvent::Microservice(scope_id, service) => {
                    if service.is_stopped() {
                        rt.remove_microservice(scope_id);
                    } else {
                        rt.upsert_microservice(scope_id, service);
                    }
                    if !rt.service().is_stopping() {
                        if rt.microservices_all(|child| child.is_running()) {
                            rt.update_status(ServiceStatus::Running).await;
                        } else if rt.microservices_all(|child| child.is_maintenance()) {
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
                StorageServiceEvent::Shutdown => {
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
