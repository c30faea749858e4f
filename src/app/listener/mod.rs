// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A concrete realization of the out-of-scope "low-level messaging
//! transport" collaborator (spec §1, §6): a length-prefixed JSON framing
//! of [`Verb`] over TCP, with a [`Listener`] actor accepting inbound
//! connections and a [`TcpMessaging`] for sending outbound ones.

use crate::app::bootstrap::{
    context::BootstrapContext,
    newcomer::{
        handle_initiate,
        InstallingCompletionHandler,
    },
    source::{
        handle_bootstrap_token_request,
        TerminateOutcome,
    },
    verbs::{
        Messaging,
        Verb,
    },
};
use async_trait::async_trait;
use backstage::core::{
    Actor,
    ActorResult,
    Rt,
    StreamExt,
    SupHandle,
    UnboundedChannel,
};
use std::{
    net::SocketAddr,
    sync::Arc,
};
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
    },
    net::{
        TcpListener,
        TcpStream,
    },
};

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

async fn write_frame(stream: &mut TcpStream, verb: &Verb) -> anyhow::Result<()> {
    let body = serde_json::to_vec(verb)?;
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> anyhow::Result<Verb> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit");
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// A [`Messaging`] implementation that opens one TCP connection per call.
/// Simple rather than pooled: bootstrap's RPC volume (one token request,
/// one initiate per target) does not warrant connection reuse.
pub struct TcpMessaging;

#[async_trait]
impl Messaging for TcpMessaging {
    async fn send_rr(&self, to: SocketAddr, verb: Verb) -> anyhow::Result<Verb> {
        let mut stream = TcpStream::connect(to).await?;
        write_frame(&mut stream, &verb).await?;
        read_frame(&mut stream).await
    }

    async fn send_one_way(&self, to: SocketAddr, verb: Verb) -> anyhow::Result<()> {
        let mut stream = TcpStream::connect(to).await?;
        write_frame(&mut stream, &verb).await
    }
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, context: BootstrapContext) -> anyhow::Result<()> {
    let verb = read_frame(&mut stream).await?;
    match verb {
        Verb::BootstrapToken => {
            let reply = handle_bootstrap_token_request(&context).await?;
            write_frame(&mut stream, &reply).await?;
        }
        Verb::BootstrapInitiate(message) => {
            let handler = Arc::new(InstallingCompletionHandler::new(context.store.clone(), context.messaging.clone()));
            let (_rewritten, ack) = handle_initiate(&context, peer, message, handler).await?;
            write_frame(&mut stream, &ack).await?;
        }
        Verb::BootstrapTerminate(status) => match context.source_streams.handle_terminate(peer, &status).await {
            TerminateOutcome::Repeat(stream_context) => {
                log::info!("re-enqueuing {:?} for {peer} after a STREAM verdict", stream_context.target_file_path);
                if let Err(error) = crate::app::bootstrap::source::repeat_file(&context, peer, stream_context).await {
                    log::error!("failed to re-send file to {peer} after a STREAM verdict: {error}");
                }
            }
            TerminateOutcome::Retired { peer_done } => {
                if peer_done {
                    log::info!("{peer} has acknowledged every file it was offered");
                }
            }
            TerminateOutcome::Unknown => {
                log::warn!("terminate verdict from {peer} named an untracked file: {:?}", status.file);
            }
        },
        other @ (Verb::BootstrapTokenReply(_) | Verb::BootstrapInitiateDone) => {
            log::warn!("{peer} sent a reply verb {other:?} as a request; ignoring");
        }
    }
    Ok(())
}

/// Listener event.
#[backstage::core::supervise]
pub enum ListenerEvent {
    /// Shutdown signal.
    #[shutdown]
    Shutdown,
}

/// Accepts inbound peer connections and dispatches each to the bootstrap
/// verb handlers, using `context`'s collaborators.
pub struct Listener {
    address: SocketAddr,
    context: BootstrapContext,
}

impl Listener {
    /// A listener binding `address`, dispatching with `context`.
    pub fn new(address: SocketAddr, context: BootstrapContext) -> Self {
        Self { address, context }
    }
}

#[async_trait]
impl<S> Actor<S> for Listener
where
    S: SupHandle<Self>,
{
    type Data = TcpListener;
    type Channel = UnboundedChannel<ListenerEvent>;

    async fn init(&mut self, _rt: &mut Rt<Self, S>) -> ActorResult<Self::Data> {
        TcpListener::bind(self.address)
            .await
            .map_err(|error| backstage::core::ActorError::exit_msg(format!("failed to bind {}: {error}", self.address)))
    }

    async fn run(&mut self, rt: &mut Rt<Self, S>, listener: Self::Data) -> ActorResult<()> {
        log::info!("listener bound to {}", self.address);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let context = self.context.clone();
                            tokio::spawn(async move {
                                if let Err(error) = handle_connection(stream, peer, context).await {
                                    log::warn!("connection from {peer} failed: {error}");
                                }
                            });
                        }
                        Err(error) => log::error!("accept failed on {}: {error}", self.address),
                    }
                }
                event = rt.inbox_mut().next() => {
                    match event {
                        Some(ListenerEvent::Shutdown) | None => {
                            rt.stop().await;
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
