//! src/engine/mod.rs
//!
//! Defines the `Engine`, the protocol core of a cluster node. It runs four
//! cooperating flows over the shared member registry: the inbound packet
//! dispatcher, the failure-detection tick, the dissemination tick, and the
//! suspect-timeout supervisor.

use crate::config::Config;
use crate::members::{MemberInfo, Members};
use crate::packet::Packet;
use crate::status::Status;
use crate::transport::TransportCommand;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

pub mod detector;

use detector::AckWaiters;

/// A ping-req target keeps at most this many members waiting for its ack.
const MAX_LISTENERS_PER_TARGET: usize = 16;

/// State shared by every engine flow and the per-check tasks they spawn.
///
/// Registry access discipline: the mutex is only ever held across pure
/// registry calls, never across a send or any other await point.
pub(crate) struct EngineCtx {
    pub(crate) config: Config,
    pub(crate) members: Arc<Mutex<Members>>,
    pub(crate) transport_tx: mpsc::Sender<TransportCommand>,
    pub(crate) waiters: AckWaiters,
}

impl EngineCtx {
    /// Hands a packet to the transport, best-effort.
    pub(crate) async fn send(&self, peer: &str, packet: Packet) {
        let command = TransportCommand::SendPacket(peer.to_string(), packet);
        if self.transport_tx.send(command).await.is_err() {
            tracing::debug!(peer, "transport channel closed; dropping outbound packet");
        }
    }
}

/// The protocol core actor.
pub struct Engine {
    ctx: Arc<EngineCtx>,
    inbound_rx: mpsc::Receiver<Packet>,
}

impl Engine {
    pub fn new(
        config: Config,
        members: Arc<Mutex<Members>>,
        inbound_rx: mpsc::Receiver<Packet>,
        transport_tx: mpsc::Sender<TransportCommand>,
    ) -> Self {
        Self {
            ctx: Arc::new(EngineCtx {
                config,
                members,
                transport_tx,
                waiters: AckWaiters::default(),
            }),
            inbound_rx,
        }
    }

    /// Runs all engine flows until the shutdown token fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let (local, updates) = {
            let members = self.ctx.members.lock().await;
            (members.local(), members.subscribe())
        };
        tracing::info!(local = %local.name, "engine started");

        let dispatcher = Dispatcher {
            ctx: self.ctx.clone(),
            inbound_rx: self.inbound_rx,
            listening: HashMap::new(),
        };
        let supervisor = SuspectSupervisor {
            ctx: self.ctx.clone(),
            updates,
            timers: HashMap::new(),
        };
        tokio::join!(
            dispatcher.run(shutdown.clone()),
            detector::run_failure_detection(self.ctx.clone(), shutdown.clone()),
            run_dissemination(self.ctx.clone(), shutdown.clone()),
            supervisor.run(shutdown),
        );
        tracing::info!("engine stopped");
    }
}

/// Drains inbound packets and reacts to each one.
struct Dispatcher {
    ctx: Arc<EngineCtx>,
    inbound_rx: mpsc::Receiver<Packet>,
    /// For each ping-req target, the members waiting for its ack to be
    /// forwarded to them. Drained whenever the target acks.
    listening: HashMap<Arc<str>, Vec<Arc<str>>>,
}

impl Dispatcher {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                packet = self.inbound_rx.recv() => {
                    let Some(packet) = packet else { break };
                    // A handler panic must not take down the dispatcher; the
                    // packet is lost, the loop continues.
                    let handled = AssertUnwindSafe(self.handle_packet(packet))
                        .catch_unwind()
                        .await;
                    if handled.is_err() {
                        tracing::error!("inbound packet handler panicked; continuing");
                    }
                }
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Ping { source } => {
                let (peer, local) = {
                    let mut members = self.ctx.members.lock().await;
                    let peer = members.get(&source.name, Some(source.validity));
                    (peer, members.local_source())
                };
                self.ctx.send(&peer, Packet::Ack { source: local }).await;
            }
            Packet::PingReq { source, target } => {
                let (peer, target, local) = {
                    let mut members = self.ctx.members.lock().await;
                    let peer = members.get(&source.name, Some(source.validity));
                    let target = members.get(&target, None);
                    (peer, target, members.local_source())
                };
                self.ctx.send(&target, Packet::Ping { source: local }).await;
                self.add_listening(target, peer);
            }
            Packet::Ack { source } => {
                let peer = {
                    let mut members = self.ctx.members.lock().await;
                    members.get(&source.name, Some(source.validity))
                };
                self.ctx.waiters.notify(&peer);
                let listeners = self.listening.remove(peer.as_ref()).unwrap_or_default();
                let ack = Packet::Ack { source };
                for listener in listeners {
                    tracing::debug!(target = %peer, listener = %listener, "forwarding ack");
                    self.ctx.send(&listener, ack.clone()).await;
                }
            }
            Packet::Gossip {
                source,
                name,
                clock,
                status,
                metadata,
            } => {
                let (peer, local) = {
                    let mut members = self.ctx.members.lock().await;
                    let peer = members.get(&source.name, Some(source.validity));
                    members.apply(&name, &peer, clock, status, metadata);
                    (peer, members.local_source())
                };
                let ack = Packet::GossipAck {
                    source: local,
                    name,
                    clock,
                };
                self.ctx.send(&peer, ack).await;
            }
            Packet::GossipAck {
                source,
                name,
                clock,
            } => {
                let mut members = self.ctx.members.lock().await;
                let peer = members.get(&source.name, Some(source.validity));
                members.get(&name, None);
                members.ack_gossip(&name, &peer, clock);
            }
        }
    }

    fn add_listening(&mut self, target: Arc<str>, listener: Arc<str>) {
        let listeners = self.listening.entry(target).or_default();
        if listeners.len() >= MAX_LISTENERS_PER_TARGET {
            tracing::debug!(listener = %listener, "listener set full; dropping ping-req registration");
            return;
        }
        if !listeners.contains(&listener) {
            listeners.push(listener);
        }
    }
}

/// Periodically picks one available peer and sends it everything it has not
/// yet acknowledged.
async fn run_dissemination(ctx: Arc<EngineCtx>, shutdown: CancellationToken) {
    let mut ticker = time::interval(ctx.config.sync_interval());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let (source, target, gossip) = {
                    let members = ctx.members.lock().await;
                    let Some(target) = members
                        .find(1, Status::AVAILABLE, &[])
                        .into_iter()
                        .next()
                    else {
                        continue;
                    };
                    let gossip = members.get_gossip(&target);
                    (members.local_source(), target, gossip)
                };
                for state in gossip {
                    let packet = Packet::Gossip {
                        source: source.clone(),
                        name: state.name.to_string(),
                        clock: state.clock,
                        status: state.status,
                        metadata: state.metadata.to_wire(),
                    };
                    ctx.send(&target, packet).await;
                }
            }
        }
    }
}

/// Arms a one-shot timer whenever a member turns suspect and disarms it on
/// any transition out of suspect. A timer that fires while the member is
/// still suspect declares it offline.
struct SuspectSupervisor {
    ctx: Arc<EngineCtx>,
    updates: broadcast::Receiver<MemberInfo>,
    timers: HashMap<Arc<str>, JoinHandle<()>>,
}

impl SuspectSupervisor {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                update = self.updates.recv() => match update {
                    Ok(info) => self.reconcile(info.name, info.status, info.local),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "change notifications lagged; rescanning suspects");
                        self.rescan().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
    }

    fn reconcile(&mut self, name: Arc<str>, status: Status, local: bool) {
        if local {
            return;
        }
        if status == Status::SUSPECT {
            self.timers
                .entry(name.clone())
                .or_insert_with(|| spawn_suspect_timer(self.ctx.clone(), name));
        } else if let Some(timer) = self.timers.remove(&name) {
            timer.abort();
        }
    }

    /// Rebuilds the timer set from the registry after missed notifications.
    async fn rescan(&mut self) {
        let suspects: HashSet<Arc<str>> = {
            let members = self.ctx.members.lock().await;
            members.get_status(Status::SUSPECT).into_iter().collect()
        };
        self.timers.retain(|name, timer| {
            if suspects.contains(name) {
                true
            } else {
                timer.abort();
                false
            }
        });
        for name in suspects {
            self.timers
                .entry(name.clone())
                .or_insert_with(|| spawn_suspect_timer(self.ctx.clone(), name));
        }
    }
}

fn spawn_suspect_timer(ctx: Arc<EngineCtx>, name: Arc<str>) -> JoinHandle<()> {
    tokio::spawn(async move {
        time::sleep(ctx.config.suspect_timeout()).await;
        let mut members = ctx.members.lock().await;
        let still_suspect = members
            .info(&name)
            .map_or(false, |info| info.status == Status::SUSPECT);
        if still_suspect {
            tracing::info!(member = %name, "suspect timeout elapsed; marking member offline");
            members.update(&name, Some(Status::OFFLINE), None);
        }
    })
}
