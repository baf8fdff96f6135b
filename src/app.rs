//! src/app.rs
//!
//! Defines the main `App` struct, which encapsulates one cluster node and
//! manages the lifecycle of its concurrent services.

use crate::{
    config::Config,
    engine::Engine,
    error::Result,
    members::{MemberInfo, Members},
    transport::{sign::Signatures, Transport, TransportCommand},
};
use crate::packet::Packet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Encapsulates a cluster node: its configuration and the lifecycle
/// management of its concurrent services.
pub struct App {
    config: Config,
    shutdown_token: CancellationToken,
}

impl App {
    /// Creates a new `App` from the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// The main run loop for the node.
    ///
    /// Builds the member registry, spawns the transport and engine services
    /// plus a change-log subscriber, then waits for a shutdown signal and
    /// terminates all tasks gracefully.
    pub async fn run(self) -> Result<()> {
        let members = Arc::new(Mutex::new(Members::new(&self.config)));
        let signatures = Signatures::new(self.config.secret.as_deref());

        let (transport_command_tx, transport_command_rx) =
            mpsc::channel::<TransportCommand>(128);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Packet>(128);

        let transport = Transport::new(
            self.config.bind_addr,
            signatures,
            transport_command_rx,
            inbound_tx,
        )
        .await?;
        tracing::info!(
            local = %self.config.local_name,
            listen_addr = %transport.local_addr()?,
            peers = self.config.peers.len(),
            "starting cluster node"
        );
        let transport_task = tokio::spawn(transport.run(self.shutdown_token.clone()));

        let engine = Engine::new(
            self.config.clone(),
            members.clone(),
            inbound_rx,
            transport_command_tx,
        );
        let engine_task = tokio::spawn(engine.run(self.shutdown_token.clone()));

        let updates = members.lock().await.subscribe();
        let change_log_task =
            tokio::spawn(run_change_log(updates, self.shutdown_token.clone()));

        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("shutdown signal received; stopping node");
            shutdown_token.cancel();
        });

        self.shutdown_token.cancelled().await;

        if let Err(e) = transport_task.await {
            tracing::error!(error = ?e, "transport task failed");
        }
        if let Err(e) = engine_task.await {
            tracing::error!(error = ?e, "engine task failed");
        }
        if let Err(e) = change_log_task.await {
            tracing::error!(error = ?e, "change log task failed");
        }
        tracing::info!("node has shut down gracefully");

        Ok(())
    }
}

/// Logs every committed membership change until shutdown.
async fn run_change_log(
    mut updates: broadcast::Receiver<MemberInfo>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            update = updates.recv() => match update {
                Ok(info) => {
                    let metadata_keys = info
                        .metadata
                        .as_map()
                        .map(|map| map.keys().cloned().collect::<Vec<_>>())
                        .unwrap_or_default();
                    tracing::info!(
                        member = %info.name,
                        status = %info.status,
                        clock = info.clock,
                        ?metadata_keys,
                        "cluster member changed"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "change log lagging behind notifications");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for Ctrl+C");
}
