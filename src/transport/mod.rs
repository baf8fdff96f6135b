//! src/transport/mod.rs
//!
//! Defines the `Transport` service, the wire seam of the cluster. It frames
//! and signs outbound packets, verifies and decodes inbound ones, and
//! resolves member names (which are `host:port` strings) to socket
//! addresses. Small frames travel as single UDP datagrams; frames too large
//! for a datagram fall back to a short-lived TCP connection to the same
//! address. Everything is best-effort: a frame that cannot be sent,
//! resolved, verified or decoded is logged and dropped.

use crate::error::Result;
use crate::packet::Packet;
use crate::transport::sign::{Signatures, DIGEST_LEN, SALT_LEN};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod sign;

/// Frames at most this large are sent as single datagrams; anything bigger
/// takes the TCP fallback.
const MAX_DATAGRAM_SIZE: usize = 1400;
/// The maximum allowed size for a single frame arriving over TCP.
const MAX_FRAME_SIZE: usize = 1024 * 1024; // 1 MiB

/// Commands that can be sent to the `Transport` service.
#[derive(Debug)]
pub enum TransportCommand {
    /// Deliver a packet to the named member, best-effort.
    SendPacket(String, Packet),
}

/// The cluster wire transport actor.
pub struct Transport {
    udp: Arc<UdpSocket>,
    tcp_listener: TcpListener,
    command_rx: mpsc::Receiver<TransportCommand>,
    inbound_tx: mpsc::Sender<Packet>,
    signatures: Arc<Signatures>,
    resolved: HashMap<String, SocketAddr>,
}

impl Transport {
    /// Binds the UDP socket and the TCP fallback listener on the same
    /// address.
    pub async fn new(
        bind_addr: SocketAddr,
        signatures: Signatures,
        command_rx: mpsc::Receiver<TransportCommand>,
        inbound_tx: mpsc::Sender<Packet>,
    ) -> Result<Self> {
        let udp = UdpSocket::bind(bind_addr).await?;
        // When bound to port 0, the TCP listener must follow the port the
        // kernel picked for the datagram socket.
        let actual_addr = udp.local_addr()?;
        let tcp_listener = TcpListener::bind(actual_addr).await?;
        Ok(Self {
            udp: Arc::new(udp),
            tcp_listener,
            command_rx,
            inbound_tx,
            signatures: Arc::new(signatures),
            resolved: HashMap::new(),
        })
    }

    /// The address the transport actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    /// The main run loop for the `Transport` service.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let local_addr = self
            .udp
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        tracing::info!(listen_addr = %local_addr, "transport started");

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("transport received shutdown signal");
                    break;
                },
                received = self.udp.recv_from(&mut buf) => match received {
                    Ok((len, peer_addr)) => {
                        self.handle_frame(&buf[..len], peer_addr).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "datagram receive failed");
                    }
                },
                accepted = self.tcp_listener.accept() => {
                    if let Ok((stream, peer_addr)) = accepted {
                        let inbound_tx = self.inbound_tx.clone();
                        let signatures = self.signatures.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                recv_stream(stream, peer_addr, inbound_tx, signatures).await
                            {
                                tracing::debug!(peer = %peer_addr, error = %e, "stream receive failed");
                            }
                        });
                    }
                },
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        tracing::info!("command channel closed; transport shutting down");
                        break;
                    }
                },
            }
        }
    }

    async fn handle_command(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::SendPacket(peer, packet) => {
                let Some(addr) = self.resolve(&peer).await else {
                    return;
                };
                let frame = match encode_frame(&self.signatures, &packet) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode outbound packet");
                        return;
                    }
                };
                if frame.len() <= MAX_DATAGRAM_SIZE {
                    if let Err(e) = self.udp.send_to(&frame, addr).await {
                        tracing::debug!(peer = %peer, error = %e, "datagram send failed");
                    }
                } else {
                    // Oversized frame, typically a gossip packet carrying a
                    // large metadata map.
                    tokio::spawn(async move {
                        if let Err(e) = send_stream(addr, frame).await {
                            tracing::debug!(peer = %addr, error = %e, "stream send failed");
                        }
                    });
                }
            }
        }
    }

    /// Verifies, decodes and forwards one received frame.
    async fn handle_frame(&self, frame: &[u8], peer_addr: SocketAddr) {
        let Some(packet) = decode_frame(&self.signatures, frame) else {
            tracing::debug!(peer = %peer_addr, "discarding unverifiable frame");
            return;
        };
        if self.inbound_tx.send(packet).await.is_err() {
            tracing::debug!("inbound channel closed; dropping packet");
        }
    }

    /// Resolves a member name to a socket address, caching successes.
    /// Failure is transient: the peer may become resolvable later, so the
    /// packet is dropped and the next send retries.
    async fn resolve(&mut self, name: &str) -> Option<SocketAddr> {
        if let Some(addr) = self.resolved.get(name) {
            return Some(*addr);
        }
        match lookup_host(name).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => {
                    self.resolved.insert(name.to_string(), addr);
                    Some(addr)
                }
                None => {
                    tracing::warn!(peer = name, "peer name resolved to no addresses; will retry on next send");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(peer = name, error = %e, "peer name resolution failed; will retry on next send");
                None
            }
        }
    }
}

/// Builds the signed wire frame `salt ‖ digest ‖ payload`.
fn encode_frame(signatures: &Signatures, packet: &Packet) -> Result<Vec<u8>> {
    let payload = bincode::serialize(packet)?;
    let (salt, digest) = signatures.sign(&payload);
    let mut frame = Vec::with_capacity(SALT_LEN + DIGEST_LEN + payload.len());
    frame.extend_from_slice(&salt);
    frame.extend_from_slice(&digest);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Verifies and decodes a wire frame. `None` means the frame is malformed,
/// unverifiable or undecodable; all three are dropped the same way.
fn decode_frame(signatures: &Signatures, frame: &[u8]) -> Option<Packet> {
    if frame.len() < SALT_LEN + DIGEST_LEN {
        return None;
    }
    let (salt, rest) = frame.split_at(SALT_LEN);
    let (digest, payload) = rest.split_at(DIGEST_LEN);
    if !signatures.verify(salt, digest, payload) {
        return None;
    }
    bincode::deserialize(payload).ok()
}

/// Sends one length-prefixed frame over a fresh TCP connection.
async fn send_stream(addr: SocketAddr, frame: Vec<u8>) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_u32(frame.len() as u32).await?;
    stream.write_all(&frame).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Reads one length-prefixed frame from an accepted TCP connection and
/// forwards the decoded packet.
async fn recv_stream(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    inbound_tx: mpsc::Sender<Packet>,
    signatures: Arc<Signatures>,
) -> std::io::Result<()> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        tracing::debug!(peer = %peer_addr, len, "oversized stream frame rejected");
        return Ok(());
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await?;
    match decode_frame(&signatures, &frame) {
        Some(packet) => {
            let _ = inbound_tx.send(packet).await;
        }
        None => {
            tracing::debug!(peer = %peer_addr, "discarding unverifiable stream frame");
        }
    }
    Ok(())
}
