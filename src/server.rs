//! Replication server: accepts peer connections and streams bus events to them.
//!
//! Each connection gets its own bus subscription and its own task, so a slow
//! peer only ever delays itself. The subscription is dropped the moment the
//! connection ends for any reason.

use crate::bus::{EventBus, Subscription};
use crate::error::MirrorError;
use crate::event::ChangeKind;
use crate::wire::{self, Frame};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch::Receiver as WatchReceiver;
use tracing::{debug, error, info, warn};

/// Per-connection limits.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Longest a single frame write may take before the peer is dropped.
    pub write_timeout: Duration,
    /// Idle time after which a heartbeat frame is sent.
    pub heartbeat_interval: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            write_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

pub struct ReplicationServer {
    listener: TcpListener,
    bus: EventBus,
    options: ServerOptions,
}

impl ReplicationServer {
    pub async fn bind(addr: &str, bus: EventBus, options: ServerOptions) -> Result<Self> {
        let socket_addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("Invalid replication address: {}", addr))?;
        let listener = TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("Failed to bind replication server on {}", socket_addr))?;
        Ok(ReplicationServer {
            listener,
            bus,
            options,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts peers until the shutdown signal flips to `true`.
    pub async fn run(self, shutdown_signal: WatchReceiver<bool>) -> Result<()> {
        info!("Replication server listening on {}", self.local_addr()?);
        let mut shutdown = shutdown_signal.clone();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.attach(stream, peer, shutdown_signal.clone()),
                        Err(e) => {
                            error!("Failed to accept peer connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                Ok(()) = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Replication server shutting down due to signal.");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn attach(&self, stream: TcpStream, peer: SocketAddr, shutdown: WatchReceiver<bool>) {
        // Subscribe before spawning so nothing published after accept is missed.
        let subscription = match self.bus.subscribe(&ChangeKind::ALL) {
            Ok(sub) => sub,
            Err(e) => {
                warn!("Refusing peer {}: {}", peer, e);
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
        }
        info!(
            "Peer {} connected (subscription {})",
            peer,
            subscription.id()
        );
        let options = self.options.clone();
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            serve_peer(peer, reader, writer, subscription, options, shutdown).await;
        });
    }
}

async fn serve_peer(
    peer: SocketAddr,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut subscription: Subscription,
    options: ServerOptions,
    mut shutdown: WatchReceiver<bool>,
) {
    let mut heartbeat = tokio::time::interval(options.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // first tick completes immediately
    let mut inbound = [0u8; 256];
    let mut sent: u64 = 0;

    loop {
        let frame = tokio::select! {
            maybe_event = subscription.recv() => match maybe_event {
                Some(event) => {
                    debug!("Forwarding {} {} to {}", event.kind(), event.path(), peer);
                    Frame::from(event)
                }
                None => {
                    warn!("Peer {} dropped by the event bus (lagging or bus closed).", peer);
                    break;
                }
            },
            _ = heartbeat.tick() => Frame::Heartbeat,
            read = reader.read(&mut inbound) => match read {
                Ok(0) => {
                    info!("Peer {} closed the connection.", peer);
                    break;
                }
                Ok(n) => {
                    debug!("Ignoring {} unexpected bytes from {}", n, peer);
                    continue;
                }
                Err(e) => {
                    warn!("Read error from peer {}: {}", peer, e);
                    break;
                }
            },
            Ok(()) = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Closing peer {} due to shutdown.", peer);
                    break;
                }
                continue;
            }
        };

        match tokio::time::timeout(options.write_timeout, wire::write_frame(&mut writer, &frame)).await {
            Ok(Ok(())) => {
                if !matches!(frame, Frame::Heartbeat) {
                    sent += 1;
                }
                heartbeat.reset();
            }
            // Rejected before any byte went out; the stream is still at a frame boundary.
            Ok(Err(e @ MirrorError::FrameTooLarge { .. })) => {
                warn!("Skipping event for peer {}: {}", peer, e);
            }
            Ok(Err(e)) => {
                warn!("Write to peer {} failed: {}", peer, e);
                break;
            }
            Err(_) => {
                warn!(
                    "Write to peer {} timed out after {:?}, disconnecting.",
                    peer, options.write_timeout
                );
                break;
            }
        }
    }

    let id = subscription.id();
    subscription.unsubscribe();
    info!(
        "Peer {} disconnected after {} event(s); subscription {} removed.",
        peer, sent, id
    );
}
