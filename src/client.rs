//! Replication client: reads the origin's event stream and applies it locally.

use crate::apply::ApplyEngine;
use crate::error::MirrorError;
use crate::wire::{self, Frame};
use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::watch::Receiver as WatchReceiver;
use tracing::{debug, error, info, warn};

pub struct ReplicationClient {
    stream: TcpStream,
    engine: ApplyEngine,
    idle_timeout: Duration,
}

/// What a finished client run did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    pub applied: u64,
    pub rejected: u64,
    pub failed: u64,
}

impl ReplicationClient {
    /// Connects to a replication server.
    ///
    /// `idle_timeout` bounds how long the stream may stay silent (no event and
    /// no heartbeat) before the server is considered gone.
    pub async fn connect(addr: &str, engine: ApplyEngine, idle_timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to replication server {}", addr))?;
        info!(
            "Connected to replication server {}, applying into {}",
            addr,
            engine.root().display()
        );
        Ok(ReplicationClient {
            stream,
            engine,
            idle_timeout,
        })
    }

    /// Applies events until the server closes the stream or shutdown is signalled.
    ///
    /// A failed apply is logged and the event dropped; it is never retried.
    pub async fn run(self, shutdown_signal: WatchReceiver<bool>) -> Result<ClientStats> {
        let ReplicationClient {
            stream,
            engine,
            idle_timeout,
        } = self;
        // Frames are read in their own task; a partly read frame is never
        // abandoned when the select below picks the shutdown branch.
        let (frame_tx, mut frames) = mpsc::channel(FRAME_QUEUE);
        let reader = tokio::spawn(read_frames(BufReader::new(stream), idle_timeout, frame_tx));
        let mut shutdown = shutdown_signal.clone();
        let mut stats = ClientStats::default();

        let outcome = loop {
            let frame = tokio::select! {
                read = frames.recv() => match read {
                    Some(Ok(frame)) => frame,
                    None => {
                        info!("Replication server closed the stream.");
                        break Ok(());
                    }
                    Some(Err(e)) if e.is_frame_local() => {
                        warn!("Skipping undecodable frame: {}", e);
                        continue;
                    }
                    Some(Err(e)) => break Err(e),
                },
                Ok(()) = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Replication client shutting down due to signal.");
                        break Ok(());
                    }
                    continue;
                }
            };

            let event = match frame.into_event() {
                Ok(Some(event)) => event,
                Ok(None) => {
                    debug!("Heartbeat from replication server");
                    continue;
                }
                Err(e) => {
                    warn!("Skipping frame: {}", e);
                    continue;
                }
            };

            debug!("Received {} {}", event.kind(), event.path());
            match engine.apply(&event).await {
                Ok(()) => stats.applied += 1,
                Err(e @ (MirrorError::PathEscape { .. } | MirrorError::EmptyPath)) => {
                    warn!("Rejected {} {}: {}", event.kind(), event.path(), e);
                    stats.rejected += 1;
                }
                Err(e) => {
                    error!("Dropping {} {}: {}", event.kind(), event.path(), e);
                    stats.failed += 1;
                }
            }
        };
        reader.abort();
        outcome.context("Replication stream failed")?;

        info!(
            "Replication client finished: {} applied, {} rejected, {} failed.",
            stats.applied, stats.rejected, stats.failed
        );
        Ok(stats)
    }
}

/// Frames read ahead of the apply loop.
const FRAME_QUEUE: usize = 64;

/// Reads frames until the stream ends, a connection-level error occurs, or
/// the server stays silent for `idle_timeout`. Frame-local errors are passed
/// on and reading continues.
async fn read_frames(
    mut reader: BufReader<TcpStream>,
    idle_timeout: Duration,
    frames: mpsc::Sender<crate::error::Result<Frame>>,
) {
    loop {
        let item = match tokio::time::timeout(idle_timeout, wire::read_frame(&mut reader)).await {
            Ok(Ok(Some(frame))) => Ok(frame),
            Ok(Ok(None)) => return,
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MirrorError::Transport(std::io::Error::new(
                ErrorKind::TimedOut,
                format!("replication server silent for {:?}", idle_timeout),
            ))),
        };
        let fatal = matches!(&item, Err(e) if !e.is_frame_local());
        if frames.send(item).await.is_err() || fatal {
            return;
        }
    }
}
