//! Relay: moves frames from one medium to another through a bounded queue.
//!
//! Each relay runs two pumps as separate tasks:
//!
//!   ingress  reads frames from the source medium and enqueues them
//!   egress   dequeues frames and writes them to the destination medium
//!
//! When a medium fails the owning pump drops it and rebuilds it from the
//! relay's `TransferSpec`. The other pump keeps running: a dead destination
//! never stops the source from draining into the queue, and vice versa.
//!
//! Delivery is at-most-once across a destination failure. A frame whose
//! write failed is retried once on the freshly recreated medium and dropped
//! if that also fails.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};

use hopline_core::wire::{read_frame, write_frame, FrameError};

use crate::medium::{MediumFactory, MediumSpec, Sink, Source, TransferSpec};

/// Bound on closing a sink during shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// ── Stats ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RelayStats {
    received: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    recreated: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub recreated: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            recreated: self.recreated.load(Ordering::Relaxed),
        }
    }
}

// ── Relay ─────────────────────────────────────────────────────────────────────

pub struct Relay {
    name: String,
    spec: TransferSpec,
    factory: Arc<MediumFactory>,
    capacity: usize,
    stats: Arc<RelayStats>,
    ingress_shutdown: broadcast::Receiver<()>,
    egress_shutdown: broadcast::Receiver<()>,
}

impl Relay {
    pub fn new(
        name: impl Into<String>,
        spec: TransferSpec,
        factory: Arc<MediumFactory>,
        capacity: usize,
        shutdown: &broadcast::Sender<()>,
    ) -> Self {
        Self {
            name: name.into(),
            spec,
            factory,
            capacity: capacity.max(1),
            stats: Arc::new(RelayStats::default()),
            ingress_shutdown: shutdown.subscribe(),
            egress_shutdown: shutdown.subscribe(),
        }
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    /// Pump frames from `source` to `sink` until shutdown. Both mediums must
    /// already be open; later replacements come from the factory.
    pub async fn run(self, source: Source, sink: Sink) -> anyhow::Result<()> {
        let (tx, rx) = mpsc::channel(self.capacity);

        tracing::info!(
            relay = %self.name,
            from = self.spec.from.kind(),
            to = self.spec.to.kind(),
            capacity = self.capacity,
            "relay started"
        );

        let ingress = Ingress {
            name: self.name.clone(),
            spec: self.spec.from.clone(),
            factory: self.factory.clone(),
            stats: self.stats.clone(),
            shutdown: self.ingress_shutdown,
        };
        let egress = Egress {
            name: self.name.clone(),
            spec: self.spec.to.clone(),
            factory: self.factory,
            stats: self.stats,
            shutdown: self.egress_shutdown,
        };

        let ingress = tokio::spawn(ingress.run(source, tx));
        let egress = tokio::spawn(egress.run(sink, rx));

        let (ingress, egress) = tokio::join!(ingress, egress);
        ingress.context("ingress task panicked")??;
        egress.context("egress task panicked")??;

        tracing::info!(relay = %self.name, "relay stopped");
        Ok(())
    }
}

// ── Ingress ───────────────────────────────────────────────────────────────────

struct Ingress {
    name: String,
    spec: MediumSpec,
    factory: Arc<MediumFactory>,
    stats: Arc<RelayStats>,
    shutdown: broadcast::Receiver<()>,
}

impl Ingress {
    async fn run(mut self, mut source: Source, queue: mpsc::Sender<Bytes>) -> anyhow::Result<()> {
        let mut backoff = self.factory.retry().backoff();
        let mut failing = false;

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.recv() => break,
                frame = read_frame(&mut source) => frame,
            };

            match frame {
                Ok(payload) => {
                    failing = false;
                    self.stats.received.fetch_add(1, Ordering::Relaxed);
                    let sent = tokio::select! {
                        _ = self.shutdown.recv() => break,
                        sent = queue.send(payload) => sent,
                    };
                    if sent.is_err() {
                        tracing::debug!(relay = %self.name, "egress gone, ingress exiting");
                        break;
                    }
                }
                Err(e) => {
                    log_failure(&self.name, "source", &self.spec, &e);
                    drop(source);
                    // A medium that fails again before yielding a frame is
                    // not hammered.
                    if failing {
                        tokio::select! {
                            _ = self.shutdown.recv() => return Ok(()),
                            _ = backoff.wait() => {}
                        }
                    } else {
                        backoff = self.factory.retry().backoff();
                    }
                    failing = true;

                    source = match self.reopen().await? {
                        Some(s) => s,
                        None => return Ok(()),
                    };
                }
            }
        }

        tracing::debug!(relay = %self.name, "ingress stopped");
        Ok(())
    }

    async fn reopen(&mut self) -> anyhow::Result<Option<Source>> {
        tokio::select! {
            _ = self.shutdown.recv() => Ok(None),
            opened = self.factory.open_source(&self.spec) => {
                let source = opened.with_context(|| format!("{}: recreating source", self.name))?;
                self.stats.recreated.fetch_add(1, Ordering::Relaxed);
                tracing::info!(relay = %self.name, medium = self.spec.kind(), "source recreated");
                Ok(Some(source))
            }
        }
    }
}

// ── Egress ────────────────────────────────────────────────────────────────────

struct Egress {
    name: String,
    spec: MediumSpec,
    factory: Arc<MediumFactory>,
    stats: Arc<RelayStats>,
    shutdown: broadcast::Receiver<()>,
}

/// Outcome of one write attempt raced against shutdown.
enum Delivery {
    Done,
    Failed(FrameError),
    Cancelled,
}

impl Egress {
    async fn run(mut self, mut sink: Sink, mut queue: mpsc::Receiver<Bytes>) -> anyhow::Result<()> {
        loop {
            let payload = tokio::select! {
                _ = self.shutdown.recv() => break,
                next = queue.recv() => match next {
                    Some(p) => p,
                    None => break,
                },
            };

            match self.deliver(&mut sink, &payload).await {
                Delivery::Done => {
                    self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Delivery::Cancelled => return Ok(()),
                Delivery::Failed(e) => log_failure(&self.name, "destination", &self.spec, &e),
            }

            drop(sink);
            sink = match self.reopen().await? {
                Some(s) => s,
                None => return Ok(()),
            };

            match self.deliver(&mut sink, &payload).await {
                Delivery::Done => {
                    self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Delivery::Cancelled => return Ok(()),
                Delivery::Failed(e) => {
                    tracing::warn!(
                        relay = %self.name,
                        len = payload.len(),
                        error = %e,
                        "retry on recreated destination failed, dropping frame"
                    );
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    drop(sink);
                    sink = match self.reopen().await? {
                        Some(s) => s,
                        None => return Ok(()),
                    };
                }
            }
        }

        close_sink(&mut sink).await;
        tracing::debug!(relay = %self.name, "egress stopped");
        Ok(())
    }

    async fn deliver(&mut self, sink: &mut Sink, payload: &Bytes) -> Delivery {
        tokio::select! {
            _ = self.shutdown.recv() => Delivery::Cancelled,
            written = write_frame(sink, payload) => match written {
                Ok(()) => Delivery::Done,
                Err(e) => Delivery::Failed(e),
            },
        }
    }

    async fn reopen(&mut self) -> anyhow::Result<Option<Sink>> {
        tokio::select! {
            _ = self.shutdown.recv() => Ok(None),
            opened = self.factory.open_sink(&self.spec) => {
                let sink = opened.with_context(|| format!("{}: recreating destination", self.name))?;
                self.stats.recreated.fetch_add(1, Ordering::Relaxed);
                tracing::info!(relay = %self.name, medium = self.spec.kind(), "destination recreated");
                Ok(Some(sink))
            }
        }
    }
}

async fn close_sink(sink: &mut Sink) {
    if tokio::time::timeout(CLOSE_TIMEOUT, sink.shutdown()).await.is_err() {
        tracing::debug!("sink close timed out");
    }
}

fn log_failure(relay: &str, side: &str, spec: &MediumSpec, err: &FrameError) {
    if err.is_disconnect() {
        tracing::warn!(relay, side, medium = spec.kind(), error = %err, "medium disconnected, recreating");
    } else {
        tracing::warn!(relay, side, medium = spec.kind(), error = %err, "medium failed, recreating");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
