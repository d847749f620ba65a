//! Relay node bring-up: one hop of the pipeline.
//!
//! The compute process talks to us through two FIFOs. We talk to the next
//! node over one outbound socket and hear from the previous node over one
//! inbound socket:
//!
//!   previous node ──socket──▶ [inbound relay]  ──to_<name>──▶   compute
//!   compute       ──from_<name>──▶ [outbound relay] ──socket──▶ next node

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::net::unix::pipe;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use hopline_core::config::HoplineConfig;
use hopline_services::{
    gate_from, signal_ready, MediumFactory, MediumSpec, Relay, RelayStats, RetryPolicy,
    TransferSpec,
};

use crate::shutdown_signal;

struct Endpoints {
    to_compute: pipe::Sender,
    from_compute: pipe::Receiver,
    outbound: TcpStream,
    inbound: TcpStream,
}

pub async fn run(config: HoplineConfig) -> Result<()> {
    config.validate_relay()?;

    let node = config.node.name.clone();
    let next = config.relay.next_node.clone();
    let factory = Arc::new(MediumFactory::new(
        config.cluster.clone(),
        &config.ports,
        &config.relay,
        RetryPolicy::from(&config.retry),
    ));
    tracing::info!(%node, %next, pipes = %config.relay.pipe_dir.display(), "relay node starting");

    let endpoints = tokio::select! {
        opened = bring_up(&config, &factory) => opened?,
        _ = shutdown_signal() => {
            tracing::info!("interrupted during bring-up");
            return Ok(());
        }
    };

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let inbound_relay = Relay::new(
        "inbound",
        TransferSpec {
            from: MediumSpec::Inbound,
            to: MediumSpec::Pipe(config.relay.send_pipe()),
        },
        factory.clone(),
        config.relay.queue_capacity,
        &shutdown_tx,
    );
    let outbound_relay = Relay::new(
        "outbound",
        TransferSpec {
            from: MediumSpec::Pipe(config.relay.recv_pipe()),
            to: MediumSpec::Outbound(next.clone()),
        },
        factory,
        config.relay.queue_capacity,
        &shutdown_tx,
    );

    let stats_printer = tokio::spawn(print_stats(
        vec![
            ("inbound", inbound_relay.stats()),
            ("outbound", outbound_relay.stats()),
        ],
        Duration::from_secs(config.relay.stats_interval_secs),
    ));

    // ── Spawn relays ─────────────────────────────────────────────────────────
    let mut relays = JoinSet::new();
    relays.spawn(inbound_relay.run(Box::new(endpoints.inbound), Box::new(endpoints.to_compute)));
    relays.spawn(outbound_relay.run(Box::new(endpoints.from_compute), Box::new(endpoints.outbound)));

    // ── Wait for exit ────────────────────────────────────────────────────────
    let early = tokio::select! {
        _ = shutdown_signal() => None,
        Some(done) = relays.join_next() => Some(done),
    };

    let failure = match early {
        Some(Ok(Ok(()))) => {
            tracing::error!("relay exited without shutdown");
            None
        }
        Some(Ok(Err(e))) => Some(e),
        Some(Err(e)) => Some(anyhow::Error::new(e).context("relay task panicked")),
        None => None,
    };

    let _ = shutdown_tx.send(());
    let grace = config.relay.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        while let Some(done) = relays.join_next().await {
            match done {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "relay stopped with error"),
                Err(e) => tracing::warn!(error = %e, "relay task failed"),
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(grace_ms = grace.as_millis() as u64, "relays did not stop in time, aborting");
        relays.abort_all();
    }
    stats_printer.abort();

    match failure {
        Some(e) => Err(e),
        None => {
            tracing::info!("relay node stopped");
            Ok(())
        }
    }
}

/// Open both pipes, connect both sockets, pass the readiness gate and
/// announce readiness.
async fn bring_up(config: &HoplineConfig, factory: &MediumFactory) -> Result<Endpoints> {
    tokio::fs::create_dir_all(&config.relay.pipe_dir)
        .await
        .with_context(|| format!("failed to create {}", config.relay.pipe_dir.display()))?;

    // Send role first: the compute process opens its read end before its
    // write end.
    let to_compute = factory
        .open_pipe_sender(&config.relay.send_pipe())
        .await
        .context("failed to open send pipe")?;
    let from_compute = factory
        .open_pipe_receiver(&config.relay.recv_pipe())
        .context("failed to open recv pipe")?;

    let (outbound, inbound) = factory
        .connect_hop(&config.relay.next_node)
        .await
        .context("failed to connect hop")?;

    gate_from(&config.readiness)
        .wait_ready(&config.node.name, &config.relay.next_node)
        .await?;
    signal_ready(&config.readiness.signal_path).await?;

    Ok(Endpoints {
        to_compute,
        from_compute,
        outbound,
        inbound,
    })
}

async fn print_stats(relays: Vec<(&'static str, Arc<RelayStats>)>, every: Duration) {
    if every.is_zero() {
        return;
    }
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        for (name, stats) in &relays {
            let s = stats.snapshot();
            tracing::info!(
                relay = name,
                received = s.received,
                forwarded = s.forwarded,
                dropped = s.dropped,
                recreated = s.recreated,
                "relay stats"
            );
        }
    }
}
