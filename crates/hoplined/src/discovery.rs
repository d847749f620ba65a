//! Bandwidth discovery entry points.

use anyhow::{Context, Result};

use hopline_core::config::HoplineConfig;
use hopline_core::schedule::Schedule;
use hopline_services::medium::bind_with_retry;
use hopline_services::{
    gate_from, AgentSettings, Aggregator, BandwidthAgent, Iperf3, Orchestrator, RetryPolicy,
};

use crate::shutdown_signal;

pub async fn run_agent(config: HoplineConfig) -> Result<()> {
    config.validate_agent()?;

    let agent = BandwidthAgent::new(
        AgentSettings::from_config(&config),
        Iperf3::new(&config.probe, &config.ports),
        gate_from(&config.readiness),
        RetryPolicy::from(&config.retry),
    );

    tokio::select! {
        report = agent.run() => {
            let report = report?;
            tracing::info!(edges = report.edges.len(), "discovery finished");
            Ok(())
        }
        _ = shutdown_signal() => {
            tracing::warn!("discovery interrupted");
            Ok(())
        }
    }
}

pub async fn run_coordinator(config: HoplineConfig) -> Result<()> {
    config.validate_coordinator()?;

    let schedule = Schedule::from_nodes(&config.cluster.nodes)?;
    let num_nodes = config.cluster.cluster_size();
    let expected = config.aggregator.expected_for(num_nodes);
    let retry = RetryPolicy::from(&config.retry);
    let ports = &config.ports;

    let orchestrator = Orchestrator::new(
        bind_with_retry(&ports.bind_host, ports.orchestrator, &retry).await?,
        schedule,
    );
    let aggregator = Aggregator::new(
        bind_with_retry(&ports.bind_host, ports.collector, &retry).await?,
        expected,
        num_nodes,
        config.aggregator.output_path.clone(),
    );
    tracing::info!(
        nodes = num_nodes,
        expected_reports = expected,
        orchestrator_port = ports.orchestrator,
        collector_port = ports.collector,
        "coordinator starting"
    );

    let work = async {
        tokio::try_join!(
            async { orchestrator.run().await.context("orchestrator failed") },
            async { aggregator.run().await.context("aggregator failed") },
        )
    };

    tokio::select! {
        done = work => {
            let (log, info) = done?;
            tracing::info!(
                probes = log.dispatched.len(),
                node_capacity = info.node_capacity,
                "bandwidth discovery complete"
            );
            Ok(())
        }
        _ = shutdown_signal() => {
            tracing::warn!("coordinator interrupted");
            Ok(())
        }
    }
}
