//! Node bandwidth agent.
//!
//! One agent runs per compute node during bandwidth discovery. It serves the
//! probes other nodes aim at it, runs the probes the orchestrator hands it
//! one at a time, and finally ships everything it measured to the
//! aggregator.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use hopline_core::config::{ClusterConfig, HoplineConfig};
use hopline_core::report::{BandwidthEdge, NodeReport};
use hopline_core::schedule::expected_inbound;
use hopline_core::wire::{read_frame, write_frame, PROBE_ACK};

use crate::host;
use crate::medium::dial_with_retry;
use crate::probe::Prober;
use crate::readiness::ReadinessGate;
use crate::retry::RetryPolicy;

/// Host and port of a coordinator service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub node: String,
    /// Peers this node probes, in dispatch order.
    pub peers: Vec<String>,
    pub num_nodes: usize,
    pub orchestrator: Endpoint,
    pub collector: Endpoint,
    /// Used to turn peer names into hostnames.
    pub cluster: ClusterConfig,
    pub dial_timeout: Duration,
    /// Pause after the readiness gate opens.
    pub settle: Duration,
    pub node_memory: u64,
}

impl AgentSettings {
    pub fn from_config(config: &HoplineConfig) -> Self {
        let dispatcher = config.cluster.host_for(&config.cluster.dispatcher_name);
        Self {
            node: config.node.name.clone(),
            peers: config.cluster.peers.clone(),
            num_nodes: config.cluster.cluster_size(),
            orchestrator: Endpoint {
                host: dispatcher.clone(),
                port: config.ports.orchestrator,
            },
            collector: Endpoint {
                host: dispatcher,
                port: config.ports.collector,
            },
            cluster: config.cluster.clone(),
            dial_timeout: config.relay.dial_timeout(),
            settle: Duration::from_millis(config.probe.settle_ms),
            node_memory: host::reported_memory(config.node.memory_bytes),
        }
    }

    /// Probe sessions this node will serve for earlier nodes.
    pub fn inbound_probes(&self) -> usize {
        expected_inbound(self.num_nodes, self.peers.len())
    }
}

pub struct BandwidthAgent<P> {
    settings: AgentSettings,
    prober: Arc<P>,
    gate: Box<dyn ReadinessGate>,
    retry: RetryPolicy,
}

impl<P: Prober> BandwidthAgent<P> {
    pub fn new(
        settings: AgentSettings,
        prober: P,
        gate: Box<dyn ReadinessGate>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            settings,
            prober: Arc::new(prober),
            gate,
            retry,
        }
    }

    /// Run discovery for this node and return the report that was sent.
    pub async fn run(self) -> anyhow::Result<NodeReport> {
        let inbound = self.settings.inbound_probes();
        tracing::info!(
            node = %self.settings.node,
            outbound = self.settings.peers.len(),
            inbound,
            "bandwidth agent starting"
        );

        let server = tokio::spawn(serve_probes(self.prober.clone(), inbound));

        let edges = if self.settings.peers.is_empty() {
            Vec::new()
        } else {
            self.probe_assigned_peers().await?
        };

        let report = NodeReport {
            edges,
            node_memory: self.settings.node_memory,
        };
        self.send_report(&report).await?;

        server.await.context("probe server task panicked")?;
        tracing::info!(node = %self.settings.node, "bandwidth agent done");
        Ok(report)
    }

    async fn probe_assigned_peers(&self) -> anyhow::Result<Vec<BandwidthEdge>> {
        let Endpoint { host, port } = &self.settings.orchestrator;
        let mut control = dial_with_retry(host, *port, self.settings.dial_timeout, &self.retry)
            .await
            .context("failed to reach orchestrator")?;
        write_frame(&mut control, self.settings.node.as_bytes())
            .await
            .context("failed to send identity")?;

        let mut edges = Vec::with_capacity(self.settings.peers.len());
        for _ in 0..self.settings.peers.len() {
            let target = read_frame(&mut control)
                .await
                .context("orchestrator closed the control connection")?;
            let target = String::from_utf8(target.to_vec()).context("target name is not UTF-8")?;

            let bandwidth = self.probe_peer(&target).await?;
            tracing::info!(node = %self.settings.node, peer = %target, bandwidth, "probe complete");
            edges.push(BandwidthEdge {
                start: self.settings.node.clone(),
                end: target,
                bandwidth,
            });

            ack(&mut control).await?;
        }
        Ok(edges)
    }

    async fn probe_peer(&self, peer: &str) -> anyhow::Result<f64> {
        self.gate.wait_ready(&self.settings.node, peer).await?;
        if !self.settings.settle.is_zero() {
            tokio::time::sleep(self.settings.settle).await;
        }

        let ip = self.resolve_peer(peer).await;
        let mut backoff = self.retry.backoff();
        loop {
            match self.prober.measure(ip).await {
                Ok(bandwidth) => return Ok(bandwidth),
                Err(e) => {
                    tracing::warn!(peer, %ip, attempt = backoff.attempts() + 1, error = %e, "probe failed, retrying");
                    backoff.wait().await;
                }
            }
        }
    }

    /// Resolve a peer name, retrying until DNS answers. Prefers IPv4.
    async fn resolve_peer(&self, peer: &str) -> IpAddr {
        let host = self.settings.cluster.host_for(peer);
        let mut backoff = self.retry.backoff();
        loop {
            match tokio::net::lookup_host((host.as_str(), 0)).await {
                Ok(addrs) => {
                    let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                    if let Some(ip) = addrs.iter().find(|ip| ip.is_ipv4()).or(addrs.first()) {
                        return *ip;
                    }
                    tracing::debug!(peer, %host, "no addresses yet");
                }
                Err(e) => tracing::debug!(peer, %host, error = %e, "resolution failed, retrying"),
            }
            backoff.wait().await;
        }
    }

    async fn send_report(&self, report: &NodeReport) -> anyhow::Result<()> {
        let payload = report.to_json().context("failed to encode node report")?;
        let Endpoint { host, port } = &self.settings.collector;
        let mut conn = dial_with_retry(host, *port, self.settings.dial_timeout, &self.retry)
            .await
            .context("failed to reach aggregator")?;
        write_frame(&mut conn, &payload)
            .await
            .context("failed to send node report")?;
        let _ = conn.shutdown().await;
        tracing::info!(edges = report.edges.len(), memory = report.node_memory, "node report sent");
        Ok(())
    }
}

async fn ack(control: &mut TcpStream) -> anyhow::Result<()> {
    control.write_all(&[PROBE_ACK]).await.context("failed to ack probe")?;
    control.flush().await.context("failed to ack probe")?;
    Ok(())
}

async fn serve_probes<P: Prober>(prober: Arc<P>, sessions: usize) {
    for session in 1..=sessions {
        tracing::debug!(session, sessions, "serving probe session");
        if let Err(e) = prober.serve_once().await {
            tracing::warn!(session, error = %e, "probe session failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(num_nodes: usize, peers: &[&str]) -> AgentSettings {
        let mut config = HoplineConfig::default();
        config.node.name = "n1".into();
        config.node.memory_bytes = 42;
        config.cluster.num_nodes = num_nodes;
        config.cluster.peers = peers.iter().map(|p| p.to_string()).collect();
        AgentSettings::from_config(&config)
    }

    #[test]
    fn inbound_count_from_cluster_size() {
        assert_eq!(settings(4, &["b", "c", "d"]).inbound_probes(), 0);
        assert_eq!(settings(4, &["d"]).inbound_probes(), 2);
        assert_eq!(settings(4, &[]).inbound_probes(), 3);
    }

    #[test]
    fn coordinator_endpoints_live_on_dispatcher() {
        let s = settings(2, &["b"]);
        assert_eq!(s.orchestrator.host, "dispatcher.default.svc.cluster.local");
        assert_eq!(s.orchestrator.port, 4000);
        assert_eq!(s.collector.port, 3000);
        assert_eq!(s.node_memory, 42);
    }
}
