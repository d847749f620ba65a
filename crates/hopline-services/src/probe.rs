//! Bandwidth probes.
//!
//! The agent only needs two things from a probe tool: serve one measurement
//! session, and measure throughput toward a target. `Iperf3` drives the
//! external `iperf3` binary in JSON mode for both.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::process::ExitStatus;

use serde::Deserialize;
use tokio::process::Command;

use hopline_core::config::{PortsConfig, ProbeSettings};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to launch {0}: {1}")]
    Spawn(String, std::io::Error),

    #[error("probe exited with {status}: {stderr}")]
    Exit { status: ExitStatus, stderr: String },

    #[error("unreadable probe report: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("probe reported an error: {0}")]
    Reported(String),

    #[error("probe report has no throughput summary")]
    MissingSummary,
}

pub trait Prober: Send + Sync + 'static {
    /// Serve exactly one incoming measurement session.
    fn serve_once(&self) -> impl Future<Output = Result<(), ProbeError>> + Send;

    /// Measure throughput toward `target` in bits per second.
    fn measure(&self, target: IpAddr) -> impl Future<Output = Result<f64, ProbeError>> + Send;
}

// ── iperf3 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Iperf3 {
    binary: String,
    port: u16,
    server_bind: String,
    client_bind: Option<Ipv4Addr>,
    duration_secs: u64,
    connect_timeout_ms: u64,
}

impl Iperf3 {
    pub fn new(settings: &ProbeSettings, ports: &PortsConfig) -> Self {
        let client_bind = if settings.interface.is_empty() {
            None
        } else {
            let addr = interface_ipv4(&settings.interface);
            if addr.is_none() {
                tracing::warn!(
                    interface = %settings.interface,
                    "no IPv4 address on probe interface, letting the OS choose"
                );
            }
            addr
        };

        Self {
            binary: settings.binary.clone(),
            port: ports.probe,
            server_bind: ports.bind_host.clone(),
            client_bind,
            duration_secs: settings.duration_secs,
            connect_timeout_ms: settings.connect_timeout_ms,
        }
    }

    fn server_args(&self) -> Vec<String> {
        vec![
            "-s".into(),
            "-B".into(),
            self.server_bind.clone(),
            "-p".into(),
            self.port.to_string(),
            "-4".into(),
            "-J".into(),
            "--one-off".into(),
        ]
    }

    fn client_args(&self, target: IpAddr) -> Vec<String> {
        let mut args = vec!["-c".into(), target.to_string()];
        if let Some(bind) = self.client_bind {
            args.push("-B".into());
            args.push(bind.to_string());
        }
        args.extend([
            "-p".into(),
            self.port.to_string(),
            "-4".into(),
            "-J".into(),
            "-i".into(),
            "0".into(),
            "-t".into(),
            self.duration_secs.to_string(),
            format!("--connect-timeout={}", self.connect_timeout_ms),
        ]);
        args
    }

    async fn execute(&self, args: &[String]) -> Result<std::process::Output, ProbeError> {
        Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProbeError::Spawn(self.binary.clone(), e))
    }
}

impl Prober for Iperf3 {
    async fn serve_once(&self) -> Result<(), ProbeError> {
        let output = self.execute(&self.server_args()).await?;
        if !output.status.success() {
            return Err(ProbeError::Exit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn measure(&self, target: IpAddr) -> Result<f64, ProbeError> {
        let output = self.execute(&self.client_args(target)).await?;
        // iperf3 -J reports failures inside the JSON, so parse first.
        match parse_report(&output.stdout) {
            Err(ProbeError::Parse(_)) if !output.status.success() => Err(ProbeError::Exit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            other => other,
        }
    }
}

// ── Report parsing ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IperfReport {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    end: Option<IperfEnd>,
}

#[derive(Debug, Deserialize)]
struct IperfEnd {
    sum_sent: Option<IperfSum>,
    sum_received: Option<IperfSum>,
}

#[derive(Debug, Deserialize)]
struct IperfSum {
    bits_per_second: f64,
}

/// Throughput from an iperf3 JSON report: the mean of the sent and received
/// rates.
pub fn parse_report(raw: &[u8]) -> Result<f64, ProbeError> {
    let report: IperfReport = serde_json::from_slice(raw)?;
    if let Some(error) = report.error.filter(|e| !e.is_empty()) {
        return Err(ProbeError::Reported(error));
    }
    let end = report.end.ok_or(ProbeError::MissingSummary)?;
    match (end.sum_sent, end.sum_received) {
        (Some(sent), Some(received)) => Ok((sent.bits_per_second + received.bits_per_second) / 2.0),
        _ => Err(ProbeError::MissingSummary),
    }
}

/// First IPv4 address assigned to interface `name`.
pub fn interface_ipv4(name: &str) -> Option<Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    addrs
        .filter(|ifa| ifa.interface_name == name)
        .find_map(|ifa| {
            let sin = ifa.address?.as_sockaddr_in().copied()?;
            Some(*SocketAddrV4::from(sin).ip())
        })
}
