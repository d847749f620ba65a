//! Readiness gating and signalling.
//!
//! Before a probe or a relay starts carrying data, the surrounding
//! environment may need time to settle (fault injection armed, peers
//! scheduled). A `ReadinessGate` blocks until it reports ready. The relay
//! publishes its own readiness by writing a small marker file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use hopline_core::config::ReadinessSettings;

pub trait ReadinessGate: Send + Sync {
    /// Resolve once `node` may start talking to `peer`.
    fn wait_ready<'a>(&'a self, node: &'a str, peer: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Always ready.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGate;

impl ReadinessGate for OpenGate {
    fn wait_ready<'a>(&'a self, _node: &'a str, _peer: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Polls a shell command until it exits 0 and prints `True` (or nothing).
#[derive(Debug, Clone)]
pub struct CommandGate {
    template: String,
    poll: Duration,
}

impl CommandGate {
    pub fn new(template: impl Into<String>, poll: Duration) -> Self {
        Self {
            template: template.into(),
            poll,
        }
    }

    fn command_for(&self, node: &str, peer: &str) -> String {
        self.template.replace("{node}", node).replace("{peer}", peer)
    }

    async fn check(&self, command: &str) -> anyhow::Result<bool> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .with_context(|| format!("failed to run readiness command {command:?}"))?;

        if !output.status.success() {
            tracing::debug!(
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "readiness command failed"
            );
            return Ok(false);
        }
        Ok(reports_ready(&output.stdout))
    }
}

impl ReadinessGate for CommandGate {
    fn wait_ready<'a>(&'a self, node: &'a str, peer: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let command = self.command_for(node, peer);
            let mut polls = 0u64;
            while !self.check(&command).await? {
                polls += 1;
                if polls == 1 {
                    tracing::info!(node, peer, "waiting for readiness gate");
                }
                tokio::time::sleep(self.poll).await;
            }
            tracing::debug!(node, peer, polls, "readiness gate open");
            Ok(())
        })
    }
}

fn reports_ready(stdout: &[u8]) -> bool {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    text.is_empty() || text.eq_ignore_ascii_case("true")
}

/// Build the gate described by config. An empty command means no gate.
pub fn gate_from(settings: &ReadinessSettings) -> Box<dyn ReadinessGate> {
    if settings.gate_command.trim().is_empty() {
        Box::new(OpenGate)
    } else {
        Box::new(CommandGate::new(
            settings.gate_command.clone(),
            Duration::from_millis(settings.poll_ms),
        ))
    }
}

// ── Signal ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct ReadyMarker {
    #[serde(rename = "Ready")]
    ready: bool,
}

/// Write `{"Ready":true}` to `path`, creating parent directories.
pub async fn signal_ready(path: &Path) -> anyhow::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let body = serde_json::to_vec(&ReadyMarker { ready: true })?;
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "readiness signalled");
    Ok(path.to_path_buf())
}
