//! Node-info aggregator.
//!
//! Collects one `NodeReport` per expected connection, merges them into a
//! `ClusterNodeInfo` and persists it for the placement step. Reports are
//! read concurrently; the merge happens once all of them are in.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use hopline_core::report::{ClusterAccumulator, ClusterNodeInfo, NodeReport};
use hopline_core::wire::{read_frame, FrameError};

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to receive report from {0}: {1}")]
    Receive(SocketAddr, #[source] FrameError),

    #[error("malformed report from {0}: {1}")]
    Decode(SocketAddr, #[source] serde_json::Error),

    #[error("report handler failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("failed to encode cluster info: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to write {0}: {1}")]
    Persist(PathBuf, #[source] io::Error),
}

pub struct Aggregator {
    listener: TcpListener,
    expected: usize,
    num_nodes: usize,
    output_path: PathBuf,
}

impl Aggregator {
    pub fn new(listener: TcpListener, expected: usize, num_nodes: usize, output_path: PathBuf) -> Self {
        Self {
            listener,
            expected,
            num_nodes,
            output_path,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept `expected` reports, merge and persist them.
    pub async fn run(self) -> Result<ClusterNodeInfo, AggregatorError> {
        tracing::info!(expected = self.expected, "aggregator waiting for reports");

        let mut handlers = JoinSet::new();
        for _ in 0..self.expected {
            let (stream, addr) = self.listener.accept().await.map_err(AggregatorError::Accept)?;
            handlers.spawn(receive_report(stream, addr));
        }
        drop(self.listener);

        let mut acc = ClusterAccumulator::new();
        while let Some(joined) = handlers.join_next().await {
            acc.absorb(joined??);
        }

        let info = acc.finish(self.num_nodes);
        persist(&info, &self.output_path).await?;
        tracing::info!(
            path = %self.output_path.display(),
            edges = info.bandwidths.len(),
            node_capacity = info.node_capacity,
            "cluster info written"
        );
        Ok(info)
    }
}

async fn receive_report(mut stream: TcpStream, addr: SocketAddr) -> Result<NodeReport, AggregatorError> {
    let payload = read_frame(&mut stream)
        .await
        .map_err(|e| AggregatorError::Receive(addr, e))?;
    let report = NodeReport::from_json(&payload).map_err(|e| AggregatorError::Decode(addr, e))?;
    tracing::info!(%addr, edges = report.edges.len(), memory = report.node_memory, "report received");
    Ok(report)
}

/// Write `info` as JSON at `path`, creating parent directories. The file is
/// replaced atomically.
pub async fn persist(info: &ClusterNodeInfo, path: &Path) -> Result<(), AggregatorError> {
    let body = serde_json::to_vec(info).map_err(AggregatorError::Encode)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AggregatorError::Persist(parent.to_path_buf(), e))?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .map_err(|e| AggregatorError::Persist(tmp.clone(), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| AggregatorError::Persist(path.to_path_buf(), e))?;
    Ok(())
}
