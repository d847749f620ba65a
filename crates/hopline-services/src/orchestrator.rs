//! Bandwidth orchestrator. Serializes every probe in the cluster.
//!
//! Nodes connect and identify themselves. Once every node that has work is
//! connected, probes are handed out one at a time in schedule order, and
//! the next is only sent after the previous one has been acknowledged.
//! At most one probe is in flight cluster-wide, so measurements never
//! compete for the same links.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use hopline_core::schedule::Schedule;
use hopline_core::wire::{read_frame, write_frame, FrameError, PROBE_ACK};

/// How long a new connection may take to send its identity.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("no connection for {0}")]
    MissingConnection(String),

    #[error("failed to dispatch {peer} to {node}: {source}")]
    Dispatch {
        node: String,
        peer: String,
        #[source]
        source: FrameError,
    },

    #[error("lost {node} while waiting for the {peer} ack: {source}")]
    AckLost {
        node: String,
        peer: String,
        #[source]
        source: io::Error,
    },

    #[error("{node} acked {peer} with {byte}, expected {}", PROBE_ACK)]
    BadAck { node: String, peer: String, byte: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    CollectingConnections,
    Dispatching,
    Done,
}

/// Every (node, peer) pair dispatched and acknowledged, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchLog {
    pub dispatched: Vec<(String, String)>,
}

pub struct Orchestrator {
    listener: TcpListener,
    schedule: Schedule,
}

impl Orchestrator {
    pub fn new(listener: TcpListener, schedule: Schedule) -> Self {
        Self { listener, schedule }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> Result<DispatchLog, OrchestratorError> {
        let Self { listener, schedule } = self;
        tracing::info!(
            nodes = schedule.len(),
            probes = schedule.total_probes(),
            phase = ?Phase::CollectingConnections,
            "orchestrator starting"
        );

        let mut conns = collect(&listener, &schedule).await?;
        drop(listener);

        tracing::info!(phase = ?Phase::Dispatching, "all nodes connected");
        let log = dispatch(&schedule, &mut conns).await?;

        tracing::info!(phase = ?Phase::Done, probes = log.dispatched.len(), "all probes acknowledged");
        Ok(log)
    }
}

async fn collect(
    listener: &TcpListener,
    schedule: &Schedule,
) -> Result<HashMap<String, TcpStream>, OrchestratorError> {
    let wanted: Vec<&str> = schedule.dispatching_nodes().collect();
    let mut conns: HashMap<String, TcpStream> = HashMap::with_capacity(wanted.len());
    // One identify task per connection. Dropping the set cancels any still pending.
    let mut pending: JoinSet<Option<(String, TcpStream, SocketAddr)>> = JoinSet::new();

    while conns.len() < wanted.len() {
        let (identity, stream, addr) = tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted.map_err(OrchestratorError::Accept)?;
                pending.spawn(identify(stream, addr));
                continue;
            }
            Some(joined) = pending.join_next() => match joined {
                Ok(Some(identified)) => identified,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "identify task failed");
                    continue;
                }
            },
        };

        if !wanted.contains(&identity.as_str()) {
            tracing::warn!(%addr, node = %identity, "unexpected identity, dropping");
            continue;
        }
        if conns.insert(identity.clone(), stream).is_some() {
            tracing::warn!(%addr, node = %identity, "node reconnected, replacing connection");
        } else {
            tracing::info!(%addr, node = %identity, connected = conns.len(), of = wanted.len(), "node identified");
        }
    }
    Ok(conns)
}

async fn identify(mut stream: TcpStream, addr: SocketAddr) -> Option<(String, TcpStream, SocketAddr)> {
    match tokio::time::timeout(IDENTIFY_TIMEOUT, read_frame(&mut stream)).await {
        Ok(Ok(frame)) => Some((String::from_utf8_lossy(&frame).into_owned(), stream, addr)),
        Ok(Err(e)) => {
            tracing::warn!(%addr, error = %e, "connection closed before identifying");
            None
        }
        Err(_) => {
            tracing::warn!(%addr, "connection never identified, dropping");
            None
        }
    }
}

async fn dispatch(
    schedule: &Schedule,
    conns: &mut HashMap<String, TcpStream>,
) -> Result<DispatchLog, OrchestratorError> {
    let mut log = DispatchLog::default();

    for (node, peer) in schedule.assignments() {
        let conn = conns
            .get_mut(node)
            .ok_or_else(|| OrchestratorError::MissingConnection(node.to_string()))?;

        tracing::info!(node, peer, "dispatching probe");
        write_frame(conn, peer.as_bytes())
            .await
            .map_err(|source| OrchestratorError::Dispatch {
                node: node.to_string(),
                peer: peer.to_string(),
                source,
            })?;

        let byte = conn.read_u8().await.map_err(|source| OrchestratorError::AckLost {
            node: node.to_string(),
            peer: peer.to_string(),
            source,
        })?;
        if byte != PROBE_ACK {
            return Err(OrchestratorError::BadAck {
                node: node.to_string(),
                peer: peer.to_string(),
                byte,
            });
        }

        log.dispatched.push((node.to_string(), peer.to_string()));
    }

    Ok(log)
}
