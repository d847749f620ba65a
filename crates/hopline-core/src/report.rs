//! Bandwidth-discovery payloads.
//!
//! `NodeReport` travels node → aggregator as the JSON payload of one frame.
//! `ClusterNodeInfo` is what the aggregator persists for the placement step.
//! Field names on the wire are fixed by the consumers and must not change.

use serde::{Deserialize, Serialize};

/// One directed measurement. Each unordered node pair has exactly one edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthEdge {
    #[serde(rename = "Start")]
    pub start: String,

    #[serde(rename = "End")]
    pub end: String,

    /// Bits per second.
    #[serde(rename = "Bandwidth")]
    pub bandwidth: f64,
}

/// Everything a single node measured, plus its total memory in bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    #[serde(rename = "Bandwidths", default)]
    pub edges: Vec<BandwidthEdge>,

    #[serde(rename = "NodeMemory")]
    pub node_memory: u64,
}

impl NodeReport {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// Merged cluster view consumed by the external placement step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNodeInfo {
    pub bandwidths: Vec<BandwidthEdge>,
    /// Smallest total memory across all reporting nodes.
    pub node_capacity: u64,
    pub num_nodes: usize,
}

/// Running fold over node reports.
#[derive(Debug, Default)]
pub struct ClusterAccumulator {
    edges: Vec<BandwidthEdge>,
    min_memory: Option<u64>,
    reports: usize,
}

impl ClusterAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb(&mut self, report: NodeReport) {
        self.edges.extend(report.edges);
        self.min_memory = Some(match self.min_memory {
            Some(m) => m.min(report.node_memory),
            None => report.node_memory,
        });
        self.reports += 1;
    }

    pub fn reports(&self) -> usize {
        self.reports
    }

    /// Freeze into the persisted form. With no reports the capacity is 0.
    pub fn finish(self, num_nodes: usize) -> ClusterNodeInfo {
        ClusterNodeInfo {
            bandwidths: self.edges,
            node_capacity: self.min_memory.unwrap_or(0),
            num_nodes,
        }
    }
}

impl ClusterNodeInfo {
    pub fn from_reports(reports: impl IntoIterator<Item = NodeReport>, num_nodes: usize) -> Self {
        let mut acc = ClusterAccumulator::new();
        for r in reports {
            acc.absorb(r);
        }
        acc.finish(num_nodes)
    }
}
