//! Pairwise probe schedule.
//!
//! Given an ordered node list, the node at position i probes every node at
//! positions i+1..N-1, in order. Every unordered pair is measured exactly
//! once and the last node probes nobody. The orchestrator walks this
//! schedule strictly sequentially, so no two probes ever overlap.

use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("node list is empty")]
    Empty,

    #[error("node {0:?} appears more than once")]
    Duplicate(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    /// (node, peers it probes), in node order.
    entries: Vec<(String, Vec<String>)>,
}

impl Schedule {
    pub fn from_nodes<S: AsRef<str>>(nodes: &[S]) -> Result<Self, ScheduleError> {
        if nodes.is_empty() {
            return Err(ScheduleError::Empty);
        }

        let mut seen = HashSet::with_capacity(nodes.len());
        for n in nodes {
            if !seen.insert(n.as_ref()) {
                return Err(ScheduleError::Duplicate(n.as_ref().to_string()));
            }
        }

        let entries = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                let peers = nodes[i + 1..]
                    .iter()
                    .map(|p| p.as_ref().to_string())
                    .collect();
                (node.as_ref().to_string(), peers)
            })
            .collect();

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All nodes in schedule order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Nodes with at least one outbound probe. These are the nodes the
    /// orchestrator waits for before dispatching.
    pub fn dispatching_nodes(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, peers)| !peers.is_empty())
            .map(|(n, _)| n.as_str())
    }

    pub fn peers_of(&self, node: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(n, _)| n == node)
            .map(|(_, peers)| peers.as_slice())
    }

    /// Number of probes `node` will receive from nodes earlier in the order.
    pub fn inbound_count(&self, node: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == node)
    }

    /// Every (prober, target) pair in dispatch order.
    pub fn assignments(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(n, peers)| peers.iter().map(move |p| (n.as_str(), p.as_str())))
    }

    pub fn total_probes(&self) -> usize {
        self.entries.iter().map(|(_, p)| p.len()).sum()
    }
}

/// Inbound probe count for a node that only knows the cluster size and its
/// own outbound list.
pub fn expected_inbound(num_nodes: usize, outbound: usize) -> usize {
    num_nodes.saturating_sub(outbound + 1)
}
