use crate::*;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use hopline_core::report::NodeReport;
use hopline_core::schedule::Schedule;
use hopline_core::wire::write_frame;
use hopline_services::{
    AgentSettings, Aggregator, BandwidthAgent, Endpoint, OpenGate, Orchestrator, ProbeError,
    Prober, RetryPolicy,
};

// ── Fake probe tool ───────────────────────────────────────────────────────────

/// Shared by every fake agent in a run to observe cluster-wide overlap.
#[derive(Default)]
struct ProbeLedger {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    measured: Mutex<Vec<String>>,
    served: AtomicUsize,
}

struct FakeProbe {
    node: String,
    ledger: Arc<ProbeLedger>,
    /// First attempt per probe fails, to exercise the retry loop.
    flaky: AtomicUsize,
}

impl Prober for FakeProbe {
    async fn serve_once(&self) -> Result<(), ProbeError> {
        self.ledger.served.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn measure(&self, _target: IpAddr) -> Result<f64, ProbeError> {
        if self.flaky.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            return Err(ProbeError::Reported("the server is busy".into()));
        }

        let now = self.ledger.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.ledger.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.ledger.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.ledger.measured.lock().unwrap().push(self.node.clone());
        Ok(1e9)
    }
}

fn agent_settings(node: &str, peers: &[&str], num_nodes: usize, orch: u16, coll: u16) -> AgentSettings {
    AgentSettings {
        node: node.into(),
        peers: peers.iter().map(|p| p.to_string()).collect(),
        num_nodes,
        orchestrator: Endpoint {
            host: "127.0.0.1".into(),
            port: orch,
        },
        collector: Endpoint {
            host: "127.0.0.1".into(),
            port: coll,
        },
        // Every peer name resolves to loopback.
        cluster: hopline_core::config::ClusterConfig {
            node_host_template: "localhost".into(),
            ..loopback_cluster()
        },
        dial_timeout: Duration::from_secs(1),
        settle: Duration::ZERO,
        node_memory: 1_000 * (node.as_bytes()[0] as u64),
    }
}

/// Four agents, one orchestrator, one aggregator. Six probes, each pair once,
/// never two at the same time, and the merged view lands on disk.
#[tokio::test]
async fn four_node_discovery_end_to_end() {
    let nodes = ["a", "b", "c", "d"];
    let schedule = Schedule::from_nodes(&nodes).unwrap();
    let out = scratch_dir("discovery").join("config").join("node_info.json");

    let orch_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let coll_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let orch_port = orch_listener.local_addr().unwrap().port();
    let coll_port = coll_listener.local_addr().unwrap().port();

    let orchestrator = tokio::spawn(Orchestrator::new(orch_listener, schedule.clone()).run());
    let aggregator = tokio::spawn(Aggregator::new(coll_listener, nodes.len(), nodes.len(), out.clone()).run());

    let ledger = Arc::new(ProbeLedger::default());
    let mut agents = Vec::new();
    for node in nodes {
        let peers: Vec<&str> = schedule
            .peers_of(node)
            .unwrap()
            .iter()
            .map(String::as_str)
            .collect();
        let agent = BandwidthAgent::new(
            agent_settings(node, &peers, nodes.len(), orch_port, coll_port),
            FakeProbe {
                node: node.to_string(),
                ledger: ledger.clone(),
                flaky: AtomicUsize::new(0),
            },
            Box::new(OpenGate),
            RetryPolicy::fixed(Duration::from_millis(5)),
        );
        agents.push(tokio::spawn(agent.run()));
    }

    let mut reports: Vec<NodeReport> = Vec::new();
    for agent in agents {
        reports.push(timeout(STEP * 2, agent).await.unwrap().unwrap().unwrap());
    }

    let log = timeout(STEP, orchestrator).await.unwrap().unwrap().unwrap();
    assert_eq!(log.dispatched.len(), 6);
    let pairs: HashSet<(String, String)> = log.dispatched.iter().cloned().collect();
    assert_eq!(pairs.len(), 6, "a pair was dispatched twice");
    assert_eq!(log.dispatched[0], ("a".to_string(), "b".to_string()));
    assert_eq!(log.dispatched[5], ("c".to_string(), "d".to_string()));

    assert_eq!(ledger.max_in_flight.load(Ordering::SeqCst), 1, "probes overlapped");
    assert_eq!(ledger.measured.lock().unwrap().len(), 6);
    // Inbound sessions: b serves 1, c serves 2, d serves 3.
    assert_eq!(ledger.served.load(Ordering::SeqCst), 6);

    assert_eq!(reports[0].edges.len(), 3);
    assert!(reports[3].edges.is_empty());

    let info = timeout(STEP, aggregator).await.unwrap().unwrap().unwrap();
    assert_eq!(info.bandwidths.len(), 6);
    assert_eq!(info.num_nodes, 4);
    assert_eq!(info.node_capacity, 1_000 * b'a' as u64);

    let persisted: serde_json::Value = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
    assert_eq!(persisted["bandwidths"].as_array().unwrap().len(), 6);
    assert_eq!(persisted["bandwidths"][0]["Bandwidth"], 1e9);

    let _ = std::fs::remove_dir_all(out.parent().unwrap().parent().unwrap());
}

/// Reports arriving on independent connections fold to the minimum memory.
#[tokio::test]
async fn aggregator_persists_minimum_capacity() {
    let out = scratch_dir("capacity").join("node_info.json");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(Aggregator::new(listener, 3, 3, out.clone()).run());

    let mut senders = Vec::new();
    for memory in [1000u64, 500, 2000] {
        senders.push(tokio::spawn(async move {
            let report = NodeReport {
                edges: vec![],
                node_memory: memory,
            };
            let mut conn = TcpStream::connect(addr).await.unwrap();
            write_frame(&mut conn, &report.to_json().unwrap()).await.unwrap();
        }));
    }
    for s in senders {
        s.await.unwrap();
    }

    let info = timeout(STEP, handle).await.unwrap().unwrap().unwrap();
    assert_eq!(info.node_capacity, 500);

    let persisted: serde_json::Value = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
    assert_eq!(persisted["node_capacity"], 500);
    assert_eq!(persisted["num_nodes"], 3);

    let _ = std::fs::remove_dir_all(out.parent().unwrap());
}
