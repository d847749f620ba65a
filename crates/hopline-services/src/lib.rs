//! hopline services: the long-running pieces of a node.
//!
//! `relay` and `medium` carry the pipeline's data plane. `agent`,
//! `orchestrator` and `aggregator` run the one-shot bandwidth discovery
//! that precedes it.

pub mod aggregator;
pub mod agent;
pub mod host;
pub mod medium;
pub mod orchestrator;
pub mod probe;
pub mod readiness;
pub mod relay;
pub mod retry;

pub use aggregator::{Aggregator, AggregatorError};
pub use agent::{AgentSettings, BandwidthAgent, Endpoint};
pub use medium::{MediumError, MediumFactory, MediumSpec, Sink, Source, TransferSpec};
pub use orchestrator::{DispatchLog, Orchestrator, OrchestratorError};
pub use probe::{Iperf3, ProbeError, Prober};
pub use readiness::{gate_from, signal_ready, CommandGate, OpenGate, ReadinessGate};
pub use relay::{Relay, RelayStats, RelayStatsSnapshot};
pub use retry::{Backoff, RetryPolicy};
