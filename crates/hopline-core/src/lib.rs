//! hopline-core: shared types, frame codec, schedule derivation and configuration.
//! All other hopline crates depend on this one.

pub mod config;
pub mod fault;
pub mod report;
pub mod schedule;
pub mod wire;

pub use fault::{classify, Fault};
pub use report::{BandwidthEdge, ClusterNodeInfo, NodeReport};
pub use schedule::Schedule;
pub use wire::{read_frame, write_frame, FrameError};
