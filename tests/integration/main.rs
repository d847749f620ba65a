//! hopline integration test harness.
//!
//! Everything runs in-process over loopback TCP and FIFOs under the temp
//! directory, so no cluster, root or probe binary is needed:
//!
//!   cargo test --test integration
//!
//! Each test binds its own ports and pipe directory.

use std::net::TcpListener as StdTcpListener;
use std::path::PathBuf;
use std::time::Duration;

use hopline_core::config::{ClusterConfig, PortsConfig, RelaySettings};
use hopline_services::{MediumFactory, RetryPolicy};

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound for any single wait in these tests.
pub const STEP: Duration = Duration::from_secs(5);

/// A loopback port nobody is listening on right now.
pub fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind scratch listener");
    listener.local_addr().expect("scratch listener addr").port()
}

/// Fresh per-test directory under the system temp dir.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("hopline-it-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

/// Cluster where every node name is also its address.
pub fn loopback_cluster() -> ClusterConfig {
    ClusterConfig {
        node_host_template: "{node}".into(),
        ..ClusterConfig::default()
    }
}

/// Medium factory that serves and dials `data_port` on 127.0.0.1.
pub fn loopback_factory(data_port: u16) -> MediumFactory {
    let ports = PortsConfig {
        bind_host: "127.0.0.1".into(),
        data: data_port,
        ..PortsConfig::default()
    };
    let relay = RelaySettings {
        dial_timeout_ms: 1_000,
        pipe_poll_ms: 5,
        ..RelaySettings::default()
    };
    MediumFactory::new(
        loopback_cluster(),
        &ports,
        &relay,
        RetryPolicy::fixed(Duration::from_millis(10)),
    )
}

mod discovery;
mod relay;
