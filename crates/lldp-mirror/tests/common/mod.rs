//! Shared setup for the integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use lldp_mirror::config_file::{MirrorConfig, PathsConfig, TimingConfig};
use lldp_mirror::desired::parse_mirror_config;
use lldp_mirror::{Guest, GuestKind, MirrorEngine, Prober, StateStore, TcCommands, WantedState};
use lldp_mirror_common::CommandRunner;
use lldp_mirror_test::{FakeKernel, MirrorFile, TestHost};

pub const VM: u32 = 100;

/// Timing short enough for tests; every wait still polls several times
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        interface_wait_ms: 150,
        backoff_initial_ms: 5,
        backoff_factor: 1.6,
        backoff_max_ms: 20,
        confirm_timeout_ms: 150,
        confirm_interval_ms: 5,
        handle_attempts: 3,
        handle_delay_ms: 5,
        remove_timeout_ms: 150,
    }
}

pub fn config_for(host: &TestHost) -> MirrorConfig {
    MirrorConfig {
        paths: PathsConfig {
            state_dir: host.state_dir(),
            mirror_dir: host.mirror_dir(),
            qemu_config_dir: host.qemu_config_dir(),
            lxc_config_dir: host.lxc_config_dir(),
        },
        timing: fast_timing(),
        ..MirrorConfig::default()
    }
}

pub fn runner(kernel: &Arc<FakeKernel>) -> Arc<dyn CommandRunner> {
    kernel.clone()
}

pub async fn engine(kernel: &Arc<FakeKernel>, state_dir: &Path, guest_id: u32) -> MirrorEngine {
    let runner = runner(kernel);
    let prober = Prober::negotiate(Arc::clone(&runner), TcCommands::default()).await;
    MirrorEngine::new(runner, prober, StateStore::new(state_dir), guest_id)
        .with_timing(fast_timing())
}

pub fn wanted(file: &MirrorFile, guest_id: u32) -> WantedState {
    parse_mirror_config(&file.render(), &Guest::new(guest_id, GuestKind::Vm))
}
