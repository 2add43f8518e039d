//! One hook invocation: resolve the guest, read its mirror file and
//! reconcile the kernel for the requested phase.

use std::path::PathBuf;
use std::sync::Arc;

use lldp_mirror_common::{CommandRunner, MirrorResult};
use tracing::{debug, info};

use crate::config_file::MirrorConfig;
use crate::desired::load_wanted_state;
use crate::engine::{check_environment, MirrorEngine, ReconcileReport};
use crate::guest;
use crate::probe::Prober;
use crate::state_store::StateStore;
use crate::types::{GuestKind, Phase, WantedState};

/// What to reconcile, with optional overrides of configured paths
#[derive(Debug, Clone)]
pub struct HookRequest {
    pub guest_id: u32,
    pub phase: Phase,
    /// Skip detection and treat the guest as this kind
    pub kind: Option<GuestKind>,
    pub mirror_file: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

impl HookRequest {
    pub fn new(guest_id: u32, phase: Phase) -> Self {
        Self {
            guest_id,
            phase,
            kind: None,
            mirror_file: None,
            state_dir: None,
        }
    }

    pub fn with_kind(mut self, kind: GuestKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_mirror_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.mirror_file = Some(path.into());
        self
    }

    pub fn with_state_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(path.into());
        self
    }
}

/// Runs one invocation against `runner`
///
/// Fatal problems (unknown guest, unusable tools, unreadable files) come
/// back as `Err`; per-pair failures are in the report.
pub async fn run(
    runner: Arc<dyn CommandRunner>,
    config: &MirrorConfig,
    request: &HookRequest,
) -> MirrorResult<ReconcileReport> {
    if let Phase::Other(token) = &request.phase {
        info!(guest = request.guest_id, phase = %token, "Ignoring phase");
        return Ok(ReconcileReport::default());
    }

    let guest = guest::resolve(&config.paths, request.guest_id, request.kind)?;
    let mirror_file = request
        .mirror_file
        .clone()
        .unwrap_or_else(|| guest::mirror_file(&config.paths, guest.id));
    let store = StateStore::new(
        request
            .state_dir
            .clone()
            .unwrap_or_else(|| config.paths.state_dir.clone()),
    );

    let wanted = match load_wanted_state(&mirror_file, &guest)? {
        Some(wanted) => wanted,
        None if request.phase == Phase::Deactivate && !store.load(guest.id)?.is_empty() => {
            debug!(guest = guest.id, "No mirrors configured, sweeping recorded rules");
            WantedState::new()
        }
        None => {
            info!(guest = guest.id, path = %mirror_file.display(), "No mirrors configured");
            return Ok(ReconcileReport::default());
        }
    };

    let commands = config.tc.commands();
    check_environment(runner.as_ref(), &commands).await?;

    let prober = Prober::negotiate(Arc::clone(&runner), commands).await;
    let engine = MirrorEngine::new(runner, prober, store, guest.id)
        .with_base_priority(config.tc.base_priority)
        .with_timing(config.timing.clone());

    info!(
        guest = guest.id,
        kind = %guest.kind,
        phase = %request.phase,
        mirrors = wanted.len(),
        "Reconciling LLDP mirrors"
    );
    let report = engine.reconcile(&request.phase, &wanted).await?;
    info!(
        guest = guest.id,
        created = report.created.len(),
        removed = report.removed.len(),
        unchanged = report.unchanged.len(),
        failed = report.failed.len(),
        "Reconciliation finished"
    );
    Ok(report)
}
