//! MirrorEngine - reconciles wanted mirror pairs against kernel tc state
//!
//! Reconciliation flow:
//! 1. Snapshot the running mirrors of every interface in the wanted state
//! 2. activate: create each pair not already mirrored both ways
//! 3. deactivate: remove each pair that is mirrored either way or still
//!    has rules recorded in the state store, then sweep recorded slots
//!    that are no longer wanted
//!
//! Rules are only ever deleted by the exact handle recorded when they were
//! created, and only while the filter listed under that handle still
//! mirrors between the recorded endpoints. The kernel hands freed handles
//! out again, so a recorded handle can outlive its rule; such records are
//! dropped and the filter now holding the handle is left alone. A pair
//! whose creation fails part way is rolled back before the error is
//! returned.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use lldp_mirror_common::{CommandRunner, MirrorError, MirrorResult};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::commands::TcCommands;
use crate::config_file::TimingConfig;
use crate::probe::{MirrorFilter, Prober};
use crate::retry::poll_until;
use crate::state_store::{PersistedState, StateStore};
use crate::types::{Direction, MirrorSpec, Phase, RuleHandle, StateKey, WantedState};

/// Default filter priority of slot 0
pub const DEFAULT_BASE_PRIORITY: u16 = 20000;

/// Outcome of one reconciliation pass
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<(String, MirrorError)>,
}

impl ReconcileReport {
    /// True when no pair failed
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, spec: &MirrorSpec, result: MirrorResult<bool>, changed: Changed) {
        let label = spec.to_string();
        match (result, changed) {
            (Ok(true), Changed::Created) => self.created.push(label),
            (Ok(true), Changed::Removed) => self.removed.push(label),
            (Ok(false), _) => self.unchanged.push(label),
            (Err(e), _) => {
                error!(
                    mirror = %label,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Mirror reconciliation failed"
                );
                self.failed.push((label, e));
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Changed {
    Created,
    Removed,
}

/// Checks that the tc and ip tools can be run at all
pub async fn check_environment(
    runner: &dyn CommandRunner,
    commands: &TcCommands,
) -> MirrorResult<()> {
    for cmd in commands.version_checks() {
        match runner.run(&cmd).await {
            Ok(result) if result.success() => {
                debug!(command = %cmd, version = %result.stdout, "Tool available");
            }
            Ok(result) => {
                return Err(MirrorError::environment(format!(
                    "'{}' failed: {}",
                    cmd,
                    result.combined_output()
                )))
            }
            Err(e) => return Err(MirrorError::environment(e.to_string())),
        }
    }
    Ok(())
}

/// Creates and removes LLDP mirror rules for one guest
pub struct MirrorEngine {
    runner: Arc<dyn CommandRunner>,
    commands: TcCommands,
    prober: Prober,
    store: StateStore,
    guest_id: u32,
    base_priority: u16,
    timing: TimingConfig,
}

impl MirrorEngine {
    /// Creates an engine for `guest_id` with default priorities and timing
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        prober: Prober,
        store: StateStore,
        guest_id: u32,
    ) -> Self {
        Self {
            runner,
            commands: prober.commands().clone(),
            prober,
            store,
            guest_id,
            base_priority: DEFAULT_BASE_PRIORITY,
            timing: TimingConfig::default(),
        }
    }

    pub fn with_base_priority(mut self, base_priority: u16) -> Self {
        self.base_priority = base_priority;
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn guest_id(&self) -> u32 {
        self.guest_id
    }

    pub fn prober(&self) -> &Prober {
        &self.prober
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Brings kernel state in line with `wanted` for `phase`
    ///
    /// Per-pair failures are collected in the report. `Err` means the
    /// running state could not be read at all.
    #[instrument(skip(self, phase, wanted), fields(guest = self.guest_id, phase = %phase))]
    pub async fn reconcile(
        &self,
        phase: &Phase,
        wanted: &WantedState,
    ) -> MirrorResult<ReconcileReport> {
        match phase {
            Phase::Activate => self.activate(wanted).await,
            Phase::Deactivate => self.deactivate(wanted).await,
            Phase::Other(token) => {
                info!(phase = %token, "Nothing to do for phase");
                Ok(ReconcileReport::default())
            }
        }
    }

    async fn activate(&self, wanted: &WantedState) -> MirrorResult<ReconcileReport> {
        let running = self.prober.query(interfaces_of(wanted)).await?;
        let mut report = ReconcileReport::default();

        for spec in wanted.values() {
            if running.has_both(spec) {
                debug!(mirror = %spec, "Mirror already active");
                report.record(spec, Ok(false), Changed::Created);
                continue;
            }
            let result = self.create_pair(spec).await.map(|()| true);
            report.record(spec, result, Changed::Created);
        }

        Ok(report)
    }

    async fn deactivate(&self, wanted: &WantedState) -> MirrorResult<ReconcileReport> {
        let running = self.prober.query(interfaces_of(wanted)).await?;
        let owned = self.store.load(self.guest_id)?;
        let owned_slots = owned.slots();
        let mut report = ReconcileReport::default();

        for spec in wanted.values() {
            if !running.has_either(spec) && !owned_slots.contains(&spec.slot) {
                debug!(mirror = %spec, "Mirror not active");
                report.record(spec, Ok(false), Changed::Removed);
                continue;
            }
            let result = self.remove_owned(spec).await.map(|n| n > 0);
            report.record(spec, result, Changed::Removed);
        }

        let wanted_slots: BTreeSet<u32> = wanted.values().map(|s| s.slot).collect();
        for slot in owned_slots.difference(&wanted_slots) {
            let spec = spec_from_owned(&owned, *slot);
            info!(mirror = %spec, "Removing recorded mirror that is no longer configured");
            let result = self.remove_owned(&spec).await.map(|n| n > 0);
            report.record(&spec, result, Changed::Removed);
        }

        Ok(report)
    }

    /// Creates both directions of `spec`, rolling back on any failure
    ///
    /// Fails without touching tc if the guest interface never appears.
    #[instrument(skip(self, spec), fields(guest = self.guest_id, mirror = %spec))]
    pub async fn create_pair(&self, spec: &MirrorSpec) -> MirrorResult<()> {
        if !self.wait_for_interface(&spec.guest_interface).await {
            return Err(MirrorError::interface_not_ready(
                &spec.guest_interface,
                self.timing.interface_wait(),
            ));
        }

        match self.apply_pair(spec).await {
            Ok(()) => {
                info!("Mirror created");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Mirror creation failed, rolling back");
                if let Err(rollback) = self.remove_owned(spec).await {
                    error!(error = %rollback, "Rollback left rules behind");
                }
                Err(e)
            }
        }
    }

    /// Removes the rules recorded for `spec`'s slot
    ///
    /// Only handles recorded in the state store are deleted; a direction
    /// without a recorded handle is skipped.
    #[instrument(skip(self, spec), fields(guest = self.guest_id, mirror = %spec))]
    pub async fn remove_pair(&self, spec: &MirrorSpec) -> MirrorResult<()> {
        self.remove_owned(spec).await.map(|_| ())
    }

    async fn wait_for_interface(&self, dev: &str) -> bool {
        let prober = &self.prober;
        let found = poll_until(
            self.timing.interface_wait(),
            &self.timing.interface_backoff(),
            move || async move {
                match prober.interface_exists(dev).await {
                    Ok(exists) => exists,
                    Err(e) => {
                        debug!(interface = dev, error = %e, "Link listing failed");
                        false
                    }
                }
            },
        )
        .await;

        if !found {
            warn!(
                interface = dev,
                waited = ?self.timing.interface_wait(),
                "Interface did not appear"
            );
        }
        found
    }

    async fn apply_pair(&self, spec: &MirrorSpec) -> MirrorResult<()> {
        let priority = spec.priority(self.base_priority)?;
        let owned = self.store.load(self.guest_id)?;
        let recorded = recorded_spec(&owned, spec);

        for direction in Direction::ALL {
            let key = StateKey::new(direction, spec.slot);
            let (from, to) = spec.endpoints(direction);

            if let Some(handle) = owned.get(&key) {
                match self.find_owned(handle).await? {
                    Some(filter) if is_rule_for(spec, direction, handle, &filter) => {
                        debug!(%key, %handle, "Recorded rule still in place");
                        continue;
                    }
                    Some(filter) if is_rule_for(&recorded, direction, handle, &filter) => {
                        info!(%key, %handle, "Replacing recorded rule that no longer matches");
                        self.delete_rule(handle).await;
                    }
                    Some(filter) => {
                        warn!(
                            %key,
                            %handle,
                            mirrors_to = ?filter.destinations,
                            "Recorded handle now belongs to another rule, forgetting it"
                        );
                        self.store.forget(self.guest_id, &[key])?;
                    }
                    None => {}
                }
            }

            self.ensure_ingress(from).await?;
            let handle = self.create_rule(from, to, priority).await?;
            self.store.record(self.guest_id, key, &handle)?;
            debug!(%key, %handle, "Mirror rule created");
        }

        let prober = &self.prober;
        let interfaces = [
            spec.guest_interface.as_str(),
            spec.physical_interface.as_str(),
        ];
        let confirmed = poll_until(
            self.timing.confirm_timeout(),
            &self.timing.confirm_backoff(),
            move || async move {
                match prober.query(interfaces).await {
                    Ok(running) => running.has_both(spec),
                    Err(_) => false,
                }
            },
        )
        .await;

        if !confirmed {
            return Err(MirrorError::ConfirmTimeout {
                operation: "creation",
                guest_interface: spec.guest_interface.clone(),
                physical_interface: spec.physical_interface.clone(),
            });
        }
        Ok(())
    }

    async fn ensure_ingress(&self, dev: &str) -> MirrorResult<()> {
        let show = self.commands.show_ingress_qdisc(dev);
        let listing = self.runner.run_or_throw(&show).await?;
        if listing.contains("ffff:") {
            return Ok(());
        }
        let add = self.commands.add_ingress_qdisc(dev);
        self.runner.run_or_throw(&add).await?;
        debug!(interface = dev, "Ingress qdisc added");
        Ok(())
    }

    /// Adds one mirror filter and recovers the handle the kernel gave it
    async fn create_rule(&self, from: &str, to: &str, priority: u16) -> MirrorResult<RuleHandle> {
        let before: HashSet<String> = self
            .prober
            .filters(from)
            .await?
            .unwrap_or_default()
            .into_iter()
            .map(|f| f.handle)
            .collect();

        let cmd = self.commands.add_mirror_filter(from, to, priority);
        self.runner.run_or_throw(&cmd).await?;

        let attempts = self.timing.handle_attempts.max(1);
        for attempt in 1..=attempts {
            match self.prober.filters(from).await {
                Ok(Some(filters)) => {
                    if let Some(filter) = filters.into_iter().find(|f| {
                        f.priority == priority && f.mirrors_to(to) && !before.contains(&f.handle)
                    }) {
                        return Ok(RuleHandle::new(from, priority, filter.handle));
                    }
                }
                Ok(None) => debug!(interface = from, "Interface vanished after filter add"),
                Err(e) => debug!(interface = from, error = %e, "Filter listing failed"),
            }
            if attempt < attempts {
                sleep(self.timing.handle_delay()).await;
            }
        }

        Err(MirrorError::HandleNotFound {
            interface: from.to_string(),
            priority,
        })
    }

    /// The listed filter behind `handle`, if it still exists
    async fn find_owned(&self, handle: &RuleHandle) -> MirrorResult<Option<MirrorFilter>> {
        Ok(self
            .prober
            .filters(&handle.device)
            .await?
            .and_then(|filters| {
                filters
                    .into_iter()
                    .find(|f| f.matches(handle.priority, &handle.handle))
            }))
    }

    async fn is_gone(&self, handle: &RuleHandle) -> bool {
        matches!(self.find_owned(handle).await, Ok(None))
    }

    async fn delete_rule(&self, handle: &RuleHandle) {
        let cmd = self
            .commands
            .del_filter(&handle.device, handle.priority, &handle.handle);
        if let Err(e) = self.runner.run_or_throw(&cmd).await {
            debug!(%handle, error = %e, "Delete failed, relying on listing to confirm");
        }
    }

    /// Deletes the recorded rules of `spec.slot` and forgets the ones
    /// confirmed gone. Returns how many rules were removed.
    ///
    /// A recorded handle is only deleted while the filter listed under it
    /// still mirrors between the recorded endpoints. Handles the kernel has
    /// since given to another filter are forgotten without a delete.
    async fn remove_owned(&self, spec: &MirrorSpec) -> MirrorResult<usize> {
        let owned = self.store.load(self.guest_id)?;
        let recorded = recorded_spec(&owned, spec);
        let mut targets: Vec<(StateKey, RuleHandle)> = Vec::new();
        let mut stale: Vec<StateKey> = Vec::new();

        for key in StateKey::pair(spec.slot) {
            let Some(handle) = owned.get(&key) else {
                continue;
            };
            match self.find_owned(handle).await? {
                Some(filter) if is_rule_for(&recorded, key.direction, handle, &filter) => {
                    self.delete_rule(handle).await;
                    targets.push((key, handle.clone()));
                }
                Some(filter) => {
                    warn!(
                        %key,
                        %handle,
                        mirrors_to = ?filter.destinations,
                        "Recorded handle now belongs to another rule, forgetting it"
                    );
                    stale.push(key);
                }
                None => targets.push((key, handle.clone())),
            }
        }

        if targets.is_empty() && stale.is_empty() {
            warn!(mirror = %spec, "No recorded rules for mirror, leaving tc untouched");
            return Ok(0);
        }
        self.store.forget(self.guest_id, &stale)?;
        if targets.is_empty() {
            return Ok(0);
        }

        let handles: Vec<&RuleHandle> = targets.iter().map(|(_, h)| h).collect();
        let handles = &handles;
        let all_gone = poll_until(
            self.timing.remove_timeout(),
            &self.timing.confirm_backoff(),
            move || async move {
                for handle in handles {
                    if !self.is_gone(handle).await {
                        return false;
                    }
                }
                true
            },
        )
        .await;

        let mut gone = Vec::with_capacity(targets.len());
        for (key, handle) in &targets {
            if all_gone || self.is_gone(handle).await {
                gone.push(*key);
            } else {
                warn!(%key, %handle, "Rule still present after delete");
            }
        }
        self.store.forget(self.guest_id, &gone)?;

        if gone.len() < targets.len() {
            return Err(MirrorError::ConfirmTimeout {
                operation: "removal",
                guest_interface: spec.guest_interface.clone(),
                physical_interface: spec.physical_interface.clone(),
            });
        }
        info!(mirror = %spec, rules = gone.len(), "Mirror removed");
        Ok(gone.len())
    }
}

fn interfaces_of(wanted: &WantedState) -> Vec<&str> {
    let mut interfaces: Vec<&str> = wanted
        .values()
        .flat_map(|s| [s.guest_interface.as_str(), s.physical_interface.as_str()])
        .collect();
    interfaces.sort_unstable();
    interfaces.dedup();
    interfaces
}

/// Rebuilds a pair description for a recorded slot from its handles
fn spec_from_owned(owned: &PersistedState, slot: u32) -> MirrorSpec {
    recorded_spec(owned, &MirrorSpec::new("?", "?", slot))
}

/// The pair `spec.slot` was created as: each recorded handle names the
/// source device of its direction, `spec` fills in whatever is unrecorded
fn recorded_spec(owned: &PersistedState, spec: &MirrorSpec) -> MirrorSpec {
    let device = |direction, fallback: &str| {
        owned
            .get(&StateKey::new(direction, spec.slot))
            .map_or_else(|| fallback.to_string(), |h| h.device.clone())
    };
    MirrorSpec::new(
        device(Direction::GuestToPhys, &spec.guest_interface),
        device(Direction::PhysToGuest, &spec.physical_interface),
        spec.slot,
    )
}

/// Whether `filter`, listed under `handle`, is the `direction` rule of `spec`
fn is_rule_for(
    spec: &MirrorSpec,
    direction: Direction,
    handle: &RuleHandle,
    filter: &MirrorFilter,
) -> bool {
    let (from, to) = spec.endpoints(direction);
    handle.device == from && filter.mirrors_to(to)
}
