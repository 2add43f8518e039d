//! Rule engine tests against the fake traffic-control subsystem
//!
//! Each scenario drives `MirrorEngine::reconcile` the way a hook
//! invocation would and then checks both the kernel and the state file.

mod common;

use std::sync::Arc;

use common::{engine, wanted, VM};
use lldp_mirror::{MirrorEngine, OutputFormat, Phase, RuleHandle, StateKey, StateStore, WantedState};
use lldp_mirror_common::{CommandRunner, MirrorError};
use lldp_mirror_test::{mirror_fixtures, FakeKernel, KernelVerifier, StateVerifier};
use pretty_assertions::assert_eq;

fn kernel_with(interfaces: &[&str]) -> Arc<FakeKernel> {
    Arc::new(FakeKernel::new().with_interfaces(interfaces.iter().copied()))
}

/// Guest 200 mirrors net0 to bond0 while guest 100 still has a record of
/// the same bond0 handle, left over from a rule the kernel has since freed
/// and handed out again.
async fn reused_handle_setup(
    kernel: &Arc<FakeKernel>,
    state_dir: &std::path::Path,
) -> (MirrorEngine, RuleHandle) {
    let other = engine(kernel, state_dir, 200).await;
    other
        .reconcile(&Phase::Activate, &wanted(&mirror_fixtures::single("bond0"), 200))
        .await
        .unwrap();
    let reused = other
        .store()
        .load(200)
        .unwrap()
        .get(&StateKey::pair(0)[0])
        .unwrap()
        .clone();

    let engine = engine(kernel, state_dir, VM).await;
    engine
        .store()
        .record(VM, StateKey::pair(0)[0], &reused)
        .unwrap();
    kernel.clear_log();
    (engine, reused)
}

#[tokio::test]
async fn test_activate_creates_both_directions() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0", "tap100i0"]);
    let engine = engine(&kernel, dir.path(), VM).await;
    let wanted = wanted(&mirror_fixtures::single("bond0"), VM);

    let report = engine.reconcile(&Phase::Activate, &wanted).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.created, vec!["tap100i0 <-> bond0 (net0)".to_string()]);
    KernelVerifier::new(&kernel)
        .assert_pair("tap100i0", "bond0")
        .unwrap();
    assert!(kernel.has_ingress("bond0"));
    assert!(kernel.has_ingress("tap100i0"));
    assert_eq!(kernel.filters("bond0")[0].priority, 20000);

    let state = engine.store().load(VM).unwrap();
    assert_eq!(state.len(), 2);
    assert_eq!(state.get(&StateKey::pair(0)[0]).unwrap().device, "bond0");
}

#[tokio::test]
async fn test_second_activate_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0", "eno1", "tap100i0", "tap100i1"]);
    let engine = engine(&kernel, dir.path(), VM).await;
    let wanted = wanted(&mirror_fixtures::dual_uplink("bond0", "eno1"), VM);

    let first = engine.reconcile(&Phase::Activate, &wanted).await.unwrap();
    assert_eq!(first.created.len(), 2);
    let state_before = engine.store().load(VM).unwrap();

    kernel.clear_log();
    let second = engine.reconcile(&Phase::Activate, &wanted).await.unwrap();

    assert_eq!(second.unchanged.len(), 2);
    assert!(second.created.is_empty());
    KernelVerifier::new(&kernel).assert_no_mutations().unwrap();
    assert_eq!(engine.store().load(VM).unwrap(), state_before);
}

#[tokio::test]
async fn test_failed_direction_rolls_back_pair() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0", "tap100i0"]);
    kernel.fail_commands_containing("filter add dev tap100i0");
    let engine = engine(&kernel, dir.path(), VM).await;
    let wanted = wanted(&mirror_fixtures::single("bond0"), VM);

    let report = engine.reconcile(&Phase::Activate, &wanted).await.unwrap();

    assert!(!report.is_success());
    assert!(matches!(
        report.failed[0].1,
        MirrorError::ShellCommandFailed { .. }
    ));
    KernelVerifier::new(&kernel).assert_filter_count(0).unwrap();
    StateVerifier::new(engine.store().state_path(VM))
        .assert_absent()
        .unwrap();
}

#[tokio::test]
async fn test_failed_pair_does_not_affect_others() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0", "eno1", "tap100i0", "tap100i1"]);
    kernel.fail_commands_containing("mirror dev eno1");
    let engine = engine(&kernel, dir.path(), VM).await;
    let wanted = wanted(&mirror_fixtures::dual_uplink("bond0", "eno1"), VM);

    let report = engine.reconcile(&Phase::Activate, &wanted).await.unwrap();

    assert_eq!(report.created, vec!["tap100i0 <-> bond0 (net0)".to_string()]);
    assert_eq!(report.failed.len(), 1);
    let verifier = KernelVerifier::new(&kernel);
    verifier.assert_pair("tap100i0", "bond0").unwrap();
    verifier.assert_no_pair("tap100i1", "eno1").unwrap();
    StateVerifier::new(engine.store().state_path(VM))
        .assert_entries(2)
        .unwrap();
}

#[tokio::test]
async fn test_foreign_rules_are_never_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0", "tap100i0"]);
    let foreign = kernel.add_foreign_mirror("bond0", "tap100i0", 20000);
    let engine = engine(&kernel, dir.path(), VM).await;
    let wanted = wanted(&mirror_fixtures::single("bond0"), VM);

    let report = engine.reconcile(&Phase::Activate, &wanted).await.unwrap();
    assert_eq!(report.created.len(), 1);
    KernelVerifier::new(&kernel).assert_filter_count(3).unwrap();

    let report = engine.reconcile(&Phase::Deactivate, &wanted).await.unwrap();
    assert_eq!(report.removed.len(), 1);

    let left = kernel.filters("bond0");
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].handle, foreign);
    assert!(kernel.filters("tap100i0").is_empty());
    let foreign_delete = format!(
        "dev \"bond0\" parent ffff: protocol 0x88cc prio 20000 handle \"{}\"",
        foreign
    );
    assert!(kernel
        .delete_commands()
        .iter()
        .all(|cmd| !cmd.contains(&foreign_delete)));
}

#[tokio::test]
async fn test_deactivate_leaves_unowned_pair_alone() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0", "tap100i0"]);
    kernel.add_foreign_mirror("bond0", "tap100i0", 20000);
    kernel.add_foreign_mirror("tap100i0", "bond0", 20000);
    let engine = engine(&kernel, dir.path(), VM).await;
    let wanted = wanted(&mirror_fixtures::single("bond0"), VM);

    let report = engine.reconcile(&Phase::Deactivate, &wanted).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.unchanged.len(), 1);
    assert!(kernel.delete_commands().is_empty());
    KernelVerifier::new(&kernel)
        .assert_pair("tap100i0", "bond0")
        .unwrap();
}

#[tokio::test]
async fn test_create_remove_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0", "tap100i0"]);
    let engine = engine(&kernel, dir.path(), VM).await;
    let wanted = wanted(&mirror_fixtures::single("bond0"), VM);

    engine.reconcile(&Phase::Activate, &wanted).await.unwrap();
    let report = engine.reconcile(&Phase::Deactivate, &wanted).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.removed.len(), 1);
    KernelVerifier::new(&kernel).assert_filter_count(0).unwrap();
    StateVerifier::new(engine.store().state_path(VM))
        .assert_absent()
        .unwrap();

    let again = engine.reconcile(&Phase::Deactivate, &wanted).await.unwrap();
    assert_eq!(again.unchanged.len(), 1);
}

#[tokio::test]
async fn test_missing_interface_times_out_without_rules() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0"]);
    let engine = engine(&kernel, dir.path(), VM).await;
    let wanted = wanted(&mirror_fixtures::single("bond0"), VM);

    let report = engine.reconcile(&Phase::Activate, &wanted).await.unwrap();

    assert_eq!(report.failed.len(), 1);
    let (label, err) = &report.failed[0];
    assert_eq!(label, "tap100i0 <-> bond0 (net0)");
    assert!(matches!(err, MirrorError::InterfaceNotReady { interface, .. } if interface == "tap100i0"));
    assert!(kernel
        .commands()
        .iter()
        .all(|cmd| !cmd.contains("filter add")));
    KernelVerifier::new(&kernel).assert_no_mutations().unwrap();
}

#[tokio::test]
async fn test_waits_for_late_interface() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = Arc::new(
        FakeKernel::new()
            .with_interfaces(["bond0"])
            .appear_after("tap100i0", 3),
    );
    let engine = engine(&kernel, dir.path(), VM).await;
    let wanted = wanted(&mirror_fixtures::single("bond0"), VM);

    let report = engine.reconcile(&Phase::Activate, &wanted).await.unwrap();

    assert!(report.is_success(), "{:?}", report.failed);
    KernelVerifier::new(&kernel)
        .assert_pair("tap100i0", "bond0")
        .unwrap();
}

#[tokio::test]
async fn test_text_output_path() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = Arc::new(
        FakeKernel::new()
            .with_interfaces(["bond0", "tap100i0"])
            .without_json(),
    );
    let engine = engine(&kernel, dir.path(), VM).await;
    assert_eq!(engine.prober().format(), OutputFormat::Text);
    let wanted = wanted(&mirror_fixtures::single("bond0"), VM);

    let created = engine.reconcile(&Phase::Activate, &wanted).await.unwrap();
    assert_eq!(created.created.len(), 1);
    assert!(kernel.commands().iter().all(|cmd| !cmd.contains(" -j filter")));

    kernel.clear_log();
    let again = engine.reconcile(&Phase::Activate, &wanted).await.unwrap();
    assert_eq!(again.unchanged.len(), 1);
    KernelVerifier::new(&kernel).assert_no_mutations().unwrap();

    let removed = engine.reconcile(&Phase::Deactivate, &wanted).await.unwrap();
    assert_eq!(removed.removed.len(), 1);
    KernelVerifier::new(&kernel).assert_filter_count(0).unwrap();
}

#[tokio::test]
async fn test_deactivate_sweeps_recorded_slots_no_longer_configured() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0", "eno1", "tap100i0", "tap100i1"]);
    let engine = engine(&kernel, dir.path(), VM).await;

    let both = wanted(&mirror_fixtures::dual_uplink("bond0", "eno1"), VM);
    engine.reconcile(&Phase::Activate, &both).await.unwrap();

    let only_first = wanted(&mirror_fixtures::single("bond0"), VM);
    let report = engine
        .reconcile(&Phase::Deactivate, &only_first)
        .await
        .unwrap();

    assert_eq!(report.removed.len(), 2);
    assert!(report.removed.contains(&"tap100i1 <-> eno1 (net1)".to_string()));
    KernelVerifier::new(&kernel).assert_filter_count(0).unwrap();
    StateVerifier::new(engine.store().state_path(VM))
        .assert_absent()
        .unwrap();
}

#[tokio::test]
async fn test_deactivate_after_guest_interface_vanished() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0", "tap100i0"]);
    let engine = engine(&kernel, dir.path(), VM).await;
    let wanted = wanted(&mirror_fixtures::single("bond0"), VM);

    engine.reconcile(&Phase::Activate, &wanted).await.unwrap();
    kernel.remove_interface("tap100i0");

    let report = engine.reconcile(&Phase::Deactivate, &wanted).await.unwrap();

    assert!(report.is_success(), "{:?}", report.failed);
    assert!(kernel.filters("bond0").is_empty());
    StateVerifier::new(engine.store().state_path(VM))
        .assert_absent()
        .unwrap();
}

#[tokio::test]
async fn test_unrecoverable_handle_fails_pair() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0", "tap100i0"]);
    kernel.ghost_filters_on("tap100i0");
    let engine = engine(&kernel, dir.path(), VM).await;
    let wanted = wanted(&mirror_fixtures::single("bond0"), VM);

    let report = engine.reconcile(&Phase::Activate, &wanted).await.unwrap();

    assert_eq!(report.failed.len(), 1);
    assert!(matches!(
        report.failed[0].1,
        MirrorError::HandleNotFound { priority: 20000, .. }
    ));
    assert!(report.failed[0].1.is_retryable());
    // The recovered direction was rolled back
    assert!(kernel.filters("bond0").is_empty());
    StateVerifier::new(engine.store().state_path(VM))
        .assert_absent()
        .unwrap();
}

#[tokio::test]
async fn test_rules_that_stay_keep_their_record() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0", "tap100i0"]);
    let engine = engine(&kernel, dir.path(), VM).await;
    let wanted = wanted(&mirror_fixtures::single("bond0"), VM);

    engine.reconcile(&Phase::Activate, &wanted).await.unwrap();
    kernel.sticky_filters_on("bond0");

    let report = engine.reconcile(&Phase::Deactivate, &wanted).await.unwrap();

    assert_eq!(report.failed.len(), 1);
    assert!(matches!(
        report.failed[0].1,
        MirrorError::ConfirmTimeout {
            operation: "removal",
            ..
        }
    ));
    let state = engine.store().load(VM).unwrap();
    assert_eq!(state.len(), 1);
    assert_eq!(state.iter().next().unwrap().1.device, "bond0");
    assert!(kernel.filters("tap100i0").is_empty());
}

#[tokio::test]
async fn test_activate_recreates_only_missing_direction() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0", "tap100i0"]);
    let engine = engine(&kernel, dir.path(), VM).await;
    let wanted = wanted(&mirror_fixtures::single("bond0"), VM);

    engine.reconcile(&Phase::Activate, &wanted).await.unwrap();
    let guest_side = engine.store().load(VM).unwrap();
    let handle = guest_side.get(&StateKey::pair(0)[1]).unwrap().clone();
    kernel
        .run_or_throw(&format!(
            "tc filter del dev {} parent ffff: protocol 0x88cc prio {} handle {} u32",
            handle.device, handle.priority, handle.handle
        ))
        .await
        .unwrap();

    kernel.clear_log();
    let report = engine.reconcile(&Phase::Activate, &wanted).await.unwrap();

    assert_eq!(report.created.len(), 1);
    let mutations = kernel.mutating_commands();
    assert_eq!(mutations.len(), 1, "{:?}", mutations);
    assert!(mutations[0].contains("filter add dev tap100i0"));
    assert_eq!(kernel.filters("bond0").len(), 1);
    KernelVerifier::new(&kernel)
        .assert_pair("tap100i0", "bond0")
        .unwrap();
}

#[tokio::test]
async fn test_independent_guests_share_physical_interface() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0", "tap100i0", "tap101i0"]);
    let first = engine(&kernel, dir.path(), 100).await;
    let second = engine(&kernel, dir.path(), 101).await;

    first
        .reconcile(&Phase::Activate, &wanted(&mirror_fixtures::single("bond0"), 100))
        .await
        .unwrap();
    second
        .reconcile(&Phase::Activate, &wanted(&mirror_fixtures::single("bond0"), 101))
        .await
        .unwrap();
    assert_eq!(kernel.filters("bond0").len(), 2);

    first
        .reconcile(&Phase::Deactivate, &wanted(&mirror_fixtures::single("bond0"), 100))
        .await
        .unwrap();

    assert_eq!(kernel.mirrors("bond0"), vec!["tap101i0".to_string()]);
    let store = StateStore::new(dir.path());
    assert!(store.load(100).unwrap().is_empty());
    assert_eq!(store.load(101).unwrap().len(), 2);
}

#[tokio::test]
async fn test_unconfirmed_creation_times_out_and_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0", "tap100i0"]);
    // The rule is added and its handle recovered, but it never lists as LLDP
    kernel.mislabel_filters_on("bond0");
    let engine = engine(&kernel, dir.path(), VM).await;
    let wanted = wanted(&mirror_fixtures::single("bond0"), VM);

    let report = engine.reconcile(&Phase::Activate, &wanted).await.unwrap();

    assert_eq!(report.failed.len(), 1);
    assert!(matches!(
        report.failed[0].1,
        MirrorError::ConfirmTimeout {
            operation: "creation",
            ..
        }
    ));
    assert!(kernel
        .delete_commands()
        .iter()
        .any(|cmd| cmd.contains("filter del dev \"bond0\"")));
    KernelVerifier::new(&kernel).assert_filter_count(0).unwrap();
    StateVerifier::new(engine.store().state_path(VM))
        .assert_absent()
        .unwrap();
}

#[tokio::test]
async fn test_activate_drops_record_of_reused_handle() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0", "tap100i0", "tap200i0"]);
    let (engine, reused) = reused_handle_setup(&kernel, dir.path()).await;

    let report = engine
        .reconcile(&Phase::Activate, &wanted(&mirror_fixtures::single("bond0"), VM))
        .await
        .unwrap();

    assert!(report.is_success(), "{:?}", report.failed);
    assert_eq!(report.created.len(), 1);
    assert!(kernel.delete_commands().is_empty());
    let verifier = KernelVerifier::new(&kernel);
    verifier.assert_pair("tap200i0", "bond0").unwrap();
    verifier.assert_pair("tap100i0", "bond0").unwrap();

    let ours = engine.store().load(VM).unwrap();
    let recorded = ours.get(&StateKey::pair(0)[0]).unwrap();
    assert_ne!(recorded, &reused);
    assert_eq!(recorded.device, "bond0");
    assert_eq!(StateStore::new(dir.path()).load(200).unwrap().len(), 2);
}

#[tokio::test]
async fn test_deactivate_drops_record_of_reused_handle() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0", "tap100i0", "tap200i0"]);
    let (engine, reused) = reused_handle_setup(&kernel, dir.path()).await;

    let report = engine
        .reconcile(&Phase::Deactivate, &wanted(&mirror_fixtures::single("bond0"), VM))
        .await
        .unwrap();

    assert!(report.is_success(), "{:?}", report.failed);
    assert!(report.removed.is_empty());
    assert!(kernel.delete_commands().is_empty());
    assert!(kernel
        .filters("bond0")
        .iter()
        .any(|f| f.handle == reused.handle && f.mirror_to == "tap200i0"));
    StateVerifier::new(engine.store().state_path(VM))
        .assert_absent()
        .unwrap();
    assert_eq!(StateStore::new(dir.path()).load(200).unwrap().len(), 2);
}

#[tokio::test]
async fn test_sweep_drops_record_of_reused_handle() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel_with(&["bond0", "tap100i0", "tap200i0"]);
    let (engine, _) = reused_handle_setup(&kernel, dir.path()).await;

    // No mirror configured any more: the recorded slot is swept
    let report = engine
        .reconcile(&Phase::Deactivate, &WantedState::new())
        .await
        .unwrap();

    assert!(report.is_success(), "{:?}", report.failed);
    assert!(kernel.delete_commands().is_empty());
    KernelVerifier::new(&kernel)
        .assert_pair("tap200i0", "bond0")
        .unwrap();
    StateVerifier::new(engine.store().state_path(VM))
        .assert_absent()
        .unwrap();
}
