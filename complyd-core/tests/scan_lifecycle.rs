mod common;

use std::sync::Arc;

use complyd_core::aggregate::JsonResultParser;
use complyd_core::artifact::{ArtifactSpec, build_artifact};
use complyd_core::events::{self, InProcEventBus};
use complyd_core::naming;
use complyd_core::runtime::AggregatorExecutor;
use complyd_core::storage::STORAGE_REJECTED_PREFIX;
use complyd_core::store::get_opt;
use complyd_core::{ObjectStore, ScanReconciler};
use complyd_model::{
    ComplianceCheck, ComplianceRemediation, ConfigMap, Deployment, LabelSelector, Labels, Node,
    NodeSpec, Object, ObjectKey, ObjectMeta, Pod, PodPhase, Scan, ScanPhase, ScanResult, ScanSpec,
    Secret, StorageClaim, labels,
};

use common::{Harness, LaggingStore, results, test_config};

fn lenient() -> ScanSpec {
    ScanSpec {
        strict_node_scan: Some(false),
        ..ScanSpec::default()
    }
}

async fn artifacts(h: &Harness, scan: &Scan) -> Vec<ConfigMap> {
    h.store
        .list(Some(scan.namespace()), &complyd_core::strategy::artifact_selector(scan))
        .await
        .expect("artifacts")
}

#[tokio::test]
async fn compliant_scan_runs_to_done_and_cleans_up() {
    let mut h = Harness::new();
    h.add_node("node-a", false).await;
    h.add_node("node-b", false).await;
    let key = h.create_scan("workers", ScanSpec::default()).await;

    let scan = h.drive_to(&key, ScanPhase::Running, 4).await;
    assert!(scan.metadata.has_finalizer(labels::SCAN_FINALIZER));
    assert!(scan.status.results_storage.is_some());
    assert_eq!(h.scanner_pods(&scan).await.len(), 2);

    let body = results(&[("sshd_disable_root", "PASS"), ("audit_rules", "PASS")]);
    h.finish_node(&scan, "node-a", "0", &body).await;
    h.finish_node(&scan, "node-b", "0", &body).await;

    let done = h.aggregate_to_done(&key).await;
    assert_eq!(done.status.result, ScanResult::Compliant);
    assert!(done.status.error_message.is_empty());

    let check: ComplianceCheck = h
        .store
        .get(&ObjectKey::new("compliance", "workers-audit-rules"))
        .await
        .expect("check");
    assert_eq!(check.status.as_str(), "PASS");
    assert!(!check.metadata.has_label(labels::CHECK_INCONSISTENT));

    let reasons: Vec<String> = h.drain_events().into_iter().map(|e| e.reason).collect();
    assert!(reasons.contains(&events::REASON_RESULT_AVAILABLE.to_string()));

    // The pass after DONE tears down everything but storage and artifacts.
    h.step(&key).await;
    assert!(h.scanner_pods(&done).await.is_empty());
    let store = h.store.as_ref();
    let ns = done.namespace();
    assert!(
        get_opt::<_, Pod>(store, &ObjectKey::new(ns, naming::aggregator_name("workers")))
            .await
            .expect("get")
            .is_none()
    );
    assert!(
        get_opt::<_, Secret>(store, &ObjectKey::new(ns, naming::root_ca_secret_name("workers")))
            .await
            .expect("get")
            .is_none()
    );
    assert!(
        get_opt::<_, Deployment>(store, &ObjectKey::new(ns, naming::result_server_name("workers")))
            .await
            .expect("get")
            .is_none()
    );
    assert!(
        get_opt::<_, StorageClaim>(store, &ObjectKey::new(ns, naming::storage_claim_name("workers")))
            .await
            .expect("get")
            .is_some()
    );
    assert_eq!(artifacts(&h, &done).await.len(), 2);
}

#[tokio::test]
async fn no_matching_nodes_is_not_applicable() {
    let mut h = Harness::new();
    let key = h.create_scan("workers", ScanSpec::default()).await;

    let scan = h.drive_to(&key, ScanPhase::Done, 3).await;
    assert_eq!(scan.status.result, ScanResult::NotApplicable);

    let reasons: Vec<String> = h.drain_events().into_iter().map(|e| e.reason).collect();
    assert!(reasons.contains(&events::REASON_NO_MATCHING_NODES.to_string()));
    assert!(reasons.contains(&events::REASON_NOT_APPLICABLE.to_string()));
}

#[tokio::test]
async fn running_waits_for_every_workload() {
    let h = Harness::new();
    h.add_node("node-a", false).await;
    h.add_node("node-b", false).await;
    let key = h.create_scan("workers", ScanSpec::default()).await;
    let scan = h.drive_to(&key, ScanPhase::Running, 4).await;

    let body = results(&[("audit_rules", "PASS")]);
    h.finish_node(&scan, "node-a", "0", &body).await;
    let action = h.step(&key).await;
    assert!(action.requeue_after.is_some());
    assert_eq!(h.scan(&key).await.status.phase, ScanPhase::Running);

    h.finish_node(&scan, "node-b", "0", &body).await;
    h.step(&key).await;
    assert_eq!(h.scan(&key).await.status.phase, ScanPhase::Aggregating);
}

#[tokio::test]
async fn aggregating_waits_for_the_aggregator() {
    let h = Harness::new();
    h.add_node("node-a", false).await;
    let key = h.create_scan("workers", ScanSpec::default()).await;
    let scan = h.drive_to(&key, ScanPhase::Running, 4).await;
    h.finish_node(&scan, "node-a", "2", &results(&[("audit_rules", "FAIL")]))
        .await;
    h.drive_to(&key, ScanPhase::Aggregating, 2).await;

    // First pass launches the aggregator, later passes wait on it.
    for _ in 0..2 {
        let action = h.step(&key).await;
        assert!(action.requeue_after.is_some());
        assert_eq!(h.scan(&key).await.status.phase, ScanPhase::Aggregating);
    }

    h.run_aggregator(&scan).await;
    let done = h.drive_to(&key, ScanPhase::Done, 2).await;
    assert_eq!(done.status.result, ScanResult::NonCompliant);

    let fixes: Vec<ComplianceRemediation> = h
        .store
        .list(Some("compliance"), &LabelSelector::from(scan.selector_labels()))
        .await
        .expect("remediations");
    assert_eq!(fixes.len(), 1);
    assert_eq!(fixes[0].metadata.name, "workers-audit-rules");
}

#[tokio::test]
async fn differing_targets_make_the_scan_inconsistent() {
    let mut h = Harness::new();
    for node in ["node-a", "node-b", "node-c"] {
        h.add_node(node, false).await;
    }
    let key = h.create_scan("workers", ScanSpec::default()).await;
    let scan = h.drive_to(&key, ScanPhase::Running, 4).await;

    let passing = results(&[("audit_rules", "PASS"), ("sshd_disable_root", "PASS")]);
    let failing = results(&[("audit_rules", "PASS"), ("sshd_disable_root", "FAIL")]);
    h.finish_node(&scan, "node-a", "0", &passing).await;
    h.finish_node(&scan, "node-b", "0", &passing).await;
    h.finish_node(&scan, "node-c", "2", &failing).await;

    let done = h.aggregate_to_done(&key).await;
    assert_eq!(done.status.result, ScanResult::Inconsistent);
    assert!(done.status.error_message.contains(labels::CHECK_INCONSISTENT));

    let check: ComplianceCheck = h
        .store
        .get(&ObjectKey::new("compliance", "workers-sshd-disable-root"))
        .await
        .expect("check");
    assert!(check.metadata.has_label(labels::CHECK_INCONSISTENT));
    assert_eq!(check.status.as_str(), "FAIL");
    assert_eq!(
        check.metadata.annotations.get(labels::INCONSISTENT_SOURCE).map(String::as_str),
        Some("node-c:FAIL")
    );
    assert_eq!(
        check.metadata.annotations.get(labels::MOST_COMMON_STATUS).map(String::as_str),
        Some("PASS")
    );

    let consistent: ComplianceCheck = h
        .store
        .get(&ObjectKey::new("compliance", "workers-audit-rules"))
        .await
        .expect("check");
    assert!(!consistent.metadata.has_label(labels::CHECK_INCONSISTENT));

    let reasons: Vec<String> = h.drain_events().into_iter().map(|e| e.reason).collect();
    assert!(reasons.contains(&events::REASON_NOT_CONSISTENT.to_string()));
}

#[tokio::test]
async fn rescan_wraps_the_index_and_clears_the_request() {
    let h = Harness::new();
    h.add_node("node-a", false).await;
    let key = h.create_scan("workers", ScanSpec::default()).await;
    let scan = h.drive_to(&key, ScanPhase::Running, 4).await;
    h.finish_node(&scan, "node-a", "0", &results(&[("audit_rules", "PASS")]))
        .await;
    h.aggregate_to_done(&key).await;

    let mut done = h.scan(&key).await;
    done.status.current_index = u64::MAX;
    let mut done = h.store.update_status(&done).await.expect("status");
    done.metadata
        .annotations
        .insert(labels::RESCAN_ANNOTATION.into(), String::new());
    h.store.update(&done).await.expect("annotate");

    h.step(&key).await;
    let reset = h.scan(&key).await;
    assert_eq!(reset.status.phase, ScanPhase::Pending);
    assert_eq!(reset.status.result, ScanResult::NotAvailable);
    assert_eq!(reset.status.current_index, 0);
    assert!(artifacts(&h, &reset).await.is_empty());

    h.step(&key).await;
    let cleared = h.scan(&key).await;
    assert!(!cleared.needs_rescan());
    assert_eq!(cleared.status.phase, ScanPhase::Pending);

    h.step(&key).await;
    assert_eq!(h.scan(&key).await.status.phase, ScanPhase::Launching);
}

#[tokio::test]
async fn deleting_a_scan_removes_everything_it_owns() {
    let h = Harness::new();
    h.add_node("node-a", false).await;
    let key = h.create_scan("workers", ScanSpec::default()).await;
    let scan = h.drive_to(&key, ScanPhase::Running, 4).await;
    h.finish_node(&scan, "node-a", "2", &results(&[("audit_rules", "FAIL")]))
        .await;
    h.aggregate_to_done(&key).await;

    h.store.delete::<Scan>(&key).await.expect("delete");
    assert!(h.scan(&key).await.metadata.is_being_deleted());

    h.step(&key).await;
    let store = h.store.as_ref();
    assert!(get_opt::<_, Scan>(store, &key).await.expect("get").is_none());

    let owned = LabelSelector::from(scan.selector_labels());
    let checks: Vec<ComplianceCheck> = store.list(Some("compliance"), &owned).await.expect("list");
    let fixes: Vec<ComplianceRemediation> = store.list(Some("compliance"), &owned).await.expect("list");
    let claims: Vec<StorageClaim> = store.list(Some("compliance"), &owned).await.expect("list");
    let maps: Vec<ConfigMap> = store.list(Some("compliance"), &owned).await.expect("list");
    let pods: Vec<Pod> = store.list(Some("compliance"), &owned).await.expect("list");
    assert!(checks.is_empty());
    assert!(fixes.is_empty());
    assert!(claims.is_empty());
    assert!(maps.is_empty());
    assert!(pods.is_empty());
}

#[tokio::test]
async fn rejected_storage_ends_the_scan_with_an_error() {
    let mut h = Harness::new();
    h.add_node("node-a", false).await;
    h.store
        .deny_creates::<StorageClaim>("exceeded quota: storage")
        .await;
    let key = h.create_scan("workers", ScanSpec::default()).await;

    let scan = h.drive_to(&key, ScanPhase::Done, 3).await;
    assert_eq!(scan.status.result, ScanResult::Error);
    assert!(scan.status.error_message.starts_with(STORAGE_REJECTED_PREFIX));
    assert!(scan.status.error_message.contains("exceeded quota"));

    let reasons: Vec<String> = h.drain_events().into_iter().map(|e| e.reason).collect();
    assert!(reasons.contains(&events::REASON_STORAGE_REJECTED.to_string()));
    assert!(h.scanner_pods(&scan).await.is_empty());
}

#[tokio::test]
async fn unknown_exit_code_without_message_fails_the_scan() {
    let h = Harness::new();
    h.add_node("node-a", false).await;
    let key = h.create_scan("workers", ScanSpec::default()).await;
    let scan = h.drive_to(&key, ScanPhase::Running, 4).await;
    h.finish_node(&scan, "node-a", "7", "").await;

    let done = h.drive_to(&key, ScanPhase::Done, 3).await;
    assert_eq!(done.status.result, ScanResult::Error);
    assert_eq!(
        done.status.error_message,
        format!(
            "the ConfigMap '{}' was missing 'error-msg' despite exitcode 7",
            naming::artifact_name("workers", "node-a")
        )
    );
}

#[tokio::test]
async fn scanner_error_message_becomes_the_scan_error() {
    let h = Harness::new();
    h.add_node("node-a", false).await;
    let key = h.create_scan("workers", ScanSpec::default()).await;
    let scan = h.drive_to(&key, ScanPhase::Running, 4).await;
    h.write_artifact(&scan, "node-a", "1", labels::KEY_ERROR_MSG, "disk full")
        .await;
    h.set_pod_phase(&h.scanner_pod(&scan, "node-a").await, PodPhase::Succeeded)
        .await;

    let done = h.drive_to(&key, ScanPhase::Done, 3).await;
    assert_eq!(done.status.result, ScanResult::Error);
    assert_eq!(done.status.error_message, "disk full");
}

#[tokio::test]
async fn strict_scans_wait_on_unschedulable_nodes() {
    let mut h = Harness::new();
    h.add_node("node-a", false).await;
    h.add_node("node-b", true).await;
    let key = h.create_scan("workers", ScanSpec::default()).await;

    h.drive_to(&key, ScanPhase::Launching, 2).await;
    let action = h.step(&key).await;
    assert!(action.requeue_after.is_some());
    let scan = h.scan(&key).await;
    assert_eq!(scan.status.phase, ScanPhase::Launching);
    assert!(h.scanner_pods(&scan).await.is_empty());

    assert_eq!(
        scan.status.warnings,
        "Not continuing scan: Node is unschedulable: node-b"
    );

    // Later passes keep waiting without repeating the warning.
    for _ in 0..3 {
        assert!(h.step(&key).await.requeue_after.is_some());
    }
    let blocked: Vec<_> = h
        .drain_events()
        .into_iter()
        .filter(|e| e.reason == events::REASON_UNSCHEDULABLE_NODE)
        .collect();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].message, "Not continuing scan: Node is unschedulable: node-b");
}

#[tokio::test]
async fn lenient_scans_skip_unschedulable_workloads() {
    let mut h = Harness::new();
    h.add_node("node-a", false).await;
    h.add_node("node-b", false).await;
    let key = h.create_scan("workers", lenient()).await;
    let scan = h.drive_to(&key, ScanPhase::Running, 4).await;

    h.finish_node(&scan, "node-a", "0", &results(&[("audit_rules", "PASS")]))
        .await;
    h.mark_unschedulable(&h.scanner_pod(&scan, "node-b").await, "0/3 nodes are available")
        .await;

    h.step(&key).await;
    let recorded: ConfigMap = h
        .store
        .get(&ObjectKey::new("compliance", naming::artifact_name("workers", "node-b")))
        .await
        .expect("unschedulable artifact");
    assert_eq!(
        recorded.value(labels::KEY_EXIT_CODE),
        Some(labels::EXIT_UNSCHEDULABLE)
    );

    let done = h.aggregate_to_done(&key).await;
    assert_eq!(done.status.result, ScanResult::Compliant);

    let reasons: Vec<String> = h.drain_events().into_iter().map(|e| e.reason).collect();
    assert!(reasons.contains(&events::REASON_UNSCHEDULABLE_NODE.to_string()));
}

#[tokio::test]
async fn invalid_scan_type_is_an_error() {
    let h = Harness::new();
    let key = h
        .create_scan(
            "workers",
            ScanSpec {
                scan_type: "Cluster".into(),
                ..ScanSpec::default()
            },
        )
        .await;
    h.step(&key).await;
    let scan = h.scan(&key).await;
    assert_eq!(scan.status.phase, ScanPhase::Done);
    assert_eq!(scan.status.result, ScanResult::Error);
    assert!(!scan.status.error_message.is_empty());
    assert_eq!(scan.key(), key);
}

async fn request_rescan(h: &Harness, key: &ObjectKey) {
    let mut done = h.scan(key).await;
    done.metadata
        .annotations
        .insert(labels::RESCAN_ANNOTATION.into(), String::new());
    h.store.update(&done).await.expect("annotate");
}

#[tokio::test]
async fn rescan_drops_checks_the_new_run_did_not_produce() {
    let h = Harness::new();
    h.add_node("node-a", false).await;
    h.add_node("node-b", false).await;
    let key = h.create_scan("workers", ScanSpec::default()).await;
    let scan = h.drive_to(&key, ScanPhase::Running, 4).await;

    h.finish_node(&scan, "node-a", "0", &results(&[("audit_rules", "PASS")]))
        .await;
    h.finish_node(
        &scan,
        "node-b",
        "0",
        &results(&[("audit_rules", "PASS"), ("extra_rule", "PASS")]),
    )
    .await;
    let first = h.aggregate_to_done(&key).await;
    assert_eq!(first.status.result, ScanResult::Inconsistent);
    let extra = ObjectKey::new("compliance", "workers-extra-rule");
    let stale: ComplianceCheck = h.store.get(&extra).await.expect("check");
    assert!(stale.metadata.has_label(labels::CHECK_INCONSISTENT));

    h.store
        .delete::<Node>(&ObjectKey::new("", "node-b"))
        .await
        .expect("delete node");
    request_rescan(&h, &key).await;
    h.step(&key).await;
    assert_eq!(h.scan(&key).await.status.current_index, 1);

    let scan = h.drive_to(&key, ScanPhase::Running, 6).await;
    assert_eq!(h.scanner_pods(&scan).await.len(), 1);
    h.finish_node(&scan, "node-a", "0", &results(&[("audit_rules", "PASS")]))
        .await;
    let second = h.aggregate_to_done(&key).await;
    assert_eq!(second.status.result, ScanResult::Compliant);
    assert!(second.status.error_message.is_empty());

    assert!(get_opt::<_, ComplianceCheck>(h.store.as_ref(), &extra)
        .await
        .expect("get")
        .is_none());
    let kept: ComplianceCheck = h
        .store
        .get(&ObjectKey::new("compliance", "workers-audit-rules"))
        .await
        .expect("check");
    assert_eq!(
        kept.metadata.labels.get(labels::CHECK_SCAN_INDEX).map(String::as_str),
        Some("1")
    );
    let fixes: Vec<ComplianceRemediation> = h
        .store
        .list(Some("compliance"), &LabelSelector::from(scan.selector_labels()))
        .await
        .expect("remediations");
    assert!(fixes.iter().all(|fix| fix.metadata.name != "workers-extra-rule"));
}

#[tokio::test]
async fn interrupted_aggregator_is_rerun_after_restart() {
    let h = Harness::new();
    h.add_node("node-a", false).await;
    let key = h.create_scan("workers", ScanSpec::default()).await;
    let scan = h.drive_to(&key, ScanPhase::Running, 4).await;
    h.finish_node(&scan, "node-a", "2", &results(&[("audit_rules", "FAIL")]))
        .await;
    h.drive_to(&key, ScanPhase::Aggregating, 2).await;
    h.step(&key).await;

    // The process stopped after the aggregator was marked running.
    let aggregator: Pod = h
        .store
        .get(&ObjectKey::new("compliance", naming::aggregator_name("workers")))
        .await
        .expect("aggregator");
    h.set_pod_phase(&aggregator, PodPhase::Running).await;
    for _ in 0..3 {
        assert!(h.step(&key).await.requeue_after.is_some());
    }
    assert_eq!(h.scan(&key).await.status.phase, ScanPhase::Aggregating);

    let restarted = AggregatorExecutor::new(
        Arc::clone(&h.store),
        Arc::new(JsonResultParser),
        test_config().retry,
    );
    assert_eq!(restarted.recover_interrupted().await.expect("recover"), 1);
    restarted
        .execute(&aggregator.key())
        .await
        .expect("aggregator run");

    let done = h.drive_to(&key, ScanPhase::Done, 3).await;
    assert_eq!(done.status.result, ScanResult::NonCompliant);
}

#[tokio::test]
async fn aggregator_not_visible_yet_requeues_sooner() {
    let config = test_config();
    let aggregator = ObjectKey::new("compliance", naming::aggregator_name("workers"));
    let store = Arc::new(LaggingStore::hiding(aggregator.clone()));
    let reconciler = ScanReconciler::new(
        Arc::clone(&store),
        Arc::new(InProcEventBus::new(16)),
        config.clone(),
    );

    let mut node_labels = Labels::new();
    node_labels.insert(labels::NODE_OS_LABEL.into(), labels::NODE_OS_LINUX.into());
    node_labels.insert("node-role.kubernetes.io/worker".into(), String::new());
    store
        .create(&Node {
            metadata: ObjectMeta::named("", "node-a").with_labels(node_labels),
            spec: NodeSpec::default(),
        })
        .await
        .expect("node");

    let mut scan = store
        .create(&Scan::new("compliance", "workers", ScanSpec::default()))
        .await
        .expect("scan");
    scan.status.phase = ScanPhase::Aggregating;
    let scan = store.update_status(&scan).await.expect("status");
    let body = results(&[("audit_rules", "PASS")]);
    let artifact = build_artifact(
        &scan,
        ArtifactSpec {
            name: naming::artifact_name("workers", "node-a"),
            payload_key: labels::KEY_RESULTS,
            source: "node-a",
            payload: body.as_bytes(),
            compress: false,
            exit_code: labels::EXIT_COMPLIANT,
            warnings: "",
        },
    )
    .expect("artifact");
    store.create(&artifact).await.expect("artifact");

    let action = reconciler.reconcile(&scan.key()).await.expect("reconcile");
    assert_eq!(action.requeue_after, Some(config.reconcile.requeue_not_found()));
    assert!(config.reconcile.requeue_not_found() < config.reconcile.requeue_after());

    store.reveal();
    let action = reconciler.reconcile(&scan.key()).await.expect("reconcile");
    assert_eq!(action.requeue_after, Some(config.reconcile.requeue_after()));
    let stored: Scan = store.get(&scan.key()).await.expect("scan");
    assert_eq!(stored.status.phase, ScanPhase::Aggregating);
}
