#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use complyd_core::aggregate::JsonResultParser;
use complyd_core::artifact::{ArtifactSpec, build_artifact};
use complyd_core::config::{ControllerConfig, ReconcileConfig, RetryConfig};
use complyd_core::events::InProcEventBus;
use complyd_core::naming;
use complyd_core::runtime::AggregatorExecutor;
use complyd_core::store::{InMemoryStore, StoreResult, StoredObject};
use complyd_core::{ObjectStore, ReconcileAction, ScanReconciler, StoreError};
use complyd_model::cluster::{POD_SCHEDULED, REASON_UNSCHEDULABLE};
use complyd_model::{
    Event, LabelSelector, Labels, Node, NodeSpec, Object, ObjectKey, ObjectMeta, Pod,
    PodCondition, PodPhase, Scan, ScanPhase, ScanSpec, labels,
};

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        reconcile: ReconcileConfig {
            requeue_after_ms: 20,
            workers: 2,
            error_backoff_base_ms: 5,
            error_backoff_max_ms: 50,
        },
        retry: RetryConfig {
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            multiplier: 1.0,
            jitter_ratio: 0.0,
        },
        ..ControllerConfig::default()
    }
    .with_namespace("compliance")
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub events: Arc<InProcEventBus>,
    pub reconciler: ScanReconciler<InMemoryStore, InProcEventBus>,
    pub executor: AggregatorExecutor<InMemoryStore, JsonResultParser>,
    event_rx: broadcast::Receiver<Event>,
}

impl Harness {
    pub fn new() -> Self {
        let config = test_config();
        let store = Arc::new(InMemoryStore::default());
        let events = Arc::new(InProcEventBus::new(256));
        let event_rx = events.subscribe();
        let executor = AggregatorExecutor::new(
            Arc::clone(&store),
            Arc::new(JsonResultParser),
            config.retry,
        );
        let reconciler = ScanReconciler::new(Arc::clone(&store), Arc::clone(&events), config);
        Self {
            store,
            events,
            reconciler,
            executor,
            event_rx,
        }
    }

    pub async fn add_node(&self, name: &str, unschedulable: bool) {
        let mut node_labels = Labels::new();
        node_labels.insert(labels::NODE_OS_LABEL.into(), labels::NODE_OS_LINUX.into());
        node_labels.insert("node-role.kubernetes.io/worker".into(), String::new());
        let node = Node {
            metadata: ObjectMeta::named("", name).with_labels(node_labels),
            spec: NodeSpec { unschedulable },
        };
        self.store.create(&node).await.expect("create node");
    }

    pub async fn create_scan(&self, name: &str, spec: ScanSpec) -> ObjectKey {
        let scan = Scan::new("compliance", name, spec);
        self.store.create(&scan).await.expect("create scan").key()
    }

    pub async fn scan(&self, key: &ObjectKey) -> Scan {
        self.store.get(key).await.expect("get scan")
    }

    pub async fn step(&self, key: &ObjectKey) -> ReconcileAction {
        self.reconciler.reconcile(key).await.expect("reconcile")
    }

    /// Reconciles until `phase` is reached or `max` passes ran.
    pub async fn drive_to(&self, key: &ObjectKey, phase: ScanPhase, max: usize) -> Scan {
        for _ in 0..max {
            let scan = self.scan(key).await;
            if scan.status.phase == phase {
                return scan;
            }
            self.step(key).await;
        }
        let scan = self.scan(key).await;
        assert_eq!(scan.status.phase, phase, "scan did not reach {phase:?}");
        scan
    }

    pub async fn scanner_pods(&self, scan: &Scan) -> Vec<Pod> {
        let selector = LabelSelector::from(scan.selector_labels())
            .with(labels::WORKLOAD, labels::WORKLOAD_SCANNER);
        self.store
            .list(Some(scan.namespace()), &selector)
            .await
            .expect("list pods")
    }

    pub async fn scanner_pod(&self, scan: &Scan, node: &str) -> Pod {
        let key = ObjectKey::new(scan.namespace(), naming::workload_name(scan.name(), node));
        self.store.get(&key).await.expect("scanner pod")
    }

    /// Plays the part of a scan workload: writes the artifact for `node` and
    /// moves its pod to `Succeeded`.
    pub async fn finish_node(&self, scan: &Scan, node: &str, exit_code: &str, body: &str) {
        self.write_artifact(scan, node, exit_code, labels::KEY_RESULTS, body)
            .await;
        self.set_pod_phase(&self.scanner_pod(scan, node).await, PodPhase::Succeeded)
            .await;
    }

    pub async fn write_artifact(
        &self,
        scan: &Scan,
        node: &str,
        exit_code: &str,
        payload_key: &str,
        body: &str,
    ) {
        let cm = build_artifact(
            scan,
            ArtifactSpec {
                name: naming::artifact_name(scan.name(), node),
                payload_key,
                source: node,
                payload: body.as_bytes(),
                compress: body.len() > 64,
                exit_code,
                warnings: "",
            },
        )
        .expect("build artifact");
        self.store.create(&cm).await.expect("create artifact");
    }

    pub async fn set_pod_phase(&self, pod: &Pod, phase: PodPhase) {
        let mut pod: Pod = self.store.get(&pod.key()).await.expect("pod");
        pod.status.phase = phase;
        self.store.update_status(&pod).await.expect("pod status");
    }

    pub async fn mark_unschedulable(&self, pod: &Pod, message: &str) {
        let mut pod: Pod = self.store.get(&pod.key()).await.expect("pod");
        pod.status.phase = PodPhase::Pending;
        pod.status.conditions.push(PodCondition {
            kind: POD_SCHEDULED.into(),
            status: false,
            reason: REASON_UNSCHEDULABLE.into(),
            message: message.into(),
        });
        self.store.update_status(&pod).await.expect("pod status");
    }

    pub async fn run_aggregator(&self, scan: &Scan) {
        let key = ObjectKey::new(scan.namespace(), naming::aggregator_name(scan.name()));
        self.executor.execute(&key).await.expect("aggregator run");
    }

    /// Drives an `Aggregating` scan through its aggregator run to `Done`.
    pub async fn aggregate_to_done(&self, key: &ObjectKey) -> Scan {
        let scan = self.drive_to(key, ScanPhase::Aggregating, 4).await;
        self.step(key).await;
        self.run_aggregator(&scan).await;
        self.drive_to(key, ScanPhase::Done, 4).await
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn results(checks: &[(&str, &str)]) -> String {
    let entries: Vec<String> = checks
        .iter()
        .map(|(id, status)| {
            format!(
                r#"{{"id":"xccdf_org.ssgproject.content_rule_{id}","status":"{status}","severity":"medium","remediations":[{{"kind":"MachineConfig","body":"fix {id}"}}]}}"#
            )
        })
        .collect();
    format!(r#"{{"checks":[{}]}}"#, entries.join(","))
}

/// Store whose reads miss one object until [`LaggingStore::reveal`], like a
/// cache that has not caught up with a create yet.
pub struct LaggingStore {
    pub inner: InMemoryStore,
    hidden: Mutex<Option<ObjectKey>>,
}

impl LaggingStore {
    pub fn hiding(key: ObjectKey) -> Self {
        Self {
            inner: InMemoryStore::default(),
            hidden: Mutex::new(Some(key)),
        }
    }

    pub fn reveal(&self) {
        self.hidden.lock().expect("hidden key").take();
    }

    fn is_hidden(&self, key: &ObjectKey) -> bool {
        self.hidden.lock().expect("hidden key").as_ref() == Some(key)
    }
}

#[async_trait]
impl ObjectStore for LaggingStore {
    async fn get<T: StoredObject>(&self, key: &ObjectKey) -> StoreResult<T> {
        if self.is_hidden(key) {
            return Err(StoreError::NotFound {
                kind: T::KIND,
                key: key.to_string(),
            });
        }
        self.inner.get(key).await
    }

    async fn list<T: StoredObject>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<T>> {
        self.inner.list(namespace, selector).await
    }

    async fn create<T: StoredObject>(&self, obj: &T) -> StoreResult<T> {
        self.inner.create(obj).await
    }

    async fn update<T: StoredObject>(&self, obj: &T) -> StoreResult<T> {
        self.inner.update(obj).await
    }

    async fn update_status<T: StoredObject>(&self, obj: &T) -> StoreResult<T> {
        self.inner.update_status(obj).await
    }

    async fn delete<T: StoredObject>(&self, key: &ObjectKey) -> StoreResult<()> {
        self.inner.delete::<T>(key).await
    }
}
