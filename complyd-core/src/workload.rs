//! Per-target scan workloads, the aggregator task and the scan-scoped
//! script/env configuration they mount.

use complyd_model::{
    ConfigMap, Container, LabelSelector, Labels, Object, ObjectKey, ObjectMeta, Pod, PodPhase,
    PodSpec, Scan, ScanType, labels,
};

use crate::config::{ResultServerSettings, WorkloadImages};
use crate::error::{CoreError, Result};
use crate::naming;
use crate::store::{self, ObjectStore};
use crate::targets::Target;

pub const SCANNER_CONTAINER: &str = "scanner";
pub const COLLECTOR_CONTAINER: &str = "log-collector";
pub const CONTENT_CONTAINER: &str = "content-container";
pub const AGGREGATOR_CONTAINER: &str = "aggregator";

pub const SCRIPT_KEY: &str = "openscap-container-entrypoint";
pub const SCANNER_SCRIPT_PATH: &str = "/scripts/openscap-container-entrypoint";
pub const CONTENT_DIR: &str = "/content";
pub const REPORT_DIR: &str = "/reports";
pub const HOST_ROOT: &str = "/host";
const TLS_DIR: &str = "/etc/pki/tls";

const SCANNER_SCRIPT: &str = r#"#!/bin/bash
set -x
cmd=(oscap xccdf eval --fetch-remote-resources --profile "$PROFILE" --results-arf "$REPORT_DIR/report-arf.xml" --results "$REPORT_DIR/report.xml")
if [ -n "$RULE" ]; then
    cmd+=(--rule "$RULE")
fi
if [ -n "$VERBOSITY" ]; then
    cmd+=(--verbose "$VERBOSITY")
fi
cmd+=("$CONTENT")
if [ -n "$HOSTROOT" ]; then
    cmd=(oscap-chroot "$HOSTROOT" "${cmd[@]:1}")
fi
"${cmd[@]}" &> "$REPORT_DIR/cmd_output"
rv=$?
echo "$rv" > "$REPORT_DIR/exit_code"
exit 0
"#;

/// Observed state of one target's workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadState {
    Running,
    Succeeded,
    /// The runtime retries failed workloads; for the scan it is terminal.
    Failed,
    Unschedulable(String),
}

impl WorkloadState {
    pub fn is_running(&self) -> bool {
        matches!(self, WorkloadState::Running)
    }
}

/// Builds and observes scan workloads. Images come from configuration
/// resolved once at startup.
#[derive(Debug, Clone)]
pub struct WorkloadManager {
    images: WorkloadImages,
    result_server: ResultServerSettings,
}

impl WorkloadManager {
    pub fn new(images: WorkloadImages, result_server: ResultServerSettings) -> Self {
        Self {
            images,
            result_server,
        }
    }

    pub fn images(&self) -> &WorkloadImages {
        &self.images
    }

    fn content_image<'a>(&'a self, scan: &'a Scan) -> &'a str {
        if scan.spec.content_image.is_empty() {
            &self.images.content
        } else {
            &scan.spec.content_image
        }
    }

    fn content_container(&self, scan: &Scan) -> Container {
        Container {
            name: CONTENT_CONTAINER.into(),
            image: self.content_image(scan).to_string(),
            command: vec!["sh".into(), "-c".into()],
            args: vec![format!("cp -r /* {CONTENT_DIR}/ 2>/dev/null || true")],
            env_from: Vec::new(),
        }
    }

    fn collector_container(&self, scan: &Scan, target: &Target) -> Container {
        let name = naming::artifact_name(scan.name(), target.name());
        Container {
            name: COLLECTOR_CONTAINER.into(),
            image: self.images.log_collector.clone(),
            command: vec!["complyd-server".into(), "collect".into()],
            args: vec![
                format!("--arf-file={REPORT_DIR}/report-arf.xml"),
                format!("--results-file={REPORT_DIR}/report.xml"),
                format!("--output-file={REPORT_DIR}/cmd_output"),
                format!("--exit-code-file={REPORT_DIR}/exit_code"),
                format!("--warnings-file={REPORT_DIR}/warning_output"),
                format!("--report-name={name}"),
                format!("--scan={}", scan.name()),
                format!("--namespace={}", scan.namespace()),
                format!("--owner-uid={}", scan.metadata.uid),
                format!("--source={}", target.node_name().unwrap_or_default()),
                format!("--artifact-file={REPORT_DIR}/artifact.json"),
                format!(
                    "--result-server-uri={}",
                    naming::result_server_uri(scan.name(), self.result_server.port)
                ),
                format!("--tls-client-cert={TLS_DIR}/tls.crt"),
                format!("--tls-client-key={TLS_DIR}/tls.key"),
                format!("--tls-ca={TLS_DIR}/ca.crt"),
            ],
            env_from: Vec::new(),
        }
    }

    fn workload_labels(scan: &Scan, target: &Target) -> Labels {
        let mut meta_labels = scan.selector_labels();
        meta_labels.insert(labels::WORKLOAD.into(), labels::WORKLOAD_SCANNER.into());
        meta_labels.insert(labels::TARGET_ROLE.into(), target.name().to_string());
        if let Some(node) = target.node_name() {
            meta_labels.insert(labels::NODE_NAME.into(), node.to_string());
        }
        meta_labels
    }

    /// The workload that scans `target` and uploads its results.
    pub fn scan_workload(&self, scan: &Scan, target: &Target) -> Pod {
        let name = naming::workload_name(scan.name(), target.name());
        let mut metadata =
            ObjectMeta::named(scan.namespace(), name).with_labels(Self::workload_labels(scan, target));
        metadata.set_controller_owner(scan.as_owner());

        let env_config = match target {
            Target::Node(_) => naming::env_config_name(scan.name()),
            Target::Platform => naming::platform_env_config_name(scan.name()),
        };
        let scanner = Container {
            name: SCANNER_CONTAINER.into(),
            image: self.images.scanner.clone(),
            command: vec![SCANNER_SCRIPT_PATH.into()],
            args: Vec::new(),
            env_from: vec![env_config.clone()],
        };

        Pod {
            metadata,
            spec: PodSpec {
                node_name: target.node_name().map(str::to_string),
                service_account: Some("complyd-scanner".into()),
                init_containers: vec![self.content_container(scan)],
                containers: vec![self.collector_container(scan, target), scanner],
                config_maps: vec![naming::script_config_name(scan.name()), env_config],
                secrets: vec![naming::client_cert_secret_name(scan.name())],
                claims: Vec::new(),
                host_root: matches!(target, Target::Node(_)),
            },
            status: Default::default(),
        }
    }

    /// The one-shot task that turns artifacts into checks and remediations.
    pub fn aggregator_workload(&self, scan: &Scan) -> Pod {
        let mut meta_labels = scan.selector_labels();
        meta_labels.insert(labels::WORKLOAD.into(), labels::WORKLOAD_AGGREGATOR.into());
        let mut metadata = ObjectMeta::named(scan.namespace(), naming::aggregator_name(scan.name()))
            .with_labels(meta_labels);
        metadata.set_controller_owner(scan.as_owner());

        Pod {
            metadata,
            spec: PodSpec {
                service_account: Some("complyd-aggregator".into()),
                init_containers: vec![self.content_container(scan)],
                containers: vec![Container {
                    name: AGGREGATOR_CONTAINER.into(),
                    image: self.images.aggregator.clone(),
                    command: vec!["complyd-aggregator".into()],
                    args: vec![
                        format!("--content={CONTENT_DIR}/{}", scan.spec.content),
                        format!("--scan={}", scan.name()),
                        format!("--namespace={}", scan.namespace()),
                    ],
                    env_from: Vec::new(),
                }],
                ..PodSpec::default()
            },
            status: Default::default(),
        }
    }

    /// Script config shared by every workload of the scan.
    pub fn script_config(&self, scan: &Scan) -> ConfigMap {
        let mut cm = scoped_config(scan, naming::script_config_name(scan.name()));
        cm.data.insert(SCRIPT_KEY.into(), SCANNER_SCRIPT.into());
        cm
    }

    /// Environment consumed by the scanner container.
    pub fn env_config(&self, scan: &Scan, scan_type: ScanType) -> ConfigMap {
        let name = match scan_type {
            ScanType::Node => naming::env_config_name(scan.name()),
            ScanType::Platform => naming::platform_env_config_name(scan.name()),
        };
        let mut cm = scoped_config(scan, name);
        cm.data.insert("PROFILE".into(), scan.spec.profile.clone());
        cm.data
            .insert("CONTENT".into(), format!("{CONTENT_DIR}/{}", scan.spec.content));
        cm.data.insert("REPORT_DIR".into(), REPORT_DIR.into());
        if let Some(rule) = scan.spec.rule.as_deref().filter(|r| !r.is_empty()) {
            cm.data.insert("RULE".into(), rule.to_string());
        }
        if scan.spec.debug {
            cm.data.insert("VERBOSITY".into(), "INFO".into());
        }
        if scan_type == ScanType::Node {
            cm.data.insert("HOSTROOT".into(), HOST_ROOT.into());
        }
        cm
    }

    /// Creates `workload`. An existing workload with the same name counts as success.
    pub async fn create<S: ObjectStore>(&self, store: &S, workload: &Pod) -> Result<()> {
        let created = store::create_if_absent(store, workload).await?;
        if created {
            tracing::info!(
                target: "scan::workload",
                pod = %workload.metadata.name,
                node = workload.spec.node_name.as_deref().unwrap_or_default(),
                "launched workload"
            );
        } else {
            tracing::debug!(target: "scan::workload", pod = %workload.metadata.name, "workload already exists");
        }
        Ok(())
    }

    /// Observes the workload of `target`; `None` when it does not exist.
    pub async fn observe<S: ObjectStore>(
        &self,
        store: &S,
        scan: &Scan,
        target: &Target,
    ) -> Result<Option<WorkloadState>> {
        let key = ObjectKey::new(
            scan.namespace(),
            naming::workload_name(scan.name(), target.name()),
        );
        let Some(pod) = store::get_opt::<_, Pod>(store, &key).await? else {
            return Ok(None);
        };
        Ok(Some(workload_state(&pod)))
    }

    /// Observes `target` and converts an unschedulable workload into
    /// [`CoreError::Unschedulable`].
    pub async fn is_running<S: ObjectStore>(
        &self,
        store: &S,
        scan: &Scan,
        target: &Target,
    ) -> Result<Option<bool>> {
        match self.observe(store, scan, target).await? {
            None => Ok(None),
            Some(WorkloadState::Unschedulable(message)) => Err(CoreError::Unschedulable {
                pod: naming::workload_name(scan.name(), target.name()),
                message,
            }),
            Some(state) => Ok(Some(state.is_running())),
        }
    }

    /// Deletes every scanner workload of `scan`.
    pub async fn delete_workloads<S: ObjectStore>(&self, store: &S, scan: &Scan) -> Result<usize> {
        let selector = LabelSelector::from(scan.selector_labels())
            .with(labels::WORKLOAD, labels::WORKLOAD_SCANNER);
        Ok(store.delete_all_of::<Pod>(scan.namespace(), &selector).await?)
    }

    pub async fn delete_aggregator<S: ObjectStore>(&self, store: &S, scan: &Scan) -> Result<bool> {
        let key = ObjectKey::new(scan.namespace(), naming::aggregator_name(scan.name()));
        Ok(store::delete_if_present::<_, Pod>(store, &key).await?)
    }

    pub async fn delete_configs<S: ObjectStore>(&self, store: &S, scan: &Scan) -> Result<()> {
        for name in [
            naming::script_config_name(scan.name()),
            naming::env_config_name(scan.name()),
            naming::platform_env_config_name(scan.name()),
        ] {
            store::delete_if_present::<_, ConfigMap>(store, &ObjectKey::new(scan.namespace(), name))
                .await?;
        }
        Ok(())
    }
}

fn scoped_config(scan: &Scan, name: String) -> ConfigMap {
    let mut meta_labels = scan.selector_labels();
    meta_labels.insert(labels::SCRIPT_CONFIG.into(), String::new());
    let mut metadata = ObjectMeta::named(scan.namespace(), name).with_labels(meta_labels);
    metadata.set_controller_owner(scan.as_owner());
    ConfigMap {
        metadata,
        data: Default::default(),
    }
}

/// Classifies a pod. Unschedulability is read once from the scheduling
/// condition and reported upward.
pub fn workload_state(pod: &Pod) -> WorkloadState {
    if let Some(message) = pod.unschedulable_message() {
        return WorkloadState::Unschedulable(message.to_string());
    }
    match pod.status.phase {
        PodPhase::Succeeded => WorkloadState::Succeeded,
        PodPhase::Failed => WorkloadState::Failed,
        PodPhase::Pending | PodPhase::Running | PodPhase::Unknown => WorkloadState::Running,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use complyd_model::{Node, PodCondition, PodStatus, ScanSpec};
    use complyd_model::cluster::{POD_SCHEDULED, REASON_UNSCHEDULABLE};

    use crate::store::InMemoryStore;

    fn manager() -> WorkloadManager {
        WorkloadManager::new(WorkloadImages::default(), ResultServerSettings::default())
    }

    fn scan() -> Scan {
        let spec = ScanSpec {
            profile: "xccdf_org.ssgproject.content_profile_moderate".into(),
            content: "ssg-rhcos4-ds.xml".into(),
            rule: Some("xccdf_org.ssgproject.content_rule_audit".into()),
            ..ScanSpec::default()
        };
        Scan::new("ns", "workers", spec)
    }

    fn node_target(name: &str) -> Target {
        Target::Node(Node {
            metadata: ObjectMeta::named("", name),
            ..Node::default()
        })
    }

    #[test]
    fn node_workload_is_pinned_and_mounts_host() {
        let pod = manager().scan_workload(&scan(), &node_target("node-1"));
        assert_eq!(pod.metadata.name, "workers-node-1-pod");
        assert_eq!(pod.spec.node_name.as_deref(), Some("node-1"));
        assert!(pod.spec.host_root);
        assert_eq!(
            pod.metadata.labels.get(labels::WORKLOAD).map(String::as_str),
            Some(labels::WORKLOAD_SCANNER)
        );
        let collector = &pod.spec.containers[0];
        assert!(collector
            .args
            .contains(&"--result-server-uri=https://workers-rs:8443/".to_string()));
        assert!(collector
            .args
            .contains(&"--report-name=workers-node-1-pod".to_string()));
    }

    #[test]
    fn env_config_contents() {
        let mut scan = scan();
        scan.spec.debug = true;
        let node_env = manager().env_config(&scan, ScanType::Node);
        assert_eq!(node_env.value("CONTENT"), Some("/content/ssg-rhcos4-ds.xml"));
        assert_eq!(node_env.value("REPORT_DIR"), Some("/reports"));
        assert_eq!(node_env.value("VERBOSITY"), Some("INFO"));
        assert_eq!(node_env.value("HOSTROOT"), Some("/host"));
        assert!(node_env.value("RULE").is_some());

        let platform_env = manager().env_config(&scan, ScanType::Platform);
        assert_eq!(platform_env.metadata.name, "workers-openscap-env-map-platform");
        assert!(platform_env.value("HOSTROOT").is_none());
    }

    #[test]
    fn unschedulable_condition_wins_over_phase() {
        let pod = Pod {
            status: PodStatus {
                phase: PodPhase::Pending,
                conditions: vec![PodCondition {
                    kind: POD_SCHEDULED.into(),
                    status: false,
                    reason: REASON_UNSCHEDULABLE.into(),
                    message: "node(s) were unschedulable".into(),
                }],
                message: String::new(),
            },
            ..Pod::default()
        };
        assert_eq!(
            workload_state(&pod),
            WorkloadState::Unschedulable("node(s) were unschedulable".into())
        );
    }

    #[tokio::test]
    async fn create_twice_is_idempotent() {
        let store = InMemoryStore::default();
        let manager = manager();
        let pod = manager.scan_workload(&scan(), &Target::Platform);
        manager.create(&store, &pod).await.expect("first create");
        manager.create(&store, &pod).await.expect("second create");
        let pods: Vec<Pod> = store
            .list(Some("ns"), &LabelSelector::new())
            .await
            .expect("list");
        assert_eq!(pods.len(), 1);
    }

    #[tokio::test]
    async fn unschedulable_workload_is_reported_as_error() {
        let store = InMemoryStore::default();
        let manager = manager();
        let target = node_target("node-1");
        let mut pod = manager.scan_workload(&scan(), &target);
        pod.status.conditions.push(PodCondition {
            kind: POD_SCHEDULED.into(),
            status: false,
            reason: REASON_UNSCHEDULABLE.into(),
            message: "0/1 nodes are available".into(),
        });
        store.create(&pod).await.expect("create");

        let err = manager
            .is_running(&store, &scan(), &target)
            .await
            .expect_err("unschedulable");
        assert!(matches!(err, CoreError::Unschedulable { .. }));
        assert!(manager
            .is_running(&store, &scan(), &node_target("node-2"))
            .await
            .expect("missing")
            .is_none());
    }
}
