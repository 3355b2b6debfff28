//! Scan targets: the nodes a node scan runs on, or the single synthetic
//! control-plane target of a platform scan.

use complyd_model::{LabelSelector, Node, Scan, ScanType};

use crate::naming::PLATFORM_TARGET;
use crate::store::{ObjectStore, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Node(Node),
    Platform,
}

impl Target {
    /// Name used in workload and artifact identifiers.
    pub fn name(&self) -> &str {
        match self {
            Target::Node(node) => &node.metadata.name,
            Target::Platform => PLATFORM_TARGET,
        }
    }

    pub fn node_name(&self) -> Option<&str> {
        match self {
            Target::Node(node) => Some(&node.metadata.name),
            Target::Platform => None,
        }
    }

    pub fn is_unschedulable(&self) -> bool {
        matches!(self, Target::Node(node) if node.spec.unschedulable)
    }
}

/// Lists the targets of `scan`. Node scans match cluster nodes against the
/// effective node selector; platform scans always have exactly one target.
pub async fn resolve_targets<S: ObjectStore>(
    store: &S,
    scan: &Scan,
    scan_type: ScanType,
) -> StoreResult<Vec<Target>> {
    match scan_type {
        ScanType::Platform => Ok(vec![Target::Platform]),
        ScanType::Node => {
            let selector = LabelSelector::from(scan.spec.effective_node_selector());
            let mut nodes: Vec<Node> = store.list(None, &selector).await?;
            nodes.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
            Ok(nodes.into_iter().map(Target::Node).collect())
        }
    }
}
