use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;

use complyd_model::{Event, EventType, Object, ObjectMeta, ScanResult, labels};

use crate::error::Result;

pub const REASON_RESULT_AVAILABLE: &str = "ResultAvailable";
pub const REASON_NOT_APPLICABLE: &str = "ScanNotApplicable";
pub const REASON_NOT_CONSISTENT: &str = "ScanNotConsistent";
pub const REASON_NO_MATCHING_NODES: &str = "NoMatchingNodes";
pub const REASON_UNSCHEDULABLE_NODE: &str = "UnschedulableNode";
pub const REASON_STORAGE_REJECTED: &str = "RawResultStorageRejected";

/// Sink for operator-facing events.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, event: Event) -> Result<()>;
}

/// Builds an event attached to `object`.
pub fn event_for<T: Object>(
    object: &T,
    event_type: EventType,
    reason: &str,
    message: impl Into<String>,
) -> Event {
    let involved = object.object_reference();
    Event {
        metadata: ObjectMeta::named(involved.namespace.clone(), format!("{}.{}", involved.name, reason)),
        involved_object: Some(involved),
        event_type,
        reason: reason.to_string(),
        message: message.into(),
        timestamp: Some(Utc::now()),
    }
}

/// Events emitted when a scan reaches a final result.
pub fn result_events<T: Object>(scan: &T, result: ScanResult) -> Vec<Event> {
    let mut events = vec![event_for(
        scan,
        EventType::Normal,
        REASON_RESULT_AVAILABLE,
        format!("ComplianceScan's result is: {result}"),
    )];
    match result {
        ScanResult::NotApplicable => events.push(event_for(
            scan,
            EventType::Normal,
            REASON_NOT_APPLICABLE,
            "The scan result is not applicable, please check if you're using the correct platform",
        )),
        ScanResult::Inconsistent => events.push(event_for(
            scan,
            EventType::Normal,
            REASON_NOT_CONSISTENT,
            format!(
                "The scan result is not consistent, please check for scan results labeled with {}",
                labels::CHECK_INCONSISTENT
            ),
        )),
        _ => {}
    }
    events
}

/// Lightweight in-process event bus that fans out controller events to
/// observers inside the process.
pub struct InProcEventBus {
    sender: broadcast::Sender<Event>,
    capacity: usize,
}

impl fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventRecorder for InProcEventBus {
    async fn record(&self, event: Event) -> Result<()> {
        tracing::info!(
            target: "scan::events",
            object = event.involved_object.as_ref().map(|o| o.name.as_str()).unwrap_or_default(),
            reason = %event.reason,
            kind = ?event.event_type,
            "{}",
            event.message
        );
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use complyd_model::{Scan, ScanSpec};

    #[tokio::test]
    async fn inconsistent_result_points_at_label() {
        let bus = InProcEventBus::new(8);
        let mut rx = bus.subscribe();
        let scan = Scan::new("ns", "workers", ScanSpec::default());
        for event in result_events(&scan, ScanResult::Inconsistent) {
            bus.record(event).await.expect("record");
        }
        let first = rx.recv().await.expect("first");
        assert_eq!(first.reason, REASON_RESULT_AVAILABLE);
        assert_eq!(first.message, "ComplianceScan's result is: INCONSISTENT");
        let second = rx.recv().await.expect("second");
        assert_eq!(second.reason, REASON_NOT_CONSISTENT);
        assert!(second.message.contains(labels::CHECK_INCONSISTENT));
    }

    #[test]
    fn compliant_result_emits_single_event() {
        let scan = Scan::new("ns", "workers", ScanSpec::default());
        assert_eq!(result_events(&scan, ScanResult::Compliant).len(), 1);
    }
}
