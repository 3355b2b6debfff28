use chrono::{DateTime, Utc};

use crate::meta::{impl_object, ObjectMeta, ObjectReference};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventType {
    #[default]
    Normal,
    Warning,
}

/// Operator-facing notice attached to an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct Event {
    pub metadata: ObjectMeta,
    pub involved_object: Option<ObjectReference>,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl_object!(Event, "Event");
