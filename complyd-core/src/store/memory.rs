use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use complyd_model::{LabelSelector, Object, ObjectKey};

use super::{ChangeFeed, ChangeType, ObjectStore, StoreChange, StoreResult, StoredObject};
use crate::error::StoreError;

type EntryKey = (&'static str, ObjectKey);

/// Objects are kept as JSON so one map can hold every kind and status can be
/// handled as a separate sub-resource.
#[derive(Default)]
struct State {
    objects: BTreeMap<EntryKey, Value>,
    next_version: u64,
    denied_creates: HashMap<&'static str, String>,
}

/// In-process [`ObjectStore`] with a broadcast change feed.
pub struct InMemoryStore {
    state: RwLock<State>,
    changes: broadcast::Sender<StoreChange>,
    change_capacity: usize,
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let object_count = self
            .state
            .try_read()
            .map(|state| state.objects.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryStore")
            .field("object_count", &object_count)
            .field("change_capacity", &self.change_capacity)
            .field("change_subscribers", &self.changes.receiver_count())
            .finish()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryStore {
    pub fn new(change_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(change_capacity);
        Self {
            state: RwLock::new(State {
                next_version: 1,
                ..State::default()
            }),
            changes,
            change_capacity,
        }
    }

    /// Makes every subsequent create of `T` fail with `Forbidden`, the way an
    /// exhausted quota would.
    pub async fn deny_creates<T: StoredObject>(&self, reason: impl Into<String>) {
        let mut state = self.state.write().await;
        state.denied_creates.insert(T::KIND, reason.into());
    }

    pub async fn allow_creates<T: StoredObject>(&self) {
        let mut state = self.state.write().await;
        state.denied_creates.remove(T::KIND);
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn publish<T: StoredObject>(&self, obj: &T, change: ChangeType) {
        let meta = obj.meta();
        let _ = self.changes.send(StoreChange {
            kind: T::KIND,
            key: obj.key(),
            change,
            labels: meta.labels.clone(),
            owner: meta.controller_owner().cloned(),
        });
    }

    fn decode<T: StoredObject>(value: &Value) -> StoreResult<T> {
        Ok(serde_json::from_value(value.clone())?)
    }

    fn encode<T: StoredObject>(obj: &T) -> StoreResult<Value> {
        let value = serde_json::to_value(obj)?;
        if !value.is_object() {
            return Err(StoreError::Invalid(format!(
                "{} did not serialize to an object",
                T::KIND
            )));
        }
        Ok(value)
    }

    fn not_found<T: StoredObject>(key: &ObjectKey) -> StoreError {
        StoreError::NotFound {
            kind: T::KIND,
            key: key.to_string(),
        }
    }

    fn check_version<T: StoredObject>(stored: &T, given: &T) -> StoreResult<()> {
        let current = stored.meta().resource_version;
        let given_version = given.meta().resource_version;
        if given_version != 0 && given_version != current {
            return Err(StoreError::Conflict {
                kind: T::KIND,
                key: given.key().to_string(),
                current,
                given: given_version,
            });
        }
        Ok(())
    }

    fn bump(state: &mut State) -> u64 {
        let version = state.next_version;
        state.next_version += 1;
        version
    }
}

/// Status subresource of a stored object. Scalar `status` fields (check
/// results) are plain data and travel with the spec.
fn status_of(value: &Value) -> Option<Value> {
    value
        .as_object()
        .and_then(|map| map.get("status"))
        .filter(|status| status.is_object())
        .cloned()
}

fn with_status(mut value: Value, status: Option<Value>) -> Value {
    if let (Some(map), Some(status)) = (value.as_object_mut(), status) {
        map.insert("status".to_string(), status);
    }
    value
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get<T: StoredObject>(&self, key: &ObjectKey) -> StoreResult<T> {
        let state = self.state.read().await;
        state
            .objects
            .get(&(T::KIND, key.clone()))
            .ok_or_else(|| Self::not_found::<T>(key))
            .and_then(Self::decode)
    }

    async fn list<T: StoredObject>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<T>> {
        let state = self.state.read().await;
        let mut out = Vec::new();
        for ((kind, key), value) in state.objects.iter() {
            if *kind != T::KIND {
                continue;
            }
            if namespace.is_some_and(|ns| ns != key.namespace) {
                continue;
            }
            let obj: T = Self::decode(value)?;
            if selector.matches(&obj.meta().labels) {
                out.push(obj);
            }
        }
        Ok(out)
    }

    async fn create<T: StoredObject>(&self, obj: &T) -> StoreResult<T> {
        let created = {
            let mut state = self.state.write().await;
            if let Some(reason) = state.denied_creates.get(T::KIND) {
                return Err(StoreError::Forbidden(reason.clone()));
            }
            let key = obj.key();
            if key.name.is_empty() {
                return Err(StoreError::Invalid(format!("{} without a name", T::KIND)));
            }
            if state.objects.contains_key(&(T::KIND, key.clone())) {
                return Err(StoreError::AlreadyExists {
                    kind: T::KIND,
                    key: key.to_string(),
                });
            }

            let mut created = obj.clone();
            let version = Self::bump(&mut state);
            let meta = created.meta_mut();
            meta.uid = Uuid::new_v4().to_string();
            meta.resource_version = version;
            meta.creation_timestamp = Some(Utc::now());
            meta.deletion_timestamp = None;

            let value = Self::encode(&created)?;
            state.objects.insert((T::KIND, key), value);
            created
        };
        self.publish(&created, ChangeType::Added);
        Ok(created)
    }

    async fn update<T: StoredObject>(&self, obj: &T) -> StoreResult<T> {
        let (updated, change) = {
            let mut state = self.state.write().await;
            let entry_key = (T::KIND, obj.key());
            let stored_value = state
                .objects
                .get(&entry_key)
                .ok_or_else(|| Self::not_found::<T>(&obj.key()))?;
            let stored: T = Self::decode(stored_value)?;
            Self::check_version(&stored, obj)?;
            let status = status_of(stored_value);

            let mut updated = obj.clone();
            let version = Self::bump(&mut state);
            {
                let meta = updated.meta_mut();
                let stored_meta = stored.meta();
                meta.uid = stored_meta.uid.clone();
                meta.creation_timestamp = stored_meta.creation_timestamp;
                meta.deletion_timestamp = stored_meta.deletion_timestamp;
                meta.resource_version = version;
            }

            let value = with_status(Self::encode(&updated)?, status);
            let updated: T = Self::decode(&value)?;

            // Last finalizer removed from an object already marked for deletion.
            if updated.meta().is_being_deleted() && updated.meta().finalizers.is_empty() {
                state.objects.remove(&entry_key);
                (updated, ChangeType::Deleted)
            } else {
                state.objects.insert(entry_key, value);
                (updated, ChangeType::Modified)
            }
        };
        self.publish(&updated, change);
        Ok(updated)
    }

    async fn update_status<T: StoredObject>(&self, obj: &T) -> StoreResult<T> {
        let updated = {
            let mut state = self.state.write().await;
            let entry_key = (T::KIND, obj.key());
            let stored_value = state
                .objects
                .get(&entry_key)
                .ok_or_else(|| Self::not_found::<T>(&obj.key()))?;
            let stored: T = Self::decode(stored_value)?;
            Self::check_version(&stored, obj)?;

            let incoming_status = status_of(&Self::encode(obj)?);
            let mut value = with_status(stored_value.clone(), incoming_status);
            let version = Self::bump(&mut state);
            if let Some(meta) = value
                .as_object_mut()
                .and_then(|map| map.get_mut("metadata"))
                .and_then(Value::as_object_mut)
            {
                meta.insert("resourceVersion".to_string(), Value::from(version));
            }
            let updated: T = Self::decode(&value)?;
            state.objects.insert(entry_key, value);
            updated
        };
        self.publish(&updated, ChangeType::Modified);
        Ok(updated)
    }

    async fn delete<T: StoredObject>(&self, key: &ObjectKey) -> StoreResult<()> {
        let (obj, change) = {
            let mut state = self.state.write().await;
            let entry_key = (T::KIND, key.clone());
            let stored_value = state
                .objects
                .get(&entry_key)
                .ok_or_else(|| Self::not_found::<T>(key))?;
            let mut obj: T = Self::decode(stored_value)?;

            if obj.meta().finalizers.is_empty() {
                state.objects.remove(&entry_key);
                (obj, ChangeType::Deleted)
            } else if obj.meta().is_being_deleted() {
                return Ok(());
            } else {
                let status = status_of(stored_value);
                let version = Self::bump(&mut state);
                let meta = obj.meta_mut();
                meta.deletion_timestamp = Some(Utc::now());
                meta.resource_version = version;
                let value = with_status(Self::encode(&obj)?, status);
                state.objects.insert(entry_key, value);
                (obj, ChangeType::Modified)
            }
        };
        self.publish(&obj, change);
        Ok(())
    }
}

impl ChangeFeed for InMemoryStore {
    fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
