//! Object store port.
//!
//! The controller never talks to a concrete cluster API. Every read and write
//! goes through [`ObjectStore`], whose optimistic-concurrency contract
//! (`resource_version` mismatch ⇒ [`StoreError::Conflict`]) is the only
//! mutual-exclusion mechanism between concurrent writers.

mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use complyd_model::{LabelSelector, Labels, Object, ObjectKey, OwnerReference};

use crate::error::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Anything the store can persist.
pub trait StoredObject: Object + Serialize + DeserializeOwned {}

impl<T> StoredObject for T where T: Object + Serialize + DeserializeOwned {}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get<T: StoredObject>(&self, key: &ObjectKey) -> StoreResult<T>;

    /// Lists objects of one kind. `namespace = None` spans all namespaces.
    async fn list<T: StoredObject>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<T>>;

    /// Creates `obj`. Fails with `AlreadyExists` if the key is taken.
    async fn create<T: StoredObject>(&self, obj: &T) -> StoreResult<T>;

    /// Replaces metadata and spec. The stored status is kept.
    async fn update<T: StoredObject>(&self, obj: &T) -> StoreResult<T>;

    /// Replaces only the status of the stored object.
    async fn update_status<T: StoredObject>(&self, obj: &T) -> StoreResult<T>;

    /// Deletes the object, or marks it for deletion while finalizers remain.
    async fn delete<T: StoredObject>(&self, key: &ObjectKey) -> StoreResult<()>;

    /// Deletes every object of a kind matching `selector` in `namespace`.
    /// Returns how many were removed or marked.
    async fn delete_all_of<T: StoredObject>(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> StoreResult<usize> {
        let items: Vec<T> = self.list(Some(namespace), selector).await?;
        let mut deleted = 0;
        for item in items {
            match self.delete::<T>(&item.key()).await {
                Ok(()) => deleted += 1,
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(deleted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

/// Notification published after every successful write.
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub kind: &'static str,
    pub key: ObjectKey,
    pub change: ChangeType,
    pub labels: Labels,
    pub owner: Option<OwnerReference>,
}

/// Stream trait for store changes so generic runtimes can subscribe without
/// depending on a concrete store type.
pub trait ChangeFeed {
    fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange>;
}

/// Get that maps `NotFound` to `None`.
pub async fn get_opt<S, T>(store: &S, key: &ObjectKey) -> StoreResult<Option<T>>
where
    S: ObjectStore,
    T: StoredObject,
{
    match store.get::<T>(key).await {
        Ok(obj) => Ok(Some(obj)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Create that treats `AlreadyExists` as success. Returns whether a new
/// object was written.
pub async fn create_if_absent<S, T>(store: &S, obj: &T) -> StoreResult<bool>
where
    S: ObjectStore,
    T: StoredObject,
{
    match store.create(obj).await {
        Ok(_) => Ok(true),
        Err(err) if err.is_already_exists() => Ok(false),
        Err(err) => Err(err),
    }
}

/// Delete that treats `NotFound` as success. Returns whether anything was deleted.
pub async fn delete_if_present<S, T>(store: &S, key: &ObjectKey) -> StoreResult<bool>
where
    S: ObjectStore,
    T: StoredObject,
{
    match store.delete::<T>(key).await {
        Ok(()) => Ok(true),
        Err(err) if err.is_not_found() => Ok(false),
        Err(err) => Err(err),
    }
}
