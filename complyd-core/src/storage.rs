//! Scan-scoped raw result storage claim.

use complyd_model::{
    Object, ObjectKey, ObjectMeta, Scan, StorageClaim, StorageClaimSpec, StorageReference, labels,
};

use crate::config::StorageDefaults;
use crate::error::{CoreError, Result};
use crate::naming;
use crate::store::{self, ObjectStore};

pub const STORAGE_REJECTED_PREFIX: &str = "Cannot create raw result storage: ";

/// Claim holding the raw results of `scan`, with defaults filled in.
pub fn storage_claim(scan: &Scan, defaults: &StorageDefaults) -> StorageClaim {
    let raw = &scan.spec.raw_result_storage;
    let mut meta_labels = scan.selector_labels();
    meta_labels.insert(labels::STORAGE_CLAIM.into(), String::new());
    let mut metadata = ObjectMeta::named(scan.namespace(), naming::storage_claim_name(scan.name()))
        .with_labels(meta_labels);
    metadata.set_controller_owner(scan.as_owner());

    StorageClaim {
        metadata,
        spec: StorageClaimSpec {
            size: if raw.size.is_empty() {
                defaults.size.clone()
            } else {
                raw.size.clone()
            },
            access_modes: if raw.access_modes.is_empty() {
                vec![defaults.access_mode.clone()]
            } else {
                raw.access_modes.clone()
            },
            storage_class_name: raw
                .storage_class_name
                .clone()
                .or_else(|| defaults.storage_class_name.clone()),
        },
        status: Default::default(),
    }
}

/// Creates the claim unless it exists and returns its reference.
///
/// A quota or admission rejection becomes a non-retriable error carrying
/// [`STORAGE_REJECTED_PREFIX`].
pub async fn ensure_claim<S: ObjectStore>(
    store: &S,
    scan: &Scan,
    defaults: &StorageDefaults,
) -> Result<StorageReference> {
    let claim = storage_claim(scan, defaults);
    match store::create_if_absent(store, &claim).await {
        Ok(created) => {
            if created {
                tracing::info!(
                    target: "scan::storage",
                    claim = %claim.key(),
                    size = %claim.spec.size,
                    "created raw result storage"
                );
            }
            Ok(StorageReference {
                name: claim.metadata.name,
                namespace: claim.metadata.namespace,
            })
        }
        Err(err) if err.is_forbidden() => Err(CoreError::non_retriable(format!(
            "{STORAGE_REJECTED_PREFIX}{err}"
        ))),
        Err(err) => Err(err.into()),
    }
}

pub async fn delete_claim<S: ObjectStore>(store: &S, scan: &Scan) -> Result<bool> {
    let key = ObjectKey::new(scan.namespace(), naming::storage_claim_name(scan.name()));
    Ok(store::delete_if_present::<_, StorageClaim>(store, &key).await?)
}
