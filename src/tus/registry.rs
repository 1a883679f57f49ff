//! Resource Registry
//!
//! Index of upload resources with:
//! - In-memory map behind an async `RwLock`, giving HEAD a consistent snapshot
//! - Per-resource locks for the single-writer rule
//! - Optional JSON sidecar records so uploads survive a restart
//! - Tombstones so requests on a deleted id report `Gone`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::locks::{LockArena, ResourceGuard};
use super::metadata::UploadMetadata;
use super::types::{ResourceId, TusError, UploadLength, UploadResource};

// ============================================================================
// Registry
// ============================================================================

/// Shared handle to the resource index
#[derive(Clone)]
pub struct ResourceRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    /// Live resources, expired-but-unswept included
    resources: RwLock<HashMap<ResourceId, UploadResource>>,

    /// Deleted ids and when they were deleted
    tombstones: RwLock<HashMap<ResourceId, DateTime<Utc>>>,

    locks: LockArena,

    /// Where sidecar records live; `None` keeps the registry in memory only
    records_dir: Option<PathBuf>,

    /// Lifetime given to new resources
    expiry: chrono::Duration,
}

impl ResourceRegistry {
    /// Create a registry that keeps nothing on disk
    pub fn in_memory(expiry: chrono::Duration) -> Self {
        Self::build(None, expiry, HashMap::new())
    }

    /// Open a durable registry, loading every record found in `dir`
    pub async fn open(dir: impl Into<PathBuf>, expiry: chrono::Duration) -> Result<Self, TusError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let resources = load_records(&dir).await?;
        tracing::info!(
            records = resources.len(),
            dir = %dir.display(),
            "Loaded upload registry"
        );

        Ok(Self::build(Some(dir), expiry, resources))
    }

    fn build(
        records_dir: Option<PathBuf>,
        expiry: chrono::Duration,
        resources: HashMap<ResourceId, UploadResource>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                resources: RwLock::new(resources),
                tombstones: RwLock::new(HashMap::new()),
                locks: LockArena::new(),
                records_dir,
                expiry,
            }),
        }
    }

    pub fn expiry(&self) -> chrono::Duration {
        self.inner.expiry
    }

    /// Wait for exclusive write access to `id`
    pub async fn lock(&self, id: &ResourceId) -> ResourceGuard {
        self.inner.locks.acquire(id).await
    }

    /// Ids currently locked or waited on
    pub fn active_locks(&self) -> usize {
        self.inner.locks.len()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Register a new resource.
    ///
    /// Generates an id when none is given. A colliding id is rejected unless
    /// `overwrite_allowed`, whatever the existing resource's state; expired
    /// records keep their id until the sweep removes them.
    pub async fn create(
        &self,
        id: Option<ResourceId>,
        length: UploadLength,
        metadata: UploadMetadata,
        overwrite_allowed: bool,
    ) -> Result<UploadResource, TusError> {
        let id = id.unwrap_or_else(ResourceId::generate);
        let resource = UploadResource::new(id.clone(), length, metadata, self.inner.expiry);

        let previous = {
            let mut resources = self.inner.resources.write().await;
            if resources.contains_key(&id) && !overwrite_allowed {
                return Err(TusError::AlreadyExists(id.to_string()));
            }
            resources.insert(id.clone(), resource.clone())
        };

        if let Err(e) = self.persist(&resource).await {
            let mut resources = self.inner.resources.write().await;
            match previous {
                Some(previous) => resources.insert(id, previous),
                None => resources.remove(&id),
            };
            return Err(e);
        }

        self.inner.tombstones.write().await.remove(&id);

        if previous.is_some() {
            tracing::info!(resource_id = %id, "Replaced existing upload resource");
        }

        Ok(resource)
    }

    /// Get a live resource. Absent and expired ids are both `NotFound`.
    pub async fn get(&self, id: &ResourceId) -> Result<UploadResource, TusError> {
        self.lookup(id)
            .await
            .filter(|r| !r.is_expired())
            .ok_or_else(|| TusError::NotFound(id.to_string()))
    }

    /// Raw snapshot, expired records included
    pub async fn lookup(&self, id: &ResourceId) -> Option<UploadResource> {
        let resources = self.inner.resources.read().await;
        resources.get(id).cloned()
    }

    /// Whether `id` was deleted or swept and not re-created since
    pub async fn was_deleted(&self, id: &ResourceId) -> bool {
        self.inner.tombstones.read().await.contains_key(id)
    }

    /// Move the offset of the guarded resource from `expected_offset` to `new_offset`
    pub async fn advance_offset(
        &self,
        guard: &ResourceGuard,
        expected_offset: u64,
        new_offset: u64,
    ) -> Result<UploadResource, TusError> {
        let id = guard.id();
        let mut resource = self
            .lookup(id)
            .await
            .ok_or_else(|| TusError::NotFound(id.to_string()))?;

        if resource.offset != expected_offset {
            return Err(TusError::OffsetMismatch {
                current: resource.offset,
                claimed: expected_offset,
            });
        }
        if new_offset < expected_offset {
            return Err(TusError::BadRequest(format!(
                "offset cannot move backwards from {expected_offset} to {new_offset}"
            )));
        }
        if let Some(total) = resource.length.known() {
            if new_offset > total {
                return Err(TusError::LengthExceeded {
                    attempted: new_offset,
                    limit: total,
                });
            }
        }

        resource.offset = new_offset;
        self.commit(resource).await
    }

    /// Fix the final length of a deferred-length resource.
    ///
    /// Re-declaring the same value is accepted; any other value is not.
    pub async fn declare_length(
        &self,
        guard: &ResourceGuard,
        total: u64,
    ) -> Result<UploadResource, TusError> {
        let id = guard.id();
        let mut resource = self
            .lookup(id)
            .await
            .ok_or_else(|| TusError::NotFound(id.to_string()))?;

        match resource.length {
            UploadLength::Known(existing) if existing == total => return Ok(resource),
            UploadLength::Known(existing) => {
                return Err(TusError::InvalidLength(format!(
                    "length already declared as {existing}"
                )))
            }
            UploadLength::Deferred => {}
        }

        if total < resource.offset {
            return Err(TusError::InvalidLength(format!(
                "declared length {total} is below current offset {}",
                resource.offset
            )));
        }

        resource.length = UploadLength::Known(total);
        let resource = self.commit(resource).await?;

        tracing::debug!(resource_id = %id, length = total, "Deferred length declared");
        Ok(resource)
    }

    /// Remove the guarded resource and leave a tombstone
    pub async fn delete(&self, guard: &ResourceGuard) -> Result<UploadResource, TusError> {
        let resource = self.discard(guard).await?;
        self.inner
            .tombstones
            .write()
            .await
            .insert(guard.id().clone(), Utc::now());
        Ok(resource)
    }

    /// Remove the guarded resource without a tombstone, as if never created
    pub async fn discard(&self, guard: &ResourceGuard) -> Result<UploadResource, TusError> {
        let id = guard.id();
        let resource = {
            let mut resources = self.inner.resources.write().await;
            resources
                .remove(id)
                .ok_or_else(|| TusError::NotFound(id.to_string()))?
        };

        self.remove_record(id).await?;
        Ok(resource)
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    /// Ids past their expiry, for the sweep
    pub async fn expired_ids(&self) -> Vec<ResourceId> {
        let now = Utc::now();
        let resources = self.inner.resources.read().await;
        resources
            .values()
            .filter(|r| r.expires_at < now)
            .map(|r| r.id.clone())
            .collect()
    }

    /// All unexpired resources, oldest first
    pub async fn list(&self) -> Vec<UploadResource> {
        let resources = self.inner.resources.read().await;
        let mut live: Vec<_> = resources
            .values()
            .filter(|r| !r.is_expired())
            .cloned()
            .collect();
        live.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        live
    }

    /// Every id in the index, expired included
    pub async fn ids(&self) -> Vec<ResourceId> {
        let resources = self.inner.resources.read().await;
        resources.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.resources.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Forget tombstones older than `age`
    ///
    /// Returns the number of tombstones dropped
    pub async fn prune_tombstones(&self, age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - age;
        let mut tombstones = self.inner.tombstones.write().await;
        let before = tombstones.len();
        tombstones.retain(|_, deleted_at| *deleted_at > cutoff);
        before - tombstones.len()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Persist then publish an updated record
    async fn commit(&self, resource: UploadResource) -> Result<UploadResource, TusError> {
        self.persist(&resource).await?;

        let mut resources = self.inner.resources.write().await;
        resources.insert(resource.id.clone(), resource.clone());
        Ok(resource)
    }

    async fn persist(&self, resource: &UploadResource) -> Result<(), TusError> {
        let Some(dir) = &self.inner.records_dir else {
            return Ok(());
        };

        let path = record_path(dir, &resource.id);
        let temp_path = dir.join(format!("{}.json.tmp", resource.id));
        let data = serde_json::to_vec_pretty(resource)?;

        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        fs::rename(&temp_path, &path).await?;

        Ok(())
    }

    async fn remove_record(&self, id: &ResourceId) -> Result<(), TusError> {
        let Some(dir) = &self.inner.records_dir else {
            return Ok(());
        };

        match fs::remove_file(record_path(dir, id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn record_path(dir: &Path, id: &ResourceId) -> PathBuf {
    dir.join(format!("{}.json", id))
}

async fn load_records(dir: &Path) -> Result<HashMap<ResourceId, UploadResource>, TusError> {
    let mut resources = HashMap::new();
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let data = fs::read(&path).await?;
        match serde_json::from_slice::<UploadResource>(&data) {
            Ok(resource) => {
                resources.insert(resource.id.clone(), resource);
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Skipping unreadable upload record"
                );
            }
        }
    }

    Ok(resources)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> ResourceRegistry {
        ResourceRegistry::in_memory(chrono::Duration::hours(1))
    }

    fn id(s: &str) -> ResourceId {
        ResourceId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_create_generates_id() {
        let registry = registry();
        let resource = registry
            .create(None, UploadLength::Known(10), UploadMetadata::default(), false)
            .await
            .unwrap();

        assert_eq!(resource.offset, 0);
        assert_eq!(registry.get(&resource.id).await.unwrap(), resource);
    }

    #[tokio::test]
    async fn test_create_rejects_collision_without_overwrite() {
        let registry = registry();
        registry
            .create(Some(id("report")), UploadLength::Known(10), UploadMetadata::default(), false)
            .await
            .unwrap();

        let result = registry
            .create(Some(id("report")), UploadLength::Known(20), UploadMetadata::default(), false)
            .await;
        assert!(matches!(result, Err(TusError::AlreadyExists(_))));

        let replaced = registry
            .create(Some(id("report")), UploadLength::Known(20), UploadMetadata::default(), true)
            .await
            .unwrap();
        assert_eq!(replaced.length, UploadLength::Known(20));
    }

    #[tokio::test]
    async fn test_advance_offset_guards() {
        let registry = registry();
        let resource = registry
            .create(None, UploadLength::Known(10), UploadMetadata::default(), false)
            .await
            .unwrap();
        let guard = registry.lock(&resource.id).await;

        let updated = registry.advance_offset(&guard, 0, 6).await.unwrap();
        assert_eq!(updated.offset, 6);

        let stale = registry.advance_offset(&guard, 0, 4).await;
        assert!(matches!(
            stale,
            Err(TusError::OffsetMismatch { current: 6, claimed: 0 })
        ));

        let too_far = registry.advance_offset(&guard, 6, 11).await;
        assert!(matches!(too_far, Err(TusError::LengthExceeded { .. })));

        assert_eq!(registry.get(&resource.id).await.unwrap().offset, 6);
    }

    #[tokio::test]
    async fn test_declare_length_is_immutable() {
        let registry = registry();
        let resource = registry
            .create(None, UploadLength::Deferred, UploadMetadata::default(), false)
            .await
            .unwrap();
        let guard = registry.lock(&resource.id).await;

        registry.advance_offset(&guard, 0, 5).await.unwrap();
        assert!(matches!(
            registry.declare_length(&guard, 4).await,
            Err(TusError::InvalidLength(_))
        ));

        let declared = registry.declare_length(&guard, 8).await.unwrap();
        assert_eq!(declared.length, UploadLength::Known(8));

        assert!(registry.declare_length(&guard, 8).await.is_ok());
        assert!(matches!(
            registry.declare_length(&guard, 9).await,
            Err(TusError::InvalidLength(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone() {
        let registry = registry();
        let resource = registry
            .create(Some(id("doomed")), UploadLength::Known(1), UploadMetadata::default(), false)
            .await
            .unwrap();

        let guard = registry.lock(&resource.id).await;
        registry.delete(&guard).await.unwrap();
        assert!(matches!(registry.delete(&guard).await, Err(TusError::NotFound(_))));
        drop(guard);
        assert_eq!(registry.active_locks(), 0);

        assert!(matches!(registry.get(&resource.id).await, Err(TusError::NotFound(_))));
        assert!(registry.was_deleted(&resource.id).await);

        // Explicit delete frees the id
        registry
            .create(Some(id("doomed")), UploadLength::Known(1), UploadMetadata::default(), false)
            .await
            .unwrap();
        assert!(!registry.was_deleted(&resource.id).await);
    }

    #[tokio::test]
    async fn test_expired_resource_keeps_id_until_removed() {
        let registry = ResourceRegistry::in_memory(chrono::Duration::milliseconds(10));
        let resource = registry
            .create(Some(id("stale")), UploadLength::Known(1), UploadMetadata::default(), false)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        assert!(matches!(registry.get(&resource.id).await, Err(TusError::NotFound(_))));
        assert!(registry.lookup(&resource.id).await.is_some());
        assert_eq!(registry.expired_ids().await, vec![resource.id.clone()]);
        assert!(registry.list().await.is_empty());

        let again = registry
            .create(Some(id("stale")), UploadLength::Known(1), UploadMetadata::default(), false)
            .await;
        assert!(matches!(again, Err(TusError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let expiry = chrono::Duration::hours(1);

        let mut metadata = UploadMetadata::default();
        metadata.insert("filename", Some(b"notes.txt".to_vec()));

        let created = {
            let registry = ResourceRegistry::open(temp_dir.path(), expiry).await.unwrap();
            let resource = registry
                .create(None, UploadLength::Known(100), metadata, false)
                .await
                .unwrap();
            let guard = registry.lock(&resource.id).await;
            registry.advance_offset(&guard, 0, 42).await.unwrap()
        };

        let reopened = ResourceRegistry::open(temp_dir.path(), expiry).await.unwrap();
        let loaded = reopened.get(&created.id).await.unwrap();
        assert_eq!(loaded, created);
        assert_eq!(loaded.metadata.get_str("filename"), Some("notes.txt"));
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let temp_dir = TempDir::new().unwrap();
        let expiry = chrono::Duration::hours(1);

        let registry = ResourceRegistry::open(temp_dir.path(), expiry).await.unwrap();
        let resource = registry
            .create(None, UploadLength::Known(1), UploadMetadata::default(), false)
            .await
            .unwrap();
        assert!(temp_dir.path().join(format!("{}.json", resource.id)).exists());

        let guard = registry.lock(&resource.id).await;
        registry.delete(&guard).await.unwrap();
        assert!(!temp_dir.path().join(format!("{}.json", resource.id)).exists());

        let reopened = ResourceRegistry::open(temp_dir.path(), expiry).await.unwrap();
        assert!(reopened.is_empty().await);
    }

    #[tokio::test]
    async fn test_unreadable_records_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("broken.json"), b"{not json").unwrap();
        std::fs::write(temp_dir.path().join("data.bin"), b"ignored").unwrap();

        let registry = ResourceRegistry::open(temp_dir.path(), chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_prune_tombstones() {
        let registry = registry();
        let resource = registry
            .create(None, UploadLength::Known(1), UploadMetadata::default(), false)
            .await
            .unwrap();
        let guard = registry.lock(&resource.id).await;
        registry.delete(&guard).await.unwrap();

        assert_eq!(registry.prune_tombstones(chrono::Duration::hours(1)).await, 0);
        assert_eq!(registry.prune_tombstones(chrono::Duration::zero()).await, 1);
        assert!(!registry.was_deleted(&resource.id).await);
    }
}
