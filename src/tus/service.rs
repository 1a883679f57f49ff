//! Protocol state machine
//!
//! Executes tus operations against the registry and the store:
//!
//! ```text
//! Created(offset=0) -> Uploading(0<offset<length) -> Completed(offset==length)
//!         \__________________ DELETE / expiry ___________________/
//!                                   |
//!                           Deleted / Expired
//! ```
//!
//! Every mutation runs under the resource's lock, and the registry offset
//! only moves after the store reports the bytes durable.

use std::sync::Arc;

use super::checksum::UploadChecksum;
use super::metadata::UploadMetadata;
use super::registry::ResourceRegistry;
use super::store::{ByteStream, LocalUploadStore, UploadStore};
use super::types::{
    PatchOutcome, ResourceId, ResourceStatus, TusError, UploadLength, UploadResource,
};
use crate::config::TusConfig;

/// Optional parts of a PATCH
#[derive(Debug, Clone, Default)]
pub struct PatchOptions {
    /// Final length for a deferred-length upload (`Upload-Length` on PATCH)
    pub declared_length: Option<u64>,

    /// Expected digest of the chunk (`Upload-Checksum`)
    pub checksum: Option<UploadChecksum>,
}

/// The tus engine: one per configured upload root
#[derive(Clone)]
pub struct TusService {
    inner: Arc<TusServiceInner>,
}

struct TusServiceInner {
    config: TusConfig,
    registry: ResourceRegistry,
    store: Arc<dyn UploadStore>,
}

impl TusService {
    pub fn new(config: TusConfig, registry: ResourceRegistry, store: Arc<dyn UploadStore>) -> Self {
        Self {
            inner: Arc::new(TusServiceInner {
                config,
                registry,
                store,
            }),
        }
    }

    /// Open a durable engine on `config.upload_path`: local store plus
    /// sidecar registry records in the same directory
    pub async fn open(config: TusConfig) -> Result<Self, TusError> {
        let store = LocalUploadStore::open(&config.upload_path).await?;
        let registry = ResourceRegistry::open(&config.upload_path, config.expiry()).await?;
        Ok(Self::new(config, registry, Arc::new(store)))
    }

    pub fn config(&self) -> &TusConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn UploadStore> {
        &self.inner.store
    }

    // ========================================================================
    // Protocol Operations
    // ========================================================================

    /// CREATE: register a resource at offset zero with an empty stream
    pub async fn create(
        &self,
        metadata: UploadMetadata,
        length: UploadLength,
        client_id: Option<ResourceId>,
    ) -> Result<UploadResource, TusError> {
        if let (Some(total), Some(max)) = (length.known(), self.inner.config.max_size) {
            if total > max {
                return Err(TusError::LengthExceeded {
                    attempted: total,
                    limit: max,
                });
            }
        }

        // Generated ids never collide, so overwriting only applies to caller ids
        let overwrite = client_id.is_some() && self.inner.config.allow_overwrite_files;
        let id = client_id.unwrap_or_else(ResourceId::generate);

        let registry = &self.inner.registry;
        let guard = registry.lock(&id).await;

        let resource = registry
            .create(Some(id.clone()), length, metadata, overwrite)
            .await?;

        if let Err(e) = self.inner.store.create(&id).await {
            tracing::error!(resource_id = %id, error = %e, "Failed to create upload stream");
            if let Err(rollback) = registry.discard(&guard).await {
                tracing::warn!(resource_id = %id, error = %rollback, "Failed to roll back upload record");
            }
            return Err(e);
        }

        tracing::info!(
            resource_id = %id,
            length = ?resource.length,
            metadata_keys = resource.metadata.len(),
            "Created upload resource"
        );

        Ok(resource)
    }

    /// PATCH: append `chunk` at `expected_offset`
    pub async fn patch(
        &self,
        id: &ResourceId,
        expected_offset: u64,
        chunk: &[u8],
    ) -> Result<PatchOutcome, TusError> {
        self.patch_with(id, expected_offset, chunk, PatchOptions::default())
            .await
    }

    /// PATCH with a deferred-length declaration and/or checksum
    pub async fn patch_with(
        &self,
        id: &ResourceId,
        expected_offset: u64,
        chunk: &[u8],
        options: PatchOptions,
    ) -> Result<PatchOutcome, TusError> {
        // Reject corrupt chunks before touching any state
        if let Some(checksum) = &options.checksum {
            checksum.verify(chunk)?;
        }

        let registry = &self.inner.registry;
        let guard = registry.lock(id).await;
        let resource = self.live_resource(id).await?;

        if resource.offset != expected_offset {
            tracing::debug!(
                resource_id = %id,
                current = resource.offset,
                claimed = expected_offset,
                "Offset mismatch"
            );
            return Err(TusError::OffsetMismatch {
                current: resource.offset,
                claimed: expected_offset,
            });
        }

        let chunk_len = chunk.len() as u64;
        let new_offset = resource.offset + chunk_len;

        // Validated now, recorded only once the bytes are durable
        let declared = match (options.declared_length, resource.length) {
            (Some(total), UploadLength::Deferred) => {
                self.check_max_size(total)?;
                if total < resource.offset {
                    return Err(TusError::InvalidLength(format!(
                        "declared length {total} is below current offset {}",
                        resource.offset
                    )));
                }
                Some(total)
            }
            (Some(total), UploadLength::Known(existing)) if total != existing => {
                return Err(TusError::InvalidLength(format!(
                    "length already declared as {existing}"
                )));
            }
            _ => None,
        };

        match declared.or(resource.length.known()) {
            Some(total) if new_offset > total => {
                return Err(TusError::LengthExceeded {
                    attempted: new_offset,
                    limit: total,
                });
            }
            Some(_) => {}
            None => self.check_max_size(new_offset)?,
        }

        if chunk.is_empty() {
            let resource = match declared {
                Some(total) => registry.declare_length(&guard, total).await?,
                None => resource,
            };
            return Ok(PatchOutcome {
                offset: resource.offset,
                completed: resource.is_complete(),
                expires_at: resource.expires_at,
            });
        }

        let store = &self.inner.store;
        let mut handle = store.open_for_append(id, resource.offset).await?;
        store.append(handle.as_mut(), chunk).await?;
        drop(handle);

        if let Some(total) = declared {
            registry.declare_length(&guard, total).await?;
        }
        let updated = registry
            .advance_offset(&guard, expected_offset, new_offset)
            .await?;
        drop(guard);

        let completed = updated.is_complete();
        tracing::debug!(
            resource_id = %id,
            offset = updated.offset,
            chunk_size = chunk_len,
            "Chunk appended"
        );
        if completed {
            tracing::info!(resource_id = %id, size = updated.offset, "Upload completed");
        }

        Ok(PatchOutcome {
            offset: updated.offset,
            completed,
            expires_at: updated.expires_at,
        })
    }

    /// HEAD: consistent snapshot of a resource, no lock taken
    pub async fn head(&self, id: &ResourceId) -> Result<ResourceStatus, TusError> {
        Ok(self.live_resource(id).await?.status())
    }

    /// DELETE: remove the resource and its stored bytes
    pub async fn delete(&self, id: &ResourceId) -> Result<(), TusError> {
        let registry = &self.inner.registry;
        let guard = registry.lock(id).await;

        registry.delete(&guard).await?;

        match self.inner.store.delete(id).await {
            Ok(()) | Err(TusError::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(resource_id = %id, error = %e, "Failed to delete upload stream");
            }
        }
        drop(guard);

        tracing::info!(resource_id = %id, "Upload resource deleted");
        Ok(())
    }

    /// Stream received bytes `start..end` of a live resource
    pub async fn read(&self, id: &ResourceId, start: u64, end: u64) -> Result<ByteStream, TusError> {
        let resource = self.live_resource(id).await?;
        if end > resource.offset {
            return Err(TusError::BadRequest(format!(
                "range end {end} beyond received offset {}",
                resource.offset
            )));
        }
        self.inner.store.read_range(id, start, end).await
    }

    /// Snapshots of every unexpired resource
    pub async fn list(&self) -> Vec<ResourceStatus> {
        self.inner
            .registry
            .list()
            .await
            .iter()
            .map(UploadResource::status)
            .collect()
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Remove expired resources and their bytes.
    ///
    /// Returns the number of resources removed. Failures are logged and the
    /// resource is left for the next sweep.
    pub async fn sweep_expired(&self) -> usize {
        let registry = &self.inner.registry;
        let mut count = 0;

        for id in registry.expired_ids().await {
            let guard = registry.lock(&id).await;

            // A concurrent overwrite may have replaced it while we waited
            match registry.lookup(&id).await {
                Some(resource) if resource.is_expired() => {}
                _ => continue,
            }

            if let Err(e) = registry.delete(&guard).await {
                tracing::warn!(resource_id = %id, error = %e, "Failed to remove expired upload");
                continue;
            }

            match self.inner.store.delete(&id).await {
                Ok(()) | Err(TusError::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(resource_id = %id, error = %e, "Failed to delete expired upload stream");
                }
            }

            drop(guard);
            count += 1;
            tracing::debug!(resource_id = %id, "Swept expired upload");
        }

        registry.prune_tombstones(registry.expiry()).await;

        if count > 0 {
            tracing::info!(count = count, "Swept expired uploads");
        }

        count
    }

    /// Compare every registered offset with the stored stream length.
    ///
    /// Drift is reported, not repaired here: a longer stream is truncated by
    /// the next append, a shorter one fails it.
    pub async fn check_integrity(&self) -> Vec<ResourceId> {
        let registry = &self.inner.registry;
        let mut drifted = Vec::new();

        for id in registry.ids().await {
            let _guard = registry.lock(&id).await;
            let Some(resource) = registry.lookup(&id).await else {
                continue;
            };

            match self.inner.store.total_length(&id).await {
                Ok(stored) if stored == resource.offset => {}
                Ok(stored) => {
                    tracing::warn!(
                        resource_id = %id,
                        registered = resource.offset,
                        stored = stored,
                        "Stored length differs from registered offset"
                    );
                    drifted.push(id.clone());
                }
                Err(e) => {
                    tracing::warn!(resource_id = %id, error = %e, "Upload stream unreadable");
                    drifted.push(id.clone());
                }
            }
        }

        drifted
    }

    /// Start background sweep task
    pub fn spawn_sweeper(self) -> tokio::task::JoinHandle<()> {
        let period = self.inner.config.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;
                self.sweep_expired().await;
            }
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Resource that may still be written or inspected: expired and deleted
    /// ids are `Gone`, unknown ids `NotFound`
    async fn live_resource(&self, id: &ResourceId) -> Result<UploadResource, TusError> {
        let registry = &self.inner.registry;
        match registry.lookup(id).await {
            Some(resource) if resource.is_expired() => Err(TusError::Gone(id.to_string())),
            Some(resource) => Ok(resource),
            None if registry.was_deleted(id).await => Err(TusError::Gone(id.to_string())),
            None => Err(TusError::NotFound(id.to_string())),
        }
    }

    fn check_max_size(&self, size: u64) -> Result<(), TusError> {
        match self.inner.config.max_size {
            Some(max) if size > max => Err(TusError::LengthExceeded {
                attempted: size,
                limit: max,
            }),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
