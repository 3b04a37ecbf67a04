//! StoragePool: the front door. Validates tenant and quota, picks a volume,
//! streams content to it, and registers metadata; delegates queue operations
//! to `QueueScheduler`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{PoolError, PoolResult};
use crate::metadata::MetadataStore;
use crate::model::{FileInfo, FileKey, FileRecord, FileStatus, TenantId};
use crate::quota::{QuotaOutcome, QuotaStore};
use crate::queue::QueueScheduler;
use crate::tenant::TenantRegistry;
use crate::volume::{ByteStream, VolumeBackend};

/// Per-tenant collaborators that together implement the active set: one
/// metadata store, one quota store, and a scheduler that wraps both.
pub(crate) struct TenantShard {
    pub(crate) metadata: Arc<MetadataStore>,
    pub(crate) quota: Arc<QuotaStore>,
    scheduler: QueueScheduler,
}

pub struct StoragePool {
    tenants: TenantRegistry,
    shards: parking_lot::RwLock<HashMap<TenantId, Arc<TenantShard>>>,
    metadata_directory: std::path::PathBuf,
    quota_directory: std::path::PathBuf,
    volumes: Vec<Arc<dyn VolumeBackend>>,
    default_tenant_quota: i64,
    retry: crate::config::RetryConfig,
}

impl StoragePool {
    pub fn new(
        tenants: TenantRegistry,
        metadata_directory: std::path::PathBuf,
        quota_directory: std::path::PathBuf,
        volumes: Vec<Arc<dyn VolumeBackend>>,
        default_tenant_quota: i64,
        retry: crate::config::RetryConfig,
    ) -> Self {
        StoragePool {
            tenants,
            shards: parking_lot::RwLock::new(HashMap::new()),
            metadata_directory,
            quota_directory,
            volumes,
            default_tenant_quota,
            retry,
        }
    }

    pub(crate) fn shard_for(&self, tenant_id: &TenantId) -> PoolResult<Arc<TenantShard>> {
        if let Some(shard) = self.shards.read().get(tenant_id) {
            return Ok(shard.clone());
        }

        let mut shards = self.shards.write();
        if let Some(shard) = shards.get(tenant_id) {
            return Ok(shard.clone());
        }

        let metadata = Arc::new(MetadataStore::open(tenant_id.clone(), &self.metadata_directory)?);
        let quota = Arc::new(QuotaStore::open(tenant_id.clone(), &self.quota_directory)?);
        let volumes: HashMap<String, Arc<dyn VolumeBackend>> = self
            .volumes
            .iter()
            .map(|v| (v.volume_id().to_string(), v.clone()))
            .collect();
        let scheduler = QueueScheduler::new(metadata.clone(), quota.clone(), volumes, self.retry.clone());

        let shard = Arc::new(TenantShard {
            metadata,
            quota,
            scheduler,
        });
        shards.insert(tenant_id.clone(), shard.clone());
        Ok(shard)
    }

    async fn require_enabled(&self, tenant_id: &TenantId) -> PoolResult<()> {
        let record = self.tenants.get_tenant(tenant_id).await?;
        if !record.status.is_enabled() {
            return Err(PoolError::TenantDisabled {
                tenant_id: tenant_id.clone(),
            });
        }
        Ok(())
    }

    /// Writes a new blob for `tenant_id` under logical `directory`, returning the
    /// assigned `FileKey`. Implements the write algorithm: tenant/quota checks,
    /// volume selection by largest free space, sharded placement, streamed write,
    /// metadata persistence — with quota rollback on every later failure.
    pub async fn write(
        &self,
        tenant_id: &TenantId,
        directory: &str,
        data: ByteStream,
    ) -> PoolResult<FileKey> {
        self.require_enabled(tenant_id).await?;
        let shard = self.shard_for(tenant_id)?;

        match shard.quota.try_increment(directory, self.default_tenant_quota)? {
            QuotaOutcome::Ok => {}
            QuotaOutcome::TenantQuotaExceeded { current, limit } => {
                return Err(PoolError::TenantQuotaExceeded {
                    tenant_id: tenant_id.clone(),
                    current,
                    limit,
                });
            }
            QuotaOutcome::DirectoryQuotaExceeded { current, limit } => {
                return Err(PoolError::DirectoryQuotaExceeded {
                    tenant_id: tenant_id.clone(),
                    directory: directory.to_string(),
                    current,
                    limit,
                });
            }
        }

        let volume = match self.select_volume().await {
            Some(v) => v,
            None => {
                shard.quota.rollback_tenant()?;
                shard.quota.decrement(directory)?;
                return Err(PoolError::NoHealthyVolume);
            }
        };

        let file_key = FileKey::new_random();
        let physical_path = volume.physical_path(tenant_id, &file_key);
        if let Some(parent) = physical_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }

        let write_result = volume.write(&physical_path, data).await;
        let file_size = match write_result {
            Ok(size) => size,
            Err(e) => {
                volume.delete(&physical_path).await.ok();
                shard.quota.rollback_tenant()?;
                shard.quota.decrement(directory)?;
                return Err(e);
            }
        };

        let record = FileRecord {
            file_key,
            tenant_id: tenant_id.clone(),
            volume_id: volume.volume_id().to_string(),
            physical_path: physical_path.to_string_lossy().to_string(),
            directory_path: directory.to_string(),
            file_size,
            status: FileStatus::Pending,
            retry_count: 0,
            available_at: None,
            processing_started_at: None,
            last_failed_at: None,
            last_error: None,
            created_at: Utc::now(),
        };
        shard.metadata.put_or_update(record)?;
        info!(tenant = %tenant_id, file_key = %file_key, volume = %volume.volume_id(), "wrote blob");
        Ok(file_key)
    }

    /// Largest-`availableSpace`-first among healthy volumes; ties broken by `volumeId`.
    async fn select_volume(&self) -> Option<Arc<dyn VolumeBackend>> {
        let mut best: Option<(u64, Arc<dyn VolumeBackend>)> = None;
        for volume in &self.volumes {
            if !volume.is_healthy().await {
                continue;
            }
            let available = match volume.available_space().await {
                Ok(a) => a,
                Err(_) => continue,
            };
            if available == 0 {
                continue;
            }
            let replace = match &best {
                None => true,
                Some((best_available, best_volume)) => {
                    available > *best_available
                        || (available == *best_available && volume.volume_id() < best_volume.volume_id())
                }
            };
            if replace {
                best = Some((available, volume.clone()));
            }
        }
        best.map(|(_, v)| v)
    }

    /// Tenant must own the record; a cross-tenant lookup is indistinguishable
    /// from a missing one.
    pub async fn read(&self, tenant_id: &TenantId, file_key: &FileKey) -> PoolResult<ByteStream> {
        self.require_enabled(tenant_id).await?;
        let shard = self.shard_for(tenant_id)?;
        let record = self.owned_record(&shard, tenant_id, file_key)?;
        let volume = self.volume_by_id(&record.volume_id)?;
        volume.read(Path::new(&record.physical_path)).await
    }

    pub async fn info(&self, tenant_id: &TenantId, file_key: &FileKey) -> PoolResult<Option<FileInfo>> {
        self.require_enabled(tenant_id).await?;
        let shard = self.shard_for(tenant_id)?;
        Ok(shard
            .metadata
            .get(file_key)?
            .filter(|r| &r.tenant_id == tenant_id)
            .as_ref()
            .map(FileInfo::from))
    }

    pub async fn location(&self, tenant_id: &TenantId, file_key: &FileKey) -> PoolResult<Option<FileRecord>> {
        self.require_enabled(tenant_id).await?;
        let shard = self.shard_for(tenant_id)?;
        Ok(shard.metadata.get(file_key)?.filter(|r| &r.tenant_id == tenant_id))
    }

    fn owned_record(
        &self,
        shard: &TenantShard,
        tenant_id: &TenantId,
        file_key: &FileKey,
    ) -> PoolResult<FileRecord> {
        shard
            .metadata
            .get(file_key)?
            .filter(|r| &r.tenant_id == tenant_id)
            .ok_or(PoolError::NotFound { file_key: *file_key })
    }

    fn volume_by_id(&self, volume_id: &str) -> PoolResult<Arc<dyn VolumeBackend>> {
        self.volumes
            .iter()
            .find(|v| v.volume_id() == volume_id)
            .cloned()
            .ok_or(PoolError::NoHealthyVolume)
    }

    pub fn claim(&self, tenant_id: &TenantId) -> PoolResult<Option<FileRecord>> {
        self.shard_for(tenant_id)?.scheduler.claim()
    }

    pub fn claim_batch(&self, tenant_id: &TenantId, n: usize) -> PoolResult<Vec<FileRecord>> {
        self.shard_for(tenant_id)?.scheduler.claim_batch(n)
    }

    pub async fn complete(&self, tenant_id: &TenantId, file_key: &FileKey) -> PoolResult<()> {
        self.shard_for(tenant_id)?.scheduler.complete(file_key).await
    }

    pub fn fail(&self, tenant_id: &TenantId, file_key: &FileKey, error_message: &str) -> PoolResult<FileRecord> {
        self.shard_for(tenant_id)?.scheduler.fail(file_key, error_message)
    }

    pub fn status(&self, tenant_id: &TenantId, file_key: &FileKey) -> PoolResult<Option<FileStatus>> {
        self.shard_for(tenant_id)?.scheduler.status(file_key)
    }

    pub fn reclaim_timed_out(&self, tenant_id: &TenantId, threshold: chrono::Duration) -> PoolResult<usize> {
        self.shard_for(tenant_id)?.scheduler.reclaim_timed_out(threshold)
    }

    pub async fn total_capacity(&self) -> u64 {
        let mut total = 0u64;
        for volume in &self.volumes {
            match volume.total_capacity().await {
                Ok(c) => total += c,
                Err(e) => warn!(volume = %volume.volume_id(), error = %e, "capacity query failed"),
            }
        }
        total
    }

    pub async fn available_space(&self) -> u64 {
        let mut total = 0u64;
        for volume in &self.volumes {
            if !volume.is_healthy().await {
                continue;
            }
            match volume.available_space().await {
                Ok(a) => total += a,
                Err(e) => warn!(volume = %volume.volume_id(), error = %e, "free-space query failed"),
            }
        }
        total
    }

    pub fn volumes(&self) -> &[Arc<dyn VolumeBackend>] {
        &self.volumes
    }

    pub fn tenants(&self) -> &TenantRegistry {
        &self.tenants
    }

    pub fn metadata_directory(&self) -> &Path {
        &self.metadata_directory
    }

    pub fn quota_directory(&self) -> &Path {
        &self.quota_directory
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use bytes::Bytes;
    use futures::stream;

    use super::*;
    use crate::config::RetryConfig;
    use crate::volume::LocalVolume;

    fn mk_pool(dir: &std::path::Path) -> StoragePool {
        let tenants = TenantRegistry::new(dir.join("tenants"), StdDuration::from_secs(300), true);
        let volume: Arc<dyn VolumeBackend> =
            Arc::new(LocalVolume::new("v1".to_string(), dir.join("v1"), 2));
        std::fs::create_dir_all(dir.join("v1")).unwrap();
        StoragePool::new(
            tenants,
            dir.join("metadata"),
            dir.join("quota"),
            vec![volume],
            0,
            RetryConfig::default(),
        )
    }

    #[tokio::test]
    async fn write_then_read_then_complete_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let pool = mk_pool(dir.path());
        let tenant = TenantId("t1".to_string());

        let chunks: Vec<std::io::Result<Bytes>> = vec![Ok(Bytes::from_static(b"hello"))];
        let key = pool.write(&tenant, "/", Box::pin(stream::iter(chunks))).await.unwrap();

        let info = pool.info(&tenant, &key).await.unwrap().unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(info.status, FileStatus::Pending);

        let claimed = pool.claim(&tenant).unwrap().unwrap();
        assert_eq!(claimed.file_key, key);

        pool.complete(&tenant, &key).await.unwrap();
        assert!(pool.info(&tenant, &key).await.unwrap().is_none());

        let shard = pool.shard_for(&tenant).unwrap();
        assert_eq!(shard.quota.directory_count("/").unwrap(), 0);
    }

    #[tokio::test]
    async fn cross_tenant_read_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let pool = mk_pool(dir.path());
        let owner = TenantId("owner".to_string());
        let other = TenantId("other".to_string());

        let chunks: Vec<std::io::Result<Bytes>> = vec![Ok(Bytes::from_static(b"secret"))];
        let key = pool.write(&owner, "/", Box::pin(stream::iter(chunks))).await.unwrap();

        let err = pool.read(&other, &key).await.unwrap_err();
        assert!(matches!(err, PoolError::NotFound { .. }));
    }

    #[tokio::test]
    async fn write_against_disabled_tenant_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = mk_pool(dir.path());
        let tenant = TenantId("t1".to_string());
        pool.tenants.create_tenant(tenant.clone()).await.unwrap();
        pool.tenants
            .set_status(&tenant, crate::model::TenantStatus::Disabled)
            .await
            .unwrap();

        let chunks: Vec<std::io::Result<Bytes>> = vec![Ok(Bytes::from_static(b"x"))];
        let err = pool.write(&tenant, "/", Box::pin(stream::iter(chunks))).await.unwrap_err();
        assert!(matches!(err, PoolError::TenantDisabled { .. }));
    }

    #[tokio::test]
    async fn directory_quota_exceeded_rolls_back_tenant_counter() {
        let dir = tempfile::tempdir().unwrap();
        let pool = mk_pool(dir.path());
        let tenant = TenantId("t1".to_string());
        let shard = pool.shard_for(&tenant).unwrap();
        shard.quota.set_directory_limit("/full", 1).unwrap();
        shard.quota.try_increment("/full", 0).unwrap();

        let chunks: Vec<std::io::Result<Bytes>> = vec![Ok(Bytes::from_static(b"x"))];
        let err = pool
            .write(&tenant, "/full", Box::pin(stream::iter(chunks)))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::DirectoryQuotaExceeded { .. }));
        assert_eq!(shard.quota.tenant_count().unwrap(), 1);
    }
}
