//! Maintenance: a single cooperative background loop that reclaims timed-out
//! records, evicts aged permanent failures, sweeps junk files and orphans, and
//! asks the backing stores to compact. Driven by `tokio::time::interval` and
//! cancelled cooperatively via a `CancellationToken`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_recursion::async_recursion;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::PoolResult;
use crate::model::{FileStatus, TenantId};
use crate::pool::StoragePool;

/// Filenames a junk sweep removes outright; never touches directories.
const JUNK_ALLOW_LIST: &[&str] = &["Thumbs.db", ".DS_Store", "desktop.ini"];

pub struct MaintenanceConfig {
    pub interval: std::time::Duration,
    pub processing_timeout: chrono::Duration,
    pub failed_retention: chrono::Duration,
    /// Tenants the loop sweeps each tick; maintenance does not discover tenants on its own.
    pub tenants: Vec<TenantId>,
}

pub struct Maintenance {
    pool: Arc<StoragePool>,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(pool: Arc<StoragePool>, config: MaintenanceConfig) -> Self {
        Maintenance { pool, config }
    }

    /// Runs until `token` is cancelled. Steps within a tick are sequential;
    /// concurrent `StoragePool` traffic proceeds unaffected.
    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = token.cancelled() => {
                    info!("maintenance loop shutting down");
                    return;
                }
            }
        }
    }

    pub async fn tick(&self) {
        for tenant_id in &self.config.tenants {
            if let Err(e) = self.reclaim_timed_out(tenant_id) {
                warn!(tenant = %tenant_id, error = %e, "reclaim step failed");
            }
            if let Err(e) = self.evict_aged_permanent_failures(tenant_id).await {
                warn!(tenant = %tenant_id, error = %e, "eviction step failed");
            }
            if let Err(e) = self.sweep_junk_files(tenant_id).await {
                warn!(tenant = %tenant_id, error = %e, "junk sweep failed");
            }
            if let Err(e) = self.sweep_orphans(tenant_id).await {
                warn!(tenant = %tenant_id, error = %e, "orphan sweep failed");
            }
        }
        self.compact().await;
    }

    #[instrument(skip(self))]
    fn reclaim_timed_out(&self, tenant_id: &TenantId) -> PoolResult<()> {
        let count = self.pool.reclaim_timed_out(tenant_id, self.config.processing_timeout)?;
        if count > 0 {
            info!(tenant = %tenant_id, count, "reclaimed timed-out records");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn evict_aged_permanent_failures(&self, tenant_id: &TenantId) -> PoolResult<()> {
        let shard_records = self.pool.shard_for(tenant_id)?;
        let aged = shard_records
            .metadata
            .find_aged_permanent_failures(Utc::now(), self.config.failed_retention);

        let mut evicted = 0u64;
        for record in aged {
            if let Some(volume) = self.pool.volumes().iter().find(|v| v.volume_id() == record.volume_id) {
                volume.delete(Path::new(&record.physical_path)).await.ok();
            }
            shard_records.quota.decrement(&record.directory_path)?;
            shard_records.metadata.delete(&record.file_key)?;
            evicted += 1;
        }
        if evicted > 0 {
            info!(tenant = %tenant_id, evicted, "evicted aged permanent failures");
        }
        Ok(())
    }

    /// Removes a fixed allow-list of junk filenames from every volume under the
    /// tenant's prefix. On a `shardingDepth == 0` volume, also prunes directories
    /// left empty by that removal; deeper sharded trees are deliberately sparse
    /// and keep their directory skeleton between writes.
    #[instrument(skip(self))]
    async fn sweep_junk_files(&self, tenant_id: &TenantId) -> PoolResult<()> {
        for volume in self.pool.volumes() {
            let tenant_root = volume.mount_path().join(&tenant_id.0);
            if !tokio::fs::try_exists(&tenant_root).await.unwrap_or(false) {
                continue;
            }
            walk_and_remove_junk(&tenant_root).await;
            if volume.sharding_depth() == 0 {
                prune_empty_dirs(&tenant_root).await;
            }
        }
        Ok(())
    }

    /// Enumerates physical files under the tenant's prefix on every volume;
    /// deletes any file whose path is absent from the metadata store.
    #[instrument(skip(self))]
    async fn sweep_orphans(&self, tenant_id: &TenantId) -> PoolResult<()> {
        let shard_records = self.pool.shard_for(tenant_id)?;
        let known: HashSet<PathBuf> = shard_records
            .metadata
            .all_active()
            .into_iter()
            .filter(|r| r.status != FileStatus::Completed)
            .map(|r| PathBuf::from(r.physical_path))
            .collect();

        for volume in self.pool.volumes() {
            let tenant_root = volume.mount_path().join(&tenant_id.0);
            if !tokio::fs::try_exists(&tenant_root).await.unwrap_or(false) {
                continue;
            }
            let orphans = collect_orphans(&tenant_root, &known).await;
            for orphan in orphans {
                if let Err(e) = tokio::fs::remove_file(&orphan).await {
                    warn!(path = %orphan.display(), error = %e, "failed to delete orphan");
                } else {
                    info!(tenant = %tenant_id, path = %orphan.display(), "deleted orphan");
                }
            }
        }
        Ok(())
    }

    /// Requests the metadata/quota backends rebuild their on-disk representation.
    #[instrument(skip(self))]
    async fn compact(&self) {
        // sled compacts incrementally as part of normal operation; flush forces
        // any buffered writes out so the on-disk size reflects live data sooner.
        for tenant_id in &self.config.tenants {
            if let Ok(shard) = self.pool.shard_for(tenant_id) {
                if let Err(e) = shard.metadata.flush().await {
                    warn!(tenant = %tenant_id, error = %e, "metadata flush failed");
                }
                if let Err(e) = shard.quota.flush().await {
                    warn!(tenant = %tenant_id, error = %e, "quota flush failed");
                }
            }
        }
    }
}

async fn walk_and_remove_junk(dir: &Path) {
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(e) => e,
            Err(_) => continue,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                stack.push(path);
            } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if JUNK_ALLOW_LIST.contains(&name) {
                    tokio::fs::remove_file(&path).await.ok();
                }
            }
        }
    }
}

/// Removes `dir` itself if it has no entries left, without recursing into
/// still-occupied subdirectories; never touches `dir` itself (the caller
/// always passes a tenant root, and the tenant root is left standing even
/// when empty, since it is the attachment point the next write expects).
async fn prune_empty_dirs(tenant_root: &Path) {
    let mut entries = match tokio::fs::read_dir(tenant_root).await {
        Ok(e) => e,
        Err(_) => return,
    };
    let mut subdirs = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if matches!(entry.file_type().await, Ok(t) if t.is_dir()) {
            subdirs.push(entry.path());
        }
    }
    for dir in subdirs {
        prune_empty_dirs_rec(&dir).await;
    }
}

#[async_recursion]
async fn prune_empty_dirs_rec(dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(_) => return,
    };
    let mut subdirs = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if matches!(entry.file_type().await, Ok(t) if t.is_dir()) {
            subdirs.push(entry.path());
        }
    }
    for sub in subdirs {
        prune_empty_dirs_rec(&sub).await;
    }

    let is_empty = match tokio::fs::read_dir(dir).await {
        Ok(mut remaining) => remaining.next_entry().await.ok().flatten().is_none(),
        Err(_) => false,
    };
    if is_empty {
        tokio::fs::remove_dir(dir).await.ok();
    }
}

async fn collect_orphans(dir: &Path, known: &HashSet<PathBuf>) -> Vec<PathBuf> {
    let mut orphans = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(e) => e,
            Err(_) => continue,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                stack.push(path);
            } else if !known.contains(&path) {
                orphans.push(path);
            }
        }
    }
    orphans
}
