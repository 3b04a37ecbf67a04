//! Recovery: detects corrupt per-tenant databases and rebuilds metadata from
//! the physical file tree and quota counts from directory enumeration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_recursion::async_recursion;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::PoolResult;
use crate::metadata::MetadataStore;
use crate::model::{FileKey, FileRecord, FileStatus, TenantId};
use crate::quota::QuotaStore;
use crate::volume::VolumeBackend;

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub backup_path: Option<PathBuf>,
    pub records_rebuilt: u64,
    pub errors: Vec<(PathBuf, String)>,
}

/// Verifies a tenant's metadata and quota databases by attempting to open
/// them and doing one structural scan; on corruption, snapshots the corrupt
/// file and rebuilds from the physical file tree.
pub async fn check_and_recover(
    tenant_id: &TenantId,
    metadata_directory: &Path,
    quota_directory: &Path,
    volumes: &[std::sync::Arc<dyn VolumeBackend>],
) -> PoolResult<RecoveryReport> {
    let metadata_path = metadata_directory.join(format!("{}.db", tenant_id.0));
    let quota_path = quota_directory.join(format!("{}-quotas.db", tenant_id.0));

    let metadata_ok = MetadataStore::open(tenant_id.clone(), metadata_directory)
        .and_then(|store| store.check_health())
        .is_ok();
    let quota_ok = QuotaStore::open(tenant_id.clone(), quota_directory)
        .and_then(|store| store.check_health())
        .is_ok();

    if metadata_ok && quota_ok {
        return Ok(RecoveryReport::default());
    }

    let mut report = RecoveryReport::default();

    if !metadata_ok {
        report.backup_path = snapshot_corrupt(&metadata_path).await;
        warn!(tenant = %tenant_id, "metadata store corrupt, rebuilding from physical tree");
    }
    if !quota_ok {
        snapshot_corrupt(&quota_path).await;
        warn!(tenant = %tenant_id, "quota store corrupt, rebuilding from directory enumeration");
    }

    let metadata = MetadataStore::open(tenant_id.clone(), metadata_directory)?;
    let quota = QuotaStore::open(tenant_id.clone(), quota_directory)?;

    // Directory counts only need reconstructing when the quota store itself was
    // corrupt; an intact quota store alongside a corrupt metadata store is left
    // untouched, since re-deriving it here would double-count every file already
    // reflected in its counters.
    let mut directory_counts: HashMap<String, i64> = HashMap::new();

    if !metadata_ok {
        for volume in volumes {
            let tenant_root = volume.mount_path().join(&tenant_id.0);
            if !tokio::fs::try_exists(&tenant_root).await.unwrap_or(false) {
                continue;
            }
            let mut files = Vec::new();
            walk_rec(&tenant_root, &mut files, &mut report.errors).await;

            for path in files {
                match rebuild_record(tenant_id, volume.volume_id(), &tenant_root, &path).await {
                    Ok(record) => {
                        let dir = record.directory_path.clone();
                        metadata.put_or_update(record)?;
                        *directory_counts.entry(dir).or_insert(0) += 1;
                        report.records_rebuilt += 1;
                    }
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "failed to rebuild record");
                        report.errors.push((path, e.to_string()));
                    }
                }
            }
        }
    } else if !quota_ok {
        // Metadata survived; derive directory counts from its active records
        // instead of re-walking every volume's physical tree.
        for record in metadata.all_active() {
            *directory_counts.entry(record.directory_path).or_insert(0) += 1;
        }
    }

    if !quota_ok {
        for (directory, count) in directory_counts {
            for _ in 0..count {
                quota.try_increment(&directory, 0)?;
            }
        }
    }

    info!(tenant = %tenant_id, rebuilt = report.records_rebuilt, "recovery complete");
    Ok(report)
}

async fn snapshot_corrupt(path: &Path) -> Option<PathBuf> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return None;
    }
    let mut file_name = path.file_name()?.to_os_string();
    file_name.push(format!(".corrupt-{}", Utc::now().timestamp()));
    let backup = path.with_file_name(file_name);
    match tokio::fs::rename(path, &backup).await {
        Ok(()) => Some(backup),
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to snapshot corrupt database");
            None
        }
    }
}

#[async_recursion]
async fn walk_rec(dir: &Path, out: &mut Vec<PathBuf>, errors: &mut Vec<(PathBuf, String)>) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) => {
            errors.push((dir.to_path_buf(), e.to_string()));
            return;
        }
    };
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(e)) => e,
            Ok(None) => break,
            Err(e) => {
                errors.push((dir.to_path_buf(), e.to_string()));
                break;
            }
        };
        let path = entry.path();
        match entry.file_type().await {
            Ok(t) if t.is_dir() => walk_rec(&path, out, errors).await,
            Ok(_) => out.push(path),
            Err(e) => errors.push((path, e.to_string())),
        }
    }
}

/// Infers `volumeId`/`directoryPath` from the path's position relative to
/// `tenant_root`: everything between the root and the filename is the shard
/// path, which also serves as the directory-path quota key.
async fn rebuild_record(
    tenant_id: &TenantId,
    volume_id: &str,
    tenant_root: &Path,
    path: &Path,
) -> PoolResult<FileRecord> {
    let meta = tokio::fs::metadata(path).await?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| crate::error::PoolError::Corruption(format!("non-UTF8 file name: {}", path.display())))?;
    let file_key = FileKey::from_hex(file_name)
        .map_err(|e| crate::error::PoolError::Corruption(format!("not a file key: {file_name}: {e}")))?;

    let relative_dir = path
        .parent()
        .and_then(|p| p.strip_prefix(tenant_root).ok())
        .map(|p| {
            if p.as_os_str().is_empty() {
                "/".to_string()
            } else {
                format!("/{}", p.to_string_lossy())
            }
        })
        .unwrap_or_else(|| "/".to_string());

    let created_at = meta
        .created()
        .or_else(|_| meta.modified())
        .map(chrono::DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    Ok(FileRecord {
        file_key,
        tenant_id: tenant_id.clone(),
        volume_id: volume_id.to_string(),
        physical_path: path.to_string_lossy().to_string(),
        directory_path: relative_dir,
        file_size: meta.len() as i64,
        status: FileStatus::Pending,
        retry_count: 0,
        available_at: None,
        processing_started_at: None,
        last_failed_at: None,
        last_error: None,
        created_at,
    })
}
