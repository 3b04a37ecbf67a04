use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::error::{PoolError, PoolResult};
use crate::model::{FileKey, FileRecord, FileStatus, TenantId};

/// Per-tenant durable metadata store. A tenant's records live in exactly one
/// `sled::Db` at `{metaRoot}/{tenantId}.db`. All mutations go through
/// `writer_lock`, which is this process's single-writer serialization point —
/// the same lock `claim_next_pending` uses, giving claims their linearizable
/// ordering.
pub struct MetadataStore {
    tenant_id: TenantId,
    db: sled::Db,
    /// Active-set cache: only records whose status is in
    /// `{Pending, Processing, Failed, PermanentlyFailed}` are ever present here.
    /// `Completed` records are deleted synchronously and never cached.
    cache: RwLock<HashMap<FileKey, FileRecord>>,
    /// Secondary ordered index over ready-pending records, rebuilt from the
    /// active-set cache on open; kept under `writer_lock` alongside every mutation
    /// so a claim never needs a full tree scan.
    pending_order: Mutex<BTreeSet<(DateTime<Utc>, FileKey)>>,
    writer_lock: Mutex<()>,
}

impl MetadataStore {
    pub fn open(tenant_id: TenantId, metadata_directory: &Path) -> PoolResult<Self> {
        let path = metadata_directory.join(format!("{}.db", tenant_id.0));
        let db = sled::open(&path)?;

        let mut cache = HashMap::new();
        let mut pending_order = BTreeSet::new();
        for entry in db.iter() {
            let (key_bytes, value_bytes) = entry?;
            let record: FileRecord = decode(&value_bytes)?;
            let key = decode_key(&key_bytes)?;
            if record.status == FileStatus::Pending {
                pending_order.insert(record.order_key());
            }
            if record.status != FileStatus::Completed {
                cache.insert(key, record);
            }
        }

        debug!(tenant = %tenant_id, loaded = cache.len(), "opened metadata store");

        Ok(MetadataStore {
            tenant_id,
            db,
            cache: RwLock::new(cache),
            pending_order: Mutex::new(pending_order),
            writer_lock: Mutex::new(()),
        })
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn put_or_update(&self, record: FileRecord) -> PoolResult<()> {
        let _guard = self.writer_lock.lock();
        self.persist_and_cache(record)
    }

    fn persist_and_cache(&self, record: FileRecord) -> PoolResult<()> {
        self.db.insert(record.file_key.0, encode(&record)?)?;

        let mut pending_order = self.pending_order.lock();
        pending_order.remove(&record.order_key());
        if record.status == FileStatus::Pending {
            pending_order.insert(record.order_key());
        }
        drop(pending_order);

        let mut cache = self.cache.write();
        if record.status == FileStatus::Completed {
            cache.remove(&record.file_key);
        } else {
            cache.insert(record.file_key, record);
        }
        Ok(())
    }

    pub fn get(&self, file_key: &FileKey) -> PoolResult<Option<FileRecord>> {
        if let Some(record) = self.cache.read().get(file_key) {
            return Ok(Some(record.clone()));
        }
        match self.db.get(file_key.0)? {
            Some(bytes) => {
                let record: FileRecord = decode(&bytes)?;
                if record.status != FileStatus::Completed {
                    self.cache.write().insert(*file_key, record.clone());
                }
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn delete(&self, file_key: &FileKey) -> PoolResult<()> {
        let _guard = self.writer_lock.lock();
        if let Some(old) = self.db.remove(file_key.0)? {
            let old: FileRecord = decode(&old)?;
            self.pending_order.lock().remove(&old.order_key());
        }
        self.cache.write().remove(file_key);
        Ok(())
    }

    /// Records with `status=Pending` and availability reached, oldest first.
    pub fn find_pending(&self, limit: usize, now: DateTime<Utc>) -> Vec<FileRecord> {
        let cache = self.cache.read();
        let order = self.pending_order.lock();
        order
            .iter()
            .filter_map(|(_, key)| cache.get(key))
            .filter(|r| r.is_ready(now))
            .take(limit)
            .cloned()
            .collect()
    }

    /// The serialization point for the queue: atomically transitions the
    /// oldest ready pending record to `Processing`.
    pub fn claim_next_pending(&self, now: DateTime<Utc>) -> PoolResult<Option<FileRecord>> {
        let _guard = self.writer_lock.lock();

        let candidate_key = {
            let cache = self.cache.read();
            let order = self.pending_order.lock();
            order
                .iter()
                .filter_map(|(_, key)| cache.get(key).map(|r| (r.clone(), *key)))
                .find(|(r, _)| r.is_ready(now))
                .map(|(r, _)| r)
        };

        let Some(mut record) = candidate_key else {
            return Ok(None);
        };

        record.status = FileStatus::Processing;
        record.processing_started_at = Some(now);
        self.persist_and_cache(record.clone())?;
        trace!(tenant = %self.tenant_id, file_key = %record.file_key, "claimed record");
        Ok(Some(record))
    }

    pub fn find_timed_out(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> Vec<FileRecord> {
        self.cache
            .read()
            .values()
            .filter(|r| {
                r.status == FileStatus::Processing
                    && r.processing_started_at
                        .map_or(false, |started| now - started > threshold)
            })
            .cloned()
            .collect()
    }

    pub fn find_aged_permanent_failures(
        &self,
        now: DateTime<Utc>,
        min_age: chrono::Duration,
    ) -> Vec<FileRecord> {
        self.cache
            .read()
            .values()
            .filter(|r| {
                r.status == FileStatus::PermanentlyFailed
                    && r.last_failed_at.map_or(false, |at| now - at > min_age)
            })
            .cloned()
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(FileStatus) -> bool) -> i64 {
        self.cache
            .read()
            .values()
            .filter(|r| predicate(r.status))
            .count() as i64
    }

    /// Every active record, for Recovery's rebuild-consistency comparisons (P7).
    pub fn all_active(&self) -> Vec<FileRecord> {
        self.cache.read().values().cloned().collect()
    }

    /// Best-effort structural health check: iterating the tree surfaces a
    /// `sled::Error` on corruption rather than silently succeeding.
    pub fn check_health(&self) -> PoolResult<()> {
        for entry in self.db.iter() {
            entry?;
        }
        Ok(())
    }

    /// Flushes buffered writes to disk so the on-disk tree reflects live data.
    pub async fn flush(&self) -> PoolResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

fn encode(record: &FileRecord) -> PoolResult<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| PoolError::Corruption(e.to_string()))
}

fn decode(bytes: &[u8]) -> PoolResult<FileRecord> {
    serde_json::from_slice(bytes).map_err(|e| PoolError::Corruption(e.to_string()))
}

fn decode_key(bytes: &[u8]) -> PoolResult<FileKey> {
    let array: [u8; 16] = bytes
        .try_into()
        .map_err(|_| PoolError::Corruption("malformed file key in metadata store".to_string()))?;
    Ok(FileKey(array))
}
