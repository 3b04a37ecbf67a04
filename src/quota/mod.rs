//! QuotaStore: per-tenant durable counters for directories plus a tenant total,
//! guarded by a lazily-created pool of mutexes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{PoolError, PoolResult};
use crate::model::{QuotaCounter, TenantId};

const TENANT_TOTAL_KEY: &str = "\0tenant-total";

pub enum QuotaOutcome {
    Ok,
    TenantQuotaExceeded { current: i64, limit: i64 },
    DirectoryQuotaExceeded { current: i64, limit: i64 },
}

pub struct QuotaStore {
    tenant_id: TenantId,
    db: sled::Db,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl QuotaStore {
    pub fn open(tenant_id: TenantId, quota_directory: &Path) -> PoolResult<Self> {
        let path = quota_directory.join(format!("{}-quotas.db", tenant_id.0));
        let db = sled::open(&path)?;
        Ok(QuotaStore {
            tenant_id,
            db,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn read_counter(&self, key: &str) -> PoolResult<QuotaCounter> {
        match self.db.get(key)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| PoolError::Corruption(e.to_string())),
            None => Ok(QuotaCounter::default()),
        }
    }

    fn write_counter(&self, key: &str, counter: QuotaCounter) -> PoolResult<()> {
        let bytes = serde_json::to_vec(&counter).map_err(|e| PoolError::Corruption(e.to_string()))?;
        self.db.insert(key, bytes)?;
        Ok(())
    }

    /// Atomically: if the limit would be exceeded, reject; otherwise increment.
    /// The tenant-level check runs before the directory check; acquired in that
    /// order, and a successful tenant increment is rolled back if the
    /// directory check then fails.
    pub fn try_increment(&self, directory: &str, default_limit: i64) -> PoolResult<QuotaOutcome> {
        let tenant_guard = self.lock_for(TENANT_TOTAL_KEY);
        let _tenant_lock = tenant_guard.lock();

        let mut tenant_counter = self.read_counter(TENANT_TOTAL_KEY)?;
        if tenant_counter.limit == 0 && default_limit != 0 && tenant_counter.current_count == 0 {
            // lazily adopt the configured default on first touch
            tenant_counter.limit = default_limit;
        }
        if !tenant_counter.has_room() {
            return Ok(QuotaOutcome::TenantQuotaExceeded {
                current: tenant_counter.current_count,
                limit: tenant_counter.limit,
            });
        }
        tenant_counter.current_count += 1;
        self.write_counter(TENANT_TOTAL_KEY, tenant_counter)?;

        let dir_guard = self.lock_for(directory);
        let _dir_lock = dir_guard.lock();

        let mut dir_counter = self.read_counter(directory)?;
        if !dir_counter.has_room() {
            // roll back the tenant-level increment
            tenant_counter.current_count -= 1;
            self.write_counter(TENANT_TOTAL_KEY, tenant_counter)?;
            return Ok(QuotaOutcome::DirectoryQuotaExceeded {
                current: dir_counter.current_count,
                limit: dir_counter.limit,
            });
        }
        dir_counter.current_count += 1;
        self.write_counter(directory, dir_counter)?;

        Ok(QuotaOutcome::Ok)
    }

    /// Roll back a tenant-level increment made by `try_increment` when a later
    /// step in the caller's write algorithm fails for an unrelated reason.
    pub fn rollback_tenant(&self) -> PoolResult<()> {
        let tenant_guard = self.lock_for(TENANT_TOTAL_KEY);
        let _lock = tenant_guard.lock();
        let mut counter = self.read_counter(TENANT_TOTAL_KEY)?;
        counter.current_count = (counter.current_count - 1).max(0);
        self.write_counter(TENANT_TOTAL_KEY, counter)
    }

    /// Saturating at zero; decrementing an unknown row is a no-op.
    pub fn decrement(&self, directory: &str) -> PoolResult<()> {
        let tenant_guard = self.lock_for(TENANT_TOTAL_KEY);
        {
            let _lock = tenant_guard.lock();
            let mut counter = self.read_counter(TENANT_TOTAL_KEY)?;
            counter.current_count = (counter.current_count - 1).max(0);
            self.write_counter(TENANT_TOTAL_KEY, counter)?;
        }

        let dir_guard = self.lock_for(directory);
        let _lock = dir_guard.lock();
        let mut counter = self.read_counter(directory)?;
        counter.current_count = (counter.current_count - 1).max(0);
        self.write_counter(directory, counter)
    }

    /// Read-only counter query; does not take the mutex.
    pub fn directory_count(&self, directory: &str) -> PoolResult<i64> {
        Ok(self.read_counter(directory)?.current_count)
    }

    pub fn tenant_count(&self) -> PoolResult<i64> {
        Ok(self.read_counter(TENANT_TOTAL_KEY)?.current_count)
    }

    pub fn set_directory_limit(&self, directory: &str, limit: i64) -> PoolResult<()> {
        let dir_guard = self.lock_for(directory);
        let _lock = dir_guard.lock();
        let mut counter = self.read_counter(directory)?;
        counter.limit = limit;
        self.write_counter(directory, counter)
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

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
