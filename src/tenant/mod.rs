//! TenantRegistry: one small JSON record per tenant, with a TTL-bounded
//! in-memory cache backed by `moka`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, trace};

use crate::error::{PoolError, PoolResult};
use crate::model::{TenantId, TenantRecord, TenantStatus};

lazy_static! {
    static ref TENANT_ID_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9._-]{1,128}$").unwrap();
}

pub fn validate_tenant_id(id: &str) -> PoolResult<()> {
    if TENANT_ID_PATTERN.is_match(id) {
        Ok(())
    } else {
        Err(PoolError::InvalidTenantId(id.to_string()))
    }
}

pub struct TenantRegistry {
    tenant_directory: PathBuf,
    cache: moka::sync::Cache<TenantId, TenantRecord>,
    auto_create: bool,
}

impl TenantRegistry {
    pub fn new(tenant_directory: PathBuf, ttl: Duration, auto_create: bool) -> Self {
        let cache = moka::sync::Cache::builder().time_to_live(ttl).build();
        TenantRegistry {
            tenant_directory,
            cache,
            auto_create,
        }
    }

    fn record_path(&self, tenant_id: &TenantId) -> PathBuf {
        self.tenant_directory.join(format!("{}.json", tenant_id.0))
    }

    /// `getTenant(id)`: cached on hit; on miss loads from disk; if missing and
    /// auto-create is enabled, creates it and retries the load.
    pub async fn get_tenant(&self, tenant_id: &TenantId) -> PoolResult<TenantRecord> {
        if let Some(record) = self.cache.get(tenant_id) {
            trace!(tenant = %tenant_id, "tenant cache hit");
            return Ok(record);
        }

        match self.load_from_disk(tenant_id).await? {
            Some(record) => {
                self.cache.insert(tenant_id.clone(), record.clone());
                Ok(record)
            }
            None if self.auto_create => match self.create_tenant(tenant_id.clone()).await {
                Ok(created) => Ok(created),
                Err(PoolError::TenantAlreadyExists { .. }) => self
                    .load_from_disk(tenant_id)
                    .await?
                    .ok_or_else(|| PoolError::TenantNotFound {
                        tenant_id: tenant_id.clone(),
                    }),
                Err(e) => Err(e),
            },
            None => Err(PoolError::TenantNotFound {
                tenant_id: tenant_id.clone(),
            }),
        }
    }

    async fn load_from_disk(&self, tenant_id: &TenantId) -> PoolResult<Option<TenantRecord>> {
        let path = self.record_path(tenant_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let record: TenantRecord =
                    serde_json::from_slice(&bytes).map_err(|e| PoolError::Corruption(e.to_string()))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PoolError::IoFault(e)),
        }
    }

    /// Not idempotent: fails if the tenant already exists. Callers that want
    /// get-or-create semantics should check `get_tenant` first.
    pub async fn create_tenant(&self, tenant_id: TenantId) -> PoolResult<TenantRecord> {
        validate_tenant_id(&tenant_id.0)?;
        let path = self.record_path(&tenant_id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(PoolError::TenantAlreadyExists { tenant_id });
        }

        let record = TenantRecord::new(tenant_id.clone());
        self.write_record(&record).await?;
        self.cache.insert(tenant_id.clone(), record.clone());
        debug!(tenant = %tenant_id, "created tenant");
        Ok(record)
    }

    pub async fn set_status(&self, tenant_id: &TenantId, status: TenantStatus) -> PoolResult<TenantRecord> {
        let mut record = self
            .load_from_disk(tenant_id)
            .await?
            .ok_or_else(|| PoolError::TenantNotFound {
                tenant_id: tenant_id.clone(),
            })?;
        record.status = status;
        record.updated_at = chrono::Utc::now();
        self.write_record(&record).await?;
        self.cache.invalidate(tenant_id);
        Ok(record)
    }

    async fn write_record(&self, record: &TenantRecord) -> PoolResult<()> {
        tokio::fs::create_dir_all(&self.tenant_directory).await?;
        let path = self.record_path(&record.tenant_id);
        let temp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record).map_err(|e| PoolError::Corruption(e.to_string()))?;
        tokio::fs::write(&temp_path, bytes).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    pub fn tenant_directory(&self) -> &Path {
        &self.tenant_directory
    }
}
