//! Bootstrap: wires every collaborator from a `PoolConfig`, runs the startup
//! health check, and surfaces failures as one of a small set of exit-code
//! bearing error kinds so `main.rs` can translate them directly.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::PoolConfig;
use crate::model::TenantId;
use crate::pool::StoragePool;
use crate::tenant::TenantRegistry;
use crate::volume::{LocalVolume, VolumeBackend};

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("startup health check found corrupt state: {0}")]
    StartupHealthCheck(String),

    #[error("volume mount unavailable: {0}")]
    MountUnavailable(String),
}

impl BootstrapError {
    /// Process exit code per the documented recognized-options policy: 0
    /// normal, 1 config error, 2 startup health check failure, 3 mount
    /// unavailable.
    pub fn exit_code(&self) -> i32 {
        match self {
            BootstrapError::Config(_) => 1,
            BootstrapError::StartupHealthCheck(_) => 2,
            BootstrapError::MountUnavailable(_) => 3,
        }
    }
}

pub struct Bootstrap;

impl Bootstrap {
    pub async fn run(config: PoolConfig) -> Result<StoragePool, BootstrapError> {
        if config.volumes.is_empty() {
            return Err(BootstrapError::Config("no volumes configured".to_string()));
        }

        let mut volumes: Vec<Arc<dyn VolumeBackend>> = Vec::with_capacity(config.volumes.len());
        for v in &config.volumes {
            if !tokio::fs::try_exists(&v.mount_path).await.unwrap_or(false) {
                return Err(BootstrapError::MountUnavailable(format!(
                    "{}: {}",
                    v.volume_id,
                    v.mount_path.display()
                )));
            }
            volumes.push(Arc::new(LocalVolume::new(
                v.volume_id.clone(),
                v.mount_path.clone(),
                v.sharding_depth,
            )));
        }

        let tenants = TenantRegistry::new(
            config.tenant_directory.clone(),
            config.tenant_cache_ttl,
            config.auto_create_tenants,
        );

        let pool = StoragePool::new(
            tenants,
            config.metadata_directory.clone(),
            config.quota_directory.clone(),
            volumes,
            config.default_tenant_quota,
            config.retry.clone(),
        );

        for tenant_id in &config.pre_create_tenants {
            pre_create_tenant(&pool, tenant_id).await?;
        }

        if config.startup_health_check {
            run_startup_health_check(&pool, &config).await?;
        }

        info!(volumes = config.volumes.len(), "pool bootstrap complete");
        Ok(pool)
    }
}

async fn pre_create_tenant(pool: &StoragePool, tenant_id: &TenantId) -> Result<(), BootstrapError> {
    match pool.tenants().create_tenant(tenant_id.clone()).await {
        Ok(_) => Ok(()),
        Err(crate::error::PoolError::TenantAlreadyExists { .. }) => Ok(()),
        Err(e) => Err(BootstrapError::Config(format!(
            "failed to pre-create tenant {tenant_id}: {e}"
        ))),
    }
}

/// Runs `recovery::check_and_recover` for every pre-created tenant, the only
/// tenants bootstrap knows about without scanning the tenant directory.
async fn run_startup_health_check(pool: &StoragePool, config: &PoolConfig) -> Result<(), BootstrapError> {
    let mut total_rebuilt = 0u64;
    for tenant_id in &config.pre_create_tenants {
        let report = crate::recovery::check_and_recover(
            tenant_id,
            pool.metadata_directory(),
            pool.quota_directory(),
            pool.volumes(),
        )
        .await
        .map_err(|e| BootstrapError::StartupHealthCheck(format!("{tenant_id}: {e}")))?;

        if !report.errors.is_empty() {
            warn!(tenant = %tenant_id, errors = report.errors.len(), "recovery completed with errors");
        }
        total_rebuilt += report.records_rebuilt;
    }
    if total_rebuilt > 0 {
        info!(total_rebuilt, "startup health check rebuilt records from corrupt state");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_mount_path_is_a_bootstrap_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PoolConfig {
            metadata_directory: dir.path().join("metadata"),
            quota_directory: dir.path().join("quota"),
            tenant_directory: dir.path().join("tenants"),
            ..PoolConfig::default()
        };
        config.volumes.push(crate::config::VolumeConfig {
            volume_id: "v1".to_string(),
            mount_path: dir.path().join("does-not-exist"),
            sharding_depth: 2,
        });

        let err = Bootstrap::run(config).await.unwrap_err();
        assert!(matches!(err, BootstrapError::MountUnavailable(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn no_volumes_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            metadata_directory: dir.path().join("metadata"),
            quota_directory: dir.path().join("quota"),
            tenant_directory: dir.path().join("tenants"),
            startup_health_check: false,
            ..PoolConfig::default()
        };
        let err = Bootstrap::run(config).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Config(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn successful_bootstrap_pre_creates_tenants() {
        let dir = tempfile::tempdir().unwrap();
        let volume_dir = dir.path().join("v1");
        tokio::fs::create_dir_all(&volume_dir).await.unwrap();
        let mut config = PoolConfig {
            metadata_directory: dir.path().join("metadata"),
            quota_directory: dir.path().join("quota"),
            tenant_directory: dir.path().join("tenants"),
            startup_health_check: false,
            ..PoolConfig::default()
        };
        config.volumes.push(crate::config::VolumeConfig {
            volume_id: "v1".to_string(),
            mount_path: volume_dir,
            sharding_depth: 2,
        });
        config.pre_create_tenants.push(TenantId("acme".to_string()));

        let pool = Bootstrap::run(config).await.unwrap();
        let record = pool.tenants().get_tenant(&TenantId("acme".to_string())).await.unwrap();
        assert_eq!(record.tenant_id, TenantId("acme".to_string()));
    }
}
