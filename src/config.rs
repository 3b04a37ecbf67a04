//! Immutable configuration object. Construction from a config file format is
//! out of scope; this struct is the one recognized shape, loadable via
//! `serde_json` by an embedder that wants to.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::TenantId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub volume_id: String,
    pub mount_path: PathBuf,
    /// 0..=3, default 2.
    pub sharding_depth: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retry_count: u32,
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    pub exponential_backoff: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retry_count: 3,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            exponential_backoff: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub metadata_directory: PathBuf,
    pub quota_directory: PathBuf,
    pub tenant_directory: PathBuf,
    pub volumes: Vec<VolumeConfig>,
    pub retry: RetryConfig,
    #[serde(with = "duration_secs")]
    pub processing_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub failed_retention: Duration,
    #[serde(with = "duration_secs")]
    pub maintenance_interval: Duration,
    pub enable_background_maintenance: bool,
    pub auto_create_tenants: bool,
    pub default_tenant_quota: i64,
    pub startup_health_check: bool,
    /// TTL for the `TenantRegistry` cache.
    #[serde(with = "duration_secs")]
    pub tenant_cache_ttl: Duration,
    /// Tenants to create eagerly during bootstrap; ambient wiring, not an engine behavior.
    pub pre_create_tenants: Vec<TenantId>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            metadata_directory: PathBuf::from("data/metadata"),
            quota_directory: PathBuf::from("data/quota"),
            tenant_directory: PathBuf::from("data/tenants"),
            volumes: Vec::new(),
            retry: RetryConfig::default(),
            processing_timeout: Duration::from_secs(30 * 60),
            failed_retention: Duration::from_secs(7 * 24 * 60 * 60),
            maintenance_interval: Duration::from_secs(60 * 60),
            enable_background_maintenance: true,
            auto_create_tenants: true,
            default_tenant_quota: 0,
            startup_health_check: true,
            tenant_cache_ttl: Duration::from_secs(300),
            pre_create_tenants: Vec::new(),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
