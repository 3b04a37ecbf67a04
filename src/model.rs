//! Core data model shared by every component: tenants, file records and quota rows.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 128-bit opaque identifier for a stored blob, rendered as 32 lowercase hex chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileKey(#[serde(with = "hex_bytes")] pub [u8; 16]);

impl FileKey {
    pub fn new_random() -> Self {
        FileKey(*uuid::Uuid::new_v4().as_bytes())
    }

    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(FileKey(bytes))
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_hex())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 16], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(d)?;
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(&s, &mut bytes).map_err(serde::de::Error::custom)?;
        Ok(bytes)
    }
}

/// Tenant identifier: `[A-Za-z0-9._-]`, length 1..=128, validated at the registry boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantStatus {
    Enabled,
    Disabled,
    Suspended,
}

impl TenantStatus {
    pub fn is_enabled(self) -> bool {
        matches!(self, TenantStatus::Enabled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRecord {
    pub tenant_id: TenantId,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Logical path prefix used as the first path component under each volume mount.
    pub storage_path: String,
}

impl TenantRecord {
    pub fn new(tenant_id: TenantId) -> Self {
        let now = Utc::now();
        let storage_path = format!("storage/{}", tenant_id.0);
        TenantRecord {
            tenant_id,
            status: TenantStatus::Enabled,
            created_at: now,
            updated_at: now,
            storage_path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    PermanentlyFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_key: FileKey,
    pub tenant_id: TenantId,
    pub volume_id: String,
    pub physical_path: String,
    /// Logical key for quota accounting, defaults to "/".
    pub directory_path: String,
    pub file_size: i64,
    pub status: FileStatus,
    pub retry_count: u32,
    pub available_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    /// True if claimable right now: status is Pending and availability has arrived.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == FileStatus::Pending && self.available_at.map_or(true, |at| at <= now)
    }

    /// Tie-break ordering used by the scheduler: smallest (created_at, file_key) wins.
    pub fn order_key(&self) -> (DateTime<Utc>, FileKey) {
        (self.created_at, self.file_key)
    }
}

/// Wire shape for `info`/`location`: a trimmed summary of a `FileRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_key: FileKey,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub status: FileStatus,
}

impl From<&FileRecord> for FileInfo {
    fn from(r: &FileRecord) -> Self {
        FileInfo {
            file_key: r.file_key,
            size: r.file_size,
            created_at: r.created_at,
            status: r.status,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QuotaCounter {
    pub current_count: i64,
    /// 0 = unlimited.
    pub limit: i64,
}

impl QuotaCounter {
    pub fn has_room(&self) -> bool {
        self.limit <= 0 || self.current_count < self.limit
    }
}
