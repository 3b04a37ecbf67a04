//! Structured error taxonomy. Internal APIs return `Result<T, PoolError>`;
//! `main.rs` and test helpers bridge to `anyhow` at the outer boundary.

use thiserror::Error;

use crate::model::{FileKey, TenantId};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("tenant not found: {tenant_id}")]
    TenantNotFound { tenant_id: TenantId },

    #[error("tenant disabled: {tenant_id}")]
    TenantDisabled { tenant_id: TenantId },

    #[error("tenant already exists: {tenant_id}")]
    TenantAlreadyExists { tenant_id: TenantId },

    #[error("invalid tenant id: {0:?}")]
    InvalidTenantId(String),

    #[error("tenant quota exceeded for {tenant_id}: {current}/{limit}")]
    TenantQuotaExceeded {
        tenant_id: TenantId,
        current: i64,
        limit: i64,
    },

    #[error("directory quota exceeded for {tenant_id}:{directory}: {current}/{limit}")]
    DirectoryQuotaExceeded {
        tenant_id: TenantId,
        directory: String,
        current: i64,
        limit: i64,
    },

    #[error("file not found: {file_key}")]
    NotFound { file_key: FileKey },

    #[error("no healthy volume available for write")]
    NoHealthyVolume,

    #[error("storage I/O fault: {0}")]
    IoFault(#[source] std::io::Error),

    #[error("metadata or quota database corruption detected: {0}")]
    Corruption(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("record {file_key} is not in Processing state")]
    AlreadyInProcessing { file_key: FileKey },

    /// Internal invariant violation: a constructed path escaped its volume mount.
    /// Never surfaced to a caller as `NotFound` — always a programming-error bug.
    #[error("path escapes volume mount: {0}")]
    PathEscape(String),
}

impl From<std::io::Error> for PoolError {
    fn from(e: std::io::Error) -> Self {
        PoolError::IoFault(e)
    }
}

impl From<sled::Error> for PoolError {
    fn from(e: sled::Error) -> Self {
        match e {
            sled::Error::Corruption { .. } => PoolError::Corruption(e.to_string()),
            sled::Error::Io(io) => PoolError::IoFault(io),
            other => PoolError::Corruption(other.to_string()),
        }
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
