//! Volume: a mounted byte-addressable store, sharded by hex prefix of the `FileKey`.

mod local;
mod stream;

pub use local::LocalVolume;
pub use stream::CountingStream;

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;

use crate::error::PoolResult;
use crate::model::{FileKey, TenantId};

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Capability set a volume backend must provide. `LocalVolume` is the only
/// variant shipped today; a `NetworkVolume` would implement the same trait.
#[async_trait]
pub trait VolumeBackend: Send + Sync + std::fmt::Debug {
    fn volume_id(&self) -> &str;
    fn mount_path(&self) -> &std::path::Path;

    /// 0..=3. Maintenance only prunes now-empty directories when this is 0 —
    /// a sharded tree (depth > 0) is deliberately sparse and its directory
    /// skeleton is expected to stay in place between writes.
    fn sharding_depth(&self) -> u8;

    /// Builds the sharded physical path for `(tenant_id, file_key)` under this volume's
    /// mount, without touching the filesystem.
    fn physical_path(&self, tenant_id: &TenantId, file_key: &FileKey) -> PathBuf;

    async fn read(&self, path: &std::path::Path) -> PoolResult<ByteStream>;

    /// Writes `data` to `path` atomically and returns the number of bytes written.
    async fn write(&self, path: &std::path::Path, data: ByteStream) -> PoolResult<i64>;

    /// Deletes the file at `path`. A missing file is treated as success.
    async fn delete(&self, path: &std::path::Path) -> PoolResult<()>;

    async fn is_healthy(&self) -> bool;

    async fn total_capacity(&self) -> PoolResult<u64>;
    async fn available_space(&self) -> PoolResult<u64>;
}

/// Shard the lowercase hex rendering of `file_key` into `depth` 2-char directories.
/// Pads the last partial shard with `'0'` and stops; never overflows past `depth`.
pub fn shard_components(file_key: &FileKey, depth: u8) -> Vec<String> {
    let hex = file_key.as_hex();
    let hex_bytes = hex.as_bytes();
    let depth = depth.min(3) as usize;

    let mut components = Vec::with_capacity(depth);
    for i in 0..depth {
        let start = 2 * i;
        if start >= hex_bytes.len() {
            break;
        }
        let end = (start + 2).min(hex_bytes.len());
        let mut shard = hex[start..end].to_string();
        if shard.len() < 2 {
            shard.push('0');
        }
        components.push(shard);
    }
    components
}
