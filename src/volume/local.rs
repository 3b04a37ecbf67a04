//! `LocalVolume`: the filesystem-backed `VolumeBackend`. Writes land via an
//! `.inserting` temp file that is renamed into place, so a reader never
//! observes a partial blob; the health canary retries up to 3 times with a
//! 100ms pause to tolerate networked filesystems.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use sysinfo::{DiskExt, System, SystemExt};
use tokio::fs::{create_dir_all, remove_file, rename, try_exists, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{shard_components, ByteStream, CountingStream, VolumeBackend};
use crate::error::{PoolError, PoolResult};
use crate::model::{FileKey, TenantId};
use crate::path_sanitizer;

/// Minimal consecutive-failure circuit breaker guarding the health canary: after
/// `TRIP_THRESHOLD` consecutive failures it opens for `COOLDOWN`, short-circuiting
/// further canary polls against a volume that is known to be down rather than
/// re-running three full retries every maintenance tick.
#[derive(Debug)]
struct HealthBreaker {
    consecutive_failures: AtomicU32,
    opened_at_epoch_ms: AtomicI64,
}

const TRIP_THRESHOLD: u32 = 3;
const COOLDOWN: Duration = Duration::from_secs(30);

impl HealthBreaker {
    fn new() -> Self {
        HealthBreaker {
            consecutive_failures: AtomicU32::new(0),
            opened_at_epoch_ms: AtomicI64::new(0),
        }
    }

    fn is_call_permitted(&self) -> bool {
        let opened_at = self.opened_at_epoch_ms.load(Ordering::Relaxed);
        if opened_at == 0 {
            return true;
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        now_ms - opened_at >= COOLDOWN.as_millis() as i64
    }

    fn on_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.opened_at_epoch_ms.store(0, Ordering::Relaxed);
    }

    fn on_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= TRIP_THRESHOLD {
            self.opened_at_epoch_ms
                .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        }
    }
}

#[derive(Debug)]
pub struct LocalVolume {
    volume_id: String,
    mount_path: PathBuf,
    sharding_depth: u8,
    breaker: HealthBreaker,
    system: Arc<Mutex<System>>,
}

impl LocalVolume {
    pub fn new(volume_id: String, mount_path: PathBuf, sharding_depth: u8) -> Self {
        LocalVolume {
            volume_id,
            mount_path,
            sharding_depth: sharding_depth.min(3),
            breaker: HealthBreaker::new(),
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    fn temp_path_for(&self, suffix: &str) -> PathBuf {
        self.mount_path.join(format!("{}.{}", Uuid::new_v4(), suffix))
    }

    /// The 3-retry/100ms-pause canary write-and-delete.
    async fn canary_once(&self) -> PoolResult<()> {
        if !try_exists(&self.mount_path).await.unwrap_or(false) {
            return Err(PoolError::IoFault(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "mount path does not exist",
            )));
        }

        let probe = self.temp_path_for("canary");
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&probe)
            .await?;
        file.write_all(b"canary").await?;
        drop(file);
        remove_file(&probe).await?;
        Ok(())
    }

    async fn canary_with_retries(&self) -> PoolResult<()> {
        let mut last_err = None;
        for attempt in 0..3u32 {
            match self.canary_once().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(volume = %self.volume_id, attempt, error = %e, "volume canary failed");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        Err(last_err.unwrap_or(PoolError::NoHealthyVolume))
    }
}

#[async_trait]
impl VolumeBackend for LocalVolume {
    fn volume_id(&self) -> &str {
        &self.volume_id
    }

    fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    fn sharding_depth(&self) -> u8 {
        self.sharding_depth
    }

    fn physical_path(&self, tenant_id: &TenantId, file_key: &FileKey) -> PathBuf {
        let mut path = self.mount_path.join(&tenant_id.0);
        for shard in shard_components(file_key, self.sharding_depth) {
            path.push(shard);
        }
        path.push(file_key.as_hex());
        path
    }

    async fn read(&self, path: &Path) -> PoolResult<ByteStream> {
        path_sanitizer::is_within(&self.mount_path, path).await?;
        trace!(path = %path.display(), "reading blob");
        let file = OpenOptions::new().read(true).open(path).await?;
        let stream = ReaderStream::new(file).map(|r| r.map_err(std::io::Error::from));
        Ok(Box::pin(stream))
    }

    async fn write(&self, path: &Path, data: ByteStream) -> PoolResult<i64> {
        path_sanitizer::is_within(&self.mount_path, path.parent().unwrap_or(path)).await?;

        if let Some(parent) = path.parent() {
            create_dir_all(parent).await?;
        }

        let temp_path = path.with_extension("inserting");
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;

        let (mut counted, counter) = CountingStream::new(data);
        while let Some(chunk) = counted.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        rename(&temp_path, path).await?;
        let written = counter.load(Ordering::Relaxed);
        debug!(path = %path.display(), written, "wrote blob");
        Ok(written)
    }

    async fn delete(&self, path: &Path) -> PoolResult<()> {
        match remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PoolError::IoFault(e)),
        }
    }

    async fn is_healthy(&self) -> bool {
        if !self.breaker.is_call_permitted() {
            return false;
        }
        match self.canary_with_retries().await {
            Ok(()) => {
                self.breaker.on_success();
                true
            }
            Err(_) => {
                self.breaker.on_failure();
                false
            }
        }
    }

    async fn total_capacity(&self) -> PoolResult<u64> {
        self.disk_stat(|d| d.total_space()).await
    }

    async fn available_space(&self) -> PoolResult<u64> {
        self.disk_stat(|d| d.available_space()).await
    }
}

impl LocalVolume {
    /// Resolves the mount's disk by matching the filesystem root of `mount_path`,
    /// falling back to drive-name equality.
    async fn disk_stat(&self, f: impl Fn(&sysinfo::Disk) -> u64 + Send + 'static) -> PoolResult<u64> {
        let mount_path = self.mount_path.clone();
        let system = self.system.clone();
        tokio::task::spawn_blocking(move || {
            let mut sys = system.lock();
            sys.refresh_disks_list();
            sys.refresh_disks();

            let mut best: Option<(usize, u64)> = None;
            for disk in sys.disks() {
                let mount_point = disk.mount_point();
                if mount_path.starts_with(mount_point) {
                    let specificity = mount_point.as_os_str().len();
                    if best.map_or(true, |(len, _)| specificity > len) {
                        best = Some((specificity, f(disk)));
                    }
                }
            }
            if let Some((_, value)) = best {
                return Ok(value);
            }
            // Fallback: drive-name equality against the first disk (portability shim
            // for platforms where mount-point prefix matching is unreliable).
            if let Some(disk) = sys.disks().first() {
                return Ok(f(disk));
            }
            Err(PoolError::IoFault(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no disk found for volume mount",
            )))
        })
        .await
        .map_err(|e| PoolError::IoFault(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}
