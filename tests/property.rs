use std::collections::HashSet;
use std::sync::Arc;

use blobpool::config::RetryConfig;
use blobpool::model::{FileKey, FileRecord, FileStatus, TenantId};
use blobpool::path_sanitizer;
use blobpool::quota::QuotaStore;
use proptest::prelude::*;

fn retry_config(max: u32) -> RetryConfig {
    RetryConfig {
        max_retry_count: max,
        initial_delay: std::time::Duration::from_millis(1),
        max_delay: std::time::Duration::from_secs(1),
        exponential_backoff: false,
    }
}

proptest! {
    /// P2: a directory's counter never exceeds its limit and every accepted
    /// increment has a matching decrement reflected in the counter.
    #[test]
    fn quota_conservation_under_mixed_increments_and_decrements(
        ops in proptest::collection::vec(any::<bool>(), 0..200),
        limit in 1i64..20,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = QuotaStore::open(TenantId("t1".to_string()), dir.path()).unwrap();
        store.set_directory_limit("/d", limit).unwrap();

        let mut shadow = 0i64;
        for increment in ops {
            if increment {
                match store.try_increment("/d", 0).unwrap() {
                    blobpool::quota::QuotaOutcome::Ok => shadow += 1,
                    blobpool::quota::QuotaOutcome::DirectoryQuotaExceeded { current, limit: l } => {
                        prop_assert_eq!(current, shadow);
                        prop_assert_eq!(l, limit);
                    }
                    blobpool::quota::QuotaOutcome::TenantQuotaExceeded { .. } => {
                        prop_assert!(false, "tenant limit is unset, should never trip");
                    }
                }
            } else if shadow > 0 {
                store.decrement("/d").unwrap();
                shadow -= 1;
            }
            prop_assert_eq!(store.directory_count("/d").unwrap(), shadow);
            prop_assert!(shadow <= limit);
            prop_assert!(shadow >= 0);
        }
    }

    /// P3: repeated failures on one record increase `retry_count` by exactly one
    /// per failure until the record is promoted to `PermanentlyFailed`, after
    /// which it never becomes claimable again.
    #[test]
    fn retry_count_increases_monotonically_until_permanent_failure(max_retries in 0u32..8) {
        let dir = tempfile::tempdir().unwrap();
        let tenant = TenantId("t1".to_string());
        let metadata = Arc::new(blobpool::metadata::MetadataStore::open(tenant.clone(), dir.path()).unwrap());
        let quota = Arc::new(QuotaStore::open(tenant.clone(), dir.path()).unwrap());
        quota.try_increment("/", 0).unwrap();

        let file_key = FileKey::new_random();
        metadata.put_or_update(FileRecord {
            file_key,
            tenant_id: tenant.clone(),
            volume_id: "v1".to_string(),
            physical_path: dir.path().join("blob").to_string_lossy().to_string(),
            directory_path: "/".to_string(),
            file_size: 1,
            status: FileStatus::Pending,
            retry_count: 0,
            available_at: None,
            processing_started_at: None,
            last_failed_at: None,
            last_error: None,
            created_at: chrono::Utc::now(),
        }).unwrap();

        let volumes = std::collections::HashMap::new();
        let scheduler = blobpool::queue::QueueScheduler::new(metadata.clone(), quota, volumes, retry_config(max_retries));

        let mut previous_retry_count = 0u32;
        for _ in 0..(max_retries + 3) {
            let Some(claimed) = scheduler.claim().unwrap() else {
                // Already permanently failed; nothing left to claim. Confirm it stays that way.
                prop_assert_eq!(scheduler.status(&file_key).unwrap(), Some(FileStatus::PermanentlyFailed));
                continue;
            };
            prop_assert_eq!(claimed.status, FileStatus::Processing);
            let after = scheduler.fail(&file_key, "synthetic failure").unwrap();
            prop_assert_eq!(after.retry_count, previous_retry_count + 1);
            previous_retry_count = after.retry_count;

            // `not-before` backoff is in the past immediately (initial_delay is 1ms),
            // but claim() only sees it once availability has actually arrived.
            std::thread::sleep(std::time::Duration::from_millis(5));

            if after.retry_count > max_retries {
                prop_assert_eq!(after.status, FileStatus::PermanentlyFailed);
            } else {
                prop_assert_eq!(after.status, FileStatus::Pending);
            }
        }
    }

    /// P6: any relative path built from arbitrary `..`/subdirectory components,
    /// once resolved against a fixed base, is accepted only if it textually stays
    /// inside the base after the `..` components cancel out.
    #[test]
    fn path_confinement_rejects_every_traversal_that_escapes_the_base(
        descend in 1usize..5,
        ascend in 0usize..8,
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let base = tempfile::tempdir().unwrap();
            let mut nested = base.path().to_path_buf();
            for i in 0..descend {
                nested.push(format!("level{i}"));
            }
            tokio::fs::create_dir_all(&nested).await.unwrap();

            let mut candidate = nested.clone();
            for _ in 0..ascend {
                candidate.push("..");
            }
            candidate.push("payload.bin");

            let result = path_sanitizer::is_within(base.path(), &candidate).await;
            if ascend > descend {
                prop_assert!(result.is_err());
            } else {
                prop_assert!(result.is_ok());
            }
            Ok(())
        })?;
    }
}

/// P1: concurrent `claim` calls against the same tenant never return the
/// same `fileKey` twice. Plain threads rather than `proptest!` since this is
/// about interleaving under real contention, not input-space exploration.
#[test]
fn concurrent_claims_never_double_deliver() {
    let dir = tempfile::tempdir().unwrap();
    let tenant = TenantId("t1".to_string());
    let metadata = Arc::new(blobpool::metadata::MetadataStore::open(tenant.clone(), dir.path()).unwrap());
    let quota = Arc::new(QuotaStore::open(tenant.clone(), dir.path()).unwrap());

    const TOTAL: usize = 300;
    for i in 0..TOTAL {
        quota.try_increment("/", 0).unwrap();
        metadata
            .put_or_update(FileRecord {
                file_key: FileKey::new_random(),
                tenant_id: tenant.clone(),
                volume_id: "v1".to_string(),
                physical_path: dir.path().join(format!("blob-{i}")).to_string_lossy().to_string(),
                directory_path: "/".to_string(),
                file_size: 1,
                status: FileStatus::Pending,
                retry_count: 0,
                available_at: None,
                processing_started_at: None,
                last_failed_at: None,
                last_error: None,
                created_at: chrono::Utc::now(),
            })
            .unwrap();
    }

    let volumes = std::collections::HashMap::new();
    let scheduler = Arc::new(blobpool::queue::QueueScheduler::new(
        metadata,
        quota,
        volumes,
        retry_config(3),
    ));

    let workers: Vec<_> = (0..20)
        .map(|_| {
            let scheduler = scheduler.clone();
            std::thread::spawn(move || {
                let mut claimed = Vec::new();
                loop {
                    match scheduler.claim().unwrap() {
                        Some(record) => claimed.push(record.file_key),
                        None => break,
                    }
                }
                claimed
            })
        })
        .collect();

    let mut all_claimed = Vec::new();
    for worker in workers {
        all_claimed.extend(worker.join().unwrap());
    }

    assert_eq!(all_claimed.len(), TOTAL);
    let unique: HashSet<_> = all_claimed.iter().collect();
    assert_eq!(unique.len(), TOTAL, "claim delivered a duplicate fileKey");
}

/// P7: running Recovery on an already-healthy tenant must not change its
/// metadata set at all.
#[tokio::test]
async fn recovery_on_healthy_tenant_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let meta_dir = dir.path().join("meta");
    let quota_dir = dir.path().join("quota");
    std::fs::create_dir_all(&meta_dir).unwrap();
    std::fs::create_dir_all(&quota_dir).unwrap();
    let tenant = TenantId("t1".to_string());

    let metadata = blobpool::metadata::MetadataStore::open(tenant.clone(), &meta_dir).unwrap();
    let quota = QuotaStore::open(tenant.clone(), &quota_dir).unwrap();
    quota.try_increment("/", 0).unwrap();
    let file_key = FileKey::new_random();
    metadata
        .put_or_update(FileRecord {
            file_key,
            tenant_id: tenant.clone(),
            volume_id: "v1".to_string(),
            physical_path: dir.path().join("blob").to_string_lossy().to_string(),
            directory_path: "/".to_string(),
            file_size: 1,
            status: FileStatus::Pending,
            retry_count: 0,
            available_at: None,
            processing_started_at: None,
            last_failed_at: None,
            last_error: None,
            created_at: chrono::Utc::now(),
        })
        .unwrap();
    let before: HashSet<_> = metadata
        .all_active()
        .into_iter()
        .map(|r| (r.file_key, r.physical_path))
        .collect();
    drop(metadata);
    drop(quota);

    let volumes: Vec<Arc<dyn blobpool::volume::VolumeBackend>> = Vec::new();
    let report = blobpool::recovery::check_and_recover(&tenant, &meta_dir, &quota_dir, &volumes)
        .await
        .unwrap();
    assert_eq!(report.records_rebuilt, 0);
    assert!(report.backup_path.is_none());

    let metadata = blobpool::metadata::MetadataStore::open(tenant.clone(), &meta_dir).unwrap();
    let after: HashSet<_> = metadata
        .all_active()
        .into_iter()
        .map(|r| (r.file_key, r.physical_path))
        .collect();
    assert_eq!(before, after);
}
