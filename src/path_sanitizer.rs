//! Confine a candidate path to a base mount.
//!
//! Every physical path `blobpool` constructs for a volume passes through
//! [`is_within`] before a read/write/delete is attempted. A violation is a fatal
//! programming error — it is never reported to a caller as "not found".

use std::path::Path;

use tracing::error;

use crate::error::{PoolError, PoolResult};

/// Returns `Ok(())` if `candidate`, once both paths are canonicalized, is
/// contained within `base`. Both inputs must already exist on disk (or have
/// an existing parent, for a not-yet-created file) so that canonicalization can
/// resolve symlinks.
pub async fn is_within(base: &Path, candidate: &Path) -> PoolResult<()> {
    let base_canon = canonicalize_existing(base).await?;
    let candidate_canon = canonicalize_existing(candidate).await?;

    if candidate_canon.starts_with(&base_canon) {
        Ok(())
    } else {
        let msg = format!(
            "candidate path {} escapes base {}",
            candidate_canon.display(),
            base_canon.display()
        );
        error!(%msg, "path confinement violation");
        Err(PoolError::PathEscape(msg))
    }
}

/// Canonicalizes `path`, walking up to the nearest existing ancestor first if
/// `path` itself does not exist yet (the common case for a not-yet-written file).
async fn canonicalize_existing(path: &Path) -> PoolResult<std::path::PathBuf> {
    let mut candidate = path.to_path_buf();
    let mut suffix: Vec<std::ffi::OsString> = Vec::new();

    loop {
        match tokio::fs::canonicalize(&candidate).await {
            Ok(mut canon) => {
                for component in suffix.into_iter().rev() {
                    canon.push(component);
                }
                return Ok(canon);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let Some(file_name) = candidate.file_name().map(|n| n.to_os_string()) else {
                    return Err(PoolError::PathEscape(format!(
                        "no existing ancestor for {}",
                        path.display()
                    )));
                };
                suffix.push(file_name);
                if !candidate.pop() {
                    return Err(PoolError::PathEscape(format!(
                        "no existing ancestor for {}",
                        path.display()
                    )));
                }
            }
            Err(e) => return Err(PoolError::IoFault(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn within_base_succeeds_for_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        tokio::fs::create_dir_all(&nested).await.unwrap();
        let file = nested.join("blob.bin");
        tokio::fs::write(&file, b"x").await.unwrap();

        assert!(is_within(dir.path(), &file).await.is_ok());
    }

    #[tokio::test]
    async fn within_base_succeeds_for_not_yet_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        tokio::fs::create_dir_all(&nested).await.unwrap();
        let file = nested.join("not-yet-written.bin");

        assert!(is_within(dir.path(), &file).await.is_ok());
    }

    #[tokio::test]
    async fn escaping_base_is_rejected() {
        let base = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        tokio::fs::write(outside.path().join("x"), b"x").await.unwrap();

        let candidate = outside.path().join("x");
        assert!(is_within(base.path(), &candidate).await.is_err());
    }

    #[tokio::test]
    async fn traversal_via_dotdot_is_rejected() {
        let base = tempfile::tempdir().unwrap();
        let sub = base.path().join("tenant");
        tokio::fs::create_dir_all(&sub).await.unwrap();

        let escaping = sub.join("..").join("..");
        assert!(is_within(base.path(), &escaping).await.is_err());
    }
}
