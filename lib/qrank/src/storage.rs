//! The object-storage seam.
//!
//! The pipeline itself never talks to the network; it only needs the two
//! capabilities below. The production S3 client lives with the deployment,
//! while [`FsStorage`] backs tests and local runs. Uploads are idempotent:
//! an object that already exists counts as uploaded.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const BUCKET: &str = "qrank";

/// Access credentials, read from a JSON key file with `Endpoint`, `Key`
/// and `Secret` fields, or from `S3_ENDPOINT`/`S3_KEY`/`S3_SECRET` when no
/// key file is given.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "Endpoint")]
    pub endpoint: String,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Secret")]
    pub secret: String,
}

impl StorageConfig {
    pub fn load(keypath: Option<&Path>) -> Result<StorageConfig> {
        match keypath {
            Some(path) => {
                let data = fs::read(path)
                    .with_context(|| format!("read storage key {}", path.display()))?;
                let config: StorageConfig = serde_json::from_slice(&data)
                    .with_context(|| format!("parse storage key {}", path.display()))?;
                Ok(config)
            }
            None => Ok(StorageConfig {
                endpoint: std::env::var("S3_ENDPOINT").unwrap_or_default(),
                key: std::env::var("S3_KEY").unwrap_or_default(),
                secret: std::env::var("S3_SECRET").unwrap_or_default(),
            }),
        }
    }
}

pub trait ObjectStorage {
    /// Whether `bucket/key` already exists.
    fn stat(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Uploads a local file to `bucket/key`.
    fn put(&self, bucket: &str, key: &str, local: &Path, content_type: &str) -> Result<()>;
}

/// Filesystem-backed storage: objects are plain files under
/// `<root>/<bucket>/<key>`.
pub struct FsStorage {
    pub root: PathBuf,
}

impl ObjectStorage for FsStorage {
    fn stat(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.root.join(bucket).join(key).exists())
    }

    fn put(&self, bucket: &str, key: &str, local: &Path, _content_type: &str) -> Result<()> {
        let dest = self.root.join(bucket).join(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(local, &dest)
            .with_context(|| format!("copy {} -> {}", local.display(), dest.display()))?;
        Ok(())
    }
}

/// Puts the final output files into object storage.
pub fn upload(
    date: NaiveDate,
    qrank_csv: &Path,
    stats: &Path,
    storage: &dyn ObjectStorage,
) -> Result<()> {
    let stamp = date.format("%Y%m%d");
    upload_file(
        &format!("public/qrank-{stamp}.csv.gz"),
        qrank_csv,
        "text/csv",
        storage,
    )?;
    upload_file(
        &format!("public/qrank-stats-{stamp}.json"),
        stats,
        "application/json",
        storage,
    )?;
    Ok(())
}

fn upload_file(
    dest: &str,
    src: &Path,
    content_type: &str,
    storage: &dyn ObjectStorage,
) -> Result<()> {
    if !src.exists() {
        bail!("missing local artifact {}", src.display());
    }
    if storage.stat(BUCKET, dest)? {
        info!(bucket = BUCKET, key = dest, "already in object storage");
        return Ok(());
    }
    storage.put(BUCKET, dest, src, content_type)?;
    info!(bucket = BUCKET, key = dest, "uploaded to object storage");
    Ok(())
}
