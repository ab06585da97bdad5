//! On-disk result cache and upload staging.
//!
//! Generated images live in the result directory as `<fingerprint>.png` and
//! are never rewritten or evicted. Uploads are staged in the temp directory
//! under the client's file name. That copy is not read back: concurrent
//! uploads may share a name, so decoding works from the request bytes.
//!
//! Generation for a given fingerprint is serialized through [`KeyedLocks`]:
//! the first request for a fingerprint does the work, concurrent requests for
//! the same fingerprint wait and then find the published result. Results are
//! written to a `.part` sibling and renamed into place, so a reader never
//! sees a half-written PNG.

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// Result directory + temp directory + per-fingerprint generation locks.
pub struct ResultStore {
    results_dir: PathBuf,
    tmp_dir: PathBuf,
    locks: KeyedLocks,
}

impl ResultStore {
    /// Create both directories (if needed) and return the store.
    pub fn open(results_dir: &Path, tmp_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(results_dir).with_context(|| {
            format!("Failed to create result directory: {}", results_dir.display())
        })?;
        std::fs::create_dir_all(tmp_dir)
            .with_context(|| format!("Failed to create temp directory: {}", tmp_dir.display()))?;

        Ok(Self {
            results_dir: results_dir.to_path_buf(),
            tmp_dir: tmp_dir.to_path_buf(),
            locks: KeyedLocks::default(),
        })
    }

    pub fn result_path(&self, fingerprint: &str) -> PathBuf {
        self.results_dir.join(format!("{}.png", fingerprint))
    }

    /// Path of a previously generated result, if one exists.
    pub async fn existing_result(&self, fingerprint: &str) -> Result<Option<PathBuf>> {
        let path = self.result_path(fingerprint);
        let exists = tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("Failed to check result: {}", path.display()))?;
        Ok(exists.then_some(path))
    }

    /// Wait for exclusive generation rights on `fingerprint`.
    pub async fn lock(&self, fingerprint: &str) -> KeyedGuard {
        self.locks.lock(fingerprint).await
    }

    /// Stage raw upload bytes in the temp directory.
    ///
    /// Only the final component of `filename` is used. When the client sends
    /// no usable name the fingerprint stands in.
    pub async fn write_upload(
        &self,
        filename: Option<&str>,
        fingerprint: &str,
        data: &[u8],
    ) -> Result<PathBuf> {
        let name = filename
            .and_then(sanitize_filename)
            .unwrap_or_else(|| format!("{}.upload", fingerprint));
        let path = self.tmp_dir.join(name);

        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("Failed to write upload: {}", path.display()))?;
        Ok(path)
    }

    /// Encode `img` as PNG and publish it as the result for `fingerprint`.
    pub async fn publish_result(&self, fingerprint: &str, img: DynamicImage) -> Result<PathBuf> {
        let path = self.result_path(fingerprint);
        let part = self.results_dir.join(format!("{}.png.part", fingerprint));

        let part_clone = part.clone();
        let written = tokio::task::spawn_blocking(move || {
            img.save_with_format(&part_clone, ImageFormat::Png)
        })
        .await?
        .with_context(|| format!("Failed to write result: {}", part.display()));

        let published = match written {
            Ok(()) => tokio::fs::rename(&part, &path)
                .await
                .with_context(|| format!("Failed to publish result: {}", path.display())),
            Err(e) => Err(e),
        };

        if let Err(e) = published {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e);
        }
        Ok(path)
    }
}

/// Decode uploaded bytes and normalize them to 8-bit RGB.
///
/// The format is sniffed from the content, so the client's file name plays no part.
pub async fn decode_upload(data: Vec<u8>) -> Result<DynamicImage> {
    tokio::task::spawn_blocking(move || -> Result<DynamicImage> {
        let img = image::load_from_memory(&data).context("Failed to decode uploaded image")?;
        Ok(DynamicImage::ImageRgb8(img.to_rgb8()))
    })
    .await?
}

fn sanitize_filename(name: &str) -> Option<String> {
    let base = Path::new(name).file_name()?.to_str()?.trim();
    if base.is_empty() {
        None
    } else {
        Some(base.to_string())
    }
}

// ============ Keyed locks ============

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// A set of async mutexes addressed by string key, created on demand.
///
/// Entries are removed once the last holder or waiter lets go, so the map
/// only ever contains fingerprints with work in flight.
#[derive(Default)]
pub struct KeyedLocks {
    inner: Arc<LockMap>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(key.to_string()).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key: key.to_string(),
            map: self.inner.clone(),
            _guard: guard,
        }
    }

    /// Number of keys currently held or awaited.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Held while generating for one key.
pub struct KeyedGuard {
    key: String,
    map: Arc<LockMap>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map and one inside our guard: nobody is waiting.
        if let Some(entry) = map.get(&self.key) {
            if Arc::strong_count(entry) <= 2 {
                map.remove(&self.key);
            }
        }
    }
}
