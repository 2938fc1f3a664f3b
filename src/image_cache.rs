//! On-disk image cache keyed by absolute image URL.
//!
//! `resolve` never fails: it returns a local path on a hit or a fresh
//! download, the remote URL when the download fails, and the placeholder for
//! missing input. Eviction runs separately through [`ImageCache::clean_cache`].
//!
//! Two concurrent `resolve` calls for the same URL may both download; the
//! mapping written last wins. Both target the same file name, so either
//! result is valid.
//!
//! Files are named after the URL's last path segment, so `/shops/1/logo.png`
//! and `/shops/2/logo.png` share one file. The most recent download owns it:
//! older mappings to that file are dropped and re-download on next use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    is_absolute_http, HttpError, HttpRequest, HttpTransport, DEFAULT_TIMEOUT_MS,
};
use crate::config::ImageCacheConfig;
use crate::model::{CacheEntry, UnixTimeMs};
use crate::task::TaskHandle;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("download failed: {0}")]
    Download(#[from] HttpError),
}

impl CacheError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Outcome of one eviction sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub scanned: usize,
    pub removed: Vec<PathBuf>,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
    /// Files selected for removal that could not be deleted.
    pub failed: usize,
}

struct Inner {
    config: ImageCacheConfig,
    image_base_url: String,
    placeholder_url: String,
    transport: Arc<dyn HttpTransport>,
    download_timeout: Duration,
    paths: RwLock<HashMap<String, PathBuf>>,
}

#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<Inner>,
}

impl ImageCache {
    pub fn new(
        config: ImageCacheConfig,
        image_base_url: impl Into<String>,
        placeholder_url: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                image_base_url: image_base_url.into(),
                placeholder_url: placeholder_url.into(),
                transport,
                download_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
                paths: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Creates the cache directory and starts one background sweep.
    #[instrument(skip(self), fields(dir = %self.inner.config.dir.display()))]
    pub async fn init(&self) -> Result<TaskHandle<Option<CleanupReport>>, CacheError> {
        let dir = &self.inner.config.dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CacheError::io(dir, e))?;
        info!("image cache initialized");
        Ok(self.spawn_cleanup())
    }

    /// Drops every in-memory mapping. Files stay on disk.
    pub async fn dispose(&self) {
        self.inner.paths.write().await.clear();
    }

    pub fn dir(&self) -> &Path {
        &self.inner.config.dir
    }

    pub fn placeholder_url(&self) -> &str {
        &self.inner.placeholder_url
    }

    /// Absolute form of an image reference. Relative paths are joined to the
    /// image base URL with a single `/`. Blank input yields `None`.
    pub fn normalize_url(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if is_absolute_http(raw) {
            return Some(raw.to_string());
        }
        Some(format!(
            "{}/{}",
            self.inner.image_base_url.trim_end_matches('/'),
            raw.trim_start_matches('/')
        ))
    }

    /// URI suitable for display: local file path, remote URL, or placeholder.
    pub async fn resolve(&self, remote_url: Option<&str>) -> String {
        let Some(url) = remote_url.and_then(|raw| self.normalize_url(raw)) else {
            return self.inner.placeholder_url.clone();
        };

        if let Some(path) = self.mapped_path(&url).await {
            match tokio::fs::try_exists(&path).await {
                Ok(true) => return path.to_string_lossy().into_owned(),
                Ok(false) => debug!(url = %url, "cached file vanished, downloading again"),
                Err(e) => warn!(url = %url, "failed to check cached file: {}", e),
            }
        }

        match self.download(&url).await {
            Ok(path) => {
                let local = path.to_string_lossy().into_owned();
                let mut paths = self.inner.paths.write().await;
                paths.retain(|mapped_url, mapped| *mapped != path || *mapped_url == url);
                paths.insert(url, path);
                local
            }
            Err(e) => {
                warn!(url = %url, "image download failed, using remote URL: {}", e);
                url
            }
        }
    }

    pub async fn mapped_path(&self, url: &str) -> Option<PathBuf> {
        self.inner.paths.read().await.get(url).cloned()
    }

    /// Mapped entries whose file still exists.
    pub async fn entries(&self) -> Vec<CacheEntry> {
        let snapshot: Vec<(String, PathBuf)> = self
            .inner
            .paths
            .read()
            .await
            .iter()
            .map(|(url, path)| (url.clone(), path.clone()))
            .collect();

        let mut entries = Vec::with_capacity(snapshot.len());
        for (url, path) in snapshot {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                entries.push(CacheEntry {
                    remote_url: Some(url),
                    size_bytes: meta.len(),
                    last_modified: meta
                        .modified()
                        .map(UnixTimeMs::from_system_time)
                        .unwrap_or(UnixTimeMs(0)),
                    local_path: path,
                });
            }
        }
        entries
    }

    /// Removes expired files, then keeps the cumulative size within budget.
    ///
    /// Files are visited oldest first. Every file's size is added to a running
    /// total; a file is deleted when it is older than the expiry window or
    /// when the running total has passed the size budget.
    #[instrument(skip(self), fields(dir = %self.inner.config.dir.display()))]
    pub async fn clean_cache(&self) -> Result<CleanupReport, CacheError> {
        let config = &self.inner.config;
        let now = UnixTimeMs::now();
        let mut files = self.scan().await?;
        files.sort_by_key(|f| f.last_modified);

        let mut report = CleanupReport {
            scanned: files.len(),
            ..CleanupReport::default()
        };
        let mut running_total = 0u64;

        for file in files {
            running_total = running_total.saturating_add(file.size_bytes);
            let expired = file.age(now) > config.expiry();
            if !expired && running_total <= config.max_size_bytes {
                report.remaining_bytes += file.size_bytes;
                continue;
            }

            match tokio::fs::remove_file(&file.local_path).await {
                Ok(()) => {
                    self.forget(&file.local_path).await;
                    report.freed_bytes += file.size_bytes;
                    report.removed.push(file.local_path);
                }
                Err(e) => {
                    warn!(path = %file.local_path.display(), "failed to evict: {}", e);
                    report.failed += 1;
                    report.remaining_bytes += file.size_bytes;
                }
            }
        }

        info!(
            scanned = report.scanned,
            removed = report.removed.len(),
            freed_bytes = report.freed_bytes,
            "cache sweep finished"
        );
        Ok(report)
    }

    /// Runs [`ImageCache::clean_cache`] in the background; failures are logged.
    pub fn spawn_cleanup(&self) -> TaskHandle<Option<CleanupReport>> {
        let cache = self.clone();
        TaskHandle::spawn("image-cache-cleanup", async move {
            match cache.clean_cache().await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!("cache sweep failed: {}", e);
                    None
                }
            }
        })
    }

    async fn scan(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let dir = &self.inner.config.dir;
        let mut reader = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| CacheError::io(dir, e))?;

        let mut files = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| CacheError::io(dir, e))?
        {
            let path = entry.path();
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) => {
                    warn!(path = %path.display(), "skipping unreadable cache entry: {}", e);
                    continue;
                }
            };
            files.push(CacheEntry {
                remote_url: None,
                size_bytes: meta.len(),
                last_modified: meta
                    .modified()
                    .map(UnixTimeMs::from_system_time)
                    .unwrap_or(UnixTimeMs(0)),
                local_path: path,
            });
        }
        Ok(files)
    }

    async fn forget(&self, path: &Path) {
        self.inner
            .paths
            .write()
            .await
            .retain(|_, mapped| mapped.as_path() != path);
    }

    async fn download(&self, url: &str) -> Result<PathBuf, CacheError> {
        let request = HttpRequest::get(url)?.with_timeout(self.inner.download_timeout)?;
        let file_name = cache_file_name(&request);
        let request_id = request.request_id().to_string();

        let response = self
            .inner
            .transport
            .send(request)
            .await?
            .error_for_status(&request_id)?;

        let path = self.inner.config.dir.join(file_name);
        write_atomic(&path, &response.body).await?;
        debug!(url, path = %path.display(), bytes = response.body.len(), "image cached");
        Ok(path)
    }
}

/// Last path segment of the URL, or the current time in milliseconds.
fn cache_file_name(request: &HttpRequest) -> String {
    request
        .url()
        .last_segment()
        .filter(|segment| segment != "." && segment != "..")
        .unwrap_or_else(|| UnixTimeMs::now().0.to_string())
}

/// Writes through a temp file and renames, so readers never see a partial image.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), CacheError> {
    let temp = path.with_extension(format!("part-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&temp, contents)
        .await
        .map_err(|e| CacheError::io(&temp, e))?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(CacheError::io(path, e));
    }
    Ok(())
}
