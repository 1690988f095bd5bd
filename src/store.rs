//! The download directory: safe lookups, per-selection memoization and
//! eviction of old files.

use std::{
    collections::{HashMap, HashSet},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::ServiceError;

const AUDIO_EXTENSIONS: [&str; 7] = ["mp3", "m4a", "aac", "wav", "ogg", "opus", "flac"];
const IN_PROGRESS_EXTENSIONS: [&str; 3] = ["part", "ytdl", "tmp"];

#[derive(Debug, Clone)]
struct MemoEntry {
    filename: String,
    materialized_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub removed_files: usize,
    pub removed_bytes: u64,
    pub remaining_bytes: u64,
}

pub struct FileStore {
    root: PathBuf,
    memo: Mutex<HashMap<String, MemoEntry>>,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            memo: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> Result<(), ServiceError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Resolves a served filename to a regular file directly inside the root.
    pub async fn locate(&self, filename: &str) -> Result<PathBuf, ServiceError> {
        let not_found = || ServiceError::NotFound("File not found".to_string());

        if !is_plain_filename(filename) {
            return Err(not_found());
        }

        let path = self.root.join(filename);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(path),
            Ok(_) => Err(not_found()),
            Err(error) if error.kind() == ErrorKind::NotFound => Err(not_found()),
            Err(error) => Err(error.into()),
        }
    }

    /// Serializes work on one key. Hold the guard for the whole fetch.
    pub async fn begin(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut in_flight = self.in_flight.lock().await;
            Arc::clone(in_flight.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drops `guard` and forgets the key's lock once nobody else waits on it.
    pub async fn release(&self, key: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut in_flight = self.in_flight.lock().await;
        if in_flight
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            in_flight.remove(key);
        }
    }

    #[cfg(test)]
    pub(crate) async fn tracked_keys(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// A previously materialized file for `key`, if it is still on disk.
    pub async fn recall(&self, key: &str) -> Option<String> {
        let filename = self.memo.lock().await.get(key)?.filename.clone();
        if self.locate(&filename).await.is_ok() {
            Some(filename)
        } else {
            self.memo.lock().await.remove(key);
            None
        }
    }

    pub async fn remember(&self, key: &str, filename: &str) {
        self.memo.lock().await.insert(
            key.to_string(),
            MemoEntry {
                filename: filename.to_string(),
                materialized_at: Utc::now(),
            },
        );
    }

    /// Deletes files older than `retention`, then the oldest files until the
    /// directory fits in `max_bytes`. Zero disables either rule.
    pub async fn sweep(&self, retention: Duration, max_bytes: u64) -> SweepReport {
        let mut report = SweepReport::default();
        let mut files = self.list_files().await;
        let now = SystemTime::now();

        if !retention.is_zero() {
            let mut kept = Vec::with_capacity(files.len());
            for file in files {
                let age = now.duration_since(file.modified).unwrap_or_default();
                if age >= retention && self.remove(&file).await {
                    report.removed_files += 1;
                    report.removed_bytes += file.len;
                } else {
                    kept.push(file);
                }
            }
            files = kept;
        }

        let mut total: u64 = files.iter().map(|file| file.len).sum();
        if max_bytes > 0 && total > max_bytes {
            files.sort_by_key(|file| file.modified);
            let mut kept = Vec::with_capacity(files.len());
            for file in files {
                if total > max_bytes && !file.in_progress && self.remove(&file).await {
                    total -= file.len;
                    report.removed_files += 1;
                    report.removed_bytes += file.len;
                } else {
                    kept.push(file);
                }
            }
            files = kept;
        }
        report.remaining_bytes = total;

        let present: HashSet<&str> = files.iter().map(|file| file.name.as_str()).collect();
        let oldest_allowed = chrono::Duration::from_std(retention)
            .ok()
            .filter(|_| !retention.is_zero())
            .map(|retention| Utc::now() - retention);
        self.memo.lock().await.retain(|_, entry| {
            present.contains(entry.filename.as_str())
                && oldest_allowed.is_none_or(|cutoff| entry.materialized_at > cutoff)
        });
        self.in_flight
            .lock()
            .await
            .retain(|_, lock| Arc::strong_count(lock) > 1);

        if report.removed_files > 0 {
            info!(
                "Evicted {} file(s), {} bytes; {} bytes remain in {:?}",
                report.removed_files, report.removed_bytes, report.remaining_bytes, self.root
            );
        }

        report
    }

    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        retention: Duration,
        max_bytes: u64,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if interval.is_zero() {
            return None;
        }

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep(retention, max_bytes).await;
            }
        }))
    }

    async fn list_files(&self) -> Vec<StoredFile> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("Could not open {:?} for eviction: {error}", self.root);
                }
                return Vec::new();
            }
        };

        let mut files = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    warn!("Could not iterate {:?} for eviction: {error}", self.root);
                    break;
                }
            };

            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(error) => {
                    warn!("Could not read metadata of {path:?}: {error}");
                    continue;
                }
            };
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };

            files.push(StoredFile {
                name: name.to_string(),
                in_progress: is_in_progress(name),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                len: metadata.len(),
                path,
            });
        }

        files
    }

    async fn remove(&self, file: &StoredFile) -> bool {
        match tokio::fs::remove_file(&file.path).await {
            Ok(()) => {
                debug!("Evicted {:?}", file.path);
                true
            }
            Err(error) if error.kind() == ErrorKind::NotFound => true,
            Err(error) => {
                warn!("Could not delete {:?}: {error}", file.path);
                false
            }
        }
    }
}

#[derive(Debug)]
struct StoredFile {
    path: PathBuf,
    name: String,
    len: u64,
    modified: SystemTime,
    in_progress: bool,
}

/// Memo key for one (url, selection token) pair.
pub fn cache_key(url: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update([0u8]);
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn is_plain_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && !name.contains("..")
}

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Partial extractor output and transcoder intermediates.
fn is_in_progress(filename: &str) -> bool {
    filename.contains(".transcoding.")
        || extension_of(filename).is_some_and(|ext| IN_PROGRESS_EXTENSIONS.contains(&ext.as_str()))
}

pub fn is_audio_filename(filename: &str) -> bool {
    extension_of(filename).is_some_and(|ext| AUDIO_EXTENSIONS.contains(&ext.as_str()))
}

/// Audio extensions map to audio types, everything else is served as video.
pub fn content_type_for_filename(filename: &str) -> &'static str {
    match extension_of(filename).unwrap_or_default().as_str() {
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        _ => "video/mp4",
    }
}

pub fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_' | ' ') {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}
