use std::{path::PathBuf, str::FromStr, time::Duration};

use tracing::warn;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
const DEFAULT_TARGET_CONTAINER: &str = "mp4";
const DEFAULT_AUDIO_CONTAINER: &str = "m4a";
const DEFAULT_EXTRACTOR_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_TRANSCODE_TIMEOUT_SECONDS: u64 = 600;
const DEFAULT_FILE_RETENTION_SECONDS: u64 = 60 * 60;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 5 * 60;

/// What `/formats` answers when no stream survives filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyFormatsPolicy {
    NotFound,
    Fallback,
}

impl FromStr for EmptyFormatsPolicy {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "not_found" | "404" => Ok(Self::NotFound),
            "fallback" => Ok(Self::Fallback),
            _ => Err(()),
        }
    }
}

/// Whether downloaded video is re-encoded, and what a transcoder failure means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodePolicy {
    Off,
    Strict,
    BestEffort,
}

impl FromStr for TranscodePolicy {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "0" | "false" => Ok(Self::Off),
            "strict" => Ok(Self::Strict),
            "best_effort" | "best-effort" => Ok(Self::BestEffort),
            _ => Err(()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub output_dir: PathBuf,
    pub target_container: String,
    pub audio_container: String,
    pub empty_formats: EmptyFormatsPolicy,
    pub transcode: TranscodePolicy,
    pub yt_dlp_bin: String,
    pub ffmpeg_bin: String,
    pub extractor_timeout: Duration,
    pub transcode_timeout: Duration,
    /// Zero disables age-based eviction.
    pub file_retention: Duration,
    /// Zero means unlimited.
    pub max_store_bytes: u64,
    /// Zero disables the background sweep.
    pub sweep_interval: Duration,
    pub serve_static_files: bool,
    /// Empty means any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            output_dir: PathBuf::from(DEFAULT_DOWNLOAD_DIR),
            target_container: DEFAULT_TARGET_CONTAINER.to_string(),
            audio_container: DEFAULT_AUDIO_CONTAINER.to_string(),
            empty_formats: EmptyFormatsPolicy::NotFound,
            transcode: TranscodePolicy::Off,
            yt_dlp_bin: "yt-dlp".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
            extractor_timeout: Duration::from_secs(DEFAULT_EXTRACTOR_TIMEOUT_SECONDS),
            transcode_timeout: Duration::from_secs(DEFAULT_TRANSCODE_TIMEOUT_SECONDS),
            file_retention: Duration::from_secs(DEFAULT_FILE_RETENTION_SECONDS),
            max_store_bytes: 0,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECONDS),
            serve_static_files: true,
            allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let text = |name: &str| lookup(name).and_then(|value| non_empty(&value));

        let bind_addr = text("APP_ADDR")
            .or_else(|| {
                text("PORT")
                    .and_then(|value| value.parse::<u16>().ok())
                    .map(|port| format!("0.0.0.0:{port}"))
            })
            .unwrap_or(defaults.bind_addr);

        let seconds = |name: &'static str, default: Duration| {
            read_u64(name, text(name)).map_or(default, Duration::from_secs)
        };

        Ok(Self {
            bind_addr,
            output_dir: text("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            target_container: text("TARGET_CONTAINER")
                .map(|value| value.to_ascii_lowercase())
                .unwrap_or(defaults.target_container),
            audio_container: text("AUDIO_CONTAINER")
                .map(|value| value.to_ascii_lowercase())
                .unwrap_or(defaults.audio_container),
            empty_formats: parse_enum("EMPTY_FORMATS", text("EMPTY_FORMATS"))?
                .unwrap_or(defaults.empty_formats),
            transcode: parse_enum("TRANSCODE", text("TRANSCODE"))?.unwrap_or(defaults.transcode),
            yt_dlp_bin: text("YT_DLP_BIN").unwrap_or(defaults.yt_dlp_bin),
            ffmpeg_bin: text("FFMPEG_BIN").unwrap_or(defaults.ffmpeg_bin),
            extractor_timeout: seconds("EXTRACTOR_TIMEOUT_SECONDS", defaults.extractor_timeout),
            transcode_timeout: seconds("TRANSCODE_TIMEOUT_SECONDS", defaults.transcode_timeout),
            file_retention: seconds("FILE_RETENTION_SECONDS", defaults.file_retention),
            max_store_bytes: read_u64("MAX_STORE_BYTES", text("MAX_STORE_BYTES"))
                .unwrap_or(defaults.max_store_bytes),
            sweep_interval: seconds("SWEEP_INTERVAL_SECONDS", defaults.sweep_interval),
            serve_static_files: text("SERVE_STATIC_FILES")
                .and_then(|value| parse_bool(&value))
                .unwrap_or(defaults.serve_static_files),
            allowed_origins: text("ALLOWED_ORIGINS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty() && *origin != "*")
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

fn parse_enum<T: FromStr>(
    name: &'static str,
    value: Option<String>,
) -> Result<Option<T>, ConfigError> {
    match value {
        None => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}

fn read_u64(name: &str, value: Option<String>) -> Option<u64> {
    let value = value?;
    match value.parse::<u64>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring {name}={value:?}: expected a non-negative integer.");
            None
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
