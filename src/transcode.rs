use std::{io::ErrorKind, path::Path, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{process::Command, time::timeout};
use tracing::debug;

use crate::error::ServiceError;

/// Re-encodes a materialized file for narrow playback targets.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, input: &Path, output: &Path) -> Result<(), ServiceError>;
}

/// H.264 + AAC via the `ffmpeg` executable.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    bin: String,
    timeout: Duration,
}

impl Ffmpeg {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Transcoder for Ffmpeg {
    async fn transcode(&self, input: &Path, output: &Path) -> Result<(), ServiceError> {
        let args = transcode_args(input, output);
        debug!("Running {} {:?}", self.bin, args);

        let command_future = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let result = timeout(self.timeout, command_future)
            .await
            .map_err(|_| {
                ServiceError::Transcode(format!(
                    "{} did not finish within {} seconds",
                    self.bin,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    ServiceError::Transcode(format!("{} is not installed or not on PATH", self.bin))
                } else {
                    ServiceError::Transcode(format!("could not run {}: {error}", self.bin))
                }
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let reason = stderr
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .next_back()
                .unwrap_or("no output");
            return Err(ServiceError::Transcode(format!(
                "{} exited with {}: {reason}",
                self.bin, result.status
            )));
        }

        Ok(())
    }
}

fn transcode_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "192k".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}
