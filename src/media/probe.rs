use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, RetempoError};
use crate::job::MediaKind;
use super::MediaCommand;

/// Bitrate ceiling (kbit/s) assumed for compressed audio output
pub const AUDIO_OUTPUT_KBPS: f64 = 55.0;

/// What probing a source file reveals
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    pub duration_secs: Option<f64>,
    pub bit_rate_kbps: Option<f64>,
    pub size_bytes: u64,
}

impl MediaInfo {
    /// Reference total used to normalize a job's progress.
    ///
    /// Video: output duration in seconds (source duration scaled by tempo).
    /// Audio: estimated output size in bytes.
    pub fn reference(&self, kind: MediaKind, tempo: f64) -> Option<f64> {
        let duration = self.duration_secs.filter(|d| d.is_finite() && *d > 0.0)?;
        if !tempo.is_finite() || tempo <= 0.0 {
            return None;
        }
        match kind {
            MediaKind::Video => Some(duration / tempo),
            MediaKind::Audio => {
                let kbps = self
                    .bit_rate_kbps
                    .filter(|rate| *rate > 0.0)
                    .map(|rate| rate.min(AUDIO_OUTPUT_KBPS))
                    .unwrap_or(AUDIO_OUTPUT_KBPS);
                Some(kbps * 1000.0 / 8.0 * duration / tempo)
            }
        }
    }
}

/// Source of media metadata taken before a job starts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo>;
}

/// ffprobe-backed prober
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    binary_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

impl FfprobeProber {
    pub fn new<P: Into<PathBuf>>(binary_path: P) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    fn command(&self, path: &Path) -> MediaCommand {
        MediaCommand::new(self.binary_path.to_string_lossy(), "Media probe")
            .args(["-v", "error", "-show_entries", "format=duration,bit_rate", "-of", "json"])
            .output(path)
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        let size_bytes = tokio::fs::metadata(path).await?.len();

        let output = self
            .command(path)
            .output_checked()
            .await
            .map_err(|e| RetempoError::Probe(format!("{}: {}", path.display(), e)))?;

        let mut info = parse_ffprobe_json(&String::from_utf8_lossy(&output.stdout))?;
        info.size_bytes = size_bytes;
        debug!("Probed {}: {:?}", path.display(), info);
        Ok(info)
    }
}

/// Parse `ffprobe -show_entries format=duration,bit_rate -of json` output
pub fn parse_ffprobe_json(json: &str) -> Result<MediaInfo> {
    let parsed: FfprobeOutput = serde_json::from_str(json)?;
    let number = |value: Option<String>| {
        value
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v > 0.0)
    };

    Ok(MediaInfo {
        duration_secs: number(parsed.format.duration),
        bit_rate_kbps: number(parsed.format.bit_rate).map(|bps| bps / 1000.0),
        size_bytes: 0,
    })
}
