use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, RetempoError};
use crate::job::MediaKind;

pub const DEFAULT_THREADS: usize = 4;
pub const MAX_THREADS: usize = 16;
pub const MAX_TEMPO: f64 = 2.0;

fn default_threads() -> usize {
    DEFAULT_THREADS
}

fn default_tempo() -> f64 {
    1.0
}

fn default_overwrite() -> OverwriteMode {
    OverwriteMode::Skip
}

fn default_media_kind() -> MediaKind {
    MediaKind::Video
}

fn default_cancel_grace_ms() -> u64 {
    3000
}

fn default_publish_interval_ms() -> u64 {
    300
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Path to the ffmpeg binary
    pub ffmpeg_path: String,
    /// Path to the ffprobe binary; derived from `ffmpeg_path` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ffprobe_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwriteMode {
    /// Leave existing destinations alone and count the job as done
    Skip,
    /// Replace existing destinations
    Overwrite,
    /// Write to the first free `name(N).ext`
    Rename,
}

impl std::str::FromStr for OverwriteMode {
    type Err = RetempoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(OverwriteMode::Skip),
            "overwrite" => Ok(OverwriteMode::Overwrite),
            "rename" => Ok(OverwriteMode::Rename),
            _ => Err(RetempoError::Config(format!(
                "Invalid overwrite mode '{}'. Valid modes: skip, overwrite, rename",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Directory scanned for input files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_dir: Option<PathBuf>,
    /// Directory receiving the transcoded files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_dir: Option<PathBuf>,
    /// Number of files encoded at the same time
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Playback speed factor (1.0 keeps the original speed)
    #[serde(default = "default_tempo")]
    pub tempo: f64,
    #[serde(default = "default_overwrite")]
    pub overwrite: OverwriteMode,
    #[serde(default = "default_media_kind")]
    pub media_kind: MediaKind,
    /// Re-encode audio with a smaller VBR mp3 profile
    #[serde(default)]
    pub compression: bool,
    /// How long a canceled encoder may take to exit before it is killed
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// Minimum interval between progress publications
    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: None,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            source_dir: None,
            dest_dir: None,
            threads: default_threads(),
            tempo: default_tempo(),
            overwrite: default_overwrite(),
            media_kind: default_media_kind(),
            compression: false,
            cancel_grace_ms: default_cancel_grace_ms(),
            publish_interval_ms: default_publish_interval_ms(),
        }
    }
}

impl EncoderConfig {
    /// ffprobe binary, next to ffmpeg unless configured explicitly
    pub fn ffprobe_path(&self) -> PathBuf {
        if let Some(path) = &self.ffprobe_path {
            return PathBuf::from(path);
        }
        let probe_name = format!("ffprobe{}", std::env::consts::EXE_SUFFIX);
        match Path::new(&self.ffmpeg_path).parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join(probe_name),
            _ => PathBuf::from(probe_name),
        }
    }
}

impl BatchConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms.max(1))
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RetempoError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| RetempoError::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| RetempoError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| RetempoError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Reject settings a batch cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.encoder.ffmpeg_path.trim().is_empty() {
            return Err(RetempoError::Config("Encoder executable path is not set".to_string()));
        }

        let batch = &self.batch;
        if batch.threads == 0 || batch.threads > MAX_THREADS {
            return Err(RetempoError::Config(format!(
                "Thread count must be between 1 and {}, got {}",
                MAX_THREADS, batch.threads
            )));
        }

        if !batch.tempo.is_finite() || batch.tempo <= 0.0 || batch.tempo > MAX_TEMPO {
            return Err(RetempoError::Config(format!(
                "Tempo must be greater than 0 and at most {}, got {}",
                MAX_TEMPO, batch.tempo
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [encoder]
            ffmpeg_path = "/opt/ffmpeg/bin/ffmpeg"

            [batch]
            overwrite = "rename"
            media_kind = "audio"
            tempo = 1.8
            "#,
        )
        .unwrap();

        assert_eq!(config.batch.overwrite, OverwriteMode::Rename);
        assert_eq!(config.batch.media_kind, MediaKind::Audio);
        assert_eq!(config.batch.threads, DEFAULT_THREADS);
        assert_eq!(config.batch.tempo, 1.8);
        assert_eq!(config.batch.cancel_grace_ms, 3000);
        assert!(!config.batch.compression);
        assert_eq!(
            config.encoder.ffprobe_path(),
            PathBuf::from("/opt/ffmpeg/bin").join(format!("ffprobe{}", std::env::consts::EXE_SUFFIX))
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retempo.toml");

        let mut config = Config::default();
        config.batch.threads = 8;
        config.batch.source_dir = Some(PathBuf::from("/media/in"));
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.batch.threads, 8);
        assert_eq!(loaded.batch.source_dir, Some(PathBuf::from("/media/in")));
        assert_eq!(loaded.encoder.ffmpeg_path, "ffmpeg");
        assert_eq!(loaded.encoder.ffprobe_path(), PathBuf::from(format!("ffprobe{}", std::env::consts::EXE_SUFFIX)));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.validate().unwrap();

        config.encoder.ffmpeg_path = "  ".to_string();
        assert!(matches!(config.validate(), Err(RetempoError::Config(_))));

        let mut config = Config::default();
        config.batch.threads = 0;
        assert!(config.validate().is_err());
        config.batch.threads = MAX_THREADS + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        for tempo in [0.0, -1.0, 2.5, f64::NAN] {
            config.batch.tempo = tempo;
            assert!(config.validate().is_err(), "tempo {tempo}");
        }
        config.batch.tempo = 2.0;
        config.validate().unwrap();
    }

    #[test]
    fn test_overwrite_mode_from_str() {
        assert_eq!("Skip".parse::<OverwriteMode>().unwrap(), OverwriteMode::Skip);
        assert_eq!("rename".parse::<OverwriteMode>().unwrap(), OverwriteMode::Rename);
        assert!("replace".parse::<OverwriteMode>().is_err());
    }
}
