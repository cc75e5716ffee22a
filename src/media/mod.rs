// Media tooling around the external encoder
//
// - Commands: encoder invocation builder and the default ffmpeg presets
// - Probe: source metadata used to normalize progress

pub mod commands;
pub mod probe;

pub use commands::*;
pub use probe::*;

use tracing::info;

use crate::config::EncoderConfig;
use crate::error::{Result, RetempoError};

/// Availability and version checks for the configured encoder
pub struct EncoderTool {
    command_builder: FfmpegCommandBuilder,
}

impl EncoderTool {
    pub fn new(config: &EncoderConfig) -> Self {
        Self {
            command_builder: FfmpegCommandBuilder::new(&config.ffmpeg_path),
        }
    }

    /// First line of `ffmpeg -version`
    pub async fn version_info(&self) -> Result<String> {
        let output = self.command_builder.version_check().output_checked().await?;
        let version_info = String::from_utf8_lossy(&output.stdout);
        Ok(version_info
            .lines()
            .next()
            .unwrap_or("Unknown version")
            .to_string())
    }

    /// Fail unless the encoder can be executed
    pub async fn check_availability(&self) -> Result<()> {
        match self.version_info().await {
            Ok(version) => {
                info!("Encoder is available: {}", version);
                Ok(())
            }
            Err(e) => Err(RetempoError::Config(format!("Encoder not usable: {}", e))),
        }
    }
}
