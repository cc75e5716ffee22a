use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, RetempoError};
use crate::job::MediaKind;

/// Video frame size every encode is scaled to
pub const VIDEO_SCALE: &str = "scale=640:360";

/// Encoder process invocation: program plus ordered argument list
#[derive(Debug, Clone, PartialEq)]
pub struct MediaCommand {
    pub binary_path: String,
    pub args: Vec<String>,
    pub description: String,
}

impl MediaCommand {
    /// Create a new media processing command
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, description: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            description: description.into(),
        }
    }

    /// Add an argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Add input file
    pub fn input<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg("-i").arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Add output file
    pub fn output<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg(path.as_ref().to_string_lossy().to_string())
    }

    /// `-y` replaces an existing output, `-n` refuses to
    pub fn overwrite(self, force: bool) -> Self {
        self.arg(if force { "-y" } else { "-n" })
    }

    /// Set video codec
    pub fn video_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:v").arg(codec)
    }

    /// Set audio codec
    pub fn audio_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:a").arg(codec)
    }

    /// Disable video
    pub fn no_video(self) -> Self {
        self.arg("-vn")
    }

    /// Set audio sample rate
    pub fn audio_sample_rate(self, rate: u32) -> Self {
        self.arg("-ar").arg(rate.to_string())
    }

    /// Add video filter
    pub fn video_filter<S: Into<String>>(self, filter: S) -> Self {
        self.arg("-filter:v").arg(filter)
    }

    /// Add audio filter
    pub fn audio_filter<S: Into<String>>(self, filter: S) -> Self {
        self.arg("-filter:a").arg(filter)
    }

    /// Machine readable progress on stdout, errors only on stderr
    pub fn progress_to_stdout(self) -> Self {
        self.args(["-progress", "pipe:1", "-nostats", "-hide_banner", "-loglevel", "error"])
    }

    /// Unconfigured `tokio` command for this invocation
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(&self.args);
        cmd
    }

    /// Run to completion and collect its output; nonzero exit is an error
    pub async fn output_checked(&self) -> Result<Output> {
        debug!("Executing media command: {} {:?}", self.binary_path, self.args);
        debug!("Description: {}", self.description);

        let output = self
            .to_command()
            .output()
            .await
            .map_err(|e| RetempoError::Spawn {
                program: self.binary_path.clone(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RetempoError::Encode {
                code: output.status.code(),
                diagnostic: format!("{} failed: {}", self.description, stderr.trim()),
            });
        }

        Ok(output)
    }
}

impl std::fmt::Display for MediaCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.binary_path)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Everything a command builder needs to know about one job
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub media_kind: MediaKind,
    pub tempo: f64,
    pub compression: bool,
    /// Whether the encoder may replace an existing destination
    pub overwrite: bool,
}

/// Produces the encoder invocation for a job
pub trait CommandBuilder: Send + Sync {
    fn build(&self, request: &EncodeRequest) -> MediaCommand;
}

impl<F> CommandBuilder for F
where
    F: Fn(&EncodeRequest) -> MediaCommand + Send + Sync,
{
    fn build(&self, request: &EncodeRequest) -> MediaCommand {
        self(request)
    }
}

/// ffmpeg invocations for the video and audio presets
#[derive(Debug, Clone)]
pub struct FfmpegCommandBuilder {
    binary_path: String,
}

impl FfmpegCommandBuilder {
    /// Create a new command builder
    pub fn new<S: Into<String>>(binary_path: S) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// AV1 640x360 re-encode; tempo rescales both timestamps and audio
    pub fn encode_video(&self, request: &EncodeRequest) -> MediaCommand {
        let cmd = MediaCommand::new(&self.binary_path, "Video encode").input(&request.source);

        let cmd = if is_unit_tempo(request.tempo) {
            cmd.arg("-vf").arg(VIDEO_SCALE)
        } else {
            cmd.video_filter(format!("setpts={:.8}*PTS,{}", 1.0 / request.tempo, VIDEO_SCALE))
                .audio_filter(format!("atempo={}", request.tempo))
        };

        cmd.args(["-pix_fmt", "yuv420p"])
            .video_codec("libaom-av1")
            .args([
                "-b:v", "70k", "-crf", "30", "-cpu-used", "8", "-row-mt", "1", "-g", "240",
                "-aq-mode", "0",
            ])
            .audio_codec("aac")
            .args(["-b:a", "80k"])
            .output(&request.dest)
            .overwrite(request.overwrite)
            .progress_to_stdout()
    }

    /// Tempo change, optionally squeezed into a low bitrate VBR mp3
    pub fn encode_audio(&self, request: &EncodeRequest) -> MediaCommand {
        let mut cmd = MediaCommand::new(&self.binary_path, "Audio encode").input(&request.source);

        if request.compression {
            cmd = cmd
                .arg("-codec:a")
                .arg("libmp3lame")
                .args(["-q:a", "7"])
                .audio_sample_rate(22050);
        }

        cmd.audio_filter(format!("atempo={}", request.tempo))
            .no_video()
            .output(&request.dest)
            .overwrite(request.overwrite)
            .progress_to_stdout()
    }

    /// Build version check command
    pub fn version_check(&self) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Version check").arg("-version")
    }
}

impl CommandBuilder for FfmpegCommandBuilder {
    fn build(&self, request: &EncodeRequest) -> MediaCommand {
        match request.media_kind {
            MediaKind::Video => self.encode_video(request),
            MediaKind::Audio => self.encode_audio(request),
        }
    }
}

fn is_unit_tempo(tempo: f64) -> bool {
    (tempo - 1.0).abs() < f64::EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(media_kind: MediaKind, tempo: f64, compression: bool) -> EncodeRequest {
        EncodeRequest {
            source: PathBuf::from("/in/clip.mkv"),
            dest: PathBuf::from("/out/clip.mkv"),
            media_kind,
            tempo,
            compression,
            overwrite: true,
        }
    }

    #[test]
    fn test_video_without_tempo() {
        let cmd = FfmpegCommandBuilder::new("ffmpeg").build(&request(MediaKind::Video, 1.0, false));
        assert_eq!(cmd.binary_path, "ffmpeg");
        assert_eq!(&cmd.args[..4], &["-i", "/in/clip.mkv", "-vf", VIDEO_SCALE]);
        assert!(!cmd.args.iter().any(|arg| arg.starts_with("atempo")));
        let out = cmd.args.iter().position(|arg| arg == "/out/clip.mkv").unwrap();
        assert_eq!(cmd.args[out + 1], "-y");
        assert_eq!(&cmd.args[out + 2..out + 4], &["-progress", "pipe:1"]);
    }

    #[test]
    fn test_video_with_tempo() {
        let cmd = FfmpegCommandBuilder::new("ffmpeg").build(&request(MediaKind::Video, 1.5, false));
        assert_eq!(
            &cmd.args[2..6],
            &["-filter:v", "setpts=0.66666667*PTS,scale=640:360", "-filter:a", "atempo=1.5"]
        );
        assert!(!cmd.args.iter().any(|arg| arg == "-vf"));
    }

    #[test]
    fn test_audio_compression_flags() {
        let builder = FfmpegCommandBuilder::new("ffmpeg");
        let plain = builder.build(&request(MediaKind::Audio, 1.8, false));
        assert_eq!(&plain.args[2..5], &["-filter:a", "atempo=1.8", "-vn"]);
        assert!(!plain.args.iter().any(|arg| arg == "libmp3lame"));

        let compressed = builder.build(&request(MediaKind::Audio, 1.8, true));
        assert_eq!(
            &compressed.args[2..10],
            &["-codec:a", "libmp3lame", "-q:a", "7", "-ar", "22050", "-filter:a", "atempo=1.8"]
        );
    }

    #[test]
    fn test_no_overwrite_flag() {
        let mut req = request(MediaKind::Audio, 1.0, false);
        req.overwrite = false;
        let cmd = FfmpegCommandBuilder::new("ffmpeg").build(&req);
        assert!(cmd.args.iter().any(|arg| arg == "-n"));
        assert!(!cmd.args.iter().any(|arg| arg == "-y"));
    }

    #[test]
    fn test_closure_builder() {
        let builder = |request: &EncodeRequest| {
            MediaCommand::new("/bin/echo", "echo").output(&request.dest)
        };
        let cmd = CommandBuilder::build(&builder, &request(MediaKind::Video, 1.0, false));
        assert_eq!(cmd.to_string(), "/bin/echo /out/clip.mkv");
    }
}
