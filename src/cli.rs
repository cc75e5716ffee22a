use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Transcode every matching file of a directory tree
    Run {
        /// Source directory (overrides batch.source_dir)
        #[arg(short, long)]
        src: Option<PathBuf>,

        /// Destination directory (overrides batch.dest_dir)
        #[arg(short, long)]
        dst: Option<PathBuf>,

        /// Number of files encoded at the same time (1-16)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Playback speed factor, e.g. 1.5
        #[arg(long)]
        tempo: Option<f64>,

        /// What to do with existing destinations: skip, overwrite, rename
        #[arg(short, long)]
        overwrite: Option<String>,

        /// Media kind: video or audio
        #[arg(short, long)]
        kind: Option<String>,

        /// Re-encode audio into a smaller mp3
        #[arg(long)]
        compression: bool,
    },

    /// Show what the prober reports for a file
    Probe {
        /// Media file to inspect
        file: PathBuf,
    },

    /// Verify the encoder can be executed
    Check,

    /// Write the default configuration to a file
    InitConfig {
        /// Target TOML file
        #[arg(default_value = "retempo.toml")]
        path: PathBuf,
    },
}

/// A command typed on stdin while a batch runs; job numbers are 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Pause(usize),
    Resume(usize),
    Cancel(usize),
    Stop,
}

impl ControlCommand {
    pub fn job_number(&self) -> Option<usize> {
        match self {
            ControlCommand::Pause(seq) | ControlCommand::Resume(seq) | ControlCommand::Cancel(seq) => {
                Some(*seq)
            }
            ControlCommand::Stop => None,
        }
    }
}

impl FromStr for ControlCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let verb = words.next().map(str::to_lowercase).unwrap_or_default();
        let number = words.next().map(|word| word.trim_start_matches('#').parse::<usize>());

        let job_number = || match number.clone() {
            Some(Ok(seq)) if seq > 0 => Ok(seq),
            _ => Err(format!("'{}' needs a job number, e.g. '{} 2'", verb, verb)),
        };

        match verb.as_str() {
            "pause" | "p" => Ok(ControlCommand::Pause(job_number()?)),
            "resume" | "r" => Ok(ControlCommand::Resume(job_number()?)),
            "cancel" | "c" => Ok(ControlCommand::Cancel(job_number()?)),
            "stop" | "quit" | "q" => Ok(ControlCommand::Stop),
            "" => Err("empty command".to_string()),
            other => Err(format!(
                "Unknown command '{}'. Valid commands: pause N, resume N, cancel N, stop",
                other
            )),
        }
    }
}

/// What a Ctrl-C does while a batch runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// Cancel all jobs and clean up partial outputs
    StopBatch,
    /// Leave immediately, even if stopping has not finished
    Exit,
}

impl InterruptAction {
    /// `count` is the number of interrupts received so far, including this one
    pub fn for_count(count: usize) -> Self {
        if count <= 1 {
            InterruptAction::StopBatch
        } else {
            InterruptAction::Exit
        }
    }
}
