use std::path::PathBuf;

use thiserror::Error;

use crate::job::{JobId, JobStatus};

#[derive(Error, Debug)]
pub enum RetempoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to spawn encoder '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoder exited with {}: {diagnostic}", exit_label(.code))]
    Encode {
        code: Option<i32>,
        diagnostic: String,
    },

    #[error("Job {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("No free name left for {}", .0.display())]
    NamingExhausted(PathBuf),

    #[error("Media probing error: {0}")]
    Probe(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Process signal error: {0}")]
    Suspend(String),

    #[error("Unsupported on this platform: {0}")]
    Unsupported(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no exit code".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, RetempoError>;
