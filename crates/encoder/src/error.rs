//! Error types for the transcode pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Failures reported by the messaging transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("rate limited, retry after {0} seconds")]
    RateLimited(u64),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Other(String),
}

/// Failures while probing a media file.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to run ffprobe: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("ffprobe failed (exit code {exit_code:?}): {stderr}")]
    Failed { exit_code: Option<i32>, stderr: String },

    #[error("ffprobe output is not valid JSON: {0}")]
    InvalidOutput(#[from] serde_json::Error),

    #[error("no video stream found")]
    NoVideoStream,

    #[error("missing or invalid {0}")]
    MissingField(&'static str),
}

/// Failures while running the transcoding engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn {bin}: {source}")]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ffmpeg failed (exit code {exit_code:?})\nSTDERR:\n{stderr}")]
    Failed { exit_code: Option<i32>, stderr: String },

    #[error("failed to read progress log {path}: {source}")]
    ProgressLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ffmpeg reported success but produced no output at {0}")]
    MissingOutput(PathBuf),
}

/// Terminal failure of one job, tagged by the stage that raised it.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("could not send status message: {0}")]
    Status(#[source] TransportError),

    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("download failed: {0}")]
    Download(#[source] TransportError),

    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("encoding failed: {0}")]
    Engine(#[from] EngineError),

    #[error("upload failed: {0}")]
    Upload(#[source] TransportError),

    #[error("job cancelled")]
    Cancelled,
}
