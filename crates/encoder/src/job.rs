use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a transcode job.
///
/// Built from the creation timestamp (seconds) plus a short random suffix, so two
/// requests arriving in the same second still get distinct workspaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn from_timestamp(created_at: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        JobId(format!("{}_{}", created_at.timestamp(), &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Chat the request came from and where results are sent back to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatRef(pub i64);

/// Message identifier inside a chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

/// Handle to the status message the pipeline keeps editing
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle {
    pub chat: ChatRef,
    pub message: MessageId,
}

/// Opaque reference to a thumbnail attached to the inbound media
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbRef(pub String);

/// Inbound media as the transport describes it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceMedia {
    /// Transport-specific handle used to fetch the bytes
    pub reference: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub caption: Option<String>,
    /// Thumbnails in ascending size; the last one is the largest
    pub thumbnails: Vec<ThumbRef>,
}

impl SourceMedia {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            ..Default::default()
        }
    }

    /// Largest available thumbnail
    pub fn best_thumbnail(&self) -> Option<&ThumbRef> {
        self.thumbnails.last()
    }

    /// Extension of the original file name including the dot, `.mp4` when unknown
    pub fn extension(&self) -> String {
        self.file_name
            .as_deref()
            .and_then(|name| std::path::Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty())
            .map(|ext| format!(".{}", ext))
            .unwrap_or_else(|| ".mp4".to_string())
    }
}

/// One transcode request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub source: SourceMedia,
    /// Requested output height; 0 re-encodes without resizing
    pub target: u32,
    pub created_at: DateTime<Utc>,
    pub chat: ChatRef,
    pub reply_to: Option<MessageId>,
}

impl Job {
    pub fn new(source: SourceMedia, target: u32, chat: ChatRef, reply_to: Option<MessageId>) -> Self {
        let created_at = Utc::now();
        Job {
            id: JobId::from_timestamp(created_at),
            source,
            target,
            created_at,
            chat,
            reply_to,
        }
    }

    /// Human label for the requested rung, e.g. `480p`
    pub fn target_label(&self) -> String {
        if self.target == 0 {
            "original resolution".to_string()
        } else {
            format!("{}p", self.target)
        }
    }
}

/// Pipeline states in the order a successful job visits them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Created,
    Downloading,
    Probing,
    Deciding,
    Satisfied,
    Transcoding,
    AssemblingOutput,
    Uploading,
    Finalizing,
    Done,
    Errored,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Replace anything outside `[A-Za-z0-9-_.]` with an underscore
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '_' })
        .collect()
}
