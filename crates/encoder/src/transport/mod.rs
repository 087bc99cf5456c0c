//! Messaging transport the pipeline talks to.
//!
//! The pipeline only sees the `Transport` trait; `local` provides a
//! filesystem-backed implementation used by the command-line tool.

pub mod local;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::job::{ChatRef, MessageHandle, MessageId, SourceMedia, ThumbRef};
use crate::progress::ProgressSink;

pub use local::LocalTransport;

/// Result of editing a status message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Applied,
    /// The transport refused because the text did not change
    Unchanged,
}

/// Streaming attributes attached to an uploaded video
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoAttributes {
    /// Whole seconds
    pub duration: u32,
    pub width: u32,
    pub height: u32,
    pub supports_streaming: bool,
}

/// Everything sent alongside the encoded file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputMeta {
    pub caption: String,
    pub thumbnail: Option<PathBuf>,
    pub attributes: VideoAttributes,
}

/// Handle to bytes already uploaded, ready to be attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedRef {
    pub id: String,
    pub file_name: String,
    pub size: u64,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_status(
        &self,
        chat: &ChatRef,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageHandle, TransportError>;

    async fn edit_status(&self, handle: &MessageHandle, text: &str) -> Result<EditOutcome, TransportError>;

    async fn delete_status(&self, handle: &MessageHandle) -> Result<(), TransportError>;

    /// Fetch the source bytes into `path`, reporting progress to `sink`
    async fn download_to(
        &self,
        path: &Path,
        source: &SourceMedia,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), TransportError>;

    /// Fetch a thumbnail into `path`, returning where it was written
    async fn download_thumbnail(&self, thumb: &ThumbRef, path: &Path) -> Result<PathBuf, TransportError>;

    async fn upload_from(
        &self,
        path: &Path,
        meta: &OutputMeta,
        sink: &mut dyn ProgressSink,
    ) -> Result<UploadedRef, TransportError>;

    async fn send_file(
        &self,
        chat: &ChatRef,
        file: &UploadedRef,
        meta: &OutputMeta,
        reply_to: Option<MessageId>,
    ) -> Result<MessageHandle, TransportError>;
}
