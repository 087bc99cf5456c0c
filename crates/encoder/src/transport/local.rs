//! Filesystem-backed transport.
//!
//! Source references and thumbnail references are local paths. Delivered
//! videos are copied into an output directory next to a `<name>.json` file
//! holding the caption and attributes. Status messages only exist in memory
//! and in the log.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{EditOutcome, OutputMeta, Transport, UploadedRef, VideoAttributes};
use crate::error::TransportError;
use crate::job::{ChatRef, MessageHandle, MessageId, SourceMedia, ThumbRef};
use crate::progress::ProgressSink;

const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Record written next to every delivered video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub chat: ChatRef,
    pub reply_to: Option<MessageId>,
    pub file_name: String,
    pub size: u64,
    pub caption: String,
    pub thumbnail: Option<PathBuf>,
    pub attributes: VideoAttributes,
    pub delivered_at: DateTime<Utc>,
}

/// Path of the record for a delivered file
pub fn record_path(out_dir: &Path, file_name: &str) -> PathBuf {
    out_dir.join(format!("{}.json", file_name))
}

pub struct LocalTransport {
    out_dir: PathBuf,
    chunk_size: usize,
    next_message: AtomicI64,
    statuses: Mutex<HashMap<MessageHandle, String>>,
}

impl LocalTransport {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        LocalTransport {
            out_dir: out_dir.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            next_message: AtomicI64::new(1),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Current text of a status message, if it still exists
    pub fn status_text(&self, handle: &MessageHandle) -> Option<String> {
        self.statuses.lock().ok()?.get(handle).cloned()
    }

    fn statuses(&self) -> Result<std::sync::MutexGuard<'_, HashMap<MessageHandle, String>>, TransportError> {
        self.statuses
            .lock()
            .map_err(|_| TransportError::Other("status table poisoned".to_string()))
    }

    /// Copy `from` into `to` chunk by chunk, reporting each chunk to `sink`
    async fn copy_with_progress(
        &self,
        from: &Path,
        to: &Path,
        sink: &mut dyn ProgressSink,
    ) -> Result<u64, TransportError> {
        let mut reader = tokio::fs::File::open(from).await?;
        let total = reader.metadata().await?.len();
        let mut writer = tokio::fs::File::create(to).await?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut done = 0u64;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            done += n as u64;
            sink.transferred(done, total).await;
        }
        writer.flush().await?;

        if done != total {
            return Err(TransportError::Transfer(format!(
                "{} changed while copying ({} of {} bytes)",
                from.display(),
                done,
                total
            )));
        }
        Ok(done)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_status(
        &self,
        chat: &ChatRef,
        text: &str,
        _reply_to: Option<MessageId>,
    ) -> Result<MessageHandle, TransportError> {
        let handle = MessageHandle {
            chat: chat.clone(),
            message: MessageId(self.next_message.fetch_add(1, Ordering::Relaxed)),
        };
        self.statuses()?.insert(handle.clone(), text.to_string());
        info!("[chat {} #{}] {}", chat.0, handle.message.0, text);
        Ok(handle)
    }

    async fn edit_status(&self, handle: &MessageHandle, text: &str) -> Result<EditOutcome, TransportError> {
        let mut statuses = self.statuses()?;
        let current = statuses
            .get_mut(handle)
            .ok_or_else(|| TransportError::MessageNotFound(format!("#{}", handle.message.0)))?;
        if current.as_str() == text {
            return Ok(EditOutcome::Unchanged);
        }
        *current = text.to_string();
        info!("[chat {} #{}] {}", handle.chat.0, handle.message.0, text);
        Ok(EditOutcome::Applied)
    }

    async fn delete_status(&self, handle: &MessageHandle) -> Result<(), TransportError> {
        match self.statuses()?.remove(handle) {
            Some(_) => {
                debug!("[chat {} #{}] deleted", handle.chat.0, handle.message.0);
                Ok(())
            }
            None => Err(TransportError::MessageNotFound(format!("#{}", handle.message.0))),
        }
    }

    async fn download_to(
        &self,
        path: &Path,
        source: &SourceMedia,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), TransportError> {
        let from = Path::new(&source.reference);
        if !from.is_file() {
            return Err(TransportError::Transfer(format!("{} is not a file", from.display())));
        }
        let bytes = self.copy_with_progress(from, path, sink).await?;
        debug!("Fetched {} bytes from {}", bytes, from.display());
        Ok(())
    }

    async fn download_thumbnail(&self, thumb: &ThumbRef, path: &Path) -> Result<PathBuf, TransportError> {
        tokio::fs::copy(&thumb.0, path).await?;
        Ok(path.to_path_buf())
    }

    async fn upload_from(
        &self,
        path: &Path,
        _meta: &OutputMeta,
        sink: &mut dyn ProgressSink,
    ) -> Result<UploadedRef, TransportError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransportError::Transfer(format!("{} has no file name", path.display())))?
            .to_string();

        tokio::fs::create_dir_all(&self.out_dir).await?;
        let dest = self.out_dir.join(&file_name);
        let size = self.copy_with_progress(path, &dest, sink).await?;

        Ok(UploadedRef {
            id: dest.display().to_string(),
            file_name,
            size,
        })
    }

    async fn send_file(
        &self,
        chat: &ChatRef,
        file: &UploadedRef,
        meta: &OutputMeta,
        reply_to: Option<MessageId>,
    ) -> Result<MessageHandle, TransportError> {
        // The workspace copy is about to be removed
        let thumbnail = match &meta.thumbnail {
            Some(thumb) => {
                let kept = self.out_dir.join(format!("{}.jpg", file.file_name));
                tokio::fs::copy(thumb, &kept).await?;
                Some(kept)
            }
            None => None,
        };

        let record = DeliveryRecord {
            chat: chat.clone(),
            reply_to,
            file_name: file.file_name.clone(),
            size: file.size,
            caption: meta.caption.clone(),
            thumbnail,
            attributes: meta.attributes,
            delivered_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| TransportError::Other(format!("failed to encode delivery record: {}", e)))?;
        let record_file = record_path(&self.out_dir, &file.file_name);
        tokio::fs::write(&record_file, json).await?;

        info!("📦 Delivered {} to chat {} ({})", file.file_name, chat.0, record_file.display());
        Ok(MessageHandle {
            chat: chat.clone(),
            message: MessageId(self.next_message.fetch_add(1, Ordering::Relaxed)),
        })
    }
}
