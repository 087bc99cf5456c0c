//! Fakes for the transport, probe and engine seams.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::decision::TranscodeParameters;
use crate::error::{EngineError, ProbeError, TransportError};
use crate::ffmpeg::{EncodeResult, TranscodeEngine};
use crate::ffprobe::{MediaDescriptor, MediaProbe};
use crate::job::{ChatRef, MessageHandle, MessageId, SourceMedia, ThumbRef};
use crate::progress::{ProgressReporter, ProgressSink, Stage};
use crate::transport::{EditOutcome, OutputMeta, Transport, UploadedRef};

type EditResponder = Box<dyn Fn() -> Result<EditOutcome, TransportError> + Send + Sync>;

#[derive(Default)]
struct Recorded {
    sent: Vec<String>,
    edits: Vec<String>,
    deleted: usize,
    uploads: Vec<(PathBuf, OutputMeta)>,
    files_sent: Vec<OutputMeta>,
}

/// In-memory transport recording every call
pub struct FakeTransport {
    recorded: Mutex<Recorded>,
    edit_responder: Mutex<Option<EditResponder>>,
    download_bytes: Vec<u8>,
    fail_download: bool,
    fail_upload: bool,
    fail_thumbnail: bool,
    delete_delay: Duration,
}

impl FakeTransport {
    pub fn new() -> Self {
        FakeTransport {
            recorded: Mutex::new(Recorded::default()),
            edit_responder: Mutex::new(None),
            download_bytes: vec![0u8; 3 * 1024 * 1024],
            fail_download: false,
            fail_upload: false,
            fail_thumbnail: false,
            delete_delay: Duration::ZERO,
        }
    }

    pub fn failing_download(mut self) -> Self {
        self.fail_download = true;
        self
    }

    pub fn failing_upload(mut self) -> Self {
        self.fail_upload = true;
        self
    }

    /// Make every status delete take `delay`
    pub fn slow_delete(mut self, delay: Duration) -> Self {
        self.delete_delay = delay;
        self
    }

    pub fn failing_thumbnail(mut self) -> Self {
        self.fail_thumbnail = true;
        self
    }

    /// Answer every later edit with `responder` instead of `Applied`
    pub fn fail_edits_with<F>(&self, responder: F)
    where
        F: Fn() -> Result<EditOutcome, TransportError> + Send + Sync + 'static,
    {
        *self.edit_responder.lock().unwrap() = Some(Box::new(responder));
    }

    pub fn sent(&self) -> Vec<String> {
        self.recorded.lock().unwrap().sent.clone()
    }

    pub fn edits(&self) -> Vec<String> {
        self.recorded.lock().unwrap().edits.clone()
    }

    pub fn deleted(&self) -> usize {
        self.recorded.lock().unwrap().deleted
    }

    pub fn uploads(&self) -> Vec<(PathBuf, OutputMeta)> {
        self.recorded.lock().unwrap().uploads.clone()
    }

    pub fn files_sent(&self) -> Vec<OutputMeta> {
        self.recorded.lock().unwrap().files_sent.clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send_status(
        &self,
        chat: &ChatRef,
        text: &str,
        _reply_to: Option<MessageId>,
    ) -> Result<MessageHandle, TransportError> {
        let mut recorded = self.recorded.lock().unwrap();
        recorded.sent.push(text.to_string());
        Ok(MessageHandle {
            chat: chat.clone(),
            message: MessageId(recorded.sent.len() as i64),
        })
    }

    async fn edit_status(&self, _handle: &MessageHandle, text: &str) -> Result<EditOutcome, TransportError> {
        self.recorded.lock().unwrap().edits.push(text.to_string());
        match self.edit_responder.lock().unwrap().as_ref() {
            Some(responder) => responder(),
            None => Ok(EditOutcome::Applied),
        }
    }

    async fn delete_status(&self, _handle: &MessageHandle) -> Result<(), TransportError> {
        if !self.delete_delay.is_zero() {
            tokio::time::sleep(self.delete_delay).await;
        }
        self.recorded.lock().unwrap().deleted += 1;
        Ok(())
    }

    async fn download_to(
        &self,
        path: &Path,
        _source: &SourceMedia,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), TransportError> {
        if self.fail_download {
            return Err(TransportError::Transfer("connection reset".to_string()));
        }
        let total = self.download_bytes.len() as u64;
        sink.transferred(total / 2, total).await;
        tokio::fs::write(path, &self.download_bytes).await?;
        sink.transferred(total, total).await;
        Ok(())
    }

    async fn download_thumbnail(&self, _thumb: &ThumbRef, path: &Path) -> Result<PathBuf, TransportError> {
        if self.fail_thumbnail {
            return Err(TransportError::Transfer("thumbnail gone".to_string()));
        }
        tokio::fs::write(path, b"jpeg").await?;
        Ok(path.to_path_buf())
    }

    async fn upload_from(
        &self,
        path: &Path,
        meta: &OutputMeta,
        sink: &mut dyn ProgressSink,
    ) -> Result<UploadedRef, TransportError> {
        if self.fail_upload {
            return Err(TransportError::Transfer("upload refused".to_string()));
        }
        let size = tokio::fs::metadata(path).await?.len();
        sink.transferred(size, size).await;
        self.recorded
            .lock()
            .unwrap()
            .uploads
            .push((path.to_path_buf(), meta.clone()));
        Ok(UploadedRef {
            id: "upload-1".to_string(),
            file_name: path.file_name().unwrap().to_string_lossy().to_string(),
            size,
        })
    }

    async fn send_file(
        &self,
        chat: &ChatRef,
        _file: &UploadedRef,
        meta: &OutputMeta,
        _reply_to: Option<MessageId>,
    ) -> Result<MessageHandle, TransportError> {
        self.recorded.lock().unwrap().files_sent.push(meta.clone());
        Ok(MessageHandle {
            chat: chat.clone(),
            message: MessageId(99),
        })
    }
}

/// Probe answering from a queue: first call gets the first answer, and so on
pub struct FakeProbe {
    answers: Mutex<VecDeque<Result<MediaDescriptor, ProbeError>>>,
    calls: Mutex<Vec<PathBuf>>,
}

impl FakeProbe {
    pub fn new(answers: Vec<Result<MediaDescriptor, ProbeError>>) -> Self {
        FakeProbe {
            answers: Mutex::new(answers.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaProbe for FakeProbe {
    async fn probe(&self, path: &Path) -> Result<MediaDescriptor, ProbeError> {
        self.calls.lock().unwrap().push(path.to_path_buf());
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ProbeError::NoVideoStream))
    }
}

/// How the fake engine behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineBehavior {
    Succeed,
    /// Writes output and progress files, then exits non-zero
    FailAfterWriting,
    /// Writes the progress log and never returns
    Hang,
}

/// Engine that writes files in the workspace instead of running ffmpeg
pub struct FakeEngine {
    behavior: EngineBehavior,
    seen: Mutex<Vec<TranscodeParameters>>,
}

impl FakeEngine {
    pub fn new(behavior: EngineBehavior) -> Self {
        FakeEngine {
            behavior,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<TranscodeParameters> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TranscodeEngine for FakeEngine {
    async fn run(
        &self,
        _input: &Path,
        params: &TranscodeParameters,
        source_duration: f64,
        reporter: &mut ProgressReporter,
    ) -> Result<EncodeResult, EngineError> {
        self.seen.lock().unwrap().push(params.clone());

        tokio::fs::write(params.progress_log(), "out_time_us=0\nprogress=continue\n")
            .await
            .map_err(|source| EngineError::ProgressLog {
                path: params.progress_log().clone(),
                source,
            })?;
        reporter.report(Stage::Encode, 0.0).await;

        match self.behavior {
            EngineBehavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            EngineBehavior::FailAfterWriting => {
                let _ = tokio::fs::write(params.output(), vec![0u8; 1024]).await;
                Err(EngineError::Failed {
                    exit_code: Some(1),
                    stderr: "Conversion failed!".to_string(),
                })
            }
            EngineBehavior::Succeed => {
                tokio::fs::write(params.output(), vec![0u8; 1024 * 1024])
                    .await
                    .map_err(|_| EngineError::MissingOutput(params.output().clone()))?;
                reporter.report(Stage::Encode, 1.0).await;
                Ok(EncodeResult {
                    output: params.output().clone(),
                    elapsed: std::time::Duration::from_secs(1),
                    encoded_seconds: source_duration,
                    speed: Some(1.0),
                })
            }
        }
    }
}
