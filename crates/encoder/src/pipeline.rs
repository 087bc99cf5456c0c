//! Job orchestration.
//!
//! `JobPipeline::run` walks one job through download, probe, decision, encode
//! and upload. Whatever happens, the job's workspace is closed before `run`
//! returns, and the user sees exactly one terminal status: the status message
//! deleted on success, the "already at target" notice, or the failure notice.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

use crate::config::EncoderConfig;
use crate::decision::{decide, Decision, FrameSize, Ladder, ProfileTable, TranscodeParameters};
use crate::error::JobError;
use crate::ffmpeg::TranscodeEngine;
use crate::ffprobe::MediaProbe;
use crate::job::{sanitize_file_name, Job, JobId, JobState, MessageHandle};
use crate::progress::{ProgressReporter, ReporterSettings, Stage};
use crate::transport::{OutputMeta, Transport, VideoAttributes};
use crate::workspace::Workspace;

const MIB: u64 = 1024 * 1024;

pub const STATUS_STARTING: &str = "Trying to process.";
pub const STATUS_PROBING: &str = "Extracting metadata...";

/// Everything the pipeline needs besides its collaborators
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub work_root: PathBuf,
    pub support_link: String,
    pub reporter: ReporterSettings,
    pub ladder: Ladder,
    pub profiles: ProfileTable,
}

impl From<&EncoderConfig> for PipelineSettings {
    fn from(cfg: &EncoderConfig) -> Self {
        PipelineSettings {
            work_root: cfg.work_root.clone(),
            support_link: cfg.support_link.clone(),
            reporter: cfg.progress.clone(),
            ladder: cfg.ladder.clone(),
            profiles: cfg.profiles.clone(),
        }
    }
}

/// How a job ended
#[derive(Debug)]
pub enum JobOutcome {
    Delivered {
        size: FrameSize,
        original_bytes: u64,
        encoded_bytes: u64,
    },
    AlreadySatisfied,
    Failed {
        /// State the job was in when the error was raised
        stage: JobState,
        error: JobError,
    },
}

#[derive(Debug)]
pub struct JobReport {
    pub job_id: JobId,
    pub outcome: JobOutcome,
    /// Every state entered, in order
    pub transitions: Vec<JobState>,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, JobOutcome::Failed { .. })
    }
}

/// Mutable per-run state that must survive the stage future being dropped
struct JobRun<'a> {
    job: &'a Job,
    state: JobState,
    transitions: Vec<JobState>,
    status: Option<MessageHandle>,
    workspace: Option<Workspace>,
}

impl<'a> JobRun<'a> {
    fn new(job: &'a Job) -> Self {
        JobRun {
            job,
            state: JobState::Created,
            transitions: vec![JobState::Created],
            status: None,
            workspace: None,
        }
    }

    fn enter(&mut self, next: JobState) {
        info!("Job {}: {} → {}", self.job.id, self.state, next);
        self.state = next;
        self.transitions.push(next);
    }

    fn workspace(&mut self) -> io::Result<&mut Workspace> {
        self.workspace
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "workspace is not open"))
    }

    /// Register a file in the workspace before anything writes it
    fn file(&mut self, name: &str) -> io::Result<PathBuf> {
        Ok(self.workspace()?.file(name))
    }
}

pub struct JobPipeline {
    transport: Arc<dyn Transport>,
    probe: Arc<dyn MediaProbe>,
    engine: Arc<dyn TranscodeEngine>,
    settings: PipelineSettings,
}

impl JobPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        probe: Arc<dyn MediaProbe>,
        engine: Arc<dyn TranscodeEngine>,
        settings: PipelineSettings,
    ) -> Self {
        JobPipeline {
            transport,
            probe,
            engine,
            settings,
        }
    }

    /// Run `job` on its own task
    pub fn spawn(self: Arc<Self>, job: Job) -> RunningJob {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let id = job.id.clone();
        let handle = tokio::spawn(async move { self.run(job, cancel_rx).await });

        RunningJob {
            id,
            cancel: JobCanceller(Arc::new(cancel_tx)),
            handle,
        }
    }

    /// Run `job` to completion. Setting `cancel` to true ends the job as failed.
    pub async fn run(&self, job: Job, mut cancel: watch::Receiver<bool>) -> JobReport {
        info!(
            "🎬 Job {}: {} requested for {}",
            job.id,
            job.target_label(),
            job.source.file_name.as_deref().unwrap_or(&job.source.reference)
        );
        let mut run = JobRun::new(&job);

        let result = tokio::select! {
            biased;
            result = self.drive(&mut run) => result,
            _ = cancelled(&mut cancel) => Err(JobError::Cancelled),
        };

        let outcome = match result {
            Ok(outcome) => {
                if run.state == JobState::Finalizing {
                    self.clear_status(&job.id, run.status.as_ref()).await;
                }
                outcome
            }
            Err(error) => {
                let stage = run.state;
                run.enter(JobState::Errored);
                error!("❌ Job {} failed during {}: {}", job.id, stage, error);
                self.notify_failure(run.status.as_ref()).await;
                JobOutcome::Failed { stage, error }
            }
        };

        if let Some(mut workspace) = run.workspace.take() {
            workspace.close();
        }
        run.enter(JobState::Done);

        if let JobOutcome::Delivered {
            size,
            original_bytes,
            encoded_bytes,
        } = &outcome
        {
            info!(
                "✅ Job {} delivered {} ({} MB → {} MB)",
                job.id,
                size,
                original_bytes / MIB,
                encoded_bytes / MIB
            );
        }

        JobReport {
            job_id: job.id.clone(),
            outcome,
            transitions: run.transitions,
        }
    }

    async fn drive(&self, run: &mut JobRun<'_>) -> Result<JobOutcome, JobError> {
        let job = run.job;
        let id = &job.id;

        let handle = self
            .transport
            .send_status(&job.chat, STATUS_STARTING, job.reply_to)
            .await
            .map_err(JobError::Status)?;
        run.status = Some(handle.clone());
        let mut reporter = ProgressReporter::new(self.transport.clone(), handle, self.settings.reporter.clone());

        run.workspace = Some(Workspace::open(&self.settings.work_root, id).await?);
        let input = run.file(&sanitize_file_name(&format!("input_{}{}", id, job.source.extension())))?;

        run.enter(JobState::Downloading);
        reporter.begin(Stage::Download);
        self.transport
            .download_to(&input, &job.source, &mut reporter)
            .await
            .map_err(JobError::Download)?;

        let video = run.file(&format!("video_{}.mp4", id))?;
        tokio::fs::rename(&input, &video).await?;
        let original_bytes = tokio::fs::metadata(&video).await?.len();

        run.enter(JobState::Probing);
        reporter.status(STATUS_PROBING).await;
        let source = self.probe.probe(&video).await?;
        info!(
            "Job {}: source {}x{}, {:.1}s @ {:.2} fps, {} bytes",
            id, source.width, source.height, source.duration, source.fps, original_bytes
        );

        run.enter(JobState::Deciding);
        let settings = match decide(job.target, &source, &self.settings.ladder, &self.settings.profiles) {
            Decision::Skip => {
                run.enter(JobState::Satisfied);
                reporter
                    .status(&format!("The video is already in {}p resolution.", job.target))
                    .await;
                return Ok(JobOutcome::AlreadySatisfied);
            }
            Decision::Encode(settings) => settings,
        };

        run.enter(JobState::Transcoding);
        let output = run.file(&format!("output_{}.mp4", id))?;
        let progress_log = run.file(&format!("progress-{}.txt", id))?;
        let params = TranscodeParameters::new(settings, output, progress_log);
        info!(
            "Job {}: encoding to {} (fps cap {:?}, crf {}, preset {})",
            id,
            params.settings().size,
            params.settings().frame_rate_cap,
            params.settings().profile.crf,
            params.settings().profile.preset
        );
        reporter.begin(Stage::Encode);
        let encoded = self.engine.run(&video, &params, source.duration, &mut reporter).await?;
        info!(
            "Job {}: encoded {:.1}s of video in {:.1}s (speed {})",
            id,
            encoded.encoded_seconds,
            encoded.elapsed.as_secs_f64(),
            encoded.speed.map(|s| format!("{:.2}x", s)).unwrap_or_else(|| "n/a".to_string())
        );

        run.enter(JobState::AssemblingOutput);
        let result = self.probe.probe(&encoded.output).await?;
        let encoded_bytes = tokio::fs::metadata(&encoded.output).await?.len();
        let thumbnail = self.fetch_thumbnail(run).await;
        let meta = OutputMeta {
            caption: build_caption(job, original_bytes, encoded_bytes),
            thumbnail,
            attributes: VideoAttributes {
                duration: result.duration.round() as u32,
                width: result.width,
                height: result.height,
                supports_streaming: true,
            },
        };

        run.enter(JobState::Uploading);
        reporter.begin(Stage::Upload);
        let uploaded = self
            .transport
            .upload_from(&encoded.output, &meta, &mut reporter)
            .await
            .map_err(JobError::Upload)?;
        self.transport
            .send_file(&job.chat, &uploaded, &meta, job.reply_to)
            .await
            .map_err(JobError::Upload)?;

        // Delivered; cancellation no longer applies
        run.enter(JobState::Finalizing);
        Ok(JobOutcome::Delivered {
            size: FrameSize {
                width: result.width,
                height: result.height,
            },
            original_bytes,
            encoded_bytes,
        })
    }

    /// Largest source thumbnail, or `None` if there is none or it can't be fetched
    async fn fetch_thumbnail(&self, run: &mut JobRun<'_>) -> Option<PathBuf> {
        let job = run.job;
        let thumb = job.source.best_thumbnail()?;
        let path = run.file(&format!("thumb_{}.jpg", job.id)).ok()?;

        match self.transport.download_thumbnail(thumb, &path).await {
            Ok(written) => {
                // The transport may pick its own name
                run.workspace().ok()?.register(written.clone());
                Some(written)
            }
            Err(e) => {
                warn!("Job {}: thumbnail unavailable, uploading without one: {}", job.id, e);
                None
            }
        }
    }

    async fn clear_status(&self, id: &JobId, status: Option<&MessageHandle>) {
        let Some(handle) = status else {
            return;
        };
        if let Err(e) = self.transport.delete_status(handle).await {
            warn!("Job {}: failed to delete status message: {}", id, e);
        }
    }

    async fn notify_failure(&self, status: Option<&MessageHandle>) {
        let Some(handle) = status else {
            return;
        };
        let notice = failure_notice(&self.settings.support_link);
        if let Err(e) = self.transport.edit_status(handle, &notice).await {
            warn!("Failed to show failure notice: {}", e);
        }
    }
}

/// Clonable trigger that cancels one running job
#[derive(Debug, Clone)]
pub struct JobCanceller(Arc<watch::Sender<bool>>);

impl JobCanceller {
    pub fn cancel(&self) {
        // No receiver means the job already finished
        let _ = self.0.send(true);
    }
}

/// Handle to a job running on its own task
pub struct RunningJob {
    id: JobId,
    cancel: JobCanceller,
    handle: JoinHandle<JobReport>,
}

impl RunningJob {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn canceller(&self) -> JobCanceller {
        self.cancel.clone()
    }

    /// Abort the task outright; the workspace is still removed when it drops
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub async fn join(self) -> Result<JobReport, JoinError> {
        self.handle.await
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let sender_gone = cancel.wait_for(|c| *c).await.is_err();
    if sender_gone {
        // Nobody can cancel any more
        std::future::pending::<()>().await;
    }
}

pub fn failure_notice(support_link: &str) -> String {
    format!("An error occurred.\n\nContact [SUPPORT]({})", support_link)
}

/// Original caption followed by a size summary line
fn build_caption(job: &Job, original_bytes: u64, encoded_bytes: u64) -> String {
    let summary = format!(
        "{} • {} MB → {} MB",
        job.target_label(),
        original_bytes / MIB,
        encoded_bytes / MIB
    );
    match job.source.caption.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        Some(caption) => format!("{}\n\n{}", caption, summary),
        None => summary,
    }
}
