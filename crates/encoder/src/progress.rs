//! Throttled status-message progress.
//!
//! One `ProgressReporter` exists per job and owns the job's status handle. It
//! turns completion fractions into edits of that message, at most one per
//! interval, and never lets an edit failure escape to the caller.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use humansize::{format_size, DECIMAL};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::job::MessageHandle;
use crate::transport::{EditOutcome, Transport};

const BAR_WIDTH: usize = 10;

/// Pipeline stages that report progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Download,
    Encode,
    Upload,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Download => "**DOWNLOADING:**",
            Stage::Encode => "**ENCODING:**",
            Stage::Upload => "**UPLOADING:**",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Receives byte-level transfer progress from the transport
#[async_trait]
pub trait ProgressSink: Send {
    async fn transferred(&mut self, done: u64, total: u64);
}

/// Throttle settings for status edits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterSettings {
    /// Minimum time between two edits of the same stage
    pub min_interval_ms: u64,
    /// Minimum fraction advance that is worth an edit
    pub min_step: f64,
}

impl Default for ReporterSettings {
    fn default() -> Self {
        ReporterSettings {
            min_interval_ms: 5_000,
            min_step: 0.05,
        }
    }
}

impl ReporterSettings {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

/// Progress of the current stage
#[derive(Debug, Clone)]
pub struct ProgressState {
    pub stage: Stage,
    /// Completion in `[0, 1]`, never decreasing within a stage
    pub fraction: f64,
    /// Bytes done and total, for transfer stages
    pub bytes: Option<(u64, u64)>,
    pub started_at: Instant,
    pub last_text: Option<String>,
    pub last_edit: Option<Instant>,
    pub last_edit_fraction: f64,
}

impl ProgressState {
    fn new(stage: Stage) -> Self {
        ProgressState {
            stage,
            fraction: 0.0,
            bytes: None,
            started_at: Instant::now(),
            last_text: None,
            last_edit: None,
            last_edit_fraction: 0.0,
        }
    }
}

pub struct ProgressReporter {
    transport: Arc<dyn Transport>,
    handle: MessageHandle,
    settings: ReporterSettings,
    state: Option<ProgressState>,
    edits_sent: u64,
}

impl ProgressReporter {
    pub fn new(transport: Arc<dyn Transport>, handle: MessageHandle, settings: ReporterSettings) -> Self {
        ProgressReporter {
            transport,
            handle,
            settings,
            state: None,
            edits_sent: 0,
        }
    }

    pub fn state(&self) -> Option<&ProgressState> {
        self.state.as_ref()
    }

    /// Number of edits attempted so far, status notices included
    pub fn edits_sent(&self) -> u64 {
        self.edits_sent
    }

    /// Start a new stage, discarding the previous stage's state
    pub fn begin(&mut self, stage: Stage) {
        debug!("Progress stage {} started", stage);
        self.state = Some(ProgressState::new(stage));
    }

    /// Report completion for `stage`, editing the status message if the throttle allows
    pub async fn report(&mut self, stage: Stage, fraction: f64) {
        if self.state.as_ref().map(|s| s.stage) != Some(stage) {
            self.begin(stage);
        }
        self.update(fraction, None).await;
    }

    /// Unthrottled best-effort edit, used for notices between stages
    pub async fn status(&mut self, text: &str) {
        self.edit(text).await;
    }

    async fn update(&mut self, fraction: f64, bytes: Option<(u64, u64)>) {
        let now = Instant::now();
        let interval = self.settings.min_interval();
        let min_step = self.settings.min_step;

        let text = {
            let Some(state) = self.state.as_mut() else {
                debug!("Progress update without an active stage ignored");
                return;
            };

            let fraction = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 };
            state.fraction = state.fraction.max(fraction);
            if bytes.is_some() {
                state.bytes = bytes;
            }

            let due = match state.last_edit {
                None => true,
                Some(at) => {
                    let advanced = state.fraction - state.last_edit_fraction >= min_step;
                    let finished = state.fraction >= 1.0 && state.last_edit_fraction < 1.0;
                    now.duration_since(at) >= interval && (advanced || finished)
                }
            };
            if !due {
                return;
            }

            let text = render(state, now);
            if state.last_text.as_deref() == Some(text.as_str()) {
                return;
            }

            state.last_edit = Some(now);
            state.last_edit_fraction = state.fraction;
            state.last_text = Some(text.clone());
            text
        };

        self.edit(&text).await;
    }

    async fn edit(&mut self, text: &str) {
        self.edits_sent += 1;
        match self.transport.edit_status(&self.handle, text).await {
            Ok(EditOutcome::Applied) => {}
            Ok(EditOutcome::Unchanged) => debug!("Status message unchanged, nothing to edit"),
            Err(e) => warn!("Status edit failed (ignored): {}", e),
        }
    }
}

#[async_trait]
impl ProgressSink for ProgressReporter {
    async fn transferred(&mut self, done: u64, total: u64) {
        let fraction = if total == 0 { 0.0 } else { done as f64 / total as f64 };
        self.update(fraction, Some((done, total))).await;
    }
}

fn render(state: &ProgressState, now: Instant) -> String {
    let filled = ((state.fraction * BAR_WIDTH as f64).floor() as usize).min(BAR_WIDTH);
    let bar: String = "■".repeat(filled) + &"□".repeat(BAR_WIDTH - filled);

    let mut text = format!("{}\n[{}] {:.1}%", state.stage.label(), bar, state.fraction * 100.0);

    if let Some((done, total)) = state.bytes {
        text.push_str(&format!("\n{} of {}", format_size(done, DECIMAL), format_size(total, DECIMAL)));
    }

    let elapsed = now.duration_since(state.started_at).as_secs_f64();
    if state.fraction > 0.0 && state.fraction < 1.0 && elapsed >= 1.0 {
        let eta = elapsed * (1.0 - state.fraction) / state.fraction;
        text.push_str(&format!("\nETA: {}", format_eta(eta as u64)));
    }

    text
}

fn format_eta(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
