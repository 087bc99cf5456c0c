pub mod config;
pub mod decision;
pub mod error;
pub mod ffmpeg;
pub mod ffprobe;
pub mod job;
pub mod pipeline;
pub mod progress;
pub mod sweep;
pub mod transport;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use config::EncoderConfig;
pub use decision::{decide, Decision, EncodeProfile, Ladder, ProfileTable, TranscodeParameters};
pub use error::{EngineError, JobError, ProbeError, TransportError};
pub use ffmpeg::{FfmpegEngine, TranscodeEngine};
pub use ffprobe::{FfprobeCli, MediaDescriptor, MediaProbe};
pub use job::{ChatRef, Job, JobId, JobState, MessageId, SourceMedia, ThumbRef};
pub use pipeline::{JobOutcome, JobPipeline, JobReport, PipelineSettings, RunningJob};
pub use progress::{ProgressReporter, ReporterSettings, Stage};
pub use transport::{LocalTransport, Transport};
