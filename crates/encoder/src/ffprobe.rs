use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::ProbeError;

/// Frame rate assumed when the probe does not report one
pub const DEFAULT_FRAME_RATE: f64 = 30.0;

/// Normalized probe result
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub width: u32,
    pub height: u32,
    /// Duration in seconds
    pub duration: f64,
    /// Frames per second
    pub fps: f64,
}

/// Anything that can describe a media file
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaDescriptor, ProbeError>;
}

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: Option<FFProbeFormat>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub duration: Option<String>,
    pub size: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub codec_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<String>,
    pub avg_frame_rate: Option<String>,
    pub r_frame_rate: Option<String>,
}

impl FFProbeData {
    /// Reduce raw ffprobe output to a descriptor, failing on missing geometry or duration
    pub fn into_descriptor(self) -> Result<MediaDescriptor, ProbeError> {
        let video = self
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .ok_or(ProbeError::NoVideoStream)?;

        let width = video.width.filter(|w| *w > 0).ok_or(ProbeError::MissingField("width"))?;
        let height = video.height.filter(|h| *h > 0).ok_or(ProbeError::MissingField("height"))?;

        // Container duration first, some muxers only fill in the stream one
        let duration = self
            .format
            .as_ref()
            .and_then(|f| parse_seconds(f.duration.as_deref()))
            .or_else(|| parse_seconds(video.duration.as_deref()))
            .ok_or(ProbeError::MissingField("duration"))?;

        let fps = video
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| video.r_frame_rate.as_deref().and_then(parse_frame_rate))
            .unwrap_or(DEFAULT_FRAME_RATE);

        Ok(MediaDescriptor {
            width,
            height,
            duration,
            fps,
        })
    }
}

fn parse_seconds(value: Option<&str>) -> Option<f64> {
    value
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
}

/// Parse frame rate from string (e.g., "30/1", "30000/1001", "29.97")
pub fn parse_frame_rate(frame_rate_str: &str) -> Option<f64> {
    if let Some((num, den)) = frame_rate_str.split_once('/') {
        let num: f64 = num.trim().parse().ok()?;
        let den: f64 = den.trim().parse().ok()?;
        if den > 0.0 && num > 0.0 {
            return Some(num / den);
        }
        // "0/0" is what ffprobe prints when it doesn't know
        return None;
    }

    frame_rate_str
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|&f| f > 0.0 && f < 1000.0)
}

/// ffprobe invoked as a subprocess
#[derive(Debug, Clone)]
pub struct FfprobeCli {
    pub ffprobe_bin: PathBuf,
}

impl FfprobeCli {
    pub fn new(ffprobe_bin: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe_bin: ffprobe_bin.into(),
        }
    }

    /// Run ffprobe and return the parsed JSON without interpretation
    pub async fn probe_raw(&self, file_path: &Path) -> Result<FFProbeData, ProbeError> {
        if !file_path.exists() {
            return Err(ProbeError::FileNotFound(file_path.to_path_buf()));
        }

        debug!("Executing ffprobe for: {}", file_path.display());

        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(file_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(ProbeError::Spawn)?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

#[async_trait]
impl MediaProbe for FfprobeCli {
    async fn probe(&self, path: &Path) -> Result<MediaDescriptor, ProbeError> {
        let descriptor = self.probe_raw(path).await?.into_descriptor()?;
        debug!(
            "Probed {}: {}x{}, {:.2}s @ {:.2} fps",
            path.display(),
            descriptor.width,
            descriptor.height,
            descriptor.duration,
            descriptor.fps
        );
        Ok(descriptor)
    }
}
