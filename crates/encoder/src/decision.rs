use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ffprobe::MediaDescriptor;

/// Sources above this frame rate get capped
pub const FRAME_RATE_THRESHOLD: f64 = 30.0;

/// Output frame rate for capped sources
pub const FRAME_RATE_CAP: u32 = 30;

/// Output frame size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One rung of the resolution ladder and its canonical 16:9 size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rung {
    pub height: u32,
    pub width: u32,
}

/// Canonical target sizes, keyed by height
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ladder {
    pub rungs: Vec<Rung>,
}

impl Default for Ladder {
    fn default() -> Self {
        Ladder {
            rungs: vec![
                Rung { height: 240, width: 426 },
                Rung { height: 360, width: 640 },
                Rung { height: 480, width: 854 },
                Rung { height: 720, width: 1280 },
            ],
        }
    }
}

impl Ladder {
    pub fn rung(&self, height: u32) -> Option<&Rung> {
        self.rungs.iter().find(|r| r.height == height)
    }
}

/// Fixed encoder settings applied to every job of a given target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeProfile {
    pub video_codec: String,
    pub pixel_format: String,
    pub preset: String,
    pub crf: u8,
    pub audio_codec: String,
    pub audio_channels: u8,
    pub audio_bitrate: String,
    pub subtitle_codec: String,
    /// Move the moov atom to the front so players can start streaming early
    pub faststart: bool,
}

impl Default for EncodeProfile {
    fn default() -> Self {
        EncodeProfile {
            video_codec: "libx264".to_string(),
            pixel_format: "yuv420p".to_string(),
            preset: "faster".to_string(),
            crf: 24,
            audio_codec: "libopus".to_string(),
            audio_channels: 2,
            audio_bitrate: "128k".to_string(),
            subtitle_codec: "copy".to_string(),
            faststart: true,
        }
    }
}

/// Profile override for one target height
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetProfile {
    pub target: u32,
    pub profile: EncodeProfile,
}

/// Lookup table from target height to encoder profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileTable {
    /// Used for any target without its own entry
    pub default: EncodeProfile,
    pub by_target: Vec<TargetProfile>,
}

impl ProfileTable {
    pub fn lookup(&self, target: u32) -> &EncodeProfile {
        self.by_target
            .iter()
            .find(|entry| entry.target == target)
            .map(|entry| &entry.profile)
            .unwrap_or(&self.default)
    }
}

/// What the engine should produce, before any paths are known
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeSettings {
    pub size: FrameSize,
    pub frame_rate_cap: Option<u32>,
    pub profile: EncodeProfile,
}

/// Outcome of the transcode decision
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Source already matches the requested rung
    Skip,
    Encode(EncodeSettings),
}

/// Decide whether a source needs encoding for `target`, and with what settings.
///
/// A source is already satisfied when its height equals the target, or when its
/// width equals the canonical width of the target rung (letterboxed sources).
/// Target 0 never skips: it re-encodes at the source size.
pub fn decide(
    target: u32,
    source: &MediaDescriptor,
    ladder: &Ladder,
    profiles: &ProfileTable,
) -> Decision {
    let rung = if target == 0 { None } else { ladder.rung(target) };

    if target != 0 {
        let height_matches = source.height == target;
        let width_matches = rung.map_or(false, |r| r.width == source.width);
        if height_matches || width_matches {
            return Decision::Skip;
        }
    }

    let size = match rung {
        Some(r) => FrameSize {
            width: r.width,
            height: r.height,
        },
        None => FrameSize {
            width: source.width,
            height: source.height,
        },
    };

    let frame_rate_cap = if source.fps > FRAME_RATE_THRESHOLD {
        Some(FRAME_RATE_CAP)
    } else {
        None
    };

    Decision::Encode(EncodeSettings {
        size,
        frame_rate_cap,
        profile: profiles.lookup(target).clone(),
    })
}

/// Settings plus the workspace paths the engine writes to
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeParameters {
    settings: EncodeSettings,
    output: PathBuf,
    progress_log: PathBuf,
}

impl TranscodeParameters {
    pub fn new(settings: EncodeSettings, output: PathBuf, progress_log: PathBuf) -> Self {
        Self {
            settings,
            output,
            progress_log,
        }
    }

    pub fn settings(&self) -> &EncodeSettings {
        &self.settings
    }

    pub fn output(&self) -> &PathBuf {
        &self.output
    }

    pub fn progress_log(&self) -> &PathBuf {
        &self.progress_log
    }
}
