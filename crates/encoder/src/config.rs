use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::decision::{Ladder, ProfileTable};
use crate::progress::ReporterSettings;

/// Configuration for the encode pipeline and the `encode-job` tool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Directory under which every job gets its own workspace
    pub work_root: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    /// Link shown in the failure notice
    pub support_link: String,
    /// Status edit throttling
    pub progress: ReporterSettings,
    /// How often the encoder progress log is read
    pub poll_interval_ms: u64,
    pub ladder: Ladder,
    pub profiles: ProfileTable,
    /// Workspaces older than this are treated as left behind by a crash
    pub orphan_max_age_secs: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl EncoderConfig {
    pub fn default_config() -> Self {
        Self {
            work_root: std::env::temp_dir().join("encodemedia"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            support_link: "https://t.me/EncodeMediaSupport".to_string(),
            progress: ReporterSettings::default(),
            poll_interval_ms: 2000,
            ladder: Ladder::default(),
            profiles: ProfileTable::default(),
            orphan_max_age_secs: 6 * 60 * 60,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn orphan_max_age(&self) -> Duration {
        Duration::from_secs(self.orphan_max_age_secs)
    }

    /// Load configuration from a file, or return defaults if path is None or the file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let Some(config_path) = path else {
            return Ok(Self::default_config());
        };
        if !config_path.exists() {
            return Ok(Self::default_config());
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))
        }
    }
}
