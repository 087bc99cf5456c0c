use std::collections::VecDeque;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::process::Command;
use tokio::time::{Instant, MissedTickBehavior};

use crate::decision::TranscodeParameters;
use crate::error::EngineError;
use crate::progress::{ProgressReporter, Stage};

/// Lines of ffmpeg stderr kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// Result of a finished encode
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeResult {
    pub output: PathBuf,
    /// Wall-clock time spent encoding
    pub elapsed: Duration,
    /// Media seconds written according to the progress log
    pub encoded_seconds: f64,
    /// Last reported speed, e.g. 1.5 for 1.5x realtime
    pub speed: Option<f64>,
}

/// Runs one encode described by `TranscodeParameters`
#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    async fn run(
        &self,
        input: &Path,
        params: &TranscodeParameters,
        source_duration: f64,
        reporter: &mut ProgressReporter,
    ) -> Result<EncodeResult, EngineError>;
}

/// Command builder for generating ffmpeg command lines
pub struct CommandBuilder;

impl CommandBuilder {
    pub fn new() -> Self {
        CommandBuilder
    }

    /// Build the encode argument list (without the binary itself)
    pub fn build_encode_command(&self, input: &Path, params: &TranscodeParameters) -> Vec<String> {
        let settings = params.settings();
        let profile = &settings.profile;
        let mut args = Vec::new();

        args.push("-hide_banner".to_string());
        args.push("-loglevel".to_string());
        args.push("error".to_string());

        // Machine-readable progress goes to its own file
        args.push("-progress".to_string());
        args.push(params.progress_log().to_string_lossy().to_string());

        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());

        if let Some(cap) = settings.frame_rate_cap {
            args.push("-r".to_string());
            args.push(cap.to_string());
        }

        args.push("-c:v".to_string());
        args.push(profile.video_codec.clone());
        args.push("-pix_fmt".to_string());
        args.push(profile.pixel_format.clone());
        args.push("-preset".to_string());
        args.push(profile.preset.clone());
        args.push("-s".to_string());
        args.push(settings.size.to_string());
        args.push("-crf".to_string());
        args.push(profile.crf.to_string());

        args.push("-c:a".to_string());
        args.push(profile.audio_codec.clone());
        args.push("-ac".to_string());
        args.push(profile.audio_channels.to_string());
        args.push("-ab".to_string());
        args.push(profile.audio_bitrate.clone());

        args.push("-c:s".to_string());
        args.push(profile.subtitle_codec.clone());

        if profile.faststart {
            args.push("-movflags".to_string());
            args.push("+faststart".to_string());
        }

        args.push(params.output().to_string_lossy().to_string());
        args.push("-y".to_string());

        args
    }
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Latest values seen in an ffmpeg `-progress` log
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncoderProgress {
    /// Encoded position in microseconds
    pub out_time_us: i64,
    pub speed: Option<f64>,
    pub finished: bool,
}

impl EncoderProgress {
    /// Apply one `key=value` line
    pub fn apply_line(&mut self, line: &str) {
        let Some((key, value)) = line.trim().split_once('=') else {
            return;
        };
        let value = value.trim();

        match key {
            // out_time_ms is in microseconds as well, despite the name
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.out_time_us = us.max(0);
                }
            }
            "out_time" => {
                if let Some(us) = parse_out_time(value) {
                    self.out_time_us = us;
                }
            }
            "speed" => {
                if let Some(speed) = value.strip_suffix('x').and_then(|s| s.trim().parse::<f64>().ok()) {
                    self.speed = Some(speed);
                }
            }
            "progress" => {
                if value == "end" {
                    self.finished = true;
                }
            }
            _ => {}
        }
    }

    pub fn encoded_seconds(&self) -> f64 {
        self.out_time_us as f64 / 1_000_000.0
    }

    /// `min(1, encoded / total)`, 0 for an unknown total
    pub fn fraction(&self, total_seconds: f64) -> f64 {
        if total_seconds <= 0.0 || !total_seconds.is_finite() {
            return 0.0;
        }
        (self.encoded_seconds() / total_seconds).clamp(0.0, 1.0)
    }
}

/// Parse `HH:MM:SS.micro` into microseconds; negative or `N/A` values give `None`
fn parse_out_time(value: &str) -> Option<i64> {
    if value.starts_with('-') {
        return None;
    }
    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(((hours * 3600.0 + minutes * 60.0 + seconds) * 1_000_000.0).round() as i64)
}

/// Incremental reader over a growing progress log
#[derive(Debug)]
pub struct ProgressTail {
    path: PathBuf,
    offset: u64,
    pending: String,
    progress: EncoderProgress,
}

impl ProgressTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ProgressTail {
            path: path.into(),
            offset: 0,
            pending: String::new(),
            progress: EncoderProgress::default(),
        }
    }

    pub fn progress(&self) -> &EncoderProgress {
        &self.progress
    }

    /// Read whatever was appended since the last poll. Returns true if anything new arrived.
    /// A log that does not exist yet is not an error.
    pub async fn poll(&mut self) -> io::Result<bool> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        if buf.is_empty() {
            return Ok(false);
        }
        self.offset += buf.len() as u64;
        self.pending.push_str(&String::from_utf8_lossy(&buf));

        // Only complete lines; a half-written one waits for the next poll
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            self.progress.apply_line(&line);
        }
        Ok(true)
    }
}

/// ffmpeg invoked as a subprocess
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    pub ffmpeg_bin: PathBuf,
    pub poll_interval: Duration,
}

impl FfmpegEngine {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        FfmpegEngine {
            ffmpeg_bin: ffmpeg_bin.into(),
            poll_interval,
        }
    }
}

enum EngineEvent {
    Exited(io::Result<ExitStatus>),
    Tick,
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    async fn run(
        &self,
        input: &Path,
        params: &TranscodeParameters,
        source_duration: f64,
        reporter: &mut ProgressReporter,
    ) -> Result<EncodeResult, EngineError> {
        let args = CommandBuilder::new().build_encode_command(input, params);
        debug!("Executing ffmpeg: {} {}", self.ffmpeg_bin.display(), args.join(" "));

        let started = Instant::now();
        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                bin: self.ffmpeg_bin.clone(),
                source,
            })?;

        let stderr = child.stderr.take();
        let stderr_handle = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let mut tail = ProgressTail::new(params.progress_log());
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let status = loop {
            let event = tokio::select! {
                status = child.wait() => EngineEvent::Exited(status),
                _ = ticker.tick() => EngineEvent::Tick,
            };

            match event {
                EngineEvent::Exited(status) => break status,
                EngineEvent::Tick => match tail.poll().await {
                    Ok(true) => {
                        reporter
                            .report(Stage::Encode, tail.progress().fraction(source_duration))
                            .await;
                    }
                    Ok(false) => {}
                    Err(source) => {
                        let _ = child.kill().await;
                        return Err(EngineError::ProgressLog {
                            path: params.progress_log().clone(),
                            source,
                        });
                    }
                },
            }
        };

        // Lines written between the last tick and exit
        match tail.poll().await {
            Ok(true) => {
                reporter
                    .report(Stage::Encode, tail.progress().fraction(source_duration))
                    .await;
            }
            Ok(false) => {}
            Err(e) => warn!("Failed to read final progress from {}: {}", params.progress_log().display(), e),
        }

        let stderr = stderr_handle.await.unwrap_or_default();
        let status = status.map_err(|e| EngineError::Failed {
            exit_code: None,
            stderr: format!("failed to wait for ffmpeg: {}", e),
        })?;

        if !status.success() {
            return Err(EngineError::Failed {
                exit_code: status.code(),
                stderr,
            });
        }

        if !params.output().exists() {
            return Err(EngineError::MissingOutput(params.output().clone()));
        }

        let result = EncodeResult {
            output: params.output().clone(),
            elapsed: started.elapsed(),
            encoded_seconds: tail.progress().encoded_seconds(),
            speed: tail.progress().speed,
        };
        info!(
            "ffmpeg finished in {:.1}s ({:.1}s encoded, speed {:?})",
            result.elapsed.as_secs_f64(),
            result.encoded_seconds,
            result.speed
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{EncodeProfile, EncodeSettings, FrameSize};
    use crate::job::{ChatRef, MessageHandle, MessageId};
    use crate::progress::ReporterSettings;
    use crate::test_support::FakeTransport;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn params(dir: &Path, frame_rate_cap: Option<u32>) -> TranscodeParameters {
        TranscodeParameters::new(
            EncodeSettings {
                size: FrameSize { width: 854, height: 480 },
                frame_rate_cap,
                profile: EncodeProfile::default(),
            },
            dir.join("output_1.mp4"),
            dir.join("progress-1.txt"),
        )
    }

    #[test]
    fn test_encode_command_order() {
        let dir = Path::new("/work");
        let args = CommandBuilder::new().build_encode_command(&dir.join("video_1.mp4"), &params(dir, None));

        let expected: Vec<String> = [
            "-hide_banner", "-loglevel", "error",
            "-progress", "/work/progress-1.txt",
            "-i", "/work/video_1.mp4",
            "-c:v", "libx264", "-pix_fmt", "yuv420p", "-preset", "faster",
            "-s", "854x480", "-crf", "24",
            "-c:a", "libopus", "-ac", "2", "-ab", "128k",
            "-c:s", "copy",
            "-movflags", "+faststart",
            "/work/output_1.mp4", "-y",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(args, expected);
    }

    #[test]
    fn test_frame_rate_cap_follows_input() {
        let dir = Path::new("/work");
        let args = CommandBuilder::new().build_encode_command(&dir.join("in.mp4"), &params(dir, Some(30)));

        let input_pos = args.iter().position(|a| a == "/work/in.mp4").unwrap();
        assert_eq!(args[input_pos + 1], "-r");
        assert_eq!(args[input_pos + 2], "30");
    }

    #[test]
    fn test_faststart_can_be_disabled() {
        let dir = Path::new("/work");
        let mut p = params(dir, None);
        let mut settings = p.settings().clone();
        settings.profile.faststart = false;
        p = TranscodeParameters::new(settings, p.output().clone(), p.progress_log().clone());

        let args = CommandBuilder::new().build_encode_command(&dir.join("in.mp4"), &p);
        assert!(!args.contains(&"-movflags".to_string()));
    }

    #[test]
    fn test_progress_line_parsing() {
        let mut progress = EncoderProgress::default();

        progress.apply_line("frame=120");
        progress.apply_line("out_time_us=5000000");
        assert_eq!(progress.out_time_us, 5_000_000);

        progress.apply_line("out_time_ms=6000000");
        assert_eq!(progress.out_time_us, 6_000_000);

        progress.apply_line("out_time=00:01:02.500000");
        assert_eq!(progress.out_time_us, 62_500_000);

        progress.apply_line("out_time=-00:00:00.023220");
        assert_eq!(progress.out_time_us, 62_500_000, "negative start offsets are ignored");

        progress.apply_line("speed=1.5x");
        assert_eq!(progress.speed, Some(1.5));
        progress.apply_line("speed=N/A");
        assert_eq!(progress.speed, Some(1.5));

        assert!(!progress.finished);
        progress.apply_line("progress=end");
        assert!(progress.finished);
    }

    #[test]
    fn test_fraction_is_capped() {
        let progress = EncoderProgress {
            out_time_us: 15_000_000,
            ..Default::default()
        };
        assert!((progress.fraction(30.0) - 0.5).abs() < 1e-9);
        assert_eq!(progress.fraction(10.0), 1.0);
        assert_eq!(progress.fraction(0.0), 0.0);
    }

    #[tokio::test]
    async fn test_tail_reads_incrementally() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("progress.txt");
        let mut tail = ProgressTail::new(&log);

        // Not created yet
        assert!(!tail.poll().await.unwrap());

        std::fs::write(&log, "out_time_us=1000000\nprogress=continue\nout_time_us=20").unwrap();
        assert!(tail.poll().await.unwrap());
        assert_eq!(tail.progress().out_time_us, 1_000_000);

        // Finish the half-written line
        let mut contents = std::fs::read_to_string(&log).unwrap();
        contents.push_str("00000\nprogress=end\n");
        std::fs::write(&log, contents).unwrap();
        assert!(tail.poll().await.unwrap());
        assert_eq!(tail.progress().out_time_us, 2_000_000);
        assert!(tail.progress().finished);

        assert!(!tail.poll().await.unwrap());
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, exit_code: i32) -> PathBuf {
        // Arguments: $5 is the progress log, the output is second to last
        let script = format!(
            r#"progress="$5"
prev=""
last=""
for arg in "$@"; do prev="$last"; last="$arg"; done
printf 'frame=10\nout_time_us=1000000\nspeed=2.0x\nprogress=continue\n' > "$progress"
printf 'frame=20\nout_time_us=2000000\nspeed=2.0x\nprogress=end\n' >> "$progress"
echo "encoded" > "$prev"
echo "Conversion status {code}" >&2
exit {code}
"#,
            code = exit_code
        );
        write_script(dir, &format!("fake-ffmpeg-{}.sh", exit_code), &script)
    }

    #[cfg(unix)]
    fn test_reporter(transport: &Arc<FakeTransport>) -> ProgressReporter {
        ProgressReporter::new(
            transport.clone(),
            MessageHandle {
                chat: ChatRef(1),
                message: MessageId(2),
            },
            ReporterSettings {
                min_interval_ms: 0,
                min_step: 0.0,
            },
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_success_reports_progress() {
        let dir = TempDir::new().unwrap();
        let engine = FfmpegEngine::new(fake_ffmpeg(dir.path(), 0), Duration::from_millis(10));
        let transport = Arc::new(FakeTransport::new());
        let mut reporter = test_reporter(&transport);
        let input = dir.path().join("video_1.mp4");
        std::fs::write(&input, b"source").unwrap();
        let p = params(dir.path(), None);

        reporter.begin(Stage::Encode);
        let result = engine.run(&input, &p, 2.0, &mut reporter).await.unwrap();

        assert_eq!(&result.output, p.output());
        assert!(p.output().exists());
        assert!((result.encoded_seconds - 2.0).abs() < 1e-9);
        assert_eq!(result.speed, Some(2.0));
        assert!(transport.edits().iter().any(|e| e.contains("100.0%")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_non_zero_exit_is_error() {
        let dir = TempDir::new().unwrap();
        let engine = FfmpegEngine::new(fake_ffmpeg(dir.path(), 1), Duration::from_millis(10));
        let transport = Arc::new(FakeTransport::new());
        let mut reporter = test_reporter(&transport);
        let input = dir.path().join("video_1.mp4");
        std::fs::write(&input, b"source").unwrap();

        let err = engine
            .run(&input, &params(dir.path(), None), 2.0, &mut reporter)
            .await
            .unwrap_err();

        match err {
            EngineError::Failed { exit_code, stderr } => {
                assert_eq!(exit_code, Some(1));
                assert!(stderr.contains("Conversion status 1"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clean_exit_without_output_is_error() {
        let dir = TempDir::new().unwrap();
        let engine = FfmpegEngine::new(
            write_script(dir.path(), "silent-ffmpeg.sh", "exit 0\n"),
            Duration::from_millis(10),
        );
        let transport = Arc::new(FakeTransport::new());
        let mut reporter = test_reporter(&transport);
        let input = dir.path().join("video_1.mp4");
        std::fs::write(&input, b"source").unwrap();
        let p = params(dir.path(), None);

        let err = engine.run(&input, &p, 2.0, &mut reporter).await.unwrap_err();

        match err {
            EngineError::MissingOutput(path) => assert_eq!(&path, p.output()),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_progress_log_kills_encoder() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("still-running");
        let engine = FfmpegEngine::new(
            write_script(
                dir.path(),
                "slow-ffmpeg.sh",
                &format!("sleep 1\ntouch \"{}\"\nsleep 5\n", marker.display()),
            ),
            Duration::from_millis(10),
        );
        let transport = Arc::new(FakeTransport::new());
        let mut reporter = test_reporter(&transport);
        let input = dir.path().join("video_1.mp4");
        std::fs::write(&input, b"source").unwrap();
        let p = params(dir.path(), None);
        // A directory where the log should be cannot be read as one
        std::fs::create_dir(p.progress_log()).unwrap();

        let started = std::time::Instant::now();
        let err = engine.run(&input, &p, 2.0, &mut reporter).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));

        match err {
            EngineError::ProgressLog { path, .. } => assert_eq!(&path, p.progress_log()),
            other => panic!("unexpected error: {:?}", other),
        }

        // A surviving encoder would have created the marker by now
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_run_missing_binary_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let engine = FfmpegEngine::new(dir.path().join("no-such-ffmpeg"), Duration::from_millis(10));
        let transport = Arc::new(FakeTransport::new());
        let mut reporter = ProgressReporter::new(
            transport.clone(),
            MessageHandle {
                chat: ChatRef(1),
                message: MessageId(2),
            },
            ReporterSettings::default(),
        );

        let err = engine
            .run(&dir.path().join("in.mp4"), &params(dir.path(), None), 2.0, &mut reporter)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }
}
