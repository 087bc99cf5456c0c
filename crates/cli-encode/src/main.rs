use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use encoder::{
    config::EncoderConfig,
    ffmpeg::FfmpegEngine,
    ffprobe::FfprobeCli,
    job::{ChatRef, Job, SourceMedia, ThumbRef},
    pipeline::{JobCanceller, JobOutcome, JobPipeline, PipelineSettings, RunningJob},
    sweep,
    transport::LocalTransport,
};
use log::{error, info, warn};

/// Re-encode video files to a target resolution
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Target height (240, 360, 480, 720, ...); 0 keeps the source resolution
    #[arg(short, long)]
    target: u32,

    /// Directory receiving encoded files and their delivery records
    #[arg(short, long, default_value = "encoded")]
    out_dir: PathBuf,

    /// Caption attached to every output
    #[arg(long)]
    caption: Option<String>,

    /// Thumbnail image attached to every output
    #[arg(long)]
    thumbnail: Option<PathBuf>,

    /// Video files to encode
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins unless --verbose is given; info otherwise
    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if args.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.format_timestamp_secs().init();

    let cfg = EncoderConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    info!("encode-job starting");
    info!("  Work root: {}", cfg.work_root.display());
    info!("  Output dir: {}", args.out_dir.display());
    info!("  ffmpeg: {}, ffprobe: {}", cfg.ffmpeg_bin.display(), cfg.ffprobe_bin.display());
    info!("  Ladder: {:?}", cfg.ladder.rungs);

    sweep::sweep_orphaned_workspaces(&cfg.work_root, cfg.orphan_max_age())
        .await
        .context("Failed to clean up orphaned workspaces")?;

    let pipeline = Arc::new(JobPipeline::new(
        Arc::new(LocalTransport::new(&args.out_dir)),
        Arc::new(FfprobeCli::new(&cfg.ffprobe_bin)),
        Arc::new(FfmpegEngine::new(&cfg.ffmpeg_bin, cfg.poll_interval())),
        PipelineSettings::from(&cfg),
    ));

    let running: Vec<RunningJob> = args
        .inputs
        .iter()
        .map(|input| {
            let job = build_job(input, &args);
            info!("Queued job {} for {}", job.id, input.display());
            pipeline.clone().spawn(job)
        })
        .collect();
    let total = running.len();

    let cancellers: Vec<JobCanceller> = running.iter().map(RunningJob::canceller).collect();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⚠️  Interrupted, cancelling {} job(s)", cancellers.len());
            for canceller in &cancellers {
                canceller.cancel();
            }
        }
    });

    let mut delivered = 0;
    let mut satisfied = 0;
    let mut failed = 0;
    for job in running {
        let id = job.id().clone();
        match job.join().await {
            Ok(report) => match report.outcome {
                JobOutcome::Delivered { .. } => delivered += 1,
                JobOutcome::AlreadySatisfied => {
                    info!("Job {}: already at {}p, nothing to do", id, args.target);
                    satisfied += 1;
                }
                JobOutcome::Failed { stage, error } => {
                    error!("Job {} failed during {}: {}", id, stage, error);
                    failed += 1;
                }
            },
            Err(e) => {
                error!("Job {} did not finish: {}", id, e);
                failed += 1;
            }
        }
    }
    interrupt.abort();

    info!(
        "Summary: {} job(s), {} delivered, {} already at target, {} failed",
        total, delivered, satisfied, failed
    );
    if failed > 0 {
        bail!("{} of {} job(s) failed", failed, total);
    }
    Ok(())
}

fn build_job(input: &Path, args: &Args) -> Job {
    let mut source = SourceMedia::new(input.display().to_string());
    source.file_name = input.file_name().map(|n| n.to_string_lossy().to_string());
    source.caption = args.caption.clone();
    source.thumbnails = args
        .thumbnail
        .iter()
        .map(|p| ThumbRef(p.display().to_string()))
        .collect();

    // Local runs have no chat to reply in
    Job::new(source, args.target, ChatRef(0), None)
}
