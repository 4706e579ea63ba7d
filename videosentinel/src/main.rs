//! CLI entry point: wires clap subcommands to the batch controller, network
//! pipeline, and duplicate grouper in `videosentinel-core`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use videosentinel_core::batch::{BatchConfig, BatchController};
use videosentinel_core::cache::MediaInfoCache;
use videosentinel_core::duplicates::{self, GroupingMode};
use videosentinel_core::logging::{self, LogConfig};
use videosentinel_core::pipeline::{LocalFsStore, PipelineConfig, PipelineController, QueueEntry};
use videosentinel_core::quality_policy::TargetCodec;
use videosentinel_core::shutdown::ShutdownCoordinator;

#[derive(Parser)]
#[command(name = "videosentinel", about = "Batch video re-encoding, network pipeline, and duplicate detection")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a directory and bring non-compliant files up to modern codec/container standards.
    Scan {
        directory: PathBuf,
        #[arg(long)]
        recursive: bool,
        #[arg(long)]
        max_files: Option<usize>,
        #[arg(long)]
        only_noncompliant: bool,
        #[arg(long)]
        replace_original: bool,
        #[arg(long)]
        recover: bool,
        #[arg(long)]
        downscale: bool,
        #[arg(long)]
        fix_preview_only: bool,
        #[arg(long)]
        lenient: bool,
        #[arg(long)]
        manual_crf: Option<f32>,
    },
    /// Enqueue and run the network pipeline over remote-stored files.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Find and remove duplicate videos, keeping the best copy.
    Dedupe {
        directory: PathBuf,
        #[arg(long)]
        recursive: bool,
        #[arg(long, default_value = "perceptual")]
        mode: String,
        #[arg(long, default_value_t = duplicates::DEFAULT_PERCEPTUAL_THRESHOLD)]
        threshold: f64,
        #[arg(long)]
        apply: bool,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Add a remote file to the persisted queue.
    Add {
        remote_source: PathBuf,
        final_remote_path: PathBuf,
        #[arg(long, default_value = "22.0")]
        crf: f32,
        #[arg(long)]
        replace_original: bool,
    },
    /// Resume and run the three-worker pipeline until the queue drains.
    Run {
        #[arg(long)]
        temp_dir: Option<PathBuf>,
        #[arg(long, default_value_t = videosentinel_core::pipeline::DEFAULT_BUFFER_SIZE)]
        buffer_size: usize,
        #[arg(long, default_value_t = videosentinel_core::pipeline::DEFAULT_MAX_TEMP_SIZE_BYTES)]
        max_temp_size_bytes: u64,
    },
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("videosentinel")
}

fn queue_state_path(temp_dir: &std::path::Path) -> PathBuf {
    temp_dir.join("queue_state.json")
}

fn run_scan(
    directory: PathBuf,
    recursive: bool,
    max_files: Option<usize>,
    only_noncompliant: bool,
    replace_original: bool,
    recover: bool,
    downscale: bool,
    fix_preview_only: bool,
    lenient: bool,
    manual_crf: Option<f32>,
    shutdown: ShutdownCoordinator,
) -> Result<()> {
    let cache = MediaInfoCache::new(default_temp_dir().join("media_info_cache")).context("failed to open MediaInfo cache")?;
    let controller = BatchController::new(cache, shutdown);

    let files = controller.discover(&directory, recursive);
    info!(count = files.len(), directory = %directory.display(), "discovered video files");

    let config = BatchConfig {
        max_files,
        only_noncompliant,
        replace_original,
        recover,
        downscale,
        fix_preview_only,
        lenient,
        manual_crf,
    };

    let report = controller.run_batch(&files, &config);

    if let Some(reason) = report.fatal_error {
        anyhow::bail!("batch aborted: {reason}");
    }

    let done = report.jobs.iter().filter(|j| j.state == videosentinel_core::job::JobState::Done).count();
    let failed = report.jobs.iter().filter(|j| j.state == videosentinel_core::job::JobState::Failed).count();
    let skipped = report.jobs.iter().filter(|j| j.state == videosentinel_core::job::JobState::Skipped).count();

    println!("processed {} files: {done} done, {failed} failed, {skipped} skipped, {} unprocessed", report.jobs.len(), report.unprocessed.len());

    for job in report.jobs.iter().filter(|j| j.state == videosentinel_core::job::JobState::Failed) {
        warn!(path = %job.source_path.display(), error = ?job.error, "file failed");
    }

    Ok(())
}

fn run_queue_add(remote_source: PathBuf, final_remote_path: PathBuf, crf: f32, replace_original: bool) -> Result<()> {
    let temp_dir = default_temp_dir();
    let queue_path = queue_state_path(&temp_dir);
    let controller = PipelineController::new(queue_path, temp_dir.join("staging"), PipelineConfig::default(), ShutdownCoordinator::new(), Arc::new(LocalFsStore))?;

    let flags = videosentinel_core::encoder::EncodeFlags {
        replace_original,
        ..Default::default()
    };
    controller.enqueue(QueueEntry::new(remote_source, final_remote_path, TargetCodec::Hevc, crf, flags))?;
    println!("enqueued");
    Ok(())
}

fn run_queue_run(temp_dir: Option<PathBuf>, buffer_size: usize, max_temp_size_bytes: u64, shutdown: ShutdownCoordinator) -> Result<()> {
    let temp_dir = temp_dir.unwrap_or_else(default_temp_dir);
    let queue_path = queue_state_path(&temp_dir);
    let config = PipelineConfig {
        max_temp_size_bytes,
        ..PipelineConfig::default().with_buffer_size(buffer_size)
    };
    let controller = Arc::new(PipelineController::new(queue_path, temp_dir.join("staging"), config, shutdown, Arc::new(LocalFsStore))?);
    controller.resume()?;
    controller.run();
    println!("queue drained");
    Ok(())
}

fn run_dedupe(directory: PathBuf, recursive: bool, mode: String, threshold: f64, apply: bool) -> Result<()> {
    let cache = MediaInfoCache::new(default_temp_dir().join("media_info_cache")).context("failed to open MediaInfo cache")?;
    let controller = BatchController::new(cache, ShutdownCoordinator::new());
    let files = controller.discover(&directory, recursive);

    let grouping_mode = match mode.as_str() {
        "perceptual" => GroupingMode::Perceptual { threshold },
        "filename" => GroupingMode::Filename,
        other => anyhow::bail!("unknown dedupe mode: {other} (expected perceptual or filename)"),
    };

    let groups = duplicates::group_duplicates(&files, grouping_mode);
    println!("found {} duplicate group(s)", groups.len());

    for group in &groups {
        println!("keeper: {}", group.keeper.display());
        for member in &group.members {
            if member != &group.keeper {
                println!("  duplicate: {}", member.display());
                if apply {
                    std::fs::remove_file(member).with_context(|| format!("failed to remove {}", member.display()))?;
                }
            }
        }
        if apply {
            if let Some(renamed) = duplicates::rename_keeper_if_free(&group.keeper)? {
                println!("  renamed keeper to {}", renamed.display());
            }
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    logging::init_logging("videosentinel", LogConfig::default()).context("failed to initialize logging")?;

    let shutdown = ShutdownCoordinator::new();
    let shutdown_for_handler = shutdown.clone();
    ctrlc::set_handler(move || {
        warn!("shutdown requested, finishing the current file before stopping");
        shutdown_for_handler.stop();
    })
    .context("failed to install Ctrl-C handler")?;

    let cli = Cli::parse();
    match cli.command {
        Command::Scan {
            directory,
            recursive,
            max_files,
            only_noncompliant,
            replace_original,
            recover,
            downscale,
            fix_preview_only,
            lenient,
            manual_crf,
        } => run_scan(
            directory,
            recursive,
            max_files,
            only_noncompliant,
            replace_original,
            recover,
            downscale,
            fix_preview_only,
            lenient,
            manual_crf,
            shutdown,
        ),
        Command::Queue { action } => match action {
            QueueAction::Add {
                remote_source,
                final_remote_path,
                crf,
                replace_original,
            } => run_queue_add(remote_source, final_remote_path, crf, replace_original),
            QueueAction::Run {
                temp_dir,
                buffer_size,
                max_temp_size_bytes,
            } => run_queue_run(temp_dir, buffer_size, max_temp_size_bytes, shutdown),
        },
        Command::Dedupe {
            directory,
            recursive,
            mode,
            threshold,
            apply,
        } => run_dedupe(directory, recursive, mode, threshold, apply),
    }
}
