//! retempo - batch media transcoding
//!
//! Scans a directory tree, re-encodes every matching file with ffmpeg on a
//! bounded pool of workers and shows live progress. Jobs can be paused,
//! resumed or canceled from stdin while the batch runs.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use chrono::Local;
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing::{Level, debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use retempo::cli::{Args, Commands, ControlCommand, InterruptAction};
use retempo::config::{Config, OverwriteMode};
use retempo::error::RetempoError;
use retempo::events::BatchEvent;
use retempo::job::{Job, JobId, JobStatus, MediaKind};
use retempo::media::{EncoderTool, FfmpegCommandBuilder, FfprobeProber, MediaProber};
use retempo::process::SignalSuspender;
use retempo::report::BatchReport;
use retempo::scan::plan_batch;
use retempo::scheduler::{BatchControl, BatchRun};

/// Resolution of the progress bars (positions per job)
const BAR_STEPS: u64 = 1000;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging to both console and file
    let _log_guard = setup_logging(args.verbose)?;

    let mut config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            if Path::new("retempo.toml").exists() {
                info!("Found retempo.toml in current directory, loading...");
                Config::from_file("retempo.toml")?
            } else {
                Config::default()
            }
        }
    };

    match args.command {
        Commands::Run { src, dst, threads, tempo, overwrite, kind, compression } => {
            if let Some(src) = src {
                config.batch.source_dir = Some(src);
            }
            if let Some(dst) = dst {
                config.batch.dest_dir = Some(dst);
            }
            if let Some(threads) = threads {
                config.batch.threads = threads;
            }
            if let Some(tempo) = tempo {
                config.batch.tempo = tempo;
            }
            if let Some(overwrite) = overwrite {
                config.batch.overwrite = overwrite.parse::<OverwriteMode>()?;
            }
            if let Some(kind) = kind {
                config.batch.media_kind = parse_media_kind(&kind)?;
            }
            if compression {
                config.batch.compression = true;
            }

            let report = run_batch(config).await?;
            if !report.is_clean() {
                warn!("Batch finished with failed or canceled jobs");
            }
        }
        Commands::Probe { file } => {
            info!("Probing {}", file.display());
            let prober = FfprobeProber::new(config.encoder.ffprobe_path());
            let media = prober.probe(&file).await?;

            println!("\n{}", file.display());
            match media.duration_secs {
                Some(duration) => println!("Duration:  {:.2} sec", duration),
                None => println!("Duration:  unknown"),
            }
            match media.bit_rate_kbps {
                Some(rate) => println!("Bitrate:   {:.0} kbit/s", rate),
                None => println!("Bitrate:   unknown"),
            }
            println!("Size:      {:.2} MB", media.size_bytes as f64 / 1024.0 / 1024.0);

            let kind = config.batch.media_kind;
            match media.reference(kind, config.batch.tempo) {
                Some(reference) => println!("Reference: {:.1} ({} progress, tempo {})", reference, kind, config.batch.tempo),
                None => println!("Reference: unknown ({} progress would be indeterminate)", kind),
            }
        }
        Commands::Check => {
            config.validate()?;
            let tool = EncoderTool::new(&config.encoder);
            tool.check_availability().await?;
            println!("{}", tool.version_info().await?);
            println!("Probe: {}", config.encoder.ffprobe_path().display());
        }
        Commands::InitConfig { path } => {
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            Config::default().save_to_file(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }

    Ok(())
}

async fn run_batch(config: Config) -> Result<BatchReport> {
    config.validate()?;
    let src = config
        .batch
        .source_dir
        .clone()
        .ok_or_else(|| anyhow!("No source directory: pass --src or set batch.source_dir"))?;
    let dst = config
        .batch
        .dest_dir
        .clone()
        .ok_or_else(|| anyhow!("No destination directory: pass --dst or set batch.dest_dir"))?;
    if src == dst {
        bail!("Source and destination must differ: {}", src.display());
    }

    info!("Processing directory: {}", src.display());
    let sources = plan_batch(&src, &dst, config.batch.media_kind)?;

    let (run, control, mut events) = BatchRun::prepare(
        &config,
        sources,
        Arc::new(FfprobeProber::new(config.encoder.ffprobe_path())),
        Arc::new(FfmpegCommandBuilder::new(config.encoder.ffmpeg_path.clone())),
        Arc::new(SignalSuspender::new()),
    )
    .await?;

    let mut display = ProgressDisplay::new(&control.snapshot().await)?;
    display.println("Commands: pause N | resume N | cancel N | stop");

    let stdin_task = tokio::spawn(handle_control_commands(control.clone(), spawn_stdin_reader()));
    let interrupt_control = control.clone();
    let interrupt_task = tokio::spawn(async move {
        let mut interrupts = 0;
        while tokio::signal::ctrl_c().await.is_ok() {
            interrupts += 1;
            match InterruptAction::for_count(interrupts) {
                InterruptAction::StopBatch => {
                    warn!("Interrupted, stopping batch (press Ctrl-C again to exit immediately)");
                    let control = interrupt_control.clone();
                    tokio::spawn(async move { control.stop_all().await });
                }
                InterruptAction::Exit => {
                    warn!("Interrupted again, exiting without cleanup");
                    std::process::exit(130);
                }
            }
        }
    });

    let runner = tokio::spawn(run.run());
    while let Some(event) = events.recv().await {
        if display.handle(event) {
            break;
        }
    }

    let report = runner.await??;
    stdin_task.abort();
    interrupt_task.abort();

    println!("\n{}", report);
    for (source, error) in &report.failures {
        println!("  {}: {}", source.display(), error);
    }
    Ok(report)
}

/// Forward stdin lines from a plain thread; a blocked read must never hold up shutdown
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn handle_control_commands(control: BatchControl, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<ControlCommand>() {
            Ok(command) => command,
            Err(e) => {
                warn!("{}", e);
                continue;
            }
        };
        if let Err(e) = apply_control(&control, command).await {
            warn!("{:?} rejected: {}", command, e);
        }
    }
}

async fn apply_control(control: &BatchControl, command: ControlCommand) -> Result<()> {
    let Some(seq) = command.job_number() else {
        control.stop_all().await;
        return Ok(());
    };
    let job = control
        .job_by_seq(seq)
        .await
        .ok_or_else(|| anyhow!("There is no job #{}", seq))?;

    match command {
        ControlCommand::Pause(_) => control.request_pause(job.id).await?,
        ControlCommand::Resume(_) => control.request_resume(job.id).await?,
        ControlCommand::Cancel(_) => control.request_cancel(job.id).await?,
        ControlCommand::Stop => control.stop_all().await,
    }
    Ok(())
}

/// Terminal rendering of batch events: one overall bar plus a bar per active job
struct ProgressDisplay {
    multi: MultiProgress,
    overall: ProgressBar,
    job_style: ProgressStyle,
    bars: HashMap<JobId, ProgressBar>,
    labels: HashMap<JobId, String>,
}

impl ProgressDisplay {
    fn new(jobs: &[Job]) -> Result<Self> {
        let multi = MultiProgress::new();
        let overall = multi.add(ProgressBar::new(BAR_STEPS));
        overall.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% {msg}")?
                .progress_chars("#>-"),
        );
        overall.set_message(format!("0/{} files", jobs.len()));

        let job_style = ProgressStyle::default_bar()
            .template("  [{bar:30.green/white}] {percent:>3}% {msg}")?
            .progress_chars("=> ");

        let labels = jobs
            .iter()
            .map(|job| (job.id, format!("#{} {}", job.seq, job.display_name())))
            .collect();

        Ok(Self {
            multi,
            overall,
            job_style,
            bars: HashMap::new(),
            labels,
        })
    }

    fn label(&self, id: JobId, seq: usize) -> String {
        self.labels.get(&id).cloned().unwrap_or_else(|| format!("#{}", seq))
    }

    fn println(&self, message: impl AsRef<str>) {
        if let Err(e) = self.multi.println(message) {
            debug!("Could not print to terminal: {}", e);
        }
    }

    /// Apply one event; returns true once the batch finished
    fn handle(&mut self, event: BatchEvent) -> bool {
        match event {
            BatchEvent::JobStatusChanged { id, seq, status } => {
                let label = self.label(id, seq);
                match status {
                    JobStatus::Running => {
                        let bar = self.bars.entry(id).or_insert_with(|| {
                            let bar = self.multi.add(ProgressBar::new(BAR_STEPS));
                            bar.set_style(self.job_style.clone());
                            bar
                        });
                        bar.set_message(label);
                    }
                    JobStatus::Paused => {
                        if let Some(bar) = self.bars.get(&id) {
                            bar.set_message(format!("{} (paused)", label));
                        }
                    }
                    JobStatus::Pending => {}
                    JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled => {
                        if let Some(bar) = self.bars.remove(&id) {
                            bar.finish_and_clear();
                            self.multi.remove(&bar);
                        }
                        self.println(format!("{}: {}", label, status));
                    }
                }
            }
            BatchEvent::JobProgress { id, seq, fraction } => {
                if let Some(bar) = self.bars.get(&id) {
                    match fraction {
                        Some(fraction) => bar.set_position((fraction * BAR_STEPS as f64) as u64),
                        None => bar.set_message(format!("{} (progress unknown)", self.label(id, seq))),
                    }
                }
            }
            BatchEvent::BatchProgress { fraction, finished, total } => {
                self.overall.set_position((fraction * BAR_STEPS as f64) as u64);
                self.overall.set_message(format!("{}/{} files", finished, total));
            }
            BatchEvent::Message(message) => self.println(message),
            BatchEvent::Finished(_) => {
                self.overall.finish();
                return true;
            }
        }
        false
    }
}

/// Setup logging to both console and file
fn setup_logging(verbose: bool) -> Result<WorkerGuard> {
    // Create log directory
    let retempo_dir = std::env::current_dir()?.join(".retempo");
    let log_dir = retempo_dir.join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(&log_dir, "retempo.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false); // No ANSI colors in file

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    info!("==== retempo started {} ====", Local::now().format("%Y-%m-%d %H:%M:%S"));
    info!(
        "Logging initialized - console: {}, file: {}",
        log_level,
        log_dir.join("retempo.log").display()
    );

    Ok(guard)
}

/// Parse media kind from string
fn parse_media_kind(kind: &str) -> Result<MediaKind> {
    match kind.to_lowercase().as_str() {
        "video" => Ok(MediaKind::Video),
        "audio" => Ok(MediaKind::Audio),
        _ => Err(RetempoError::Config(format!(
            "Invalid media kind '{}'. Valid kinds: video, audio",
            kind
        ))
        .into()),
    }
}
