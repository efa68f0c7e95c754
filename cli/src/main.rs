//! offload - Command-line front end for the offload engine.
//!
//! Copies a camera card to several destinations, verifies every copy and
//! reports whether the card is safe to format. Jobs are journaled, so an
//! interrupted run can be picked up again with `offload resume`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Args, Parser, Subcommand};
use offload_engine::{
    create_journal, spawn_offload, verify_audit_manifest, ChecksumListGenerator, FileState, HashAlgorithm,
    JournalStore, OffloadEvent, OffloadJournal, OffloadOutcome, OffloadPhase, OffloadReport, OffloadWorker,
};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_JOURNAL_DIR: &str = ".offload";

/// offload - verified multi-destination card offload
#[derive(Parser, Debug)]
#[command(name = "offload")]
#[command(version)]
#[command(about = "Copy a camera card to several destinations and prove every copy")]
struct Cli {
    /// TOML file with defaults for journal_dir, verify_source, required_copies,
    /// generate_mhl and mhl_format
    #[arg(long, global = true, value_name = "PATH", env = "OFFLOAD_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding job journals
    #[arg(long, global = true, value_name = "PATH", env = "OFFLOAD_JOURNAL_DIR")]
    journal_dir: Option<PathBuf>,

    /// Per-file output and debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new offload
    Run(RunArgs),
    /// Continue an interrupted or cancelled offload
    Resume {
        #[arg(long)]
        job_id: String,
        /// Give failed files another attempt
        #[arg(long)]
        retry_failed: bool,
        /// Write an audit manifest here when the job finishes
        #[arg(long, value_name = "PATH")]
        manifest: Option<PathBuf>,
    },
    /// Show the journaled state of a job
    Status {
        #[arg(long)]
        job_id: String,
    },
    /// Check the self-checksum of an audit manifest
    VerifyManifest { path: PathBuf },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Card or folder to offload
    #[arg(long, value_name = "PATH")]
    source: PathBuf,

    /// Destination root (repeat for every copy)
    #[arg(long = "dest", value_name = "PATH", required = true)]
    dest: Vec<PathBuf>,

    /// Job identifier (a UUID is generated otherwise)
    #[arg(long)]
    job_id: Option<String>,

    /// Skip re-reading the source after the copies are verified
    #[arg(long)]
    no_verify_source: bool,

    /// Verified copies needed before a file counts as safe
    #[arg(long, value_name = "N")]
    required_copies: Option<usize>,

    #[arg(long)]
    project: Option<String>,

    #[arg(long)]
    camera: Option<String>,

    #[arg(long)]
    roll: Option<String>,

    /// Write a checksum list into every destination folder
    #[arg(long)]
    mhl: bool,

    /// Checksum list algorithm: xxh64, sha256 or md5
    #[arg(long, value_name = "ALGORITHM")]
    mhl_format: Option<String>,

    /// Write an audit manifest here when the job finishes
    #[arg(long, value_name = "PATH")]
    manifest: Option<PathBuf>,
}

/// Defaults read from `--config`. Command-line flags win.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
struct CliConfig {
    journal_dir: Option<PathBuf>,
    verify_source: Option<bool>,
    required_copies: Option<usize>,
    generate_mhl: Option<bool>,
    mhl_format: Option<String>,
}

impl CliConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(CliConfig::default());
        };
        let text = fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

/// How the process ends, mapped to the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Every file has enough verified copies (or the check passed)
    Safe,
    /// Finished, but the card must not be formatted
    NotSafe,
    Cancelled,
}

impl Verdict {
    fn from_outcome(outcome: &OffloadOutcome) -> Self {
        if outcome.is_cancelled() {
            Verdict::Cancelled
        } else if outcome.report().safe_to_format {
            Verdict::Safe
        } else {
            Verdict::NotSafe
        }
    }

    fn code(self) -> u8 {
        match self {
            Verdict::Safe => 0,
            Verdict::NotSafe => 1,
            Verdict::Cancelled => 3,
        }
    }
}

/// Renders engine events on stderr.
struct ProgressPrinter {
    verbose: bool,
    total_files: usize,
    start_time: Instant,
    last_progress_update: Option<Instant>,
    current: String,
}

impl ProgressPrinter {
    fn new(verbose: bool, total_files: usize) -> Self {
        ProgressPrinter {
            verbose,
            total_files,
            start_time: Instant::now(),
            last_progress_update: None,
            current: String::new(),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(20 - filled), percent.min(100))
    }

    fn handle(&mut self, event: &OffloadEvent) {
        match event {
            OffloadEvent::PhaseChanged { phase } => {
                self.last_progress_update = None;
                match phase {
                    OffloadPhase::Copying => eprintln!("Copying {} files...", self.total_files),
                    OffloadPhase::Verifying => eprintln!("\nVerifying copies..."),
                    OffloadPhase::Finalizing => eprintln!("\nFinalizing..."),
                    _ => {}
                }
            }
            OffloadEvent::FileStarted { index, name } => {
                self.current = name.clone();
                if self.verbose {
                    eprintln!("[{:3}/{}] Starting: {}", index + 1, self.total_files, name);
                }
            }
            OffloadEvent::FileProgress {
                index,
                bytes_done: done,
                total_bytes: total,
            } => {
                // At most one redraw every 200ms
                if let Some(last) = self.last_progress_update {
                    if last.elapsed().as_millis() < 200 && done < total {
                        return;
                    }
                }
                self.last_progress_update = Some(Instant::now());
                let percent = if *total == 0 {
                    100
                } else {
                    (*done as f64 / *total as f64 * 100.0) as u32
                };
                eprint!(
                    "\r[{:3}/{}] {} {}",
                    index + 1,
                    self.total_files,
                    Self::progress_bar(percent),
                    self.current
                );
                let _ = std::io::Write::flush(&mut std::io::stderr());
            }
            OffloadEvent::FileCompleted {
                index,
                name,
                success,
                error,
            } => {
                if !success {
                    eprintln!(
                        "\n[{:3}/{}] Failed: {}: {}",
                        index + 1,
                        self.total_files,
                        name,
                        error.as_deref().unwrap_or("(unknown error)")
                    );
                } else if self.verbose {
                    eprintln!("\n[{:3}/{}] Done: {}", index + 1, self.total_files, name);
                }
            }
            OffloadEvent::JobCompleted { report } => {
                eprintln!();
                print_report(report);
                eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));
            }
        }
    }
}

fn print_report(report: &OffloadReport) {
    println!("Job {}: {}", report.job_id, report.phase);
    println!(
        "Files: {} total, {} copied, {} verified, {} failed",
        report.total_files, report.copied_files, report.verified_files, report.failed_files
    );
    println!(
        "Bytes: {} of {}",
        ProgressPrinter::format_bytes(report.copied_bytes),
        ProgressPrinter::format_bytes(report.total_bytes)
    );
    if let Some(signature) = &report.job_signature {
        println!("Signature: {}", signature);
    }
    if let Some(path) = &report.audit_manifest {
        println!("Audit manifest: {}", path.display());
    }
    if report.safe_to_format {
        println!("SAFE TO FORMAT");
    } else {
        println!("NOT SAFE TO FORMAT");
    }
}

fn print_status(journal: &OffloadJournal) {
    println!("Job {} ({})", journal.job_id, journal.phase);
    println!("Source: {}", journal.source_path.display());
    for dest in &journal.destination_paths {
        println!("Destination: {}", dest.display());
    }
    println!("Created: {}", local_time(&journal.created_at));
    if let Some(done) = &journal.completed_at {
        println!("Completed: {}", local_time(done));
    }
    for entry in &journal.files {
        let copies = format!("{}/{}", entry.verified_copy_count(), entry.destination_copies.len());
        match (&entry.state, &entry.error_message) {
            (FileState::Failed, Some(msg)) => {
                println!("  {:<16} {:>5}  {}: {}", entry.state, copies, entry.display_name(), msg)
            }
            _ => println!("  {:<16} {:>5}  {}", entry.state, copies, entry.display_name()),
        }
    }
    println!(
        "{} of {} files failed; safe to format: {}",
        journal.failed_count(),
        journal.files.len(),
        journal.safe_to_format()
    );
}

fn local_time(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "offload=debug,offload_engine=debug"
    } else {
        "offload=info,offload_engine=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run_cli(&cli) {
        Ok(verdict) => ExitCode::from(verdict.code()),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

/// Main CLI logic - separated for testability
fn run_cli(cli: &Cli) -> Result<Verdict> {
    let config = CliConfig::load(cli.config.as_deref())?;
    let journal_dir = cli
        .journal_dir
        .clone()
        .or_else(|| config.journal_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_JOURNAL_DIR));
    let store = JournalStore::new(journal_dir);

    match &cli.command {
        Command::Run(args) => {
            let journal = build_journal(args, &config)?;
            if store.exists(&journal.job_id) {
                bail!(
                    "job {} already exists at {}; continue it with `offload resume --job-id {}`",
                    journal.job_id,
                    store.path_for(&journal.job_id).display(),
                    journal.job_id
                );
            }
            info!(job_id = %journal.job_id, journal = %store.path_for(&journal.job_id).display(), "job created");
            let mut worker = OffloadWorker::new(journal, store);
            if let Some(path) = &args.manifest {
                worker = worker.with_audit_manifest(path.clone());
            }
            execute(worker, cli.verbose)
        }
        Command::Resume {
            job_id,
            retry_failed,
            manifest,
        } => {
            let mut worker = OffloadWorker::resume(store, job_id).with_context(|| format!("loading job {}", job_id))?;
            if *retry_failed {
                let reset = worker.journal_mut().reset_failed();
                info!(job_id = %job_id, files = reset, "retrying failed files");
            }
            if let Some(path) = manifest {
                worker = worker.with_audit_manifest(path.clone());
            }
            execute(worker, cli.verbose)
        }
        Command::Status { job_id } => {
            let journal = store.load(job_id).with_context(|| format!("loading job {}", job_id))?;
            print_status(&journal);
            Ok(match journal.phase {
                OffloadPhase::Cancelled => Verdict::Cancelled,
                _ if journal.safe_to_format() => Verdict::Safe,
                _ => Verdict::NotSafe,
            })
        }
        Command::VerifyManifest { path } => {
            if verify_audit_manifest(path).with_context(|| format!("reading manifest {}", path.display()))? {
                println!("{}: intact", path.display());
                Ok(Verdict::Safe)
            } else {
                warn!(path = %path.display(), "manifest checksum mismatch");
                println!("{}: MODIFIED", path.display());
                Ok(Verdict::NotSafe)
            }
        }
    }
}

fn build_journal(args: &RunArgs, config: &CliConfig) -> Result<OffloadJournal> {
    if !args.source.is_dir() {
        bail!("Source directory does not exist: {}", args.source.display());
    }

    let mut journal = create_journal(args.job_id.clone(), &args.source, &args.dest).context("creating job")?;

    journal.verify_source = !args.no_verify_source && config.verify_source.unwrap_or(true);
    if let Some(n) = args.required_copies.or(config.required_copies) {
        journal.required_copies = n;
    }
    journal.generate_mhl = args.mhl || config.generate_mhl.unwrap_or(false);
    if let Some(format) = args.mhl_format.as_deref().or(config.mhl_format.as_deref()) {
        journal.mhl_format = HashAlgorithm::from_str(format)?;
    }
    journal.project_id = args.project.clone();
    journal.camera_label = args.camera.clone();
    journal.roll_name = args.roll.clone();
    Ok(journal)
}

fn execute(worker: OffloadWorker, verbose: bool) -> Result<Verdict> {
    let worker = worker.with_mhl_generator(Box::new(ChecksumListGenerator));
    let mut printer = ProgressPrinter::new(verbose, worker.journal().files.len());

    let handle = spawn_offload(worker)?;
    for event in handle.events().iter() {
        printer.handle(&event);
    }
    let (outcome, _journal) = handle.join()?;
    Ok(Verdict::from_outcome(&outcome))
}
