// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::Serialize;
use sharefs_core::{AccessRights, ArbiterConfig, ArbiterStats, FsError, ShareArbiter, ShareRights};
use sharefs_logging::CliLoggingArgs;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const COMPONENT: &str = "sharefs-stress";

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.logging.init(COMPONENT)?;

    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Rewrite(args) => {
            let json_output = args.json_output.clone();
            let report = run_rewrite(config, args)?;
            emit_report(&report, json_output.as_deref())?;
        }
        Command::RemoveTree(args) => {
            let json_output = args.json_output.clone();
            let report = run_remove_tree(config, args)?;
            emit_report(&report, json_output.as_deref())?;
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ArbiterConfig> {
    let Some(path) = path else {
        return Ok(ArbiterConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    ArbiterConfig::from_toml_str(&text)
        .with_context(|| format!("invalid arbiter config {}", path.display()))
}

fn emit_report<T: Serialize>(report: &T, json_output: Option<&Path>) -> Result<()> {
    if let Some(path) = json_output {
        serde_json::to_writer_pretty(File::create(path)?, report)?;
    }
    write_json_to_stdout(report)
}

fn write_json_to_stdout<T: Serialize>(value: &T) -> Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    out.flush()?;
    Ok(())
}

fn timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[derive(Parser)]
#[command(author, version, about = "ShareFS share-mode workload runner")]
struct Cli {
    #[command(flatten)]
    logging: CliLoggingArgs,

    /// TOML file with arbiter settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// One writer rewrites a file while readers keep reopening it
    Rewrite(RewriteArgs),
    /// Remove a tree while one of its files is held open
    RemoveTree(RemoveTreeArgs),
}

#[derive(Args, Clone)]
struct RewriteArgs {
    /// Scratch directory for the workload file
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Duration of the workload in seconds
    #[arg(long, default_value_t = 5)]
    duration_sec: u64,

    /// Number of reader threads
    #[arg(long, default_value_t = 1)]
    readers: usize,

    /// Seed for rewrite lengths; random when omitted
    #[arg(long)]
    seed: Option<u64>,

    /// Optional path for writing the JSON report
    #[arg(long)]
    json_output: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct RemoveTreeArgs {
    /// Scratch directory in which the tree is built
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Number of files in the tree
    #[arg(long, default_value_t = 32)]
    files: usize,

    /// How long the holder keeps its file open, in milliseconds
    #[arg(long, default_value_t = 1500)]
    hold_ms: u64,

    /// Let the holder share Delete, so removal need not wait
    #[arg(long)]
    share_delete: bool,

    /// Optional path for writing the JSON report
    #[arg(long)]
    json_output: Option<PathBuf>,
}

fn scratch_dir(workdir: Option<PathBuf>, name: &str) -> Result<PathBuf> {
    let dir = workdir.unwrap_or_else(|| std::env::temp_dir().join(COMPONENT)).join(name);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create workdir {}", dir.display()))?;
    Ok(dir)
}

/// How a single read observed a file under concurrent rewrite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOutcome {
    /// Nothing visible, the writer had just truncated
    Empty,
    /// Stopped at a write-chunk boundary of an unfinished rewrite
    Partial,
    /// A whole rewrite pass
    Whole,
    /// A length no writer ever produced
    BadLength,
    /// Bytes from more than one pass
    Torn,
}

impl ReadOutcome {
    fn label(self) -> &'static str {
        match self {
            ReadOutcome::Empty => "empty",
            ReadOutcome::Partial => "partial",
            ReadOutcome::Whole => "whole",
            ReadOutcome::BadLength => "bad_length",
            ReadOutcome::Torn => "torn",
        }
    }

    fn is_violation(self) -> bool {
        matches!(self, ReadOutcome::BadLength | ReadOutcome::Torn)
    }
}

/// Rewrites always have a length that is a multiple of 10, written in
/// `chunk`-sized pieces of one byte that changes from pass to pass.
fn classify_read(data: &[u8], chunk: usize) -> ReadOutcome {
    let Some(first) = data.first() else {
        return ReadOutcome::Empty;
    };
    if !data.iter().all(|b| b == first) {
        return ReadOutcome::Torn;
    }
    if data.len() % 10 == 0 {
        ReadOutcome::Whole
    } else if data.len() % chunk == 0 {
        ReadOutcome::Partial
    } else {
        ReadOutcome::BadLength
    }
}

#[derive(Default, Serialize, Clone)]
struct ReadStats {
    reads: u64,
    empty: u64,
    partial: u64,
    whole: u64,
    bytes: u64,
}

impl ReadStats {
    fn record(&mut self, outcome: ReadOutcome, bytes: usize) {
        self.reads += 1;
        self.bytes += bytes as u64;
        match outcome {
            ReadOutcome::Empty => self.empty += 1,
            ReadOutcome::Partial => self.partial += 1,
            ReadOutcome::Whole => self.whole += 1,
            ReadOutcome::BadLength | ReadOutcome::Torn => {}
        }
    }
}

impl std::ops::AddAssign<&ReadStats> for ReadStats {
    fn add_assign(&mut self, other: &ReadStats) {
        self.reads += other.reads;
        self.empty += other.empty;
        self.partial += other.partial;
        self.whole += other.whole;
        self.bytes += other.bytes;
    }
}

#[derive(Default)]
struct ReaderResult {
    stats: ReadStats,
    benign_errors: HashMap<String, u64>,
    fatal_errors: HashMap<String, u64>,
}

#[derive(Serialize)]
struct RewriteReport {
    phase: String,
    readers: usize,
    duration_sec: u64,
    io_chunk_size: usize,
    seed: u64,
    start_time: String,
    end_time: String,
    rewrites: u64,
    reads: ReadStats,
    benign_errors: HashMap<String, u64>,
    fatal_errors: HashMap<String, u64>,
    arbiter: ArbiterStats,
    status: String,
}

fn error_label(err: &FsError) -> String {
    match err {
        FsError::Io(io) => format!("io_{:?}", io.kind()).to_lowercase(),
        other => other.to_string().replace(' ', "_"),
    }
}

fn merge_counts(target: &mut HashMap<String, u64>, source: &HashMap<String, u64>) {
    for (key, value) in source {
        *target.entry(key.clone()).or_insert(0) += value;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_rewrite(config: ArbiterConfig, args: RewriteArgs) -> Result<RewriteReport> {
    if args.readers == 0 {
        bail!("at least one reader is required");
    }
    let workdir = scratch_dir(args.workdir.clone(), "rewrite")?;
    let path = workdir.join("read_write_concurrent.txt");
    let chunk = config.io_chunk_size;
    let arbiter = Arc::new(ShareArbiter::new(config)?);
    arbiter
        .write_all(&path, &[b'a'; 10])
        .with_context(|| format!("failed to seed {}", path.display()))?;

    let seed = args.seed.unwrap_or_else(rand::random);
    info!(
        readers = args.readers,
        duration_sec = args.duration_sec,
        seed,
        path = %path.display(),
        "rewrite workload starting"
    );

    let start_time = chrono::Utc::now();
    let stop_at = Instant::now() + Duration::from_secs(args.duration_sec);

    let writer = {
        let arbiter = Arc::clone(&arbiter);
        let path = path.clone();
        thread::spawn(move || -> std::result::Result<u64, FsError> {
            let mut rng = SmallRng::seed_from_u64(seed);
            let mut rewrites = 0u64;
            while Instant::now() < stop_at {
                let length = rng.gen_range(1..1000) * 10;
                let fill = b'a' + (rewrites % 26) as u8;
                arbiter.write_all(&path, &vec![fill; length])?;
                rewrites += 1;
            }
            Ok(rewrites)
        })
    };

    let readers: Vec<_> = (0..args.readers)
        .map(|_| {
            let arbiter = Arc::clone(&arbiter);
            let path = path.clone();
            thread::spawn(move || read_until(&arbiter, &path, stop_at, chunk))
        })
        .collect();

    let mut reads = ReadStats::default();
    let mut benign_errors = HashMap::new();
    let mut fatal_errors: HashMap<String, u64> = HashMap::new();
    for reader in readers {
        match reader.join() {
            Ok(result) => {
                reads += &result.stats;
                merge_counts(&mut benign_errors, &result.benign_errors);
                merge_counts(&mut fatal_errors, &result.fatal_errors);
            }
            Err(panic) => {
                *fatal_errors.entry("thread_panic".to_string()).or_insert(0) += 1;
                warn!("reader thread panicked: {}", panic_message(&*panic));
            }
        }
    }

    let rewrites = match writer.join() {
        Ok(Ok(rewrites)) => rewrites,
        Ok(Err(err)) => {
            warn!(error = %err, "writer failed");
            *fatal_errors.entry(format!("write_{}", error_label(&err))).or_insert(0) += 1;
            0
        }
        Err(panic) => {
            warn!("writer thread panicked: {}", panic_message(&*panic));
            *fatal_errors.entry("thread_panic".to_string()).or_insert(0) += 1;
            0
        }
    };

    let status = if fatal_errors.is_empty() { "passed" } else { "failed" };
    Ok(RewriteReport {
        phase: "rewrite".to_string(),
        readers: args.readers,
        duration_sec: args.duration_sec,
        io_chunk_size: chunk,
        seed,
        start_time: timestamp(start_time),
        end_time: timestamp(chrono::Utc::now()),
        rewrites,
        reads,
        benign_errors,
        fatal_errors,
        arbiter: arbiter.stats(),
        status: status.to_string(),
    })
}

fn read_until(arbiter: &ShareArbiter, path: &Path, stop_at: Instant, chunk: usize) -> ReaderResult {
    let mut result = ReaderResult::default();
    while Instant::now() < stop_at {
        let mut handle = match arbiter.open(path, AccessRights::READ, ShareRights::ALL) {
            Ok(handle) => handle,
            Err(err) => {
                let label = format!("open_{}", error_label(&err));
                *result.fatal_errors.entry(label).or_insert(0) += 1;
                continue;
            }
        };
        let length = match handle.length() {
            Ok(length) => length as usize,
            Err(err) => {
                *result.fatal_errors.entry(format!("length_{}", error_label(&err))).or_insert(0) += 1;
                continue;
            }
        };
        let mut buf = vec![0u8; length];
        let n = match handle.read(&mut buf) {
            Ok(n) => n,
            Err(err) => {
                *result.fatal_errors.entry(format!("read_{}", error_label(&err))).or_insert(0) += 1;
                continue;
            }
        };
        let outcome = classify_read(&buf[..n], chunk);
        if outcome.is_violation() {
            warn!(length, bytes_read = n, outcome = outcome.label(), "inconsistent read");
            *result.fatal_errors.entry(outcome.label().to_string()).or_insert(0) += 1;
        } else if n < length {
            *result.benign_errors.entry("short_read".to_string()).or_insert(0) += 1;
        }
        result.stats.record(outcome, n);
    }
    result
}

#[derive(Serialize)]
struct RemoveTreeReport {
    phase: String,
    files: usize,
    hold_ms: u64,
    share_delete: bool,
    max_attempts: u32,
    retry_delay_ms: u64,
    start_time: String,
    end_time: String,
    elapsed_ms: u128,
    removed: bool,
    error: Option<String>,
    held_content_intact: bool,
    arbiter: ArbiterStats,
    status: String,
}

fn build_tree(root: &Path, files: usize) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::with_capacity(files);
    for i in 0..files {
        let dir = root.join(format!("d{}", i % 4)).join(format!("e{}", i % 3));
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("f{i}.txt"));
        fs::write(&path, format!("file {i}"))?;
        paths.push(path);
    }
    Ok(paths)
}

fn run_remove_tree(config: ArbiterConfig, args: RemoveTreeArgs) -> Result<RemoveTreeReport> {
    if args.files == 0 {
        bail!("the tree needs at least one file");
    }
    let root = scratch_dir(args.workdir.clone(), "remove-tree")?.join("tree");
    let policy = config.removal.clone();
    let arbiter = Arc::new(ShareArbiter::new(config)?);
    let paths = build_tree(&root, args.files)?;

    let share = if args.share_delete {
        ShareRights::ALL
    } else {
        ShareRights::READ
    };
    let held_path = &paths[paths.len() / 2];
    let mut holder = arbiter.open(held_path, AccessRights::READ, share)?;
    let expected = format!("file {}", paths.len() / 2).into_bytes();
    info!(
        root = %root.display(),
        held = %held_path.display(),
        hold_ms = args.hold_ms,
        share_delete = args.share_delete,
        "remove-tree workload starting"
    );

    let hold = Duration::from_millis(args.hold_ms);
    let releaser = thread::spawn(move || -> std::result::Result<bool, FsError> {
        thread::sleep(hold);
        let mut content = Vec::new();
        holder.read_to_end(&mut content)?;
        holder.close()?;
        Ok(content == expected)
    });

    let start_time = chrono::Utc::now();
    let started = Instant::now();
    let outcome = arbiter.remove_tree(&root);
    let elapsed_ms = started.elapsed().as_millis();

    let held_content_intact = match releaser.join() {
        Ok(Ok(intact)) => intact,
        Ok(Err(err)) => {
            warn!(error = %err, "holder failed");
            false
        }
        Err(panic) => {
            warn!("holder thread panicked: {}", panic_message(&*panic));
            false
        }
    };

    let removed = !root.exists();
    let passed = held_content_intact && outcome.is_ok() == removed;
    Ok(RemoveTreeReport {
        phase: "remove_tree".to_string(),
        files: args.files,
        hold_ms: args.hold_ms,
        share_delete: args.share_delete,
        max_attempts: policy.max_attempts,
        retry_delay_ms: policy.retry_delay_ms,
        start_time: timestamp(start_time),
        end_time: timestamp(chrono::Utc::now()),
        elapsed_ms,
        removed,
        error: outcome.err().map(|err| err.to_string()),
        held_content_intact,
        arbiter: arbiter.stats(),
        status: if passed { "passed" } else { "failed" }.to_string(),
    })
}
