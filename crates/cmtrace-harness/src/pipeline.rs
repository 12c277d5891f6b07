//! File-level encode, replay and analysis runs.
//!
//! Each run takes paths (`-` for stdin/stdout), does its work with the core
//! crate, and logs `run_start` followed by `run_complete` or `run_failed`.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use cmtrace_core::alloc::{BumpAllocator, LibcAllocator, NullAllocator, SizeClassAllocator};
use cmtrace_core::analysis::{Layout, Lifetimes, annotate_reader};
use cmtrace_core::{
    AllocatorKind, Encoder, EncoderOutput, ReplayAllocator, ReplayConfig, ReplayStats, Replayer,
};

use crate::error::HarnessError;
use crate::report::{EncodeReport, ReplayReport, sha256_hex};
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

const STDIO: &str = "-";

fn is_stdio(path: &Path) -> bool {
    path.as_os_str() == STDIO
}

fn open_input(path: &Path) -> Result<Box<dyn BufRead>, HarnessError> {
    if is_stdio(path) {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(path).map_err(HarnessError::open(path))?;
    Ok(Box::new(BufReader::new(file)))
}

fn open_output(path: &Path) -> Result<Box<dyn Write>, HarnessError> {
    if is_stdio(path) {
        return Ok(Box::new(BufWriter::new(io::stdout())));
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path).map_err(HarnessError::open(path))?;
    Ok(Box::new(BufWriter::new(file)))
}

fn digest(path: &Path) -> Result<Option<String>, HarnessError> {
    if is_stdio(path) {
        Ok(None)
    } else {
        sha256_hex(path).map(Some)
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Log the end of a run, passing `result` through.
fn finish_run<T>(
    log: &mut LogEmitter,
    start: Instant,
    result: Result<T, HarnessError>,
    counts: impl FnOnce(&T) -> (u64, u64),
) -> Result<T, HarnessError> {
    let entry = match &result {
        Ok(value) => {
            let (records, bytes) = counts(value);
            LogEntry::new("", LogLevel::Info, "run_complete")
                .with_outcome(Outcome::Pass)
                .with_counts(records, bytes)
        }
        Err(err) => LogEntry::new("", LogLevel::Error, "run_failed")
            .with_outcome(Outcome::Fail)
            .with_error(err.to_string()),
    };
    log.emit_entry(entry.with_duration_ms(elapsed_ms(start)))?;
    log.flush()?;
    result
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub format: EncoderOutput,
}

/// Encode a producer trace file.
pub fn run_encode(opts: &EncodeOptions, log: &mut LogEmitter) -> Result<EncodeReport, HarnessError> {
    let start = Instant::now();
    log.emit_entry(
        LogEntry::new("", LogLevel::Info, "run_start").with_artifacts(vec![
            opts.input.display().to_string(),
            opts.output.display().to_string(),
        ]),
    )?;
    let result = encode_file(opts, start);
    finish_run(log, start, result, |r| (r.lines, r.bytes_written))
}

fn encode_file(opts: &EncodeOptions, start: Instant) -> Result<EncodeReport, HarnessError> {
    let input = open_input(&opts.input)?;
    let output = open_output(&opts.output)?;
    let mut encoder = Encoder::new(output, opts.format);
    encoder.encode_reader(input)?;
    let live_at_end = encoder.live_allocations() as u64;
    let highest_tag = encoder.highest_tag();
    let (_, stats) = encoder.finish()?;

    let mut report = EncodeReport::from_stats(&stats, live_at_end, highest_tag);
    report.input = opts.input.display().to_string();
    report.input_sha256 = digest(&opts.input)?;
    report.output = opts.output.display().to_string();
    report.output_sha256 = digest(&opts.output)?;
    report.format = match opts.format {
        EncoderOutput::Binary => "binary",
        EncoderOutput::Summary => "summary",
    }
    .to_string();
    report.duration_ms = elapsed_ms(start);
    Ok(report)
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOptions {
    pub input: PathBuf,
    pub config: ReplayConfig,
}

/// Replay a compact stream against the configured allocator.
pub fn run_replay(opts: &ReplayOptions, log: &mut LogEmitter) -> Result<ReplayReport, HarnessError> {
    let start = Instant::now();
    log.emit_entry(
        LogEntry::new("", LogLevel::Info, "run_start")
            .with_allocator(opts.config.allocator.as_str())
            .with_artifacts(vec![opts.input.display().to_string()])
            .with_details(serde_json::json!({
                "verbose": opts.config.verbose,
                "bump_arena_bytes": opts.config.bump_arena_bytes,
            })),
    )?;
    let result = replay_file(opts, start);
    finish_run(log, start, result, |r| (r.records, r.bytes_read))
}

fn replay_file(opts: &ReplayOptions, start: Instant) -> Result<ReplayReport, HarnessError> {
    let input = open_input(&opts.input)?;
    let verbose = opts.config.verbose;

    let (stats, footprint) = match opts.config.allocator {
        AllocatorKind::Libc => {
            let (stats, _) = replay_with(input, LibcAllocator::new(), verbose)?;
            (stats, None)
        }
        AllocatorKind::Bump => {
            let alloc = BumpAllocator::with_limit(opts.config.bump_arena_bytes);
            let (stats, alloc) = replay_with(input, alloc, verbose)?;
            (stats, Some(alloc.used() as u64))
        }
        AllocatorKind::SizeClass => {
            let (stats, alloc) = replay_with(input, SizeClassAllocator::new(), verbose)?;
            (stats, Some(alloc.stats().footprint as u64))
        }
        AllocatorKind::Null => {
            let (stats, _) = replay_with(input, NullAllocator::new(), verbose)?;
            (stats, None)
        }
    };

    let mut report = ReplayReport::from_stats(opts.config.allocator.as_str(), &stats);
    report.input = opts.input.display().to_string();
    report.input_sha256 = digest(&opts.input)?;
    report.footprint_bytes = footprint;
    report.duration_ms = elapsed_ms(start);
    Ok(report)
}

/// Replay `input` against `allocator`, printing each call to stdout when
/// `verbose` is set.
pub fn replay_with<R: Read, A: ReplayAllocator>(
    input: R,
    allocator: A,
    verbose: bool,
) -> Result<(ReplayStats, A), HarnessError> {
    let mut replayer = Replayer::new(input, allocator);
    if verbose {
        replayer = replayer.with_trace(Box::new(BufWriter::new(io::stdout())));
    }
    let stats = replayer.run()?;
    Ok((stats, replayer.into_allocator()))
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Which annotating pass to run over a summary trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisPass {
    Lifetimes,
    Layout,
}

impl AnalysisPass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lifetimes => "lifetimes",
            Self::Layout => "layout",
        }
    }
}

/// Annotate a summary trace. Returns the number of lines processed.
pub fn run_analysis(
    pass: AnalysisPass,
    input: &Path,
    output: &Path,
    log: &mut LogEmitter,
) -> Result<usize, HarnessError> {
    let start = Instant::now();
    log.emit_entry(
        LogEntry::new("", LogLevel::Info, "run_start").with_artifacts(vec![
            input.display().to_string(),
            output.display().to_string(),
        ]),
    )?;
    let result = analyze_file(pass, input, output);
    finish_run(log, start, result, |lines| (*lines as u64, 0))
}

fn analyze_file(pass: AnalysisPass, input: &Path, output: &Path) -> Result<usize, HarnessError> {
    let reader = open_input(input)?;
    let mut writer = open_output(output)?;
    let lines = match pass {
        AnalysisPass::Lifetimes => annotate_reader(reader, &mut writer, &mut Lifetimes::new())?,
        AnalysisPass::Layout => annotate_reader(reader, &mut writer, &mut Layout::new())?,
    };
    Ok(lines)
}
