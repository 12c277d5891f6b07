//! CLI entrypoint for compact malloc trace tooling.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use cmtrace_core::config::parse_mebibytes;
use cmtrace_core::{AllocatorKind, EncoderOutput, ReplayConfig};
use cmtrace_harness::pipeline::{self, AnalysisPass, EncodeOptions, ReplayOptions};
use cmtrace_harness::report::write_report;
use cmtrace_harness::structured_log::{LogEmitter, validate_log_file};

/// Compact malloc trace encoder, replayer and analysis passes.
#[derive(Debug, Parser)]
#[command(name = "cmtrace")]
#[command(about = "Encode malloc call traces compactly and replay them against allocators")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Encode a producer `call-trace` log into a compact stream.
    Encode {
        /// Producer trace (`-` for stdin).
        #[arg(default_value = "-")]
        input: PathBuf,
        /// Output path (`-` for stdout).
        #[arg(short, long, default_value = "-")]
        output: PathBuf,
        /// Write human-readable summary lines instead of binary records.
        #[arg(short, long)]
        summary: bool,
        /// Structured JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// JSON report path.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Replay a compact stream against an allocator.
    Replay {
        /// Compact stream (`-` for stdin).
        #[arg(default_value = "-")]
        input: PathBuf,
        /// Print every replayed call in summary form.
        #[arg(short, long)]
        verbose: bool,
        /// Allocator: `libc`, `bump`, `size-class` or `null` (default from CMTRACE_ALLOCATOR).
        #[arg(long)]
        allocator: Option<String>,
        /// Bump arena limit in MiB (default from CMTRACE_BUMP_ARENA_MB).
        #[arg(long)]
        arena_mb: Option<String>,
        /// Structured JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// JSON report path.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Annotate a summary trace with allocation sizes and ages at release.
    Lifetimes {
        /// Summary trace (`-` for stdin).
        #[arg(default_value = "-")]
        input: PathBuf,
        /// Output path (`-` for stdout).
        #[arg(short, long, default_value = "-")]
        output: PathBuf,
        /// Structured JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Annotate a summary trace with neighbouring blocks, gaps and pages.
    Layout {
        /// Summary trace (`-` for stdin).
        #[arg(default_value = "-")]
        input: PathBuf,
        /// Output path (`-` for stdout).
        #[arg(short, long, default_value = "-")]
        output: PathBuf,
        /// Structured JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Validate a structured JSONL log against the schema.
    ValidateLog {
        /// Log path.
        log: PathBuf,
    },
}

fn run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}-{nanos}", std::process::id())
}

fn emitter(path: Option<&Path>, command: &str) -> std::io::Result<LogEmitter> {
    let run_id = run_id();
    match path {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            LogEmitter::to_file(path, command, &run_id)
        }
        None => Ok(LogEmitter::sink(command, &run_id)),
    }
}

fn analyze(
    pass: AnalysisPass,
    input: &Path,
    output: &Path,
    log: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut log = emitter(log, pass.as_str())?;
    let lines = pipeline::run_analysis(pass, input, output, &mut log)?;
    eprintln!("{}: annotated {lines} lines", pass.as_str());
    Ok(())
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Encode {
            input,
            output,
            summary,
            log,
            report,
        } => {
            let mut log = emitter(log.as_deref(), "encode")?;
            let opts = EncodeOptions {
                input,
                output,
                format: if summary {
                    EncoderOutput::Summary
                } else {
                    EncoderOutput::Binary
                },
            };
            let encoded = pipeline::run_encode(&opts, &mut log)?;
            eprintln!(
                "encode: {} lines, {} calls, {} bytes ({:.2} bytes/call), {} skipped, {} live at end",
                encoded.lines,
                encoded.allocations + encoded.resizes + encoded.releases,
                encoded.bytes_written,
                encoded.bytes_per_event(),
                encoded.skipped,
                encoded.live_at_end,
            );
            if let Some(path) = report {
                write_report(&path, &encoded)?;
                eprintln!("Wrote encode report to {}", path.display());
            }
        }
        Command::Replay {
            input,
            verbose,
            allocator,
            arena_mb,
            log,
            report,
        } => {
            let mut config = ReplayConfig::from_env();
            config.verbose = verbose;
            if let Some(name) = allocator {
                config.allocator = AllocatorKind::from_str_loose(&name);
            }
            if let Some(raw) = arena_mb {
                config.bump_arena_bytes = parse_mebibytes(&raw)
                    .ok_or_else(|| format!("invalid --arena-mb value: {raw:?}"))?;
            }

            let mut log = emitter(log.as_deref(), "replay")?;
            let replayed = pipeline::run_replay(&ReplayOptions { input, config }, &mut log)?;
            eprintln!(
                "replay[{}]: {} records, {} bytes, peak {} live, {} live at end",
                replayed.allocator,
                replayed.records,
                replayed.bytes_read,
                replayed.peak_live,
                replayed.live_at_end,
            );
            if let Some(path) = report {
                write_report(&path, &replayed)?;
                eprintln!("Wrote replay report to {}", path.display());
            }
        }
        Command::Lifetimes { input, output, log } => {
            analyze(AnalysisPass::Lifetimes, &input, &output, log.as_deref())?;
        }
        Command::Layout { input, output, log } => {
            analyze(AnalysisPass::Layout, &input, &output, log.as_deref())?;
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for err in &errors {
                eprintln!("{err}");
            }
            if !errors.is_empty() {
                return Err(format!(
                    "{}: {} violation(s) in {lines} entries",
                    log.display(),
                    errors.len()
                )
                .into());
            }
            eprintln!("{}: {lines} entries valid", log.display());
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("cmtrace: {err}");
            ExitCode::FAILURE
        }
    }
}
