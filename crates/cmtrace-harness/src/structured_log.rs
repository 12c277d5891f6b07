//! Structured JSONL logs for encode/replay/analysis runs.
//!
//! Provides:
//! - [`LogEntry`]: one JSONL record with required and optional fields.
//! - [`LogEmitter`]: writes entries to a file or an in-memory buffer.
//! - [`validate_log_line`]: checks a single JSONL line against the schema.
//! - [`validate_log_file`]: checks an entire JSONL file.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

// ---------------------------------------------------------------------------
// Log entry
// ---------------------------------------------------------------------------

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    const NAMES: [&'static str; 5] = ["trace", "debug", "info", "warn", "error"];
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
}

/// Canonical structured log entry.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    // Required
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    // Optional
    /// CLI command that produced the entry (`encode`, `replay`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Replay allocator name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    /// Records (or lines) processed so far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<u64>,
    /// Bytes read or written, depending on the command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Input/output paths touched by the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_refs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new log entry with required fields only.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            command: None,
            allocator: None,
            outcome: None,
            records: None,
            bytes: None,
            duration_ms: None,
            artifact_refs: None,
            error: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    #[must_use]
    pub fn with_allocator(mut self, allocator: impl Into<String>) -> Self {
        self.allocator = Some(allocator.into());
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Set record and byte counters.
    #[must_use]
    pub fn with_counts(mut self, records: u64, bytes: u64) -> Self {
        self.records = Some(records);
        self.bytes = Some(bytes);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_artifacts(mut self, refs: Vec<String>) -> Self {
        self.artifact_refs = Some(refs);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Set free-form details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Log emitter
// ---------------------------------------------------------------------------

/// Writes structured JSONL log entries.
pub struct LogEmitter {
    writer: Box<dyn Write>,
    seq: u64,
    command: String,
    run_id: String,
}

impl LogEmitter {
    /// Create an emitter that writes to a file.
    pub fn to_file(path: &Path, command: &str, run_id: &str) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::to_writer(
            Box::new(std::io::BufWriter::new(file)),
            command,
            run_id,
        ))
    }

    /// Create an emitter over any writer.
    #[must_use]
    pub fn to_writer(writer: Box<dyn Write>, command: &str, run_id: &str) -> Self {
        Self {
            writer,
            seq: 0,
            command: command.to_string(),
            run_id: run_id.to_string(),
        }
    }

    /// Create an emitter that discards its output.
    #[must_use]
    pub fn sink(command: &str, run_id: &str) -> Self {
        Self::to_writer(Box::new(std::io::sink()), command, run_id)
    }

    /// Generate the next trace ID.
    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("{}::{}::{:03}", self.command, self.run_id, self.seq)
    }

    /// Emit a log entry with auto-generated trace_id and command.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<LogEntry> {
        let trace_id = self.next_trace_id();
        let entry = LogEntry::new(trace_id, level, event).with_command(&self.command);
        self.emit_entry(entry.clone())?;
        Ok(entry)
    }

    /// Emit a fully-populated log entry.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<()> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        if entry.command.is_none() {
            entry.command = Some(self.command.clone());
        }
        let line = serde_json::to_string(&entry).map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")
    }

    /// Flush the underlying writer.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validation error for a log line.
#[derive(Debug)]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for LogValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: field '{}': {}",
            self.line_number, self.field, self.message
        )
    }
}

/// Validate a single JSONL line against the schema.
pub fn validate_log_line(
    line: &str,
    line_number: usize,
) -> Result<LogEntry, Vec<LogValidationError>> {
    let mut errors = Vec::new();
    let violation = |field: &str, message: String| LogValidationError {
        line_number,
        field: field.to_string(),
        message,
    };

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            errors.push(violation("<json>", format!("invalid JSON: {e}")));
            return Err(errors);
        }
    };
    let Some(obj) = value.as_object() else {
        errors.push(violation("<root>", "expected JSON object".to_string()));
        return Err(errors);
    };

    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            errors.push(violation(field, "required field missing".to_string()));
        }
    }

    if let Some(level) = obj.get("level").and_then(|v| v.as_str())
        && !LogLevel::NAMES.contains(&level)
    {
        errors.push(violation("level", format!("invalid level: '{level}'")));
    }

    if let Some(outcome) = obj.get("outcome").and_then(|v| v.as_str())
        && !["pass", "fail"].contains(&outcome)
    {
        errors.push(violation("outcome", format!("invalid outcome: '{outcome}'")));
    }

    // A failed run must say why.
    if obj.get("outcome").and_then(|v| v.as_str()) == Some("fail")
        && !obj
            .get("error")
            .and_then(|v| v.as_str())
            .is_some_and(|e| !e.trim().is_empty())
    {
        errors.push(violation(
            "error",
            "failed runs must include a non-empty error".to_string(),
        ));
    }

    if let Some(trace_id) = obj.get("trace_id").and_then(|v| v.as_str())
        && trace_id.split("::").count() != 3
    {
        errors.push(violation(
            "trace_id",
            format!("trace_id should follow <command>::<run_id>::<seq> format, got: '{trace_id}'"),
        ));
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    serde_json::from_value::<LogEntry>(value).map_err(|e| {
        vec![LogValidationError {
            line_number,
            field: "<deserialization>".to_string(),
            message: format!("failed to deserialize: {e}"),
        }]
    })
}

/// Validate an entire JSONL file.
///
/// Returns the total line count and any validation errors found.
pub fn validate_log_file(path: &Path) -> Result<(usize, Vec<LogValidationError>), std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    let mut all_errors = Vec::new();
    let mut line_count = 0;

    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;
        if let Err(errs) = validate_log_line(line, i + 1) {
            all_errors.extend(errs);
        }
    }

    Ok((line_count, all_errors))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Current time as RFC 3339 UTC with millisecond precision.
#[must_use]
pub fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_utc(duration.as_secs(), duration.subsec_millis())
}

fn format_utc(secs: u64, millis: u32) -> String {
    let days = secs / 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
    )
}

/// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z % 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn log_entry_serializes_required_fields() {
        let entry = LogEntry::new("encode::run-1::001", LogLevel::Info, "run_start");
        let json = entry.to_jsonl().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["timestamp"].is_string());
        assert_eq!(parsed["trace_id"], "encode::run-1::001");
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["event"], "run_start");
        assert!(parsed.get("command").is_none());
        assert!(parsed.get("allocator").is_none());
        assert!(parsed.get("outcome").is_none());
    }

    #[test]
    fn log_entry_with_optional_fields() {
        let entry = LogEntry::new("replay::run-1::002", LogLevel::Error, "run_failed")
            .with_command("replay")
            .with_allocator("bump")
            .with_outcome(Outcome::Fail)
            .with_counts(12, 40)
            .with_duration_ms(3)
            .with_artifacts(vec!["trace.cmt".to_string()])
            .with_error("record 13 at byte 40: unterminated integer")
            .with_details(serde_json::json!({"live": 4}));

        let json = entry.to_jsonl().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["command"], "replay");
        assert_eq!(parsed["allocator"], "bump");
        assert_eq!(parsed["outcome"], "fail");
        assert_eq!(parsed["records"], 12);
        assert_eq!(parsed["bytes"], 40);
        assert_eq!(parsed["duration_ms"], 3);
        assert!(parsed["artifact_refs"].is_array());
        assert!(parsed["details"].is_object());
        assert!(validate_log_line(&json, 1).is_ok());
    }

    #[test]
    fn validate_missing_required_field() {
        let json = r#"{"timestamp":"2026-01-01T00:00:00Z","level":"info","event":"test"}"#;
        let errors = validate_log_line(json, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "trace_id"));
    }

    #[test]
    fn validate_invalid_level() {
        let json = r#"{"timestamp":"2026-01-01T00:00:00Z","trace_id":"a::b::c","level":"critical","event":"test"}"#;
        let errors = validate_log_line(json, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "level"));
    }

    #[test]
    fn validate_failure_without_error() {
        let json = r#"{"timestamp":"2026-01-01T00:00:00Z","trace_id":"a::b::c","level":"error","event":"run_failed","outcome":"fail"}"#;
        let errors = validate_log_line(json, 4).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "error" && e.line_number == 4));
    }

    #[test]
    fn validate_invalid_json_and_trace_id() {
        let errors = validate_log_line("not json at all", 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "<json>"));

        let json = r#"{"timestamp":"2026-01-01T00:00:00Z","trace_id":"no-separator","level":"info","event":"test"}"#;
        let errors = validate_log_line(json, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "trace_id"));
    }

    #[test]
    fn emitter_generates_sequential_trace_ids() {
        let buf = SharedBuf::default();
        let mut emitter = LogEmitter::to_writer(Box::new(buf.clone()), "encode", "run-42");
        emitter.emit(LogLevel::Info, "run_start").unwrap();
        emitter
            .emit_entry(
                LogEntry::new("", LogLevel::Info, "run_complete").with_outcome(Outcome::Pass),
            )
            .unwrap();
        emitter.flush().unwrap();

        let text = String::from_utf8(buf.0.borrow().clone()).unwrap();
        let entries: Vec<LogEntry> = text
            .lines()
            .enumerate()
            .map(|(i, line)| validate_log_line(line, i + 1).unwrap())
            .collect();
        assert_eq!(entries[0].trace_id, "encode::run-42::001");
        assert_eq!(entries[1].trace_id, "encode::run-42::002");
        assert_eq!(entries[1].command.as_deref(), Some("encode"));
    }

    #[test]
    fn timestamps_are_calendar_correct() {
        assert_eq!(format_utc(0, 0), "1970-01-01T00:00:00.000Z");
        // 2024-02-29T12:34:56.789Z
        assert_eq!(format_utc(1_709_210_096, 789), "2024-02-29T12:34:56.789Z");
        assert_eq!(format_utc(1_735_689_599, 0), "2024-12-31T23:59:59.000Z");
    }
}
