//! Allocation events and the producer's `call-trace` line grammar.
//!
//! Recognized shapes (fields separated by tabs or spaces):
//!
//! ```text
//! call-trace <ts> <frame-info...> malloc <size> <addr>
//! call-trace <ts> free <addr>
//! call-trace <ts> <frame-info...> realloc <addr> <size> <addr>
//! call-trace <ts> <frame-info...> mmap ...
//! ```

use thiserror::Error;

const CALL_TRACE: &str = "call-trace";

/// One allocator call observed by the trace producer, keyed by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocEvent {
    Allocate { size: u64, addr: u64 },
    Resize { old: u64, size: u64, new: u64 },
    Release { addr: u64 },
}

impl AllocEvent {
    /// Requested size, `0` for releases.
    #[must_use]
    pub fn size(&self) -> u64 {
        match *self {
            Self::Allocate { size, .. } | Self::Resize { size, .. } => size,
            Self::Release { .. } => 0,
        }
    }

    #[must_use]
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Allocate { .. } => "malloc",
            Self::Resize { .. } => "realloc",
            Self::Release { .. } => "free",
        }
    }
}

/// Classification of one producer line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLine {
    Event(AllocEvent),
    /// A recognized call outside the allocate/resize/release model (`mmap`).
    Skipped,
    /// A line that is not a `call-trace` record at all, or a null free.
    Ignored,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line_number}: can't parse: {line}")]
    Malformed { line_number: usize, line: String },
    #[error("line {line_number}: {symbol} with zero size: {line}")]
    ZeroSize {
        line_number: usize,
        symbol: &'static str,
        line: String,
    },
}

/// Classify a single producer line.
///
/// `free 0` is treated as the no-op `free(NULL)` and classified as ignored,
/// not rejected as an untagged release.
pub fn parse_trace_line(line: &str, line_number: usize) -> Result<TraceLine, ParseError> {
    let line = line.trim_end_matches(['\n', '\r']);
    if !line.starts_with(CALL_TRACE) {
        return Ok(TraceLine::Ignored);
    }

    let malformed = || ParseError::Malformed {
        line_number,
        line: line.to_string(),
    };
    let sized = |event: AllocEvent| {
        if event.size() == 0 {
            Err(ParseError::ZeroSize {
                line_number,
                symbol: event.symbol(),
                line: line.to_string(),
            })
        } else {
            Ok(TraceLine::Event(event))
        }
    };

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.first() != Some(&CALL_TRACE) || fields.len() < 3 {
        return Err(malformed());
    }
    fields[1].parse::<u64>().map_err(|_| malformed())?;

    // Frame info is hex digits only, so the first alphabetic keyword is the call.
    let Some(call_idx) = (2..fields.len())
        .find(|&i| matches!(fields[i], "malloc" | "free" | "realloc" | "mmap"))
    else {
        return Err(malformed());
    };
    let args = &fields[call_idx + 1..];

    match fields[call_idx] {
        "malloc" => {
            let [size, addr, ..] = args else {
                return Err(malformed());
            };
            let size = parse_size(size).ok_or_else(malformed)?;
            let addr = parse_addr(addr).ok_or_else(malformed)?;
            sized(AllocEvent::Allocate { size, addr })
        }
        "free" => {
            if call_idx != 2 {
                return Err(malformed());
            }
            let [addr, ..] = args else {
                return Err(malformed());
            };
            let addr = parse_addr(addr).ok_or_else(malformed)?;
            if addr == 0 {
                return Ok(TraceLine::Ignored);
            }
            Ok(TraceLine::Event(AllocEvent::Release { addr }))
        }
        "realloc" => {
            let [old, size, new, ..] = args else {
                return Err(malformed());
            };
            let old = parse_addr(old).ok_or_else(malformed)?;
            let size = parse_size(size).ok_or_else(malformed)?;
            let new = parse_addr(new).ok_or_else(malformed)?;
            // realloc(NULL, n) is an allocation.
            let event = match (old, size) {
                (0, 1..) => AllocEvent::Allocate { size, addr: new },
                _ => AllocEvent::Resize { old, size, new },
            };
            sized(event)
        }
        _ => Ok(TraceLine::Skipped),
    }
}

/// Parse a hexadecimal address, with or without a `0x` prefix.
#[must_use]
pub fn parse_addr(raw: &str) -> Option<u64> {
    let hex = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    u64::from_str_radix(hex, 16).ok()
}

fn parse_size(raw: &str) -> Option<u64> {
    raw.parse::<u64>().ok()
}
