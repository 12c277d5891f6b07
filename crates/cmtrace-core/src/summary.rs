//! Human-readable one-line-per-call form.
//!
//! ```text
//! malloc(96) = 81d21e160<1>
//! realloc(81d21e160<1>, 512) = 81d3b9800<2>
//! free(81d3b9800<2>)
//! ```
//!
//! The encoder emits it instead of binary records in summary mode, the
//! replayer prints it in verbose mode and the analysis passes consume it.

use std::fmt;

use crate::event::parse_addr;

/// One call in summary form. Handles are rendered in lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryLine<A = u64> {
    Malloc {
        size: u64,
        addr: A,
        tag: u32,
    },
    Realloc {
        old_addr: A,
        old_tag: u32,
        size: u64,
        new_addr: A,
        new_tag: u32,
    },
    Free {
        addr: A,
        tag: u32,
    },
}

impl<A: fmt::LowerHex + Copy> fmt::Display for SummaryLine<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Malloc { size, addr, tag } => write!(f, "malloc({size}) = {addr:x}<{tag}>"),
            Self::Realloc {
                old_addr,
                old_tag,
                size,
                new_addr,
                new_tag,
            } => write!(
                f,
                "realloc({old_addr:x}<{old_tag}>, {size}) = {new_addr:x}<{new_tag}>"
            ),
            Self::Free { addr, tag } => write!(f, "free({addr:x}<{tag}>)"),
        }
    }
}

/// Parse a summary line; `None` if it does not have one of the three shapes.
#[must_use]
pub fn parse_summary_line(line: &str) -> Option<SummaryLine> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("malloc(") {
        let (size, rest) = rest.split_once(") = ")?;
        let (addr, tag) = parse_tagged(rest)?;
        return Some(SummaryLine::Malloc {
            size: size.trim().parse().ok()?,
            addr,
            tag,
        });
    }
    if let Some(rest) = line.strip_prefix("realloc(") {
        let (old, rest) = rest.split_once(", ")?;
        let (size, new) = rest.split_once(") = ")?;
        let (old_addr, old_tag) = parse_tagged(old)?;
        let (new_addr, new_tag) = parse_tagged(new)?;
        return Some(SummaryLine::Realloc {
            old_addr,
            old_tag,
            size: size.trim().parse().ok()?,
            new_addr,
            new_tag,
        });
    }
    if let Some(rest) = line.strip_prefix("free(") {
        let inner = rest.strip_suffix(')')?;
        let (addr, tag) = parse_tagged(inner)?;
        return Some(SummaryLine::Free { addr, tag });
    }
    None
}

/// `81d21e160<6385>` -> (0x81d21e160, 6385)
fn parse_tagged(raw: &str) -> Option<(u64, u32)> {
    let (addr, rest) = raw.trim().split_once('<')?;
    let tag = rest.strip_suffix('>')?;
    Some((parse_addr(addr)?, tag.parse().ok()?))
}
