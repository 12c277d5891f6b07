//! Annotating passes over summary-form traces.
//!
//! Each pass reads summary lines in order and may attach a note to a line.
//! Annotated lines are printed as `<line padded to 49 columns> # <note>`;
//! lines without a note are printed unchanged.
//!
//! - [`Lifetimes`]: on `free`/`realloc`, the size being released and how many
//!   lines ago it was allocated.
//! - [`Layout`]: the neighbouring live blocks, the gaps to them and the
//!   4 KiB pages a block spans.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::summary::{SummaryLine, parse_summary_line};

/// Width a summary line is padded to before its note.
pub const NOTE_COLUMN: usize = 49;

const PAGE_SHIFT: u32 = 12;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("cannot parse line {line_number}: \"{line}\"")]
    Unparsable { line_number: usize, line: String },
    #[error("line {line_number}: {addr:x} is not a live allocation")]
    UnknownAddress { line_number: usize, addr: u64 },
    #[error("line {line_number}: {addr:x} is already live")]
    DuplicateAddress { line_number: usize, addr: u64 },
    #[error("line {line_number}: block at {addr:x} overlaps live block at {other:x}")]
    Overlap {
        line_number: usize,
        addr: u64,
        other: u64,
    },
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// One annotating pass.
pub trait Annotator {
    /// Note for the summary line at `line_number` (1-based), if any.
    fn annotate(
        &mut self,
        line: &SummaryLine,
        line_number: usize,
    ) -> Result<Option<String>, AnalysisError>;
}

/// `line` padded to [`NOTE_COLUMN`] followed by `# note`.
#[must_use]
pub fn render(line: &str, note: Option<&str>) -> String {
    match note {
        Some(note) => format!("{line:width$} # {note}", width = NOTE_COLUMN),
        None => line.to_string(),
    }
}

/// Run `annotator` over every line of `input`, writing the result to `out`.
/// Returns the number of lines processed.
pub fn annotate_reader<R, W, A>(
    input: R,
    out: &mut W,
    annotator: &mut A,
) -> Result<usize, AnalysisError>
where
    R: BufRead,
    W: Write + ?Sized,
    A: Annotator + ?Sized,
{
    let mut line_number = 0;
    for line in input.lines() {
        let line = line?;
        line_number += 1;
        let line = line.trim_end();
        let parsed = parse_summary_line(line).ok_or_else(|| AnalysisError::Unparsable {
            line_number,
            line: line.to_string(),
        })?;
        let note = annotator.annotate(&parsed, line_number)?;
        writeln!(out, "{}", render(line, note.as_deref()))?;
    }
    out.flush()?;
    Ok(line_number)
}

#[derive(Debug, Clone, Copy)]
struct LiveBlock {
    size: u64,
    line_number: usize,
}

/// Allocation age and size at release time.
#[derive(Debug, Default)]
pub struct Lifetimes {
    live: HashMap<u64, LiveBlock>,
}

impl Lifetimes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn take(&mut self, addr: u64, line_number: usize) -> Result<String, AnalysisError> {
        let block = self
            .live
            .remove(&addr)
            .ok_or(AnalysisError::UnknownAddress { line_number, addr })?;
        Ok(format!(
            "{} bytes, allocated {} lines ago",
            block.size,
            line_number - block.line_number
        ))
    }

    fn put(&mut self, addr: u64, size: u64, line_number: usize) -> Result<(), AnalysisError> {
        if self.live.contains_key(&addr) {
            return Err(AnalysisError::DuplicateAddress { line_number, addr });
        }
        self.live.insert(addr, LiveBlock { size, line_number });
        Ok(())
    }
}

impl Annotator for Lifetimes {
    fn annotate(
        &mut self,
        line: &SummaryLine,
        line_number: usize,
    ) -> Result<Option<String>, AnalysisError> {
        match *line {
            SummaryLine::Malloc { size, addr, .. } => {
                self.put(addr, size, line_number)?;
                Ok(None)
            }
            SummaryLine::Realloc {
                old_addr,
                size,
                new_addr,
                ..
            } => {
                let note = self.take(old_addr, line_number)?;
                self.put(new_addr, size, line_number)?;
                Ok(Some(note))
            }
            SummaryLine::Free { addr, .. } => self.take(addr, line_number).map(Some),
        }
    }
}

const fn page_of(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

/// Last byte of a block; zero-sized blocks count as one byte.
const fn last_byte(addr: u64, size: u64) -> u64 {
    addr.saturating_add(if size == 0 { 0 } else { size - 1 })
}

/// The live block on one side of an allocation and the gap to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Neighbour {
    addr: u64,
    size: u64,
    gap: u64,
}

struct Side(&'static str, Option<Neighbour>);

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.1 {
            Some(n) => write!(f, "{} {:x}, gap {}", self.0, n.addr, n.gap),
            None => write!(f, "{} -, gap -", self.0),
        }
    }
}

/// Address-ordered view of the live heap.
#[derive(Debug, Default)]
pub struct Layout {
    live: BTreeMap<u64, LiveBlock>,
}

impl Layout {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live blocks on either side of `addr..addr + size`.
    fn neighbours(
        &self,
        addr: u64,
        size: u64,
        line_number: usize,
    ) -> Result<(Option<Neighbour>, Option<Neighbour>), AnalysisError> {
        let prev = match self.live.range(..addr).next_back() {
            Some((&p, block)) => {
                let end = p.saturating_add(block.size);
                if end > addr {
                    return Err(AnalysisError::Overlap {
                        line_number,
                        addr,
                        other: p,
                    });
                }
                Some(Neighbour {
                    addr: p,
                    size: block.size,
                    gap: addr - end,
                })
            }
            None => None,
        };
        let next = match self.live.range(addr.saturating_add(1)..).next() {
            Some((&n, block)) => {
                let end = addr.saturating_add(size);
                if end > n {
                    return Err(AnalysisError::Overlap {
                        line_number,
                        addr,
                        other: n,
                    });
                }
                Some(Neighbour {
                    addr: n,
                    size: block.size,
                    gap: n - end,
                })
            }
            None => None,
        };
        Ok((prev, next))
    }

    fn release(&mut self, addr: u64, line_number: usize) -> Result<String, AnalysisError> {
        let block = *self
            .live
            .get(&addr)
            .ok_or(AnalysisError::UnknownAddress { line_number, addr })?;
        let (prev, next) = self.neighbours(addr, block.size, line_number)?;
        self.live.remove(&addr);
        Ok(format!(
            "{} bytes, allocated {} lines ago, {}, {}, pages [{}-{}]",
            block.size,
            line_number - block.line_number,
            Side("prev", prev),
            Side("next", next),
            page_of(addr),
            page_of(last_byte(addr, block.size)),
        ))
    }

    fn place(&mut self, addr: u64, size: u64, line_number: usize) -> Result<String, AnalysisError> {
        if self.live.contains_key(&addr) {
            return Err(AnalysisError::DuplicateAddress { line_number, addr });
        }
        let (prev, next) = self.neighbours(addr, size, line_number)?;
        self.live.insert(addr, LiveBlock { size, line_number });

        let first_page = page_of(addr);
        let last_page = page_of(last_byte(addr, size));
        // Pages this block touches that no neighbour already touched.
        let mut more_pages = last_page - first_page + 1;
        if prev.is_some_and(|p| page_of(last_byte(p.addr, p.size)) == first_page) {
            more_pages -= 1;
        }
        if first_page != last_page && next.is_some_and(|n| page_of(n.addr) == last_page) {
            more_pages -= 1;
        }
        Ok(format!(
            "{}, {}, pages [{}, {}], {} more pages",
            Side("prev", prev),
            Side("next", next),
            first_page,
            last_page,
            more_pages,
        ))
    }
}

impl Annotator for Layout {
    fn annotate(
        &mut self,
        line: &SummaryLine,
        line_number: usize,
    ) -> Result<Option<String>, AnalysisError> {
        match *line {
            SummaryLine::Malloc { size, addr, .. } => self.place(addr, size, line_number).map(Some),
            SummaryLine::Realloc {
                old_addr,
                size,
                new_addr,
                ..
            } => {
                let note = self.release(old_addr, line_number)?;
                self.place(new_addr, size, line_number)?;
                Ok(Some(note))
            }
            SummaryLine::Free { addr, .. } => self.release(addr, line_number).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<A: Annotator>(annotator: &mut A, text: &str) -> Result<String, AnalysisError> {
        let mut out = Vec::new();
        annotate_reader(text.as_bytes(), &mut out, annotator)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn render_pads_to_note_column() {
        let rendered = render("free(10<1>)", Some("8 bytes"));
        assert_eq!(rendered.find('#'), Some(NOTE_COLUMN + 1));
        assert_eq!(render("free(10<1>)", None), "free(10<1>)");
    }

    #[test]
    fn lifetimes_report_size_and_age() {
        let text = "malloc(8) = 81d220b48<6655>\n\
                    realloc(81d220b48<6655>, 16) = 81d3b83a0<6656>\n\
                    free(81d3b83a0<6656>)\n";
        let out = run(&mut Lifetimes::new(), text).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "malloc(8) = 81d220b48<6655>");
        assert_eq!(
            lines[1],
            "realloc(81d220b48<6655>, 16) = 81d3b83a0<6656>    # 8 bytes, allocated 1 lines ago"
        );
        assert_eq!(
            lines[2],
            "free(81d3b83a0<6656>)                             # 16 bytes, allocated 1 lines ago"
        );
    }

    #[test]
    fn lifetimes_reject_unknown_release() {
        let err = run(&mut Lifetimes::new(), "free(1000<1>)\n").unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::UnknownAddress {
                line_number: 1,
                addr: 0x1000
            }
        ));
    }

    #[test]
    fn layout_reports_neighbours_gaps_and_pages() {
        let mut layout = Layout::new();
        let first = SummaryLine::Malloc {
            size: 16,
            addr: 0x1000,
            tag: 1,
        };
        assert_eq!(
            layout.annotate(&first, 1).unwrap().unwrap(),
            "prev -, gap -, next -, gap -, pages [1, 1], 1 more pages"
        );

        let second = SummaryLine::Malloc {
            size: 0x1000,
            addr: 0x1020,
            tag: 2,
        };
        assert_eq!(
            layout.annotate(&second, 2).unwrap().unwrap(),
            "prev 1000, gap 16, next -, gap -, pages [1, 2], 1 more pages"
        );

        let free = SummaryLine::Free {
            addr: 0x1000,
            tag: 1,
        };
        assert_eq!(
            layout.annotate(&free, 3).unwrap().unwrap(),
            "16 bytes, allocated 2 lines ago, prev -, gap -, next 1020, gap 16, pages [1-1]"
        );
    }

    #[test]
    fn layout_detects_overlap() {
        let mut layout = Layout::new();
        let a = SummaryLine::Malloc {
            size: 64,
            addr: 0x1000,
            tag: 1,
        };
        let b = SummaryLine::Malloc {
            size: 8,
            addr: 0x1020,
            tag: 2,
        };
        layout.annotate(&a, 1).unwrap();
        assert!(matches!(
            layout.annotate(&b, 2),
            Err(AnalysisError::Overlap { other: 0x1000, .. })
        ));
    }

    #[test]
    fn unparsable_line_is_fatal() {
        let err = run(&mut Layout::new(), "mmap(4096)\n").unwrap_err();
        assert!(err.to_string().contains("cannot parse line 1"));
    }
}
