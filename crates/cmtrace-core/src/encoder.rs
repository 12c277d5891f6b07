//! Producer trace -> compact binary stream.

use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::event::{AllocEvent, ParseError, TraceLine, parse_trace_line};
use crate::record::{HighWaterMark, Record, RecordError};
use crate::summary::SummaryLine;
use crate::tag_table::{Tag, TagError, TagTable};
use crate::varint::{MAX_VALUE, VarintError};

/// What the encoder writes for each event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum EncoderOutput {
    /// Compact binary records.
    #[default]
    Binary,
    /// One human-readable summary line per event.
    Summary,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("line {line_number}: {source}")]
    Tag {
        line_number: usize,
        #[source]
        source: TagError,
    },
    #[error("line {line_number}: {source}")]
    Record {
        line_number: usize,
        #[source]
        source: RecordError,
    },
    #[error("line {line_number}: size {size} exceeds the 28-bit wire limit")]
    SizeTooLarge { line_number: usize, size: u64 },
    #[error("line {line_number}: {symbol} with zero size")]
    ZeroSize {
        line_number: usize,
        symbol: &'static str,
    },
    #[error("line {line_number}: size == 0 with no old tag")]
    EmptyRecord { line_number: usize },
    #[error(transparent)]
    Varint(#[from] VarintError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Counters collected over one encode pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeStats {
    pub lines: u64,
    pub allocations: u64,
    pub resizes: u64,
    pub releases: u64,
    /// `mmap` and other recognized calls outside the model.
    pub skipped: u64,
    /// Lines that are not `call-trace` records, plus null frees.
    pub ignored: u64,
    pub bytes_written: u64,
    pub peak_live: u64,
}

impl EncodeStats {
    #[must_use]
    pub fn events(&self) -> u64 {
        self.allocations + self.resizes + self.releases
    }
}

/// Streaming encoder owning its tag table and high-water mark.
pub struct Encoder<W: Write> {
    out: W,
    output: EncoderOutput,
    tags: TagTable<u64>,
    mark: HighWaterMark,
    stats: EncodeStats,
    line_number: usize,
}

impl<W: Write> Encoder<W> {
    pub fn new(out: W, output: EncoderOutput) -> Self {
        Self {
            out,
            output,
            tags: TagTable::new(),
            mark: HighWaterMark::new(),
            stats: EncodeStats::default(),
            line_number: 0,
        }
    }

    #[must_use]
    pub fn stats(&self) -> &EncodeStats {
        &self.stats
    }

    /// Allocations assigned a tag and not yet released.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.tags.len()
    }

    #[must_use]
    pub fn highest_tag(&self) -> u32 {
        self.tags.highest_assigned()
    }

    /// Encode one event handed over directly (not from a producer line).
    ///
    /// Errors report the 1-based event index in place of a line number.
    pub fn encode_event(&mut self, event: AllocEvent) -> Result<(), EncodeError> {
        self.line_number = usize::try_from(self.stats.events() + 1).unwrap_or(usize::MAX);
        self.apply(event)
    }

    /// Classify and encode one producer line.
    pub fn encode_line(&mut self, line: &str, line_number: usize) -> Result<(), EncodeError> {
        self.stats.lines += 1;
        match parse_trace_line(line, line_number)? {
            TraceLine::Event(event) => {
                self.line_number = line_number;
                self.apply(event)
            }
            TraceLine::Skipped => {
                self.stats.skipped += 1;
                Ok(())
            }
            TraceLine::Ignored => {
                self.stats.ignored += 1;
                Ok(())
            }
        }
    }

    /// Encode every line from `input`.
    pub fn encode_reader<R: BufRead>(&mut self, mut input: R) -> Result<(), EncodeError> {
        let mut buf = Vec::new();
        let mut line_number = 0;
        loop {
            buf.clear();
            if input.read_until(b'\n', &mut buf)? == 0 {
                return Ok(());
            }
            line_number += 1;
            let line = String::from_utf8_lossy(&buf);
            self.encode_line(&line, line_number)?;
        }
    }

    /// Flush the output and hand it back with the final counters.
    pub fn finish(mut self) -> Result<(W, EncodeStats), EncodeError> {
        self.out.flush()?;
        Ok((self.out, self.stats))
    }

    fn apply(&mut self, event: AllocEvent) -> Result<(), EncodeError> {
        let size = event.size();
        if size > u64::from(MAX_VALUE) {
            return Err(EncodeError::SizeTooLarge {
                line_number: self.line_number,
                size,
            });
        }
        // Zero-size records carry no new-tag field; reject before tagging.
        if size == 0 && !matches!(event, AllocEvent::Release { .. }) {
            return Err(EncodeError::ZeroSize {
                line_number: self.line_number,
                symbol: event.symbol(),
            });
        }

        match event {
            AllocEvent::Allocate { size, addr } => {
                let tag = self.tag_result(|tags| tags.assign(addr))?;
                self.stats.allocations += 1;
                self.emit(
                    None,
                    size,
                    Some(tag),
                    SummaryLine::Malloc {
                        size,
                        addr,
                        tag: tag.get(),
                    },
                )?;
            }
            AllocEvent::Resize { old, size, new } => {
                // The source leaves the table before the result enters it, so
                // an in-place resize reuses the address under a new tag.
                let old_tag = self.tag_result(|tags| tags.release_handle(old))?;
                let new_tag = self.tag_result(|tags| tags.assign(new))?;
                self.stats.resizes += 1;
                self.emit(
                    Some(old_tag),
                    size,
                    Some(new_tag),
                    SummaryLine::Realloc {
                        old_addr: old,
                        old_tag: old_tag.get(),
                        size,
                        new_addr: new,
                        new_tag: new_tag.get(),
                    },
                )?;
            }
            AllocEvent::Release { addr } => {
                let tag = self.tag_result(|tags| tags.release_handle(addr))?;
                self.stats.releases += 1;
                self.emit(
                    Some(tag),
                    0,
                    None,
                    SummaryLine::Free {
                        addr,
                        tag: tag.get(),
                    },
                )?;
            }
        }

        self.stats.peak_live = self.stats.peak_live.max(self.tags.len() as u64);
        Ok(())
    }

    fn emit(
        &mut self,
        old: Option<Tag>,
        size: u64,
        new: Option<Tag>,
        summary: SummaryLine,
    ) -> Result<(), EncodeError> {
        if size == 0 && old.is_none() {
            return Err(EncodeError::EmptyRecord {
                line_number: self.line_number,
            });
        }

        let line_number = self.line_number;
        let record_err = |source| EncodeError::Record {
            line_number,
            source,
        };
        let old_tag_field = self.mark.old_field(old).map_err(record_err)?;
        let new_tag_field = if size != 0 {
            Some(self.mark.new_field(new).map_err(record_err)?)
        } else {
            None
        };

        match self.output {
            EncoderOutput::Binary => {
                let record = Record {
                    // Bounded by the MAX_VALUE check in `apply`.
                    size: size as u32,
                    old_tag_field,
                    new_tag_field,
                };
                let written = record.write_to(&mut self.out)?;
                self.stats.bytes_written += written as u64;
            }
            EncoderOutput::Summary => {
                let line = format!("{summary}\n");
                self.out.write_all(line.as_bytes())?;
                self.stats.bytes_written += line.len() as u64;
            }
        }
        Ok(())
    }

    fn tag_result<T>(
        &mut self,
        op: impl FnOnce(&mut TagTable<u64>) -> Result<T, TagError>,
    ) -> Result<T, EncodeError> {
        op(&mut self.tags).map_err(|source| EncodeError::Tag {
            line_number: self.line_number,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(events: &[AllocEvent]) -> Vec<u8> {
        let mut encoder = Encoder::new(Vec::new(), EncoderOutput::Binary);
        for event in events {
            encoder.encode_event(*event).unwrap();
        }
        encoder.finish().unwrap().0
    }

    #[test]
    fn first_allocation_record() {
        let bytes = encode_all(&[AllocEvent::Allocate {
            size: 96,
            addr: 0x81d2_1e160,
        }]);
        assert_eq!(bytes, vec![0x80 | 96, 0x80, 0x81]);
    }

    #[test]
    fn allocate_then_free() {
        let bytes = encode_all(&[
            AllocEvent::Allocate {
                size: 20,
                addr: 0x1000,
            },
            AllocEvent::Release { addr: 0x1000 },
        ]);
        assert_eq!(bytes, vec![0x80 | 20, 0x80, 0x81, 0x80, 0x81]);
    }

    #[test]
    fn allocate_then_resize() {
        let bytes = encode_all(&[
            AllocEvent::Allocate {
                size: 20,
                addr: 0x1000,
            },
            AllocEvent::Resize {
                old: 0x1000,
                size: 64,
                new: 0x2000,
            },
        ]);
        assert_eq!(bytes, vec![0x80 | 20, 0x80, 0x81, 0x80 | 64, 0x81, 0x81]);
    }

    #[test]
    fn older_tags_produce_larger_deltas() {
        let bytes = encode_all(&[
            AllocEvent::Allocate { size: 8, addr: 0xa },
            AllocEvent::Allocate { size: 8, addr: 0xb },
            AllocEvent::Allocate { size: 8, addr: 0xc },
            AllocEvent::Release { addr: 0xa },
        ]);
        // H=3, old=1 -> (3 + 1) - 1 = 3
        assert_eq!(&bytes[bytes.len() - 2..], &[0x80, 0x83]);
    }

    #[test]
    fn in_place_resize_keeps_address_but_changes_tag() {
        let mut encoder = Encoder::new(Vec::new(), EncoderOutput::Summary);
        encoder
            .encode_event(AllocEvent::Allocate {
                size: 16,
                addr: 0x40,
            })
            .unwrap();
        encoder
            .encode_event(AllocEvent::Resize {
                old: 0x40,
                size: 24,
                new: 0x40,
            })
            .unwrap();
        let (out, stats) = encoder.finish().unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "malloc(16) = 40<1>\nrealloc(40<1>, 24) = 40<2>\n"
        );
        assert_eq!(stats.resizes, 1);
        assert_eq!(stats.peak_live, 1);
    }

    #[test]
    fn double_allocation_is_fatal() {
        let mut encoder = Encoder::new(Vec::new(), EncoderOutput::Binary);
        encoder
            .encode_line("call-trace 1 5 1 malloc 8 1000", 1)
            .unwrap();
        let err = encoder
            .encode_line("call-trace 2 5 1 malloc 8 1000", 2)
            .unwrap_err();
        assert!(matches!(
            err,
            EncodeError::Tag {
                line_number: 2,
                source: TagError::DuplicateHandle { .. }
            }
        ));
    }

    #[test]
    fn free_of_unknown_address_is_fatal() {
        let mut encoder = Encoder::new(Vec::new(), EncoderOutput::Binary);
        let err = encoder.encode_line("call-trace 1 free 1000", 7).unwrap_err();
        assert_eq!(err.to_string(), "line 7: no tag for 1000");
    }

    #[test]
    fn oversized_allocation_is_rejected() {
        let mut encoder = Encoder::new(Vec::new(), EncoderOutput::Binary);
        let err = encoder
            .encode_event(AllocEvent::Allocate {
                size: 1 << 28,
                addr: 0x10,
            })
            .unwrap_err();
        assert!(matches!(err, EncodeError::SizeTooLarge { line_number: 1, .. }));
        assert_eq!(encoder.live_allocations(), 0);
    }

    #[test]
    fn zero_size_allocation_is_rejected_before_tagging() {
        let mut encoder = Encoder::new(Vec::new(), EncoderOutput::Binary);
        let err = encoder
            .encode_event(AllocEvent::Allocate { size: 0, addr: 0x10 })
            .unwrap_err();
        assert!(matches!(
            err,
            EncodeError::ZeroSize {
                line_number: 1,
                symbol: "malloc"
            }
        ));
        assert_eq!(encoder.live_allocations(), 0);
        assert_eq!(encoder.highest_tag(), 0);
        assert!(encoder.finish().unwrap().0.is_empty());
    }

    #[test]
    fn zero_size_resize_leaves_table_and_stream_untouched() {
        let mut encoder = Encoder::new(Vec::new(), EncoderOutput::Binary);
        encoder
            .encode_event(AllocEvent::Allocate { size: 8, addr: 0x10 })
            .unwrap();
        let err = encoder
            .encode_event(AllocEvent::Resize {
                old: 0x10,
                size: 0,
                new: 0x20,
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "line 2: realloc with zero size");
        assert_eq!(encoder.live_allocations(), 1);
        assert_eq!(encoder.highest_tag(), 1);

        // The source allocation is still live under its original tag.
        encoder
            .encode_event(AllocEvent::Release { addr: 0x10 })
            .unwrap();
        let (bytes, stats) = encoder.finish().unwrap();
        assert_eq!(bytes, vec![0x80 | 8, 0x80, 0x81, 0x80, 0x81]);
        assert_eq!((stats.allocations, stats.resizes, stats.releases), (1, 0, 1));
    }

    #[test]
    fn reader_counts_line_kinds() {
        let trace = "\
# header
call-trace\t1\t50a0805 14\tmalloc\t96\t81d21e160
call-trace\t2\t50a0805 14\tmmap
call-trace\t3\t\tfree\t81d21e160\t
call-trace\t4\tfree\t0
";
        let mut encoder = Encoder::new(Vec::new(), EncoderOutput::Binary);
        encoder.encode_reader(trace.as_bytes()).unwrap();
        let (bytes, stats) = encoder.finish().unwrap();
        assert_eq!(stats.lines, 5);
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.ignored, 2);
        assert_eq!(stats.bytes_written, bytes.len() as u64);
        assert_eq!(bytes.len(), 5);
    }
}
