//! Compact binary stream -> calls against a [`ReplayAllocator`].
//!
//! Strict single pass: each record is decoded and dispatched before the
//! next byte is read. Any fault ends the replay; there is no resync.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::alloc::{AllocError, ReplayAllocator};
use crate::record::{HighWaterMark, Record, RecordError};
use crate::summary::SummaryLine;
use crate::tag_table::{Tag, TagError, TagTable};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("cmt stream error: record {record} at byte {offset}: {source}")]
    Record {
        record: u64,
        offset: u64,
        #[source]
        source: RecordError,
    },
    #[error(
        "cmt stream error: record {record} at byte {offset}: invalid field combination \
         (size={size}, old tag field={old_tag_field}, new tag field={new_tag_field:?})"
    )]
    InvalidRecord {
        record: u64,
        offset: u64,
        size: u32,
        old_tag_field: u32,
        new_tag_field: Option<u32>,
    },
    #[error("record {record} at byte {offset}: {source}")]
    Tag {
        record: u64,
        offset: u64,
        #[source]
        source: TagError,
    },
    #[error("record {record} at byte {offset}: {source}")]
    Alloc {
        record: u64,
        offset: u64,
        #[source]
        source: AllocError,
    },
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// One dispatched call with the tags that identify it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayCall<H> {
    Allocate {
        size: usize,
        tag: Tag,
        handle: H,
    },
    Resize {
        old_tag: Tag,
        old_handle: H,
        size: usize,
        new_tag: Tag,
        new_handle: H,
    },
    Release {
        tag: Tag,
        handle: H,
    },
}

impl<H: Copy> ReplayCall<H> {
    /// The call in summary form, as printed by verbose replays.
    #[must_use]
    pub fn summary(&self) -> SummaryLine<H> {
        match *self {
            Self::Allocate { size, tag, handle } => SummaryLine::Malloc {
                size: size as u64,
                addr: handle,
                tag: tag.get(),
            },
            Self::Resize {
                old_tag,
                old_handle,
                size,
                new_tag,
                new_handle,
            } => SummaryLine::Realloc {
                old_addr: old_handle,
                old_tag: old_tag.get(),
                size: size as u64,
                new_addr: new_handle,
                new_tag: new_tag.get(),
            },
            Self::Release { tag, handle } => SummaryLine::Free {
                addr: handle,
                tag: tag.get(),
            },
        }
    }
}

/// Counters collected over one replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub records: u64,
    pub allocations: u64,
    pub resizes: u64,
    pub releases: u64,
    pub bytes_read: u64,
    /// Sum of sizes passed to allocate and resize.
    pub bytes_requested: u64,
    pub peak_live: u64,
    /// Allocations still live when the stream ended.
    pub live_at_end: u64,
}

/// Drives one allocator through one compact stream.
pub struct Replayer<R, A: ReplayAllocator> {
    input: R,
    allocator: A,
    tags: TagTable<A::Handle>,
    mark: HighWaterMark,
    trace: Option<Box<dyn Write>>,
    stats: ReplayStats,
}

impl<R: Read, A: ReplayAllocator> Replayer<R, A> {
    pub fn new(input: R, allocator: A) -> Self {
        Self {
            input,
            allocator,
            tags: TagTable::new(),
            mark: HighWaterMark::new(),
            trace: None,
            stats: ReplayStats::default(),
        }
    }

    /// Print every dispatched call to `out` in summary form.
    #[must_use]
    pub fn with_trace(mut self, out: Box<dyn Write>) -> Self {
        self.trace = Some(out);
        self
    }

    #[must_use]
    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    #[must_use]
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.tags.len()
    }

    /// Handle currently bound to `tag`, if live.
    #[must_use]
    pub fn handle_of(&self, tag: Tag) -> Option<A::Handle> {
        self.tags.handle_of(tag)
    }

    pub fn into_allocator(self) -> A {
        self.allocator
    }

    /// Replay until the stream ends on a record boundary.
    pub fn run(&mut self) -> Result<ReplayStats, ReplayError> {
        while self.step()?.is_some() {}
        if let Some(trace) = self.trace.as_mut() {
            trace.flush()?;
        }
        self.stats.live_at_end = self.tags.len() as u64;
        Ok(self.stats)
    }

    /// Decode and dispatch one record; `Ok(None)` at end of stream.
    pub fn step(&mut self) -> Result<Option<ReplayCall<A::Handle>>, ReplayError> {
        let record_no = self.stats.records + 1;
        let offset = self.stats.bytes_read;
        let record_err = |source| ReplayError::Record {
            record: record_no,
            offset,
            source,
        };
        let tag_err = |source| ReplayError::Tag {
            record: record_no,
            offset,
            source,
        };
        let alloc_err = |source| ReplayError::Alloc {
            record: record_no,
            offset,
            source,
        };

        let Some((record, consumed)) = Record::read_from(&mut self.input).map_err(record_err)?
        else {
            return Ok(None);
        };
        self.stats.bytes_read += consumed as u64;
        self.stats.records = record_no;

        let old = self
            .mark
            .resolve_old(record.old_tag_field)
            .map_err(record_err)?;
        let new = match record.new_tag_field {
            Some(field) => self.mark.resolve_new(field).map_err(record_err)?,
            None => None,
        };
        let size = record.size as usize;

        let call = match (size, old, new) {
            (1.., None, Some(tag)) => {
                let handle = self.allocator.allocate(size).map_err(alloc_err)?;
                self.tags.register(tag, handle).map_err(tag_err)?;
                self.stats.allocations += 1;
                self.stats.bytes_requested += size as u64;
                ReplayCall::Allocate { size, tag, handle }
            }
            (1.., Some(old_tag), Some(new_tag)) => {
                // Deregister first: an in-place resize hands back the same handle.
                let old_handle = self.tags.release_tag(old_tag).map_err(tag_err)?;
                let new_handle = self
                    .allocator
                    .resize(old_handle, size)
                    .map_err(alloc_err)?;
                self.tags.register(new_tag, new_handle).map_err(tag_err)?;
                self.stats.resizes += 1;
                self.stats.bytes_requested += size as u64;
                ReplayCall::Resize {
                    old_tag,
                    old_handle,
                    size,
                    new_tag,
                    new_handle,
                }
            }
            (0, Some(tag), None) => {
                let handle = self.tags.release_tag(tag).map_err(tag_err)?;
                self.allocator.release(handle).map_err(alloc_err)?;
                self.stats.releases += 1;
                ReplayCall::Release { tag, handle }
            }
            _ => {
                return Err(ReplayError::InvalidRecord {
                    record: record_no,
                    offset,
                    size: record.size,
                    old_tag_field: record.old_tag_field,
                    new_tag_field: record.new_tag_field,
                });
            }
        };

        self.stats.peak_live = self.stats.peak_live.max(self.tags.len() as u64);
        if let Some(trace) = self.trace.as_mut() {
            writeln!(trace, "{}", call.summary())?;
        }
        Ok(Some(call))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{BumpAllocator, NullAllocator};
    use crate::varint::VarintError;

    fn tag(raw: u32) -> Tag {
        Tag::new(raw).unwrap()
    }

    fn replay_all(bytes: &[u8]) -> Result<Vec<ReplayCall<usize>>, ReplayError> {
        let mut replayer = Replayer::new(bytes, NullAllocator::new());
        let mut calls = Vec::new();
        while let Some(call) = replayer.step()? {
            calls.push(call);
        }
        Ok(calls)
    }

    #[test]
    fn empty_stream_replays_nothing() {
        assert!(replay_all(&[]).unwrap().is_empty());
    }

    #[test]
    fn pure_allocate() {
        let calls = replay_all(&[0x80 | 96, 0x80, 0x81]).unwrap();
        assert!(matches!(
            calls.as_slice(),
            [ReplayCall::Allocate { size: 96, tag: t, .. }] if *t == tag(1)
        ));
    }

    #[test]
    fn allocate_then_free_releases_same_handle() {
        let calls = replay_all(&[0x80 | 20, 0x80, 0x81, 0x80, 0x81]).unwrap();
        let [
            ReplayCall::Allocate { handle: a, .. },
            ReplayCall::Release { tag: t, handle: r },
        ] = calls.as_slice()
        else {
            panic!("unexpected calls: {calls:?}");
        };
        assert_eq!(a, r);
        assert_eq!(*t, tag(1));
    }

    #[test]
    fn resize_rebinds_under_new_tag() {
        let mut replayer = Replayer::new(
            &[0x80 | 20, 0x80, 0x81, 0x80 | 64, 0x81, 0x81][..],
            BumpAllocator::new(),
        );
        replayer.step().unwrap();
        let call = replayer.step().unwrap().unwrap();
        let ReplayCall::Resize {
            old_tag,
            new_tag,
            size,
            new_handle,
            ..
        } = call
        else {
            panic!("expected resize, got {call:?}");
        };
        assert_eq!((old_tag, new_tag, size), (tag(1), tag(2), 64));
        assert_eq!(replayer.handle_of(tag(1)), None);
        assert_eq!(replayer.handle_of(tag(2)), Some(new_handle));
    }

    #[test]
    fn truncated_integer_is_unterminated() {
        // size=200 needs two bytes; the stream stops after the first.
        let err = replay_all(&[0x80 | 20, 0x80, 0x81, 0x48]).unwrap_err();
        assert!(matches!(
            err,
            ReplayError::Record {
                record: 2,
                offset: 3,
                source: RecordError::Varint(VarintError::Truncated { consumed: 1 })
            }
        ));
        assert!(err.to_string().contains("unterminated integer"));
    }

    #[test]
    fn old_tag_beyond_high_water_mark_is_fatal() {
        // Release with old field 2 while only tag 1 exists.
        let err = replay_all(&[0x80 | 8, 0x80, 0x81, 0x80, 0x82]).unwrap_err();
        assert!(matches!(
            err,
            ReplayError::Record {
                source: RecordError::OldTagOutOfRange {
                    field: 2,
                    highest: 1
                },
                ..
            }
        ));
    }

    #[test]
    fn allocation_without_new_tag_is_invalid() {
        let err = replay_all(&[0x80 | 8, 0x80, 0x80]).unwrap_err();
        assert!(matches!(
            err,
            ReplayError::InvalidRecord {
                size: 8,
                old_tag_field: 0,
                new_tag_field: Some(0),
                ..
            }
        ));
    }

    #[test]
    fn release_without_old_tag_is_invalid() {
        let err = replay_all(&[0x80, 0x80]).unwrap_err();
        assert!(matches!(err, ReplayError::InvalidRecord { size: 0, .. }));
    }

    #[test]
    fn double_release_is_fatal() {
        // alloc -> 1, alloc -> 2, free 1, free 1 again.
        let err = replay_all(&[
            0x88, 0x80, 0x81, 0x88, 0x80, 0x81, 0x80, 0x82, 0x80, 0x82,
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            ReplayError::Tag {
                record: 4,
                source: TagError::UnknownTag { .. },
                ..
            }
        ));
    }

    #[test]
    fn verbose_trace_lines_follow_summary_form() {
        use std::cell::RefCell;
        use std::rc::Rc;

        #[derive(Clone, Default)]
        struct Shared(Rc<RefCell<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.borrow_mut().write(buf)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let sink = Shared::default();
        let bytes = [0x80 | 20, 0x80, 0x81, 0x80 | 64, 0x81, 0x81, 0x80, 0x81];
        let mut replayer =
            Replayer::new(&bytes[..], NullAllocator::new()).with_trace(Box::new(sink.clone()));
        let stats = replayer.run().unwrap();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.bytes_read, bytes.len() as u64);
        assert_eq!(stats.live_at_end, 0);

        let text = String::from_utf8(sink.0.borrow().clone()).unwrap();
        assert_eq!(
            text,
            "malloc(20) = 1000<1>\nrealloc(1000<1>, 64) = 1010<2>\nfree(1010<2>)\n"
        );
    }
}
