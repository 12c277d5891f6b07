//! Wire records and the tag delta scheme.
//!
//! A record is `size`, the old-tag field and, only when `size != 0`, the
//! new-tag field. Both tag fields are deltas against the session
//! high-water mark `H`: the old tag is sent as `(H + 1) - old` and the new
//! tag as `new - H`, so recently assigned tags stay in one byte.

use std::io::{Read, Write};

use thiserror::Error;

use crate::tag_table::Tag;
use crate::varint::{self, VarintError};

/// One decoded (or to-be-encoded) record, fields as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub size: u32,
    pub old_tag_field: u32,
    /// Present iff `size != 0`.
    pub new_tag_field: Option<u32>,
}

impl Record {
    /// Write the record, returning the number of bytes produced.
    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> Result<usize, VarintError> {
        let mut written = varint::write(out, u64::from(self.size))?;
        written += varint::write(out, u64::from(self.old_tag_field))?;
        if self.size != 0 {
            written += varint::write(out, u64::from(self.new_tag_field.unwrap_or(0)))?;
        }
        Ok(written)
    }

    /// Read the next record.
    ///
    /// `Ok(None)` means the stream ended cleanly on a record boundary.
    pub fn read_from<R: Read + ?Sized>(input: &mut R) -> Result<Option<(Self, usize)>, RecordError> {
        let Some((size, mut consumed)) = varint::read(input)? else {
            return Ok(None);
        };
        let (old_tag_field, n) = varint::read(input)?.ok_or(RecordError::Truncated {
            field: "old tag",
        })?;
        consumed += n;
        let new_tag_field = if size != 0 {
            let (field, n) = varint::read(input)?.ok_or(RecordError::Truncated {
                field: "new tag",
            })?;
            consumed += n;
            Some(field)
        } else {
            None
        };
        Ok(Some((
            Self {
                size,
                old_tag_field,
                new_tag_field,
            },
            consumed,
        )))
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Varint(#[from] VarintError),
    #[error("stream ended before the {field} field")]
    Truncated { field: &'static str },
    #[error("old tag {old} is not below the high-water mark {highest}")]
    OldTagAhead { old: Tag, highest: u32 },
    #[error("old tag field {field} out of range for high-water mark {highest}")]
    OldTagOutOfRange { field: u32, highest: u32 },
    #[error("new tag {new} does not exceed the high-water mark {highest}")]
    NewTagBehind { new: Tag, highest: u32 },
    #[error("new tag field {field} overflows the tag space at high-water mark {highest}")]
    NewTagOverflow { field: u32, highest: u32 },
}

/// Session high-water mark shared by the encode and decode directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HighWaterMark {
    highest: u32,
}

impl HighWaterMark {
    #[must_use]
    pub const fn new() -> Self {
        Self { highest: 0 }
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.highest
    }

    /// Old-tag field for an outgoing record.
    pub fn old_field(self, old: Option<Tag>) -> Result<u32, RecordError> {
        match old {
            None => Ok(0),
            Some(old) if old.get() <= self.highest => Ok(self.highest + 1 - old.get()),
            Some(old) => Err(RecordError::OldTagAhead {
                old,
                highest: self.highest,
            }),
        }
    }

    /// New-tag field for an outgoing record; advances the mark.
    pub fn new_field(&mut self, new: Option<Tag>) -> Result<u32, RecordError> {
        match new {
            None => Ok(0),
            Some(new) if new.get() > self.highest => {
                let field = new.get() - self.highest;
                self.highest = new.get();
                Ok(field)
            }
            Some(new) => Err(RecordError::NewTagBehind {
                new,
                highest: self.highest,
            }),
        }
    }

    /// Resolve an incoming old-tag field.
    pub fn resolve_old(self, field: u32) -> Result<Option<Tag>, RecordError> {
        if field == 0 {
            return Ok(None);
        }
        if field > self.highest {
            return Err(RecordError::OldTagOutOfRange {
                field,
                highest: self.highest,
            });
        }
        Ok(Tag::new(self.highest + 1 - field))
    }

    /// Resolve an incoming new-tag field; advances the mark.
    pub fn resolve_new(&mut self, field: u32) -> Result<Option<Tag>, RecordError> {
        if field == 0 {
            return Ok(None);
        }
        let raw = self
            .highest
            .checked_add(field)
            .filter(|raw| *raw <= varint::MAX_VALUE)
            .ok_or(RecordError::NewTagOverflow {
                field,
                highest: self.highest,
            })?;
        self.highest = raw;
        Ok(Tag::new(raw))
    }
}
