//! Bidirectional handle <-> tag mapping.
//!
//! The encoder keys the table by the addresses found in the producer trace,
//! the replayer by the handles returned from the allocator under test. Both
//! sides hand out tags in the same strictly increasing order, which is what
//! lets the wire format refer to allocations by small deltas.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroU32;

use thiserror::Error;

use crate::varint::MAX_VALUE;

/// Synthetic identifier for one live allocation.
///
/// Tag `0` means "absent" on the wire and is represented as `Option::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(NonZeroU32);

impl Tag {
    /// The first tag handed out in a session.
    pub const FIRST: Tag = Tag(NonZeroU32::MIN);

    /// Build a tag from its raw value; `None` for `0`.
    #[must_use]
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagError {
    #[error("already have {handle} as tag {tag}")]
    DuplicateHandle { handle: String, tag: Tag },
    #[error("tag {tag} is already bound to {handle}")]
    DuplicateTag { tag: Tag, handle: String },
    #[error("no tag for {handle}")]
    UnknownHandle { handle: String },
    #[error("no handle for tag {tag}")]
    UnknownTag { tag: Tag },
    #[error("tag {tag} does not exceed highest assigned tag {highest}")]
    NotMonotonic { tag: Tag, highest: u32 },
    #[error("tag space exhausted after {highest}")]
    Exhausted { highest: u32 },
}

/// Live handle <-> tag bijection plus the session high-water mark.
#[derive(Debug, Clone)]
pub struct TagTable<H> {
    by_handle: HashMap<H, Tag>,
    by_tag: HashMap<Tag, H>,
    highest: u32,
}

impl<H> TagTable<H>
where
    H: Copy + Eq + Hash + fmt::LowerHex,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_handle: HashMap::new(),
            by_tag: HashMap::new(),
            highest: 0,
        }
    }

    /// Greatest tag handed out so far (`0` before the first assignment).
    #[must_use]
    pub fn highest_assigned(&self) -> u32 {
        self.highest
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    #[must_use]
    pub fn tag_of(&self, handle: H) -> Option<Tag> {
        self.by_handle.get(&handle).copied()
    }

    #[must_use]
    pub fn handle_of(&self, tag: Tag) -> Option<H> {
        self.by_tag.get(&tag).copied()
    }

    /// Assign the next tag to `handle`.
    pub fn assign(&mut self, handle: H) -> Result<Tag, TagError> {
        let next = self
            .highest
            .checked_add(1)
            .filter(|next| *next <= MAX_VALUE)
            .and_then(Tag::new)
            .ok_or(TagError::Exhausted {
                highest: self.highest,
            })?;
        self.register(next, handle)?;
        Ok(next)
    }

    /// Bind `handle` under an explicitly chosen `tag`.
    ///
    /// The tag must exceed every tag seen before and neither side of the
    /// pair may already be live.
    pub fn register(&mut self, tag: Tag, handle: H) -> Result<(), TagError> {
        if tag.get() <= self.highest {
            if let Some(bound) = self.by_tag.get(&tag) {
                return Err(TagError::DuplicateTag {
                    tag,
                    handle: format!("{bound:x}"),
                });
            }
            return Err(TagError::NotMonotonic {
                tag,
                highest: self.highest,
            });
        }
        if let Some(existing) = self.by_handle.get(&handle) {
            return Err(TagError::DuplicateHandle {
                handle: format!("{handle:x}"),
                tag: *existing,
            });
        }

        self.by_handle.insert(handle, tag);
        self.by_tag.insert(tag, handle);
        self.highest = tag.get();
        Ok(())
    }

    /// Remove the entry for `handle`, returning its tag.
    pub fn release_handle(&mut self, handle: H) -> Result<Tag, TagError> {
        let tag = self
            .by_handle
            .remove(&handle)
            .ok_or_else(|| TagError::UnknownHandle {
                handle: format!("{handle:x}"),
            })?;
        self.by_tag.remove(&tag);
        Ok(tag)
    }

    /// Remove the entry for `tag`, returning its handle.
    pub fn release_tag(&mut self, tag: Tag) -> Result<H, TagError> {
        let handle = self
            .by_tag
            .remove(&tag)
            .ok_or(TagError::UnknownTag { tag })?;
        self.by_handle.remove(&handle);
        Ok(handle)
    }

    /// Live entries ordered by tag.
    #[must_use]
    pub fn live(&self) -> Vec<(Tag, H)> {
        let mut out: Vec<(Tag, H)> = self.by_tag.iter().map(|(t, h)| (*t, *h)).collect();
        out.sort_by_key(|(tag, _)| *tag);
        out
    }
}

impl<H> Default for TagTable<H>
where
    H: Copy + Eq + Hash + fmt::LowerHex,
{
    fn default() -> Self {
        Self::new()
    }
}
