//! # cmtrace-core
//!
//! Compact malloc traces: a streaming encoder that turns textual
//! `call-trace` allocator logs into a dense binary record stream, and a
//! replayer that drives an allocator with that stream.
//!
//! Records are variable-length integers (see [`varint`]) carrying a size and
//! two tag deltas against a running high-water mark (see [`record`]). Tags
//! replace addresses, so a stream is independent of where the producing
//! process happened to place its blocks.

#![deny(unsafe_code)]

pub mod alloc;
pub mod analysis;
pub mod config;
pub mod encoder;
pub mod event;
pub mod record;
pub mod replay;
pub mod summary;
pub mod tag_table;
pub mod varint;

pub use alloc::{AllocError, ReplayAllocator};
pub use config::{AllocatorKind, ReplayConfig};
pub use encoder::{EncodeError, EncodeStats, Encoder, EncoderOutput};
pub use event::{AllocEvent, ParseError, TraceLine};
pub use record::{HighWaterMark, Record, RecordError};
pub use replay::{ReplayCall, ReplayError, ReplayStats, Replayer};
pub use summary::SummaryLine;
pub use tag_table::{Tag, TagError, TagTable};
