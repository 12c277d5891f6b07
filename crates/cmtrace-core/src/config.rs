//! Replay configuration.
//!
//! The allocator is chosen with the `CMTRACE_ALLOCATOR` environment variable:
//! - `libc` (default): the process `malloc`/`realloc`/`free`.
//! - `bump`: pointer bumping inside one arena, capped at
//!   `CMTRACE_BUMP_ARENA_MB` mebibytes (default 1024).
//! - `size-class`: size-class free lists over an offset space.
//! - `null`: synthetic handles only.
//!
//! Command-line flags override both variables.

use crate::alloc::bump::DEFAULT_ARENA_LIMIT;

pub const ALLOCATOR_ENV: &str = "CMTRACE_ALLOCATOR";
pub const BUMP_ARENA_ENV: &str = "CMTRACE_BUMP_ARENA_MB";

const MIB: usize = 1 << 20;

/// Allocator a replay drives.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    #[default]
    Libc,
    Bump,
    SizeClass,
    Null,
}

impl AllocatorKind {
    pub const ALL: [Self; 4] = [Self::Libc, Self::Bump, Self::SizeClass, Self::Null];

    /// Parse from string (case-insensitive). Unknown names fall back to `libc`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "bump" | "arena" => Self::Bump,
            "size-class" | "size_class" | "sizeclass" | "slab" => Self::SizeClass,
            "null" | "none" | "off" => Self::Null,
            _ => Self::Libc,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Libc => "libc",
            Self::Bump => "bump",
            Self::SizeClass => "size-class",
            Self::Null => "null",
        }
    }
}

/// Everything a replay needs besides its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayConfig {
    pub allocator: AllocatorKind,
    /// Arena cap for [`AllocatorKind::Bump`], in bytes.
    pub bump_arena_bytes: usize,
    /// Print every replayed call in summary form.
    pub verbose: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            allocator: AllocatorKind::default(),
            bump_arena_bytes: DEFAULT_ARENA_LIMIT,
            verbose: false,
        }
    }
}

impl ReplayConfig {
    /// Read the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Unset or unparsable values
    /// keep their defaults.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = lookup(ALLOCATOR_ENV) {
            config.allocator = AllocatorKind::from_str_loose(&raw);
        }
        if let Some(bytes) = lookup(BUMP_ARENA_ENV).as_deref().and_then(parse_mebibytes) {
            config.bump_arena_bytes = bytes;
        }
        config
    }
}

/// `"64"` -> 64 MiB in bytes. Zero and overflow are rejected.
#[must_use]
pub fn parse_mebibytes(raw: &str) -> Option<usize> {
    raw.trim()
        .parse::<usize>()
        .ok()
        .filter(|mb| *mb > 0)
        .and_then(|mb| mb.checked_mul(MIB))
}
