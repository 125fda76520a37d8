//! Arena configuration resolved once at context construction.
//!
//! Settings come from code defaults, optionally overridden by environment
//! variables through [`ArenaConfig::from_env`]. The arena never re-reads
//! them after it is built.

use std::env;

/// Environment variable overriding [`ArenaConfig::chunk_pages`].
pub const ENV_CHUNK_PAGES: &str = "PRISM_THUNK_CHUNK_PAGES";

/// Environment variable overriding [`ArenaConfig::max_chunks`].
pub const ENV_MAX_CHUNKS: &str = "PRISM_THUNK_MAX_CHUNKS";

/// Configuration for the executable memory arena and emitted layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Pages reserved per backing chunk.
    pub chunk_pages: usize,

    /// Upper bound on backing chunks; `None` grows until the OS refuses.
    pub max_chunks: Option<usize>,

    /// Minimum INT3 bytes appended after each trampoline.
    pub guard_bytes: usize,
}

impl ArenaConfig {
    /// Default pages per chunk (64 KiB with 4 KiB pages).
    pub const DEFAULT_CHUNK_PAGES: usize = 16;

    /// Default trap padding after a trampoline.
    pub const DEFAULT_GUARD_BYTES: usize = 8;

    /// Small chunks and a tight cap, so tests hit growth and exhaustion quickly.
    pub fn for_testing() -> Self {
        Self {
            chunk_pages: 2,
            max_chunks: Some(64),
            guard_bytes: Self::DEFAULT_GUARD_BYTES,
        }
    }

    /// Defaults overridden by `PRISM_THUNK_*` environment variables.
    ///
    /// Unparseable or zero values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(pages) = Self::env_usize(ENV_CHUNK_PAGES) {
            config.chunk_pages = pages;
        }
        if let Some(chunks) = Self::env_usize(ENV_MAX_CHUNKS) {
            config.max_chunks = Some(chunks);
        }
        config
    }

    /// Set pages per chunk (clamped to at least one).
    pub fn with_chunk_pages(mut self, pages: usize) -> Self {
        self.chunk_pages = pages.max(1);
        self
    }

    /// Cap the number of backing chunks.
    pub fn with_max_chunks(mut self, chunks: usize) -> Self {
        self.max_chunks = Some(chunks.max(1));
        self
    }

    /// Set the minimum trap padding.
    pub fn with_guard_bytes(mut self, bytes: usize) -> Self {
        self.guard_bytes = bytes;
        self
    }

    fn env_usize(name: &str) -> Option<usize> {
        Self::parse_count(&env::var(name).ok()?)
    }

    fn parse_count(raw: &str) -> Option<usize> {
        raw.trim().parse::<usize>().ok().filter(|&n| n > 0)
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            chunk_pages: Self::DEFAULT_CHUNK_PAGES,
            max_chunks: None,
            guard_bytes: Self::DEFAULT_GUARD_BYTES,
        }
    }
}
