//! Shared state for closure construction.

use std::sync::OnceLock;

use crate::arena::ExecArena;
use crate::config::ArenaConfig;
use crate::layout::LayoutCache;

/// The executable arena plus the layout cache that feeds it.
///
/// Closures borrow the context they were built from, so the arena cannot be
/// torn down while any of them is alive. Dropping the context unmaps all
/// executable memory.
#[derive(Debug)]
pub struct ThunkContext {
    arena: ExecArena,
    layouts: LayoutCache,
}

static GLOBAL: OnceLock<ThunkContext> = OnceLock::new();

impl ThunkContext {
    /// Create a context. Executable memory is mapped on first use.
    pub fn new(config: ArenaConfig) -> Self {
        let layouts = LayoutCache::new(config.guard_bytes);
        Self {
            arena: ExecArena::new(config),
            layouts,
        }
    }

    /// The lazily created process-wide context, configured from the environment.
    pub fn global() -> &'static ThunkContext {
        GLOBAL.get_or_init(|| ThunkContext::new(ArenaConfig::from_env()))
    }

    /// Backing arena.
    #[inline]
    pub fn arena(&self) -> &ExecArena {
        &self.arena
    }

    /// Layout cache.
    #[inline]
    pub fn layouts(&self) -> &LayoutCache {
        &self.layouts
    }
}

impl Default for ThunkContext {
    fn default() -> Self {
        Self::new(ArenaConfig::default())
    }
}
