//! Scratch arenas - explicit per-call working buffers
//!
//! Design: Delegated numeric routines need large temporary buffers. Those
//! are acquired as scoped arenas owned by the call site and released when
//! the guard drops, never shared across calls:
//! 1. Bump allocation inside one arena (fast path)
//! 2. Pool reuse of retired arena blocks (amortized cost)

#[cfg(test)]
mod tests;

use crate::logging::trace;

const DEFAULT_BLOCK_DOUBLES: usize = 4 * 1024;

/// Reusable block pool backing scratch arenas
///
/// The pool itself is plain data; callers hold it per execution context.
/// Acquiring an arena moves a block out of the pool; dropping the arena
/// returns it.
pub struct ScratchPool {
    free: Vec<Vec<f64>>,
    acquired: usize,
}

impl ScratchPool {
    pub const fn new() -> Self {
        Self {
            free: Vec::new(),
            acquired: 0,
        }
    }

    /// Acquire an arena with room for at least `min_doubles` elements
    pub fn acquire(&mut self, min_doubles: usize) -> ScratchArena {
        let want = min_doubles.max(DEFAULT_BLOCK_DOUBLES);
        let block = match self.free.iter().position(|b| b.capacity() >= want) {
            Some(pos) => self.free.swap_remove(pos),
            None => Vec::with_capacity(want),
        };
        self.acquired += 1;
        trace!(event = "scratch_acquire", capacity = block.capacity());
        ScratchArena {
            block,
            used: 0,
        }
    }

    /// Return a retired block for reuse
    pub fn release(&mut self, mut arena: ScratchArena) {
        arena.block.clear();
        self.free.push(std::mem::take(&mut arena.block));
        self.acquired = self.acquired.saturating_sub(1);
    }

    /// Arenas currently handed out
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.acquired
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new()
    }
}

/// One scoped scratch buffer
///
/// Slices handed out by `alloc` stay valid for the arena's lifetime; the
/// whole buffer is reclaimed at once when the arena is dropped or released
/// back to its pool.
pub struct ScratchArena {
    block: Vec<f64>,
    used: usize,
}

impl ScratchArena {
    /// Carve a zero-initialized slice of `len` doubles off the arena
    pub fn alloc(&mut self, len: usize) -> &mut [f64] {
        let start = self.used;
        let end = start + len;
        if self.block.len() < end {
            self.block.resize(end, 0.0);
        }
        self.used = end;
        &mut self.block[start..end]
    }

    /// Elements carved so far
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total capacity without reallocation
    #[inline]
    pub fn capacity(&self) -> usize {
        self.block.capacity()
    }
}
