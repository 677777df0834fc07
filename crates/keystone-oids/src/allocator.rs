use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use keystone_types::{Oid, OidBlock};
use tracing::trace;

use crate::error::OidResult;
use crate::strategy::OidAllocationStrategy;

/// Sequential draw from a single reserved block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockCursor {
    block: OidBlock,
    next: u64,
}

impl BlockCursor {
    pub fn new(block: OidBlock) -> Self {
        Self {
            next: block.start.value(),
            block,
        }
    }

    pub fn block(&self) -> OidBlock {
        self.block
    }

    /// The next unused oid, or `None` once the block is exhausted.
    pub fn next_oid(&mut self) -> Option<Oid> {
        if self.next >= self.block.end() {
            return None;
        }
        let oid = Oid::new(self.next);
        self.next += 1;
        Some(oid)
    }

    pub fn remaining(&self) -> u64 {
        self.block.end().saturating_sub(self.next)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

#[derive(Default)]
struct AllocatorState {
    /// Reserved blocks not yet handed to anyone.
    free: VecDeque<OidBlock>,
    current: Option<BlockCursor>,
    /// Blocks fully drawn through `next_id`, kept for audit.
    exhausted: Vec<OidBlock>,
}

/// Process-wide oid block cache for one application.
///
/// Transactions take whole blocks via [`OidAllocator::reserve`]; callers that
/// want single ids use [`OidAllocator::next_id`]. Blocks are never returned or
/// reused once handed out.
pub struct OidAllocator {
    strategy: Arc<dyn OidAllocationStrategy>,
    state: Mutex<AllocatorState>,
}

impl OidAllocator {
    pub fn new(strategy: Arc<dyn OidAllocationStrategy>) -> Self {
        Self {
            strategy,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    /// Hand out a block, from the cache if one is available.
    pub fn reserve(&self) -> OidResult<OidBlock> {
        let mut state = self.state.lock().expect("lock poisoned");
        match state.free.pop_front() {
            Some(block) => Ok(block),
            None => self.strategy.reserve_block(),
        }
    }

    /// Reserve `count` blocks ahead of demand.
    pub fn prefetch(&self, count: usize) -> OidResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        for _ in 0..count {
            let block = self.strategy.reserve_block()?;
            state.free.push_back(block);
        }
        trace!(cached = state.free.len(), "prefetched oid blocks");
        Ok(())
    }

    /// Draw the next single oid, reserving a new block when the current one
    /// runs out.
    pub fn next_id(&self) -> OidResult<Oid> {
        let mut state = self.state.lock().expect("lock poisoned");
        loop {
            if let Some(cursor) = state.current.as_mut() {
                if let Some(oid) = cursor.next_oid() {
                    return Ok(oid);
                }
                let spent = cursor.block();
                state.exhausted.push(spent);
                state.current = None;
            }
            let block = match state.free.pop_front() {
                Some(block) => block,
                None => self.strategy.reserve_block()?,
            };
            state.current = Some(BlockCursor::new(block));
        }
    }

    /// Number of reserved blocks waiting in the cache.
    pub fn cached_blocks(&self) -> usize {
        self.state.lock().expect("lock poisoned").free.len()
    }

    /// Blocks fully consumed through [`OidAllocator::next_id`].
    pub fn exhausted_blocks(&self) -> Vec<OidBlock> {
        self.state.lock().expect("lock poisoned").exhausted.clone()
    }
}

impl std::fmt::Debug for OidAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidAllocator")
            .field("cached_blocks", &self.cached_blocks())
            .finish()
    }
}
