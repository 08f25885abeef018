//! The adaptive node pool: a small-object allocator that hands out
//! fixed-size "nodes" carved out of large aligned "blocks", themselves
//! subdivided into "subblocks".
//!
//! Ported from Boost.Interprocess's `adaptive_node_pool_impl` (see
//! `examples/original_source/external/common/include/boost/interprocess/allocators/detail/adaptive_node_pool.hpp`
//! in the retrieval pack this crate was built from). The three properties
//! that make this pool worth its complexity over a plain free-list are
//! unchanged from the original:
//!
//! - **O(1) pointer → block recovery.** Every block is aligned to a power
//!   of two large enough to bound its overhead; clearing a node pointer's
//!   low bits finds the subblock, and a stored offset there finds the
//!   block header.
//! - **Trimming order.** Blocks are kept in order of ascending free-node
//!   count, address breaking ties, so fully-free blocks collect at the
//!   high-address end of that order — the ones [`NodePool::deallocate_free_blocks`]
//!   returns to the segment manager first.
//! - **Bounded residency.** The pool never holds more than `max_free_blocks`
//!   fully-free blocks; deallocating past that threshold trims immediately.

mod segment;
mod shared;

use std::collections::BTreeSet;
use std::ptr::NonNull;

pub use segment::{SegmentManager, SystemSegmentManager};
pub use shared::SharedNodePool;

/// Errors raised by [`NodePool`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The segment manager failed to supply a new block.
    #[error("out of memory: segment manager could not supply a new block")]
    NoMemory,
}

type PoolResult<T> = Result<T, PoolError>;

/// Written at the start of every non-header subblock. Records, as a byte
/// distance, where the block's single [`BlockHeader`] lives.
#[repr(C)]
struct HdrOffsetHolder {
    hdr_offset: usize,
}

/// The block's single header, living at the start of its last subblock.
/// Its own `hdr_offset` is always `0` — reading a node's containing
/// subblock as a `HdrOffsetHolder` and following `hdr_offset` bytes forward
/// always lands here, including when the subblock already *is* the header
/// subblock.
#[repr(C)]
struct BlockHeader {
    hdr_offset: usize,
    free_head: Option<NonNull<FreeNode>>,
    free_count: usize,
}

/// An intrusive singly linked free list node: the free cells of a block
/// double as the links of that block's free list.
#[repr(C)]
struct FreeNode {
    next: Option<NonNull<FreeNode>>,
}

/// Ordering key for the block multiset: first by free-node count
/// ascending, then by address ascending, so fully-free, high-address
/// blocks sort last and are the first candidates for trimming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct BlockKey {
    free_count: usize,
    addr: usize,
}

impl BlockKey {
    fn header(self) -> NonNull<BlockHeader> {
        // SAFETY: `addr` always comes from a live block header previously
        // written by `NodePool::alloc_block`.
        unsafe { NonNull::new_unchecked(self.addr as *mut BlockHeader) }
    }
}

const MAX_ALIGN: usize = std::mem::align_of::<FreeNode>();

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

fn hdr_size() -> usize {
    round_up(std::mem::size_of::<BlockHeader>(), MAX_ALIGN)
}

fn hdr_offset_size() -> usize {
    round_up(std::mem::size_of::<HdrOffsetHolder>(), MAX_ALIGN)
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}

fn upper_power_of_2(mut n: usize) -> usize {
    if n <= 1 {
        return 1;
    }
    n -= 1;
    let mut shift = 1;
    while shift < usize::BITS as usize {
        n |= n >> shift;
        shift <<= 1;
    }
    n + 1
}

/// Smallest power-of-two block alignment such that per-block overhead stays
/// below `overhead_percent`. Mirrors `calculate_alignment` in the original.
fn calculate_alignment(overhead_percent: usize, real_node_size: usize) -> usize {
    let hdr_offset_size = hdr_offset_size();
    let divisor = overhead_percent.max(1) * real_node_size;
    let dividend = hdr_offset_size * 100;
    let elements_per_subblock = (dividend - 1) / divisor + 1;
    let mut candidate = upper_power_of_2(elements_per_subblock * real_node_size + hdr_offset_size);
    let max_subblock_overhead = hdr_size();
    loop {
        let elements_per_subblock = (candidate - max_subblock_overhead) / real_node_size;
        let overhead_size = candidate - elements_per_subblock * real_node_size;
        if overhead_size * 100 / candidate < overhead_percent {
            return candidate;
        }
        candidate <<= 1;
    }
}

/// Derives `num_subblocks` and `real_num_node` for a given block alignment.
/// Mirrors `calculate_num_subblocks` in the original.
fn calculate_num_subblocks(
    alignment: usize,
    real_node_size: usize,
    elements_per_block: usize,
    overhead_percent: usize,
) -> (usize, usize) {
    let hdr_offset_size = hdr_offset_size();
    let elements_per_subblock = (alignment - hdr_offset_size) / real_node_size;
    let mut possible_num_subblock = (elements_per_block - 1) / elements_per_subblock + 1;
    let hdr_subblock_elements = (alignment - hdr_size()) / real_node_size;

    while (possible_num_subblock - 1) * elements_per_subblock + hdr_subblock_elements
        < elements_per_block
    {
        possible_num_subblock += 1;
    }

    loop {
        let total_data = (elements_per_subblock * (possible_num_subblock - 1)
            + hdr_subblock_elements)
            * real_node_size;
        let total_size = alignment * possible_num_subblock;
        if (total_size - total_data) * 100 / total_size < overhead_percent {
            break;
        }
        possible_num_subblock += 1;
    }

    let num_subblocks = possible_num_subblock;
    let real_num_node = (possible_num_subblock - 1) * elements_per_subblock + hdr_subblock_elements;
    (num_subblocks, real_num_node)
}

/// A single-threaded fixed-size node allocator. See the module docs.
pub struct NodePool<S: SegmentManager = SystemSegmentManager> {
    segment: S,
    max_free_blocks: usize,
    real_node_size: usize,
    block_alignment: usize,
    num_subblocks: usize,
    real_num_nodes: usize,
    blocks: BTreeSet<BlockKey>,
    totally_free_blocks: usize,
}

impl NodePool<SystemSegmentManager> {
    /// Create a pool backed by the global allocator.
    pub fn new(node_size: usize, nodes_per_block: usize, max_free_blocks: usize) -> Self {
        Self::with_overhead(
            SystemSegmentManager,
            node_size,
            nodes_per_block,
            max_free_blocks,
            5,
        )
    }
}

impl<S: SegmentManager> NodePool<S> {
    /// Create a pool with an explicit segment manager and overhead budget
    /// (`overhead_percent` in `1..100`, the fraction of a block that may be
    /// alignment padding rather than usable nodes).
    pub fn with_overhead(
        segment: S,
        node_size: usize,
        nodes_per_block: usize,
        max_free_blocks: usize,
        overhead_percent: usize,
    ) -> Self {
        assert!(node_size > 0, "node_size must be non-zero");
        assert!(nodes_per_block > 0, "nodes_per_block must be non-zero");
        assert!(
            (1..100).contains(&overhead_percent),
            "overhead_percent must be in 1..100"
        );

        let real_node_size = lcm(node_size, MAX_ALIGN);
        let block_alignment = calculate_alignment(overhead_percent, real_node_size);
        let (num_subblocks, real_num_nodes) = calculate_num_subblocks(
            block_alignment,
            real_node_size,
            nodes_per_block,
            overhead_percent,
        );

        Self {
            segment,
            max_free_blocks,
            real_node_size,
            block_alignment,
            num_subblocks,
            real_num_nodes,
            blocks: BTreeSet::new(),
            totally_free_blocks: 0,
        }
    }

    /// The real per-block node count after geometry rounding; may exceed
    /// the requested `nodes_per_block`.
    pub fn real_num_nodes(&self) -> usize {
        self.real_num_nodes
    }

    /// The block alignment (and size) chosen to respect the overhead budget.
    pub fn block_alignment(&self) -> usize {
        self.block_alignment
    }

    /// Number of blocks presently owned by the pool (free or partially used).
    pub fn blocks_in_pool(&self) -> usize {
        // Fully used blocks (free_count == 0) aren't tracked in `blocks`,
        // so this undercounts by that amount; exposed for tests only via
        // `num_free_nodes` + `totally_free_blocks`, which are exact.
        self.blocks.len()
    }

    /// Sum of free nodes across every block currently tracked by the pool.
    pub fn num_free_nodes(&self) -> usize {
        self.blocks.iter().map(|k| k.free_count).sum()
    }

    /// Number of fully-free blocks the pool is currently holding onto.
    pub fn totally_free_blocks(&self) -> usize {
        self.totally_free_blocks
    }

    /// Allocate one node. Allocates a new block if the pool is empty.
    pub fn allocate_node(&mut self) -> PoolResult<NonNull<u8>> {
        self.check_invariants();
        if self.blocks.is_empty() {
            self.alloc_blocks(1)?;
        }
        let node = self.take_first_node();
        self.check_invariants();
        Ok(node)
    }

    /// Return a node to its owning block. Trims if the resident fully-free
    /// block count now exceeds `max_free_blocks`.
    pub fn deallocate_node(&mut self, node: NonNull<u8>) {
        self.reinsert_node(node);
        if self.totally_free_blocks > self.max_free_blocks {
            self.deallocate_free_blocks(self.max_free_blocks);
        }
        self.check_invariants();
    }

    /// Allocate `n` nodes as a chain. On failure partway through, the
    /// partial chain already taken is returned to the pool before the
    /// error propagates (never leaks nodes).
    pub fn allocate_nodes(&mut self, n: usize) -> PoolResult<Vec<NonNull<u8>>> {
        let mut chain = Vec::with_capacity(n);
        for _ in 0..n {
            match self.allocate_node() {
                Ok(node) => chain.push(node),
                Err(e) => {
                    self.deallocate_nodes(chain);
                    return Err(e);
                }
            }
        }
        Ok(chain)
    }

    /// Return a chain of nodes previously obtained from [`Self::allocate_nodes`]
    /// (or any combination of single allocations).
    pub fn deallocate_nodes(&mut self, nodes: impl IntoIterator<Item = NonNull<u8>>) {
        for node in nodes {
            self.deallocate_node(node);
        }
    }

    /// Trim resident fully-free blocks down to `limit`, highest address
    /// first, returning each to the segment manager.
    pub fn deallocate_free_blocks(&mut self, limit: usize) {
        self.check_invariants();
        while self.totally_free_blocks > limit {
            let key = *self
                .blocks
                .iter()
                .next_back()
                .expect("totally_free_blocks > 0 implies a tracked fully-free block exists");
            debug_assert_eq!(key.free_count, self.real_num_nodes);
            self.blocks.remove(&key);
            self.totally_free_blocks -= 1;
            // SAFETY: `key` came from `self.blocks`, which only ever holds
            // addresses of blocks this pool allocated and has not yet freed.
            unsafe {
                self.free_block(key.header());
            }
        }
    }

    /// Swap the internal state of two pools with identical geometry. Used
    /// to hand an entire pool's resident blocks to another owner without
    /// reallocating.
    pub fn swap(&mut self, other: &mut Self) {
        debug_assert_eq!(self.max_free_blocks, other.max_free_blocks);
        debug_assert_eq!(self.real_node_size, other.real_node_size);
        debug_assert_eq!(self.block_alignment, other.block_alignment);
        debug_assert_eq!(self.real_num_nodes, other.real_num_nodes);
        std::mem::swap(&mut self.blocks, &mut other.blocks);
        std::mem::swap(&mut self.totally_free_blocks, &mut other.totally_free_blocks);
    }

    fn take_first_node(&mut self) -> NonNull<u8> {
        let key = *self.blocks.iter().next().expect("block just allocated");
        self.blocks.remove(&key);
        // SAFETY: key comes from a live block this pool owns.
        let mut header = key.header();
        let header_mut = unsafe { header.as_mut() };
        let node = header_mut.free_head.expect("free_count > 0 implies a free node");
        // SAFETY: node is a live free-list entry of this block.
        header_mut.free_head = unsafe { node.as_ref().next };
        header_mut.free_count -= 1;

        if key.free_count == self.real_num_nodes {
            self.totally_free_blocks -= 1;
        }
        if header_mut.free_count > 0 {
            self.blocks.insert(BlockKey {
                free_count: header_mut.free_count,
                addr: key.addr,
            });
        }
        node.cast()
    }

    fn reinsert_node(&mut self, node: NonNull<u8>) {
        // SAFETY: node was handed out by this pool's `allocate_node`.
        let mut header = unsafe { self.block_header_from_node(node) };
        let header_mut = unsafe { header.as_mut() };
        debug_assert!(header_mut.free_count < self.real_num_nodes);

        if header_mut.free_count > 0 {
            self.blocks.remove(&BlockKey {
                free_count: header_mut.free_count,
                addr: header.as_ptr() as usize,
            });
        }

        let mut free_node = node.cast::<FreeNode>();
        // SAFETY: node is `real_node_size` bytes, large enough for a FreeNode.
        unsafe {
            free_node.as_mut().next = header_mut.free_head;
        }
        header_mut.free_head = Some(free_node);
        header_mut.free_count += 1;

        self.blocks.insert(BlockKey {
            free_count: header_mut.free_count,
            addr: header.as_ptr() as usize,
        });

        if header_mut.free_count == self.real_num_nodes {
            self.totally_free_blocks += 1;
        }
    }

    unsafe fn block_header_from_node(&self, node: NonNull<u8>) -> NonNull<BlockHeader> {
        let subblock_start = (node.as_ptr() as usize) & !(self.block_alignment - 1);
        let holder = subblock_start as *const HdrOffsetHolder;
        let hdr_offset = (*holder).hdr_offset;
        NonNull::new_unchecked((subblock_start + hdr_offset) as *mut BlockHeader)
    }

    fn alloc_blocks(&mut self, n: usize) -> PoolResult<()> {
        for _ in 0..n {
            self.alloc_block()?;
        }
        Ok(())
    }

    fn alloc_block(&mut self) -> PoolResult<()> {
        let real_block_size = self.block_alignment * self.num_subblocks;
        let base = self
            .segment
            .allocate_aligned(real_block_size, self.block_alignment)
            .ok_or(PoolError::NoMemory)?;

        let hdr_offset_size = hdr_offset_size();
        let hdr_size = hdr_size();
        let elements_per_subblock = (self.block_alignment - hdr_offset_size) / self.real_node_size;
        let hdr_subblock_elements = (self.block_alignment - hdr_size) / self.real_node_size;

        let hdr_addr = base.as_ptr() as usize + self.block_alignment * (self.num_subblocks - 1);
        // SAFETY: `hdr_addr` is within the freshly allocated, block-aligned
        // region and large enough for a `BlockHeader`.
        unsafe {
            (hdr_addr as *mut BlockHeader).write(BlockHeader {
                hdr_offset: 0,
                free_head: None,
                free_count: 0,
            });
        }
        let mut free_head: Option<NonNull<FreeNode>> = None;
        let mut free_count = 0usize;

        for subblock in 0..self.num_subblocks - 1 {
            let subblock_addr = base.as_ptr() as usize + self.block_alignment * subblock;
            // SAFETY: within the allocated block.
            unsafe {
                (subblock_addr as *mut HdrOffsetHolder).write(HdrOffsetHolder {
                    hdr_offset: hdr_addr - subblock_addr,
                });
            }
            let mut node_addr = subblock_addr + hdr_offset_size;
            for _ in 0..elements_per_subblock {
                // SAFETY: each node slot is within the allocated block and
                // untouched until now.
                unsafe {
                    (node_addr as *mut FreeNode).write(FreeNode { next: free_head });
                }
                free_head = NonNull::new(node_addr as *mut FreeNode);
                free_count += 1;
                node_addr += self.real_node_size;
            }
        }
        {
            let mut node_addr = hdr_addr + hdr_size;
            for _ in 0..hdr_subblock_elements {
                // SAFETY: within the header subblock, past the header itself.
                unsafe {
                    (node_addr as *mut FreeNode).write(FreeNode { next: free_head });
                }
                free_head = NonNull::new(node_addr as *mut FreeNode);
                free_count += 1;
                node_addr += self.real_node_size;
            }
        }

        debug_assert_eq!(free_count, self.real_num_nodes);
        // SAFETY: header was just written above.
        unsafe {
            let header = &mut *(hdr_addr as *mut BlockHeader);
            header.free_head = free_head;
            header.free_count = free_count;
        }

        self.blocks.insert(BlockKey {
            free_count,
            addr: hdr_addr,
        });
        self.totally_free_blocks += 1;
        Ok(())
    }

    /// # Safety
    /// `header` must point at a block header this pool owns with
    /// `free_count == real_num_nodes` (fully free), and must not be used
    /// again afterward.
    unsafe fn free_block(&self, header: NonNull<BlockHeader>) {
        let first_subblock_addr =
            header.as_ptr() as usize - self.block_alignment * (self.num_subblocks - 1);
        let real_block_size = self.block_alignment * self.num_subblocks;
        self.segment.deallocate(
            NonNull::new_unchecked(first_subblock_addr as *mut u8),
            real_block_size,
            self.block_alignment,
        );
    }

    #[cfg(debug_assertions)]
    fn check_invariants(&self) {
        let mut prev_free_count = None;
        let mut total_free = 0usize;
        let mut totally_free = 0usize;
        for key in self.blocks.iter() {
            if let Some(prev) = prev_free_count {
                debug_assert!(prev <= key.free_count, "block multiset must be non-decreasing");
            }
            prev_free_count = Some(key.free_count);
            total_free += key.free_count;
            if key.free_count == self.real_num_nodes {
                totally_free += 1;
            }
        }
        debug_assert!(total_free >= self.totally_free_blocks * self.real_num_nodes);
        debug_assert_eq!(totally_free, self.totally_free_blocks);
    }

    #[cfg(not(debug_assertions))]
    fn check_invariants(&self) {}
}

impl<S: SegmentManager> Drop for NodePool<S> {
    fn drop(&mut self) {
        let keys: Vec<BlockKey> = self.blocks.iter().copied().collect();
        for key in keys {
            // SAFETY: every tracked block was allocated by this pool and is
            // being dropped exactly once, here.
            unsafe {
                self.free_block(key.header());
            }
        }
        self.blocks.clear();
        self.totally_free_blocks = 0;
    }
}

// The pool owns raw pointers into blocks it allocated itself; there is no
// thread-confined state beyond that, so moving the whole pool across
// threads is sound. Concurrent access from multiple threads is not — see
// `SharedNodePool`.
unsafe impl<S: SegmentManager + Send> Send for NodePool<S> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_node_roundtrip_never_grows_past_one_block() {
        let mut pool = NodePool::new(32, 8, 1);
        for _ in 0..1000 {
            let node = pool.allocate_node().unwrap();
            pool.deallocate_node(node);
        }
        assert_eq!(pool.blocks_in_pool(), 1);
    }

    #[test]
    fn pool_trim_returns_one_block_on_exact_split() {
        let mut pool = NodePool::new(16, 64, 1);
        let real_num_nodes = pool.real_num_nodes();

        let nodes = pool.allocate_nodes(2 * real_num_nodes).unwrap();
        assert_eq!(pool.num_free_nodes(), 0);

        pool.deallocate_nodes(nodes);

        assert_eq!(pool.num_free_nodes(), real_num_nodes);
        assert_eq!(pool.totally_free_blocks(), 1);
    }

    #[test]
    fn num_free_nodes_plus_allocated_equals_capacity() {
        let mut pool = NodePool::new(24, 10, 4);
        let real_num_nodes = pool.real_num_nodes();
        let mut allocated = Vec::new();
        for _ in 0..(real_num_nodes + 3) {
            allocated.push(pool.allocate_node().unwrap());
        }
        let blocks_in_pool = 2; // exactly enough to need a second block
        let total_capacity = real_num_nodes * blocks_in_pool;
        assert_eq!(pool.num_free_nodes() + allocated.len(), total_capacity);
        pool.deallocate_nodes(allocated);
    }

    #[test]
    fn deallocate_free_blocks_respects_limit() {
        let mut pool = NodePool::new(16, 32, 8);
        let real_num_nodes = pool.real_num_nodes();
        let nodes = pool.allocate_nodes(3 * real_num_nodes).unwrap();
        pool.deallocate_nodes(nodes);
        assert!(pool.totally_free_blocks() <= 8);
        pool.deallocate_free_blocks(0);
        assert_eq!(pool.totally_free_blocks(), 0);
        assert_eq!(pool.num_free_nodes(), 0);
    }

    #[test]
    fn allocate_nodes_failure_returns_partial_chain() {
        struct FailingAfter {
            inner: SystemSegmentManager,
            remaining: std::cell::Cell<usize>,
        }
        unsafe impl SegmentManager for FailingAfter {
            fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
                if self.remaining.get() == 0 {
                    return None;
                }
                self.remaining.set(self.remaining.get() - 1);
                self.inner.allocate_aligned(size, align)
            }
            unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize) {
                self.inner.deallocate(ptr, size, align)
            }
        }

        let segment = FailingAfter {
            inner: SystemSegmentManager,
            remaining: std::cell::Cell::new(1),
        };
        let mut pool = NodePool::with_overhead(segment, 16, 4, 1, 5);
        let real_num_nodes = pool.real_num_nodes();
        let err = pool.allocate_nodes(real_num_nodes + 1);
        assert!(err.is_err());
        // The one block that was allocated must have been fully returned,
        // not leaked as partially-allocated nodes.
        assert_eq!(pool.num_free_nodes(), real_num_nodes);
    }
}
