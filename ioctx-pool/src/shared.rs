//! A mutex-guarded [`NodePool`] for the "shared pool" allocation policy —
//! several engine threads drawing operation nodes from one pool instead of
//! each keeping a private one.

use std::ptr::NonNull;
use std::sync::Mutex;

use crate::{NodePool, PoolError, SegmentManager, SystemSegmentManager};

/// Thread-safe handle to a [`NodePool`]. Cheap to construct; expensive pool
/// operations still serialize behind the mutex, so this is meant for the
/// "shared across worker threads" policy, not the hot per-thread path.
pub struct SharedNodePool<S: SegmentManager = SystemSegmentManager> {
    inner: Mutex<NodePool<S>>,
}

impl SharedNodePool<SystemSegmentManager> {
    /// Create a shared pool backed by the global allocator.
    pub fn new(node_size: usize, nodes_per_block: usize, max_free_blocks: usize) -> Self {
        Self {
            inner: Mutex::new(NodePool::new(node_size, nodes_per_block, max_free_blocks)),
        }
    }
}

impl<S: SegmentManager + Send> SharedNodePool<S> {
    /// Wrap an existing pool for cross-thread sharing.
    pub fn from_pool(pool: NodePool<S>) -> Self {
        Self {
            inner: Mutex::new(pool),
        }
    }

    /// See [`NodePool::allocate_node`].
    pub fn allocate_node(&self) -> Result<NonNull<u8>, PoolError> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .allocate_node()
    }

    /// See [`NodePool::deallocate_node`].
    pub fn deallocate_node(&self, node: NonNull<u8>) {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .deallocate_node(node)
    }

    /// See [`NodePool::allocate_nodes`].
    pub fn allocate_nodes(&self, n: usize) -> Result<Vec<NonNull<u8>>, PoolError> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .allocate_nodes(n)
    }

    /// See [`NodePool::deallocate_nodes`].
    pub fn deallocate_nodes(&self, nodes: impl IntoIterator<Item = NonNull<u8>>) {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .deallocate_nodes(nodes)
    }

    /// See [`NodePool::deallocate_free_blocks`].
    pub fn deallocate_free_blocks(&self, limit: usize) {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .deallocate_free_blocks(limit)
    }

    /// See [`NodePool::num_free_nodes`].
    pub fn num_free_nodes(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .num_free_nodes()
    }
}

// SAFETY: nodes handed out by `allocate_node` are plain `NonNull<u8>` into
// pool-owned blocks; moving them across threads to be freed elsewhere is
// sound as long as the freeing thread only ever calls back into this same
// `SharedNodePool`.
unsafe impl<S: SegmentManager + Send> Sync for SharedNodePool<S> {}
