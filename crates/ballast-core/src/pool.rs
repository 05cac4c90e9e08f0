//! Pool - min-heap of workers keyed by pending load.
//!
//! The heap stores worker ids; the workers themselves live in a fixed arena
//! indexed by id. Every member records its own position in the heap so a
//! worker whose load changed can be pulled out of the middle in O(log n).
//!
//! # Invariants
//! - heap order: `load(parent(i)) <= load(i)` for every non-root position `i`
//! - index consistency: `heap[members[w].heap_index] == w` for every member in
//!   the heap, and members outside the heap carry no index

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable worker identifier, assigned at construction and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn new(n: usize) -> Self {
        Self(n)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Anything the pool can order by load.
pub trait Loaded {
    /// Current load (pending task count for a worker).
    fn load(&self) -> usize;

    /// Position in the pool's backing array, `None` while outside the heap.
    fn heap_index(&self) -> Option<usize>;

    fn set_heap_index(&mut self, index: Option<usize>);
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("heap order violated: {parent} (load {parent_load}) sits above {child} (load {child_load})")]
    OrderViolated {
        parent: WorkerId,
        parent_load: usize,
        child: WorkerId,
        child_load: usize,
    },

    #[error("{worker} records heap index {recorded:?} but sits at {actual}")]
    IndexMismatch {
        worker: WorkerId,
        recorded: Option<usize>,
        actual: usize,
    },

    #[error("{0} claims a heap slot it does not occupy")]
    Stray(WorkerId),
}

/// Array-backed binary min-heap over an arena of members.
///
/// Ties on load are broken by worker id so dispatch order is reproducible.
#[derive(Debug)]
pub struct Pool<W> {
    members: Vec<W>,
    heap: Vec<WorkerId>,
}

impl<W: Loaded> Pool<W> {
    /// Create a pool whose members all start outside the heap.
    /// Member `i` gets `WorkerId::new(i)`.
    pub fn new(mut members: Vec<W>) -> Self {
        for member in &mut members {
            member.set_heap_index(None);
        }
        let heap = Vec::with_capacity(members.len());
        Self { members, heap }
    }

    /// Create a pool with every member already inserted.
    pub fn filled(members: Vec<W>) -> Self {
        let mut pool = Self::new(members);
        for n in 0..pool.members.len() {
            pool.insert(WorkerId::new(n));
        }
        pool
    }

    /// Number of members currently in the heap.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn member(&self, id: WorkerId) -> Option<&W> {
        self.members.get(id.0)
    }

    /// Mutable access to a member.
    ///
    /// Changing the load of a member that is in the heap breaks heap order
    /// until [`Pool::reposition`] is called for it.
    pub fn member_mut(&mut self, id: WorkerId) -> Option<&mut W> {
        self.members.get_mut(id.0)
    }

    pub fn members(&self) -> impl Iterator<Item = (WorkerId, &W)> {
        self.members
            .iter()
            .enumerate()
            .map(|(n, member)| (WorkerId::new(n), member))
    }

    pub fn members_mut(&mut self) -> impl Iterator<Item = (WorkerId, &mut W)> {
        self.members
            .iter_mut()
            .enumerate()
            .map(|(n, member)| (WorkerId::new(n), member))
    }

    pub fn into_members(self) -> Vec<W> {
        self.members
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.member(id).is_some_and(|m| m.heap_index().is_some())
    }

    /// Loads of all members, indexed by worker id.
    pub fn loads(&self) -> Vec<usize> {
        self.members.iter().map(Loaded::load).collect()
    }

    pub fn peek_min(&self) -> Option<WorkerId> {
        self.heap.first().copied()
    }

    /// Insert a member that is currently outside the heap. O(log n).
    pub fn insert(&mut self, id: WorkerId) {
        assert!(id.0 < self.members.len(), "{id} is not a pool member");
        assert!(
            self.members[id.0].heap_index().is_none(),
            "{id} is already in the pool"
        );
        let index = self.heap.len();
        self.heap.push(id);
        self.members[id.0].set_heap_index(Some(index));
        self.sift_up(index);
    }

    /// Take out the least-loaded member. O(log n).
    pub fn pop_min(&mut self) -> Option<WorkerId> {
        let last = self.heap.len().checked_sub(1)?;
        self.swap(0, last);
        let id = self.heap.pop()?;
        self.members[id.0].set_heap_index(None);
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some(id)
    }

    /// Remove `id` from position `index`. O(log n).
    ///
    /// # Panics
    /// If `heap[index] != id`. A stale index would otherwise corrupt heap
    /// order without any visible error.
    pub fn remove_at(&mut self, index: usize, id: WorkerId) {
        assert_eq!(
            self.heap.get(index).copied(),
            Some(id),
            "stale heap index {index} for {id}"
        );
        let last = self.heap.len() - 1;
        self.swap(index, last);
        self.heap.pop();
        self.members[id.0].set_heap_index(None);

        if index < self.heap.len() && !self.sift_up(index) {
            self.sift_down(index);
        }
    }

    /// Restore heap order after the load of `id` changed.
    ///
    /// # Panics
    /// If `id` is not in the heap.
    pub fn reposition(&mut self, id: WorkerId) {
        let index = self
            .member(id)
            .and_then(Loaded::heap_index)
            .unwrap_or_else(|| panic!("{id} is not in the pool"));
        self.remove_at(index, id);
        self.insert(id);
    }

    /// Verify heap order and index consistency.
    pub fn check_invariants(&self) -> Result<(), PoolError> {
        for (pos, &id) in self.heap.iter().enumerate() {
            let recorded = self.members[id.0].heap_index();
            if recorded != Some(pos) {
                return Err(PoolError::IndexMismatch {
                    worker: id,
                    recorded,
                    actual: pos,
                });
            }
            if pos > 0 {
                let parent = self.heap[(pos - 1) / 2];
                let parent_load = self.members[parent.0].load();
                let child_load = self.members[id.0].load();
                if parent_load > child_load {
                    return Err(PoolError::OrderViolated {
                        parent,
                        parent_load,
                        child: id,
                        child_load,
                    });
                }
            }
        }

        for (id, member) in self.members() {
            if let Some(index) = member.heap_index()
                && self.heap.get(index) != Some(&id)
            {
                return Err(PoolError::Stray(id));
            }
        }
        Ok(())
    }

    fn key(&self, pos: usize) -> (usize, WorkerId) {
        let id = self.heap[pos];
        (self.members[id.0].load(), id)
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.key(a) < self.key(b)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        let (id_a, id_b) = (self.heap[a], self.heap[b]);
        self.members[id_a.0].set_heap_index(Some(a));
        self.members[id_b.0].set_heap_index(Some(b));
    }

    /// Returns true if the element moved.
    fn sift_up(&mut self, mut pos: usize) -> bool {
        let start = pos;
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.less(pos, parent) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos != start
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, pos) {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
    }
}
