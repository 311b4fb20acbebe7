//! Lock-free sorted singly linked list.

use core::cmp::Ordering::*;
use core::mem;
use core::sync::atomic::Ordering::*;

use crossbeam_epoch::{pin, unprotected, Atomic, Guard, Owned, Shared};

use crate::ConcurrentSet;

/// A snapshot of a node's link: successor pointer plus logical-deletion mark.
///
/// Replaced as a whole by CAS, never mutated in place, so no thread can
/// observe a torn `(next, deleted)` combination. A marked state is final:
/// every writer CASes against an unmarked snapshot, so a dead node's
/// successor cannot change. That stability is what makes splicing sound.
#[derive(Debug)]
struct State<T> {
    /// Written once at construction, read-only once the state is published.
    next: Atomic<Node<T>>,
    deleted: bool,
}

/// Linked list node. The value is immutable; all observation and mutation of
/// the node goes through its single atomic `state` slot.
#[derive(Debug)]
struct Node<T> {
    value: T,
    state: Atomic<State<T>>,
}

/// Sorted singly linked list with lock-free insertion, removal, and
/// membership tests.
///
/// Removal is two-phase: a node is first marked deleted (the linearization
/// point), then unlinked either by the remover or cooperatively by a later
/// traversal that finds it in the way. Retired nodes and link snapshots are
/// reclaimed with epochs.
#[derive(Debug)]
pub struct LockFreeListSet<T> {
    /// The anchor link. Front insertions and unlinks CAS this slot through
    /// the same protocol as any node's `state`; its mark is never set.
    head: Atomic<State<T>>,
}

unsafe impl<T: Send> Send for LockFreeListSet<T> {}
unsafe impl<T: Send + Sync> Sync for LockFreeListSet<T> {}

/// Traversal position: the slot whose observed state points at `curr`.
#[derive(Debug)]
struct Cursor<'g, T> {
    prev: &'g Atomic<State<T>>,
    /// `prev`'s state as last validated: unmarked and pointing at `curr`.
    /// The expected value for any CAS the caller performs on `prev`.
    prev_state: Shared<'g, State<T>>,
    curr: Shared<'g, Node<T>>,
}

impl<T> State<T> {
    fn new(next: Shared<'_, Node<T>>, deleted: bool) -> Self {
        Self {
            next: next.into(),
            deleted,
        }
    }
}

impl<T> Node<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            state: Atomic::new(State {
                next: Atomic::null(),
                deleted: false,
            }),
        }
    }

    /// Redirects the node's forward link.
    ///
    /// # Safety
    ///
    /// The node must not have been published to other threads yet.
    unsafe fn set_next<'g>(&self, next: Shared<'g, Node<T>>, guard: &'g Guard) {
        let state = self.state.load(Relaxed, guard);
        // SAFETY: the state allocation lives as long as the node.
        unsafe { state.deref() }.next.store(next, Relaxed);
    }
}

impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        // SAFETY: the node is being destroyed, so its final state snapshot is
        // no longer shared.
        drop(unsafe { mem::take(&mut self.state).try_into_owned() });
    }
}

impl<'g, T> Cursor<'g, T>
where
    T: Ord,
{
    /// Moves the cursor to the first live node with a value `>= value`.
    /// Returns whether that value was found.
    ///
    /// Marked nodes encountered on the way are spliced out, completing
    /// removals initiated by other threads. Returns `Err(())` if a concurrent
    /// mutation raced ahead; no partial progress is trusted and the caller
    /// restarts from the anchor.
    fn find(&mut self, value: &T, guard: &'g Guard) -> Result<bool, ()> {
        loop {
            let Some(curr_node) = (unsafe { self.curr.as_ref() }) else {
                return Ok(false);
            };

            // Re-read the predecessor's link: if it was marked or redirected
            // since we got here, the traversal is stale.
            let prev_state = self.prev.load(Acquire, guard);
            let prev_ref = unsafe { prev_state.deref() };
            // `next` is immutable after publication, so Relaxed suffices.
            if prev_ref.deleted || prev_ref.next.load(Relaxed, guard) != self.curr {
                return Err(());
            }
            self.prev_state = prev_state;

            let curr_state = curr_node.state.load(Acquire, guard);
            let curr_ref = unsafe { curr_state.deref() };
            let next = curr_ref.next.load(Relaxed, guard);

            if curr_ref.deleted {
                // Splice the dead node out before continuing the scan. Its
                // successor is stable because a marked state is final.
                let repaired = Owned::new(State::new(next, false));
                match self
                    .prev
                    .compare_exchange(prev_state, repaired, Release, Relaxed, guard)
                {
                    Ok(new_state) => {
                        // SAFETY: the CAS made the old link and the dead node
                        // unreachable from the anchor; only readers pinned
                        // before it can still see them.
                        unsafe {
                            guard.defer_destroy(prev_state);
                            guard.defer_destroy(self.curr);
                        }
                        self.prev_state = new_state;
                        self.curr = next;
                    }
                    Err(_) => return Err(()),
                }
                continue;
            }

            match curr_node.value.cmp(value) {
                Less => {
                    self.prev = &curr_node.state;
                    self.prev_state = curr_state;
                    self.curr = next;
                }
                Equal => return Ok(true),
                Greater => return Ok(false),
            }
        }
    }
}

impl<T> LockFreeListSet<T> {
    /// Creates a new, empty set.
    pub fn new() -> Self {
        Self {
            head: Atomic::new(State {
                next: Atomic::null(),
                deleted: false,
            }),
        }
    }

    fn head<'g>(&'g self, guard: &'g Guard) -> Cursor<'g, T> {
        let prev_state = self.head.load(Acquire, guard);
        // The anchor state is never marked, so it is always safe to follow.
        let curr = unsafe { prev_state.deref() }.next.load(Relaxed, guard);
        Cursor {
            prev: &self.head,
            prev_state,
            curr,
        }
    }
}

impl<T> LockFreeListSet<T>
where
    T: Ord,
{
    fn find<'g>(&'g self, value: &T, guard: &'g Guard) -> (bool, Cursor<'g, T>) {
        loop {
            let mut cursor = self.head(guard);
            if let Ok(found) = cursor.find(value, guard) {
                return (found, cursor);
            }
        }
    }
}

impl<T> ConcurrentSet<T> for LockFreeListSet<T>
where
    T: Ord,
{
    fn contains(&self, value: &T) -> bool {
        let guard = pin();
        let mut curr = unsafe { self.head.load(Acquire, &guard).deref() }
            .next
            .load(Relaxed, &guard);
        // A single forward scan; no CAS, no retry. Concurrent structural
        // changes only make the answer momentarily stale, never wrong.
        loop {
            let Some(curr_node) = (unsafe { curr.as_ref() }) else {
                return false;
            };
            let state = unsafe { curr_node.state.load(Acquire, &guard).deref() };
            match curr_node.value.cmp(value) {
                Less => curr = state.next.load(Relaxed, &guard),
                Equal => return !state.deleted,
                Greater => return false,
            }
        }
    }

    fn insert(&self, value: T) -> bool {
        let guard = pin();
        let node = Owned::new(Node::new(value)).into_shared(&guard);
        let value = &unsafe { node.deref() }.value;
        // The link that will make `node` reachable; a failed CAS hands it
        // back for the next attempt.
        let mut link = Owned::new(State::new(node, false));
        loop {
            let (found, cursor) = self.find(value, &guard);
            if found {
                // SAFETY: the node was never published; this thread still
                // owns it exclusively.
                drop(unsafe { node.into_owned() });
                return false;
            }

            // SAFETY: the node is still private to this thread.
            unsafe { node.deref().set_next(cursor.curr, &guard) };
            match cursor
                .prev
                .compare_exchange(cursor.prev_state, link, Release, Relaxed, &guard)
            {
                Ok(_) => {
                    // SAFETY: the replaced link is no longer reachable.
                    unsafe { guard.defer_destroy(cursor.prev_state) };
                    return true;
                }
                Err(e) => link = e.new,
            }
        }
    }

    fn remove(&self, value: &T) -> bool {
        let guard = pin();
        loop {
            let (found, cursor) = self.find(value, &guard);
            if !found {
                return false;
            }
            // SAFETY: `found` means the current node is non-null.
            let curr_node = unsafe { cursor.curr.deref() };
            let curr_state = curr_node.state.load(Acquire, &guard);
            let curr_ref = unsafe { curr_state.deref() };
            if curr_ref.deleted {
                // Another removal of the same value got here first.
                continue;
            }
            let next = curr_ref.next.load(Relaxed, &guard);

            // Logical removal: republish the same link with the mark set.
            // This CAS is the linearization point.
            let marked = Owned::new(State::new(next, true));
            if curr_node
                .state
                .compare_exchange(curr_state, marked, AcqRel, Relaxed, &guard)
                .is_err()
            {
                continue;
            }
            // SAFETY: the marked state replaced this one.
            unsafe { guard.defer_destroy(curr_state) };

            // One best-effort physical unlink. If it loses, the node stays
            // linked until a later traversal splices it out.
            let unlinked = Owned::new(State::new(next, false));
            if cursor
                .prev
                .compare_exchange(cursor.prev_state, unlinked, Release, Relaxed, &guard)
                .is_ok()
            {
                // SAFETY: this CAS unlinked both the old link and the node.
                unsafe {
                    guard.defer_destroy(cursor.prev_state);
                    guard.defer_destroy(cursor.curr);
                }
            }
            return true;
        }
    }

    fn is_empty(&self) -> bool {
        let guard = pin();
        unsafe { self.head.load(Acquire, &guard).deref() }
            .next
            .load(Relaxed, &guard)
            .is_null()
    }
}

impl<T> Default for LockFreeListSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeListSet<T> {
    fn drop(&mut self) {
        // SAFETY: with `&mut self`, no operation is in flight and no guard
        // can still reach a node, so the whole chain is exclusively owned.
        unsafe {
            let guard = unprotected();
            let head = self.head.load(Relaxed, guard);
            let mut curr = head.deref().next.load(Relaxed, guard);
            drop(head.into_owned());
            while !curr.is_null() {
                let next = curr
                    .deref()
                    .state
                    .load(Relaxed, guard)
                    .deref()
                    .next
                    .load(Relaxed, guard);
                drop(curr.into_owned());
                curr = next;
            }
        }
    }
}

#[cfg(test)]
impl<T: Clone> LockFreeListSet<T> {
    /// Snapshot of the unmarked values currently linked, in list order.
    fn live_values(&self) -> Vec<T> {
        let guard = pin();
        let mut out = Vec::new();
        let mut curr = unsafe { self.head.load(Acquire, &guard).deref() }
            .next
            .load(Relaxed, &guard);
        while let Some(node) = unsafe { curr.as_ref() } {
            let state = unsafe { node.state.load(Acquire, &guard).deref() };
            if !state.deleted {
                out.push(node.value.clone());
            }
            curr = state.next.load(Relaxed, &guard);
        }
        out
    }
}
