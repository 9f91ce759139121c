//! # stele-heap
//!
//! A typed slab heap with persistable, position-independent handles.
//!
//! ## Design Philosophy
//!
//! Objects are pooled in fixed-capacity slabs and referenced through opaque
//! `(slab, slot)` handles instead of machine addresses. Because a handle
//! never encodes an address, a whole heap can be serialized, shipped to
//! another process, and rebuilt there - handles embedded inside persisted
//! payloads survive the trip and are rebound to fresh addresses by the
//! relocation sweep.
//!
//! ## Layers
//!
//! 1. [`Handle`] - logical pair plus an advisory cached address
//! 2. Slot metadata - refs flag, self identity, intrusive free link
//! 3. Slab - payload array, parallel metadata, persistence status
//! 4. [`Heap`] - slab sequence, free-list, counters; the public surface
//!
//! ## Example
//!
//! ```
//! use stele_heap::Heap;
//!
//! let mut heap = Heap::<u64>::new(16)?;
//!
//! let h = heap.insert(42)?;
//! assert_eq!(heap.get(h), Some(&42));
//!
//! heap.free(h);
//! assert_eq!(heap.get(h), None);
//! # Ok::<(), stele_heap::HeapError>(())
//! ```
//!
//! The heap is a single-owner structure: no internal locking, no object
//! moves while allocated, exactly one free per alloc (extra frees are
//! silent no-ops). Sharing across threads means external mutual exclusion
//! over the whole heap.

#![warn(missing_docs)]

use std::collections::TryReserveError;

use tracing::debug;

mod handle;
mod meta;
mod relocate;
mod wire;

pub use handle::Handle;
pub use relocate::{Relocate, Relocator};
pub use wire::{Wire, WireError, WIRE_VERSION};

use meta::{Slab, SlabStatus, SlotMeta, SlotRef};

// =============================================================================
// Constants
// =============================================================================

/// Largest permitted slab capacity.
pub const MAX_SLAB_CAPACITY: u32 = (1 << 31) - 1;

// =============================================================================
// Errors
// =============================================================================

/// Errors from heap construction and allocation.
#[derive(Debug)]
pub enum HeapError {
    /// Slab capacity of zero requested.
    ZeroCapacity,
    /// Slab capacity above [`MAX_SLAB_CAPACITY`] requested.
    CapacityTooLarge {
        /// The rejected capacity.
        capacity: u32,
    },
    /// Memory for a new slab could not be reserved. The heap is unchanged.
    Growth(TryReserveError),
}

impl std::fmt::Display for HeapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeapError::ZeroCapacity => write!(f, "slab capacity must be at least 1"),
            HeapError::CapacityTooLarge { capacity } => {
                write!(f, "slab capacity {capacity} exceeds {MAX_SLAB_CAPACITY}")
            }
            HeapError::Growth(err) => write!(f, "slab growth failed: {err}"),
        }
    }
}

impl std::error::Error for HeapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HeapError::Growth(err) => Some(err),
            _ => None,
        }
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Point-in-time snapshot of heap counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Successful allocations since construction or the last restore.
    pub allocs: u64,
    /// Successful frees since construction or the last restore.
    pub frees: u64,
    /// Slabs currently owned by the heap.
    pub slabs: usize,
    /// Slabs whose occupancy changed since construction or the last restore.
    pub dirty_slabs: usize,
    /// Total slots across all slabs.
    pub slots: usize,
    /// Slots currently on the free-list.
    pub free_slots: usize,
}

// =============================================================================
// Heap
// =============================================================================

/// A pool of `T` payloads addressed through [`Handle`]s.
///
/// Slabs of `slab_capacity` slots are appended on demand and never
/// released; a payload's address is stable from alloc to free. Free slots
/// form an intrusive LIFO threaded through slot metadata, so alloc and free
/// are O(1) outside of growth.
#[derive(Debug)]
pub struct Heap<T> {
    pub(crate) slabs: Vec<Slab<T>>,
    pub(crate) slab_capacity: u32,
    pub(crate) free_head: SlotRef,
    pub(crate) free_len: usize,
    pub(crate) slot_count: usize,
    pub(crate) allocs: u64,
    pub(crate) frees: u64,
    pub(crate) dirty_slabs: usize,
}

impl<T> Heap<T> {
    /// Creates an empty heap; the first allocation grows the first slab.
    ///
    /// `slab_capacity` is fixed for the heap's lifetime and must lie in
    /// `[1, MAX_SLAB_CAPACITY]`.
    pub fn new(slab_capacity: u32) -> Result<Self, HeapError> {
        if slab_capacity == 0 {
            return Err(HeapError::ZeroCapacity);
        }
        if slab_capacity > MAX_SLAB_CAPACITY {
            return Err(HeapError::CapacityTooLarge {
                capacity: slab_capacity,
            });
        }

        Ok(Self {
            slabs: Vec::new(),
            slab_capacity,
            free_head: SlotRef::NULL,
            free_len: 0,
            slot_count: 0,
            allocs: 0,
            frees: 0,
            dirty_slabs: 0,
        })
    }

    /// Returns the number of live payloads.
    #[inline]
    pub fn len(&self) -> usize {
        self.slot_count - self.free_len
    }

    /// Returns true if no payloads are live.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of slabs.
    #[inline]
    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    /// Returns the per-slab slot capacity.
    #[inline]
    pub fn slab_capacity(&self) -> u32 {
        self.slab_capacity
    }

    /// Returns a counter snapshot.
    pub fn stats(&self) -> Stats {
        Stats {
            allocs: self.allocs,
            frees: self.frees,
            slabs: self.slabs.len(),
            dirty_slabs: self.dirty_slabs,
            slots: self.slot_count,
            free_slots: self.free_len,
        }
    }

    /// Returns the payload behind `handle`.
    ///
    /// Null handles and handles to freed slots yield `None`.
    ///
    /// # Panics
    ///
    /// Panics when the handle's indices are out of range for this heap;
    /// such a handle was never issued here and signals caller corruption,
    /// not input to validate.
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        let (i, j) = self.locate(handle)?;
        if self.slabs[i].slots[j].refs == 0 {
            return None;
        }
        Some(&self.slabs[i].memory[j])
    }

    /// Mutable access to the payload behind `handle`.
    ///
    /// Marks the owning slab dirty, since the caller may rewrite content an
    /// incremental persister would want to pick up. Same null/freed/range
    /// behavior as [`get`](Heap::get).
    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        let (i, j) = self.locate(handle)?;
        if self.slabs[i].slots[j].refs == 0 {
            return None;
        }
        self.mark_dirty(i);
        Some(&mut self.slabs[i].memory[j])
    }

    /// Returns the payload slot behind `handle` to the free-list.
    ///
    /// Idempotent: null handles and already-freed slots are no-ops. The
    /// payload itself is not cleared; residue must not be relied on.
    pub fn free(&mut self, handle: Handle<T>) {
        let Some((i, j)) = self.locate(handle) else {
            return;
        };
        if self.slabs[i].slots[j].refs == 0 {
            return;
        }

        self.slabs[i].slots[j].refs = 0;
        self.mark_dirty(i);
        self.frees += 1;
        self.push_free(SlotRef {
            slab: handle.slab_index(),
            slot: handle.slot_index(),
        });
    }

    /// Returns `handle` rebound to a fresh cached address; null in, null
    /// out. The logical pair is unchanged.
    ///
    /// This is the public half of the relocation protocol, for root handles
    /// the caller persisted outside the heap. Handles embedded in payloads
    /// are rebound automatically during
    /// [`from_bytes`](Heap::from_bytes).
    ///
    /// # Panics
    ///
    /// Panics when the handle's indices are out of range for this heap.
    pub fn reloc(&self, handle: Handle<T>) -> Handle<T> {
        match self.locate(handle) {
            None => Handle::null(),
            Some((i, j)) => Handle::bound(
                handle.slab_index(),
                handle.slot_index(),
                &self.slabs[i].memory[j] as *const T,
            ),
        }
    }

    // -------------------------------------------------------------------------
    // Internal: lookup and dirty tracking
    // -------------------------------------------------------------------------

    /// Maps a handle to `(slab index, 0-based slot index)`; `None` for the
    /// null handle, panic for out-of-range pairs.
    fn locate(&self, handle: Handle<T>) -> Option<(usize, usize)> {
        if handle.is_null() {
            return None;
        }

        let slab = handle.slab_index() as usize;
        let slot = handle.slot_index();
        assert!(
            slab < self.slabs.len(),
            "handle slab index {slab} out of range"
        );
        assert!(
            slot >= 1 && slot <= self.slab_capacity,
            "handle slot index {slot} out of range"
        );

        Some((slab, slot as usize - 1))
    }

    fn mark_dirty(&mut self, slab: usize) {
        let status = &mut self.slabs[slab].status;
        if *status != SlabStatus::Dirty {
            *status = SlabStatus::Dirty;
            self.dirty_slabs += 1;
        }
    }

    // -------------------------------------------------------------------------
    // Internal: free-list
    // -------------------------------------------------------------------------

    /// Pushes a free slot onto the list head.
    ///
    /// Pushing an allocated slot means the structure is already corrupt, so
    /// this aborts rather than continue.
    pub(crate) fn push_free(&mut self, slot_ref: SlotRef) {
        let head = self.free_head;
        let slot = self.slot_mut(slot_ref);
        assert!(slot.refs == 0, "free-list push of an allocated slot");

        slot.next = head;
        self.free_head = slot_ref;
        self.free_len += 1;
    }

    /// Pops the list head and hands it out as allocated.
    pub(crate) fn pop_free(&mut self) -> SlotRef {
        let head = self.free_head;
        assert!(!head.is_null(), "free-list pop from an empty list");

        let slot = self.slot_mut(head);
        assert!(slot.refs == 0, "free-list head is an allocated slot");
        slot.refs = 1;
        let next = slot.next;
        slot.next = SlotRef::NULL;

        self.free_head = next;
        assert!(self.free_len > 0, "free-list length corrupted");
        self.free_len -= 1;

        head
    }

    #[inline]
    fn slot_mut(&mut self, slot_ref: SlotRef) -> &mut SlotMeta {
        &mut self.slabs[slot_ref.slab as usize].slots[slot_ref.slot as usize - 1]
    }
}

impl<T: Default> Heap<T> {
    /// Allocates a slot and returns its handle, growing the slab sequence
    /// when the free-list is empty.
    ///
    /// The payload is whatever the slot last held - fresh slabs start at
    /// `T::default()`, reused slots keep their residue until overwritten.
    ///
    /// # Errors
    ///
    /// [`HeapError::Growth`] when a new slab cannot be reserved; the heap
    /// is left unchanged.
    pub fn alloc(&mut self) -> Result<Handle<T>, HeapError> {
        if self.free_head.is_null() {
            self.grow()?;
        }

        let slot_ref = self.pop_free();
        let i = slot_ref.slab as usize;
        self.mark_dirty(i);
        self.allocs += 1;

        let ptr = &self.slabs[i].memory[slot_ref.slot as usize - 1] as *const T;
        Ok(Handle::bound(slot_ref.slab, slot_ref.slot, ptr))
    }

    /// Allocates a slot and writes `value` into it.
    pub fn insert(&mut self, value: T) -> Result<Handle<T>, HeapError> {
        let handle = self.alloc()?;
        *self.get_mut(handle).expect("freshly allocated slot") = value;
        Ok(handle)
    }

    /// Appends one slab and threads its slots onto the free-list.
    fn grow(&mut self) -> Result<(), HeapError> {
        let cap = self.slab_capacity as usize;
        let slab_index = self.slabs.len() as u32;

        // All reservations are fallible and happen before any mutation.
        self.slabs.try_reserve(1).map_err(HeapError::Growth)?;

        let mut memory: Vec<T> = Vec::new();
        memory.try_reserve_exact(cap).map_err(HeapError::Growth)?;
        memory.resize_with(cap, T::default);

        let mut slots: Vec<SlotMeta> = Vec::new();
        slots.try_reserve_exact(cap).map_err(HeapError::Growth)?;
        for j in 1..=self.slab_capacity {
            slots.push(SlotMeta {
                refs: 0,
                self_ref: SlotRef {
                    slab: slab_index,
                    slot: j,
                },
                next: SlotRef::NULL,
            });
        }

        self.slabs.push(Slab {
            status: SlabStatus::Clean,
            memory: memory.into_boxed_slice(),
            slots: slots.into_boxed_slice(),
        });
        self.slot_count += cap;

        // Descending pushes so a fresh slab hands out ascending slot
        // indices.
        for j in (1..=self.slab_capacity).rev() {
            self.push_free(SlotRef {
                slab: slab_index,
                slot: j,
            });
        }

        debug!("appended slab {slab_index} ({cap} slots)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
