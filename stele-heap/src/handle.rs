//! Opaque, persistable handles to heap slots.

use std::fmt;
use std::ptr;

use crate::wire::{Wire, WireError};

/// Opaque handle to a payload slot.
///
/// Logically a `(slab_index, slot_index)` pair with 1-based slot indices;
/// `(0, 0)` is the null handle. The pair is the source of truth and the only
/// thing that is persisted, compared, or printed. Alongside it the handle
/// carries an advisory cached address for zero-cost dereference; the cache
/// is dropped by [`Wire::decode`] and refreshed by the relocation protocol.
///
/// Handles are plain values: copying one never touches the heap.
pub struct Handle<T> {
    slab: u32,
    slot: u32,
    ptr: *const T,
}

impl<T> Handle<T> {
    /// The null handle.
    #[inline]
    pub const fn null() -> Self {
        Self {
            slab: 0,
            slot: 0,
            ptr: ptr::null(),
        }
    }

    /// Handle bound to an in-memory payload address.
    #[inline]
    pub(crate) const fn bound(slab: u32, slot: u32, ptr: *const T) -> Self {
        Self { slab, slot, ptr }
    }

    /// Handle carrying only the logical pair; the cache stays null until
    /// the handle passes through a relocator.
    #[inline]
    pub(crate) const fn unbound(slab: u32, slot: u32) -> Self {
        Self {
            slab,
            slot,
            ptr: ptr::null(),
        }
    }

    /// Returns true iff both indices are 0.
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.slab == 0 && self.slot == 0
    }

    /// Index of the owning slab.
    #[inline]
    pub const fn slab_index(&self) -> u32 {
        self.slab
    }

    /// 1-based index of the slot within its slab.
    #[inline]
    pub const fn slot_index(&self) -> u32 {
        self.slot
    }

    /// Dereferences the cached payload address, `None` when no address is
    /// cached (null handle, or decoded and not yet relocated).
    ///
    /// # Safety
    ///
    /// The caller must ensure the heap that issued this handle is still
    /// alive, the slot has not been freed, and no restore cycle has run
    /// since the address was cached. [`Heap::get`](crate::Heap::get) is the
    /// checked path and should be preferred outside hot loops.
    #[inline]
    pub unsafe fn as_ref<'a>(&self) -> Option<&'a T> {
        if self.ptr.is_null() {
            None
        } else {
            Some(unsafe { &*self.ptr })
        }
    }
}

// Handles encode as the logical pair only; the cache never crosses the wire.
impl<T> Wire for Handle<T> {
    const WIDTH: usize = 8;

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.slab.to_be_bytes());
        out.extend_from_slice(&self.slot.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let slab = u32::decode(buf)?;
        let slot = u32::decode(&buf[4..])?;
        Ok(Handle::unbound(slab, slot))
    }
}

impl<T> Clone for Handle<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Default for Handle<T> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

// Equality is on the logical pair; two handles to the same slot compare
// equal even when one carries a stale or missing cache.
impl<T> PartialEq for Handle<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.slab == other.slab && self.slot == other.slot
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Handle(null)")
        } else {
            write!(f, "Handle({}, {})", self.slab, self.slot)
        }
    }
}

// Safety: the pair is plain data; the cached address is only ever read
// through `as_ref`, whose contract covers cross-thread use.
unsafe impl<T: Sync> Send for Handle<T> {}
unsafe impl<T: Sync> Sync for Handle<T> {}
