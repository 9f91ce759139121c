//! Handle rebinding after a restore.
//!
//! Decoded handles carry their logical pair but no cached address. After a
//! heap is rebuilt from bytes, the relocation sweep walks every live
//! payload exactly once (ascending slabs, ascending slots) and hands it a
//! [`Relocator`] so it can rewrite its embedded handle fields in place.
//! Hooks rewrite fields locally and never chase handles into other
//! payloads - cycles are fine precisely because nobody follows them.

use std::ptr::NonNull;

use crate::handle::Handle;
use crate::Heap;

/// Per-payload-type relocation hook.
///
/// Payload types that embed handles rewrite each handle field through the
/// relocator; the default body is the no-op for payloads without embedded
/// handles:
///
/// ```
/// use stele_heap::{Handle, Relocate, Relocator};
///
/// struct Entry {
///     weight: u32,
///     peer: Handle<Entry>,
/// }
///
/// impl Relocate for Entry {
///     fn relocate(&mut self, reloc: &Relocator<Self>) {
///         self.peer = reloc.reloc(self.peer);
///     }
/// }
/// ```
pub trait Relocate: Sized {
    /// Rewrites every embedded handle field via `reloc`.
    fn relocate(&mut self, reloc: &Relocator<Self>) {
        let _ = reloc;
    }
}

macro_rules! impl_relocate_noop {
    ($($ty:ty),+) => {
        $(impl Relocate for $ty {})+
    };
}

impl_relocate_noop!(u8, u16, u32, u64, i8, i16, i32, i64);

/// Capability handed to [`Relocate`] hooks during the restore sweep.
///
/// The only legitimate way to rebind a cached address. Lookup is pure
/// pointer arithmetic over the slab base table; payload memory is never
/// read, so a hook holding `&mut` to its own payload cannot alias it.
pub struct Relocator<T> {
    bases: Box<[NonNull<T>]>,
    slab_capacity: u32,
}

impl<T> Relocator<T> {
    pub(crate) fn new(bases: Box<[NonNull<T>]>, slab_capacity: u32) -> Self {
        Self {
            bases,
            slab_capacity,
        }
    }

    /// Returns `handle` rebound to a fresh cached address; null in, null
    /// out.
    ///
    /// Liveness is not consulted - the refs gate stays with
    /// [`Heap::get`](crate::Heap::get).
    ///
    /// # Panics
    ///
    /// Panics when the logical pair is out of range for the restored heap;
    /// a persisted payload referencing a slot that does not exist is
    /// corruption, not input.
    pub fn reloc(&self, handle: Handle<T>) -> Handle<T> {
        if handle.is_null() {
            return Handle::null();
        }

        let slab = handle.slab_index();
        let slot = handle.slot_index();
        assert!(
            (slab as usize) < self.bases.len(),
            "relocated handle slab index {slab} out of range"
        );
        assert!(
            slot >= 1 && slot <= self.slab_capacity,
            "relocated handle slot index {slot} out of range"
        );

        let ptr = unsafe { self.bases[slab as usize].as_ptr().add(slot as usize - 1) };
        Handle::bound(slab, slot, ptr as *const T)
    }
}

impl<T: Relocate> Heap<T> {
    /// Runs the relocation sweep over every live payload.
    pub(crate) fn rebind_live(&mut self) {
        let bases: Box<[NonNull<T>]> = self
            .slabs
            .iter_mut()
            .map(|slab| NonNull::new(slab.memory.as_mut_ptr()).expect("slab memory base"))
            .collect();
        let reloc = Relocator::new(bases, self.slab_capacity);

        let mut live = 0usize;
        for i in 0..self.slabs.len() {
            for j in 0..self.slab_capacity as usize {
                if self.slabs[i].slots[j].refs != 0 {
                    self.slabs[i].memory[j].relocate(&reloc);
                    live += 1;
                }
            }
        }
        tracing::trace!("relocation sweep rebound {live} live payloads");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Wire, WireError};

    // Minimal handle-bearing payload: a singly-linked ring node.
    #[derive(Default, Clone, Copy)]
    struct Link {
        value: u32,
        next: Handle<Link>,
    }

    impl Relocate for Link {
        fn relocate(&mut self, reloc: &Relocator<Self>) {
            self.next = reloc.reloc(self.next);
        }
    }

    impl Wire for Link {
        const WIDTH: usize = 4 + 8;

        fn encode(&self, out: &mut Vec<u8>) {
            self.value.encode(out);
            self.next.encode(out);
        }

        fn decode(buf: &[u8]) -> Result<Self, WireError> {
            Ok(Link {
                value: u32::decode(buf)?,
                next: Handle::decode(&buf[4..])?,
            })
        }
    }

    #[test]
    fn heap_reloc_rebinds_cache() {
        let mut heap = Heap::<u64>::new(2).unwrap();
        let h = heap.insert(11).unwrap();

        let mut buf = Vec::new();
        h.encode(&mut buf);
        let stale = Handle::<u64>::decode(&buf).unwrap();
        assert_eq!(unsafe { stale.as_ref() }, None);

        let rebound = heap.reloc(stale);
        assert_eq!(rebound, h);
        assert_eq!(unsafe { rebound.as_ref() }, Some(&11));
    }

    #[test]
    fn heap_reloc_null_is_null() {
        let heap = Heap::<u64>::new(2).unwrap();
        assert!(heap.reloc(Handle::null()).is_null());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn heap_reloc_out_of_range_aborts() {
        let mut heap = Heap::<u64>::new(2).unwrap();
        heap.alloc().unwrap();

        let mut buf = Vec::new();
        Handle::<u64>::unbound(7, 1).encode(&mut buf);
        let bogus = Handle::<u64>::decode(&buf).unwrap();
        heap.reloc(bogus);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn sweep_aborts_on_dangling_embedded_handle() {
        let mut heap = Heap::<Link>::new(2).unwrap();

        let mut buf = Vec::new();
        Handle::<Link>::unbound(99, 1).encode(&mut buf);
        let dangling = Handle::decode(&buf).unwrap();
        heap.insert(Link { value: 1, next: dangling }).unwrap();

        // A live payload naming a slot that does not exist is corruption;
        // the restore sweep refuses to rebind it.
        let _ = Heap::<Link>::from_bytes(&heap.to_bytes());
    }

    #[test]
    fn cycle_survives_restore() {
        let mut heap = Heap::<Link>::new(4).unwrap();
        let a = heap.insert(Link { value: 1, next: Handle::null() }).unwrap();
        let b = heap.insert(Link { value: 2, next: a }).unwrap();
        heap.get_mut(a).unwrap().next = b;

        let restored = Heap::<Link>::from_bytes(&heap.to_bytes()).unwrap();
        let a2 = restored.reloc(a);

        // Walk the two-element ring through cached addresses only.
        let first = restored.get(a2).unwrap();
        assert_eq!(first.value, 1);
        let second = unsafe { first.next.as_ref() }.unwrap();
        assert_eq!(second.value, 2);
        let back = unsafe { second.next.as_ref() }.unwrap();
        assert_eq!(back.value, 1);
    }

    #[test]
    fn self_reference_survives_restore() {
        let mut heap = Heap::<Link>::new(1).unwrap();
        let a = heap.insert(Link { value: 9, next: Handle::null() }).unwrap();
        heap.get_mut(a).unwrap().next = a;

        let restored = Heap::<Link>::from_bytes(&heap.to_bytes()).unwrap();
        let node = restored.get(restored.reloc(a)).unwrap();
        assert_eq!(node.next, a);
        assert_eq!(unsafe { node.next.as_ref() }.unwrap().value, 9);
    }
}
