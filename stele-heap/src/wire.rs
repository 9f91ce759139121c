//! Flat big-endian wire codec for heaps.
//!
//! A serialized heap is a single length-implicit stream; framing, storage,
//! and compression belong to the caller:
//!
//! ```text
//! Heap    := u32 version   u32 slab_capacity   u32 slab_count   Slab*
//! Slab    := u8  status    Slot[slab_capacity]  Payload[slab_capacity]
//! Slot    := u32 refs      u32 slab_index       u32 slot_index
//! Payload := Wire::WIDTH bytes of a single payload
//! ```
//!
//! Every slab is emitted in full, clean or not. Free-list links are not
//! persisted; the list is rebuilt on decode in the same deterministic order
//! used when a slab is first created, so a store/restore/store cycle is
//! byte-stable.

use tracing::debug;

use crate::meta::{Slab, SlabStatus, SlotMeta, SlotRef};
use crate::relocate::Relocate;
use crate::{Heap, MAX_SLAB_CAPACITY};

/// Version tag leading every serialized heap.
pub const WIRE_VERSION: u32 = 0x0000_0001;

/// Bytes per persisted slot record: refs, slab index, slot index.
const SLOT_RECORD: usize = 12;

// =============================================================================
// Wire trait
// =============================================================================

/// Byte-exact, fixed-width encoding for payload types.
///
/// The heap treats payloads as opaque `WIDTH`-byte records; the codec for a
/// payload's fields is entirely the client's. Fixed-width integers and
/// [`Handle`](crate::Handle) implement `Wire`, so compound payloads compose
/// field by field:
///
/// ```
/// use stele_heap::{Handle, Wire, WireError};
///
/// struct Entry {
///     weight: u32,
///     peer: Handle<Entry>,
/// }
///
/// impl Wire for Entry {
///     const WIDTH: usize = 4 + 8;
///
///     fn encode(&self, out: &mut Vec<u8>) {
///         self.weight.encode(out);
///         self.peer.encode(out);
///     }
///
///     fn decode(buf: &[u8]) -> Result<Self, WireError> {
///         Ok(Entry {
///             weight: u32::decode(buf)?,
///             peer: Handle::decode(&buf[4..])?,
///         })
///     }
/// }
/// ```
pub trait Wire: Sized {
    /// Encoded width in bytes. `encode` must append exactly this many.
    const WIDTH: usize;

    /// Appends the encoded payload to `out`.
    fn encode(&self, out: &mut Vec<u8>);

    /// Decodes a payload from the first [`WIDTH`](Wire::WIDTH) bytes of
    /// `buf`.
    fn decode(buf: &[u8]) -> Result<Self, WireError>;
}

macro_rules! impl_wire_for_int {
    ($($ty:ty),+) => {
        $(
            impl Wire for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn encode(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_be_bytes());
                }

                #[inline]
                fn decode(buf: &[u8]) -> Result<Self, WireError> {
                    match buf.get(..Self::WIDTH) {
                        Some(bytes) => {
                            let mut raw = [0u8; std::mem::size_of::<$ty>()];
                            raw.copy_from_slice(bytes);
                            Ok(<$ty>::from_be_bytes(raw))
                        }
                        None => Err(WireError::Truncated {
                            needed: Self::WIDTH,
                            remaining: buf.len(),
                        }),
                    }
                }
            }
        )+
    };
}

impl_wire_for_int!(u8, u16, u32, u64, i8, i16, i32, i64);

// =============================================================================
// Errors
// =============================================================================

/// Errors produced while decoding a serialized heap or payload.
///
/// A failed decode discards the heap under construction; the input is never
/// partially applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// The stream was produced by an incompatible codec version.
    Version {
        /// Version tag found in the stream.
        found: u32,
    },
    /// The stream ended before a complete record.
    Truncated {
        /// Bytes the next record required.
        needed: usize,
        /// Bytes actually remaining.
        remaining: usize,
    },
    /// The slab capacity in the header is outside `[1, MAX_SLAB_CAPACITY]`
    /// or inconsistent with the advertised slab count.
    Capacity {
        /// Capacity found in the header.
        capacity: u32,
    },
    /// Unknown slab status byte.
    Status {
        /// The offending byte.
        byte: u8,
    },
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Version { found } => {
                write!(f, "unsupported wire version {found:#010x}, expected {WIRE_VERSION:#010x}")
            }
            WireError::Truncated { needed, remaining } => {
                write!(f, "truncated stream: needed {needed} bytes, {remaining} remaining")
            }
            WireError::Capacity { capacity } => {
                write!(f, "slab capacity {capacity} out of range")
            }
            WireError::Status { byte } => write!(f, "unknown slab status byte {byte:#04x}"),
        }
    }
}

impl std::error::Error for WireError {}

// =============================================================================
// Reader
// =============================================================================

/// Front-consuming cursor over the input stream.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::Truncated {
                needed: n,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    #[inline]
    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    #[inline]
    fn u32(&mut self) -> Result<u32, WireError> {
        u32::decode(self.take(4)?)
    }
}

// =============================================================================
// Heap codec
// =============================================================================

impl<T: Wire> Heap<T> {
    /// Serializes the heap to a flat byte stream.
    ///
    /// Statuses and statistics are untouched; a heap may keep serving
    /// allocations after a store.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());

        WIRE_VERSION.encode(&mut out);
        self.slab_capacity.encode(&mut out);
        (self.slabs.len() as u32).encode(&mut out);

        for slab in &self.slabs {
            out.push(slab.status.as_byte());
            for slot in slab.slots.iter() {
                slot.refs.encode(&mut out);
                slot.self_ref.slab.encode(&mut out);
                slot.self_ref.slot.encode(&mut out);
            }
            for payload in slab.memory.iter() {
                payload.encode(&mut out);
            }
        }

        debug!("stored heap: {} slabs, {} bytes", self.slabs.len(), out.len());
        out
    }

    fn encoded_len(&self) -> usize {
        let per_slab = 1 + self.slab_capacity as usize * (SLOT_RECORD + T::WIDTH);
        12 + self.slabs.len() * per_slab
    }
}

impl<T: Wire + Relocate> Heap<T> {
    /// Rebuilds a heap from a serialized stream.
    ///
    /// Validates the header, reads every slab, rebuilds the free-list in
    /// the deterministic birth order (ascending slabs, descending slots),
    /// then runs the relocation sweep over every live payload so embedded
    /// handles come back with fresh cached addresses. The restored heap is
    /// fully clean; descriptive counters start over at zero.
    ///
    /// Trailing bytes after a well-formed stream are ignored - outer
    /// framing is the caller's concern.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(bytes);

        let found = r.u32()?;
        if found != WIRE_VERSION {
            return Err(WireError::Version { found });
        }

        let slab_capacity = r.u32()?;
        if slab_capacity == 0 || slab_capacity > MAX_SLAB_CAPACITY {
            return Err(WireError::Capacity { capacity: slab_capacity });
        }
        let slab_count = r.u32()? as usize;
        let cap = slab_capacity as usize;

        // Reject impossible headers before reserving slab memory: the
        // advertised payload must actually be present in the input.
        let per_slab = cap
            .checked_mul(SLOT_RECORD + T::WIDTH)
            .and_then(|n| n.checked_add(1))
            .ok_or(WireError::Capacity { capacity: slab_capacity })?;
        match slab_count.checked_mul(per_slab) {
            Some(needed) if needed <= r.remaining() => {}
            _ => {
                return Err(WireError::Truncated {
                    needed: slab_count.saturating_mul(per_slab),
                    remaining: r.remaining(),
                })
            }
        }

        let mut slabs = Vec::with_capacity(slab_count);
        for _ in 0..slab_count {
            let byte = r.u8()?;
            if SlabStatus::from_byte(byte).is_none() {
                return Err(WireError::Status { byte });
            }

            let mut slots = Vec::with_capacity(cap);
            for _ in 0..cap {
                let refs = r.u32()?;
                let slab = r.u32()?;
                let slot = r.u32()?;
                slots.push(SlotMeta {
                    refs,
                    self_ref: SlotRef { slab, slot },
                    next: SlotRef::NULL,
                });
            }

            let mut memory = Vec::with_capacity(cap);
            for _ in 0..cap {
                memory.push(T::decode(r.take(T::WIDTH)?)?);
            }

            slabs.push(Slab {
                status: SlabStatus::Restored,
                memory: memory.into_boxed_slice(),
                slots: slots.into_boxed_slice(),
            });
        }

        let mut heap = Heap {
            slabs,
            slab_capacity,
            free_head: SlotRef::NULL,
            free_len: 0,
            slot_count: slab_count * cap,
            allocs: 0,
            frees: 0,
            dirty_slabs: 0,
        };

        // Same discipline as slab birth: within each slab the free slots go
        // on in descending order, so post-restore allocations pop ascending.
        for i in 0..heap.slabs.len() {
            for j in (1..=slab_capacity).rev() {
                if heap.slabs[i].slots[j as usize - 1].refs == 0 {
                    heap.push_free(SlotRef {
                        slab: i as u32,
                        slot: j,
                    });
                }
            }
        }

        heap.rebind_live();

        for slab in &mut heap.slabs {
            slab.status = SlabStatus::Clean;
        }

        debug!(
            "restored heap: {} slabs, {} free of {} slots",
            heap.slabs.len(),
            heap.free_len,
            heap.slot_count
        );
        Ok(heap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_heap() -> (Heap<u64>, Vec<crate::Handle<u64>>) {
        let mut heap = Heap::<u64>::new(4).unwrap();
        let handles: Vec<_> = (0..6u64)
            .map(|v| heap.insert(v * 100).unwrap())
            .collect();
        (heap, handles)
    }

    #[test]
    fn int_decode_short_input() {
        let err = u64::decode(&[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            WireError::Truncated {
                needed: 8,
                remaining: 3
            }
        );
    }

    #[test]
    fn header_layout() {
        let heap = Heap::<u64>::new(4).unwrap();
        let bytes = heap.to_bytes();
        // version, capacity, slab count - no slabs yet
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 4]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 0]);
    }

    #[test]
    fn round_trip_preserves_live_payloads() {
        let (heap, handles) = filled_heap();
        let expected: Vec<_> = handles.iter().map(|&h| *heap.get(h).unwrap()).collect();

        let restored = Heap::<u64>::from_bytes(&heap.to_bytes()).unwrap();
        for (&h, want) in handles.iter().zip(&expected) {
            let rebound = restored.reloc(h);
            assert_eq!(rebound, h);
            assert_eq!(restored.get(rebound), Some(want));
        }
    }

    #[test]
    fn round_trip_rebuilds_free_list_deterministically() {
        let (mut heap, handles) = filled_heap();
        // Free two live slots and leave the tail of the second slab unused.
        heap.free(handles[1]);
        heap.free(handles[4]);

        let mut restored = Heap::<u64>::from_bytes(&heap.to_bytes()).unwrap();
        let stats = restored.stats();
        assert_eq!(stats.slabs, 2);
        assert_eq!(stats.slots, 8);
        assert_eq!(stats.free_slots, 4);
        assert_eq!(stats.allocs, 0);
        assert_eq!(stats.frees, 0);
        assert_eq!(stats.dirty_slabs, 0);

        // Free slots pop in descending-slab, ascending-slot order.
        let order: Vec<_> = (0..4)
            .map(|_| {
                let h = restored.alloc().unwrap();
                (h.slab_index(), h.slot_index())
            })
            .collect();
        assert_eq!(order, vec![(1, 1), (1, 3), (1, 4), (0, 2)]);
    }

    #[test]
    fn version_guard() {
        let (heap, _) = filled_heap();
        let mut bytes = heap.to_bytes();
        bytes[3] = 2;

        let err = Heap::<u64>::from_bytes(&bytes).unwrap_err();
        assert_eq!(err, WireError::Version { found: 2 });
    }

    #[test]
    fn truncated_stream() {
        let (heap, _) = filled_heap();
        let bytes = heap.to_bytes();

        let err = Heap::<u64>::from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));

        let err = Heap::<u64>::from_bytes(&bytes[..7]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn zero_capacity_header_rejected() {
        let mut bytes = Vec::new();
        WIRE_VERSION.encode(&mut bytes);
        0u32.encode(&mut bytes);
        0u32.encode(&mut bytes);

        let err = Heap::<u64>::from_bytes(&bytes).unwrap_err();
        assert_eq!(err, WireError::Capacity { capacity: 0 });
    }

    #[test]
    fn oversized_slab_count_rejected_without_allocating() {
        let mut bytes = Vec::new();
        WIRE_VERSION.encode(&mut bytes);
        16u32.encode(&mut bytes);
        u32::MAX.encode(&mut bytes);

        let err = Heap::<u64>::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn unknown_status_rejected() {
        let (heap, _) = filled_heap();
        let mut bytes = heap.to_bytes();
        // First slab's status byte sits right after the 12-byte header.
        bytes[12] = 9;

        let err = Heap::<u64>::from_bytes(&bytes).unwrap_err();
        assert_eq!(err, WireError::Status { byte: 9 });
    }

    #[test]
    fn trailing_bytes_ignored() {
        let (heap, handles) = filled_heap();
        let mut bytes = heap.to_bytes();
        bytes.extend_from_slice(b"outer container framing");

        let restored = Heap::<u64>::from_bytes(&bytes).unwrap();
        assert_eq!(restored.get(restored.reloc(handles[0])), Some(&0));
    }

    #[test]
    fn second_round_trip_is_byte_identical() {
        let (mut heap, handles) = filled_heap();
        heap.free(handles[2]);

        let first = Heap::<u64>::from_bytes(&heap.to_bytes()).unwrap();
        let second = Heap::<u64>::from_bytes(&first.to_bytes()).unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
    }

    #[test]
    fn restore_clears_dirty_tracking() {
        let (heap, _) = filled_heap();
        assert_eq!(heap.stats().dirty_slabs, 2);

        let restored = Heap::<u64>::from_bytes(&heap.to_bytes()).unwrap();
        assert_eq!(restored.stats().dirty_slabs, 0);
    }
}
