//! Opaque, non-reusing resource identifiers
//!
//! Every table services entity (registry record, access descriptor, shared
//! load buffer, validation request, dump request) is named by a 32-bit value
//! combining a kind-specific base in the top byte with a 24-bit serial. Serials
//! increase monotonically per kind, so an identifier that has been released is
//! not handed out again until the serial space wraps. This prevents a stale
//! handle from silently resolving to a newer entity that happens to occupy the
//! same slot.
//!
//! The slot index is derived from the serial modulo the table capacity. The
//! allocator skips serials whose slot is in use.

use std::fmt;
use std::num::NonZeroU32;

/// Number of bits used for the serial
pub const SERIAL_BITS: u32 = 24;

/// Mask selecting the serial from a raw identifier
pub const SERIAL_MASK: u32 = (1 << SERIAL_BITS) - 1;

/// Common behaviour of the typed identifiers
pub trait ResourceId: Copy + Eq + fmt::Debug {
    /// Kind base occupying the top byte
    const BASE: u32;

    /// Build an identifier from a serial in `1..=SERIAL_MASK`
    fn from_serial(serial: u32) -> Self;

    /// Raw 32-bit value
    fn raw(self) -> u32;

    /// Serial portion of the identifier
    fn serial(self) -> u32 {
        self.raw() & SERIAL_MASK
    }

    /// Array index of the identifier in a table of `capacity` slots
    fn to_index(self, capacity: usize) -> usize {
        self.serial() as usize % capacity
    }
}

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident, $base:expr, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(NonZeroU32);

        impl ResourceId for $name {
            const BASE: u32 = $base << SERIAL_BITS;

            fn from_serial(serial: u32) -> Self {
                let raw = Self::BASE | (serial & SERIAL_MASK);
                // BASE is non-zero, so raw is non-zero
                Self(NonZeroU32::new(raw).unwrap_or(NonZeroU32::MIN))
            }

            fn raw(self) -> u32 {
                self.0.get()
            }
        }

        impl $name {
            /// Decode a raw value, rejecting values of another kind or the undefined value
            pub fn from_raw(raw: u32) -> Option<Self> {
                if raw & !SERIAL_MASK != Self::BASE || raw & SERIAL_MASK == 0 {
                    return None;
                }
                NonZeroU32::new(raw).map(Self)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.serial())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010x}", self.raw())
            }
        }
    };
}

resource_id!(
    /// Identifier of a registry record
    RegId, 0x41, "reg"
);
resource_id!(
    /// Per-application handle onto a registered table
    TblHandle, 0x42, "handle"
);
resource_id!(
    /// Identifier of a shared load buffer
    LoadBufferId, 0x43, "loadbuf"
);
resource_id!(
    /// Identifier of a validation request
    ValResultId, 0x44, "valresult"
);
resource_id!(
    /// Identifier of a dump control block
    DumpCtrlId, 0x45, "dumpctrl"
);

/// Serial generator for one identifier kind
#[derive(Debug)]
pub struct IdSerial<K: ResourceId> {
    last: u32,
    _kind: std::marker::PhantomData<K>,
}

impl<K: ResourceId> Default for IdSerial<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ResourceId> IdSerial<K> {
    /// Create a generator starting before serial 1
    pub fn new() -> Self {
        Self {
            last: 0,
            _kind: std::marker::PhantomData,
        }
    }

    /// Create a generator that continues after `last`
    pub fn starting_after(last: u32) -> Self {
        Self {
            last: last & SERIAL_MASK,
            _kind: std::marker::PhantomData,
        }
    }

    /// Next identifier whose slot is free
    ///
    /// Tries `capacity` consecutive serials, restarting the count when the
    /// serial wraps so every slot is visited. Returns `None` when every slot
    /// is in use.
    pub fn next(&mut self, capacity: usize, is_used: impl Fn(usize) -> bool) -> Option<K> {
        let mut serial = self.last;
        let mut remaining = capacity;
        while remaining > 0 {
            if serial >= SERIAL_MASK {
                serial = 1;
                remaining = capacity;
            } else {
                serial += 1;
            }
            remaining -= 1;
            let id = K::from_serial(serial);
            if !is_used(id.to_index(capacity)) {
                self.last = serial;
                return Some(id);
            }
        }
        None
    }
}
