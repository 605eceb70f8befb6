use std::fmt;

/// An opaque machine word identifying one byte in the card table.
///
/// The queues never interpret the value; only the remembered-set layer
/// behind [`CardRefinery`](crate::refine::CardRefinery) does. This type
/// needs to be zero overhead (memory wise and time wise), so it is a
/// transparent wrapper over `usize`.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CardPtr(usize);

impl CardPtr {
    /// The zero card pointer. Used as the initial content of buffer slots;
    /// never a valid card.
    pub const ZERO: CardPtr = CardPtr(0);

    /// Wrap a raw card-table address.
    pub const fn from_usize(raw: usize) -> CardPtr {
        CardPtr(raw)
    }

    /// The raw card-table address.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for CardPtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for CardPtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
