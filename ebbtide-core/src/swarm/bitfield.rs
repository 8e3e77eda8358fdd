//! Compact piece bitmap shared between local completion tracking and peer
//! advertisements.

/// Fixed-length bit vector indexed by piece.
///
/// Bit `i` of the map is bit `7 - (i % 8)` of byte `i / 8`, matching the
/// wire layout of peer bitfield messages. Out-of-range reads return false;
/// out-of-range writes are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    len: u32,
}

impl Bitfield {
    /// Creates an all-zero bitfield for `len` pieces.
    pub fn new(len: u32) -> Self {
        Self {
            bytes: vec![0u8; len.div_ceil(8) as usize],
            len,
        }
    }

    /// Creates an all-set bitfield for `len` pieces.
    pub fn full(len: u32) -> Self {
        let mut field = Self::new(len);
        for index in 0..len {
            field.set(index);
        }
        field
    }

    /// Number of pieces this bitfield covers.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// True when the bitfield covers zero pieces.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns whether the bit for `index` is set.
    pub fn has(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        let byte = self.bytes[(index / 8) as usize];
        byte & (0x80 >> (index % 8)) != 0
    }

    /// Sets the bit for `index`. Returns true if the bit was newly set.
    pub fn set(&mut self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        let byte = &mut self.bytes[(index / 8) as usize];
        let mask = 0x80 >> (index % 8);
        let was_set = *byte & mask != 0;
        *byte |= mask;
        !was_set
    }

    /// Number of set bits.
    pub fn count_set(&self) -> u32 {
        self.bytes.iter().map(|b| b.count_ones()).sum()
    }

    /// True when every bit is set.
    pub fn is_all_set(&self) -> bool {
        self.count_set() == self.len
    }

    /// Iterates the indices whose bits are clear, in ascending order.
    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(|&i| !self.has(i))
    }

    /// Iterates the indices whose bits are set, in ascending order.
    pub fn set_indices(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(|&i| self.has(i))
    }

    /// Fraction of bits set, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.len == 0 {
            return 1.0;
        }
        f64::from(self.count_set()) / f64::from(self.len)
    }
}
