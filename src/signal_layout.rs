/*!
 * Defines the layout in bits of a big-endian signal so that it can be reused to pack/unpack into bytes
 */

/// One contiguous span of bits within a single byte of the CAN frame data.
///
/// Describes a mapping: "take `num_bits` consecutive bits starting at
/// `bit_offset` in `data[byte_index]`, and place them at `value_shift`
/// in the raw u64 value."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitSpan {
    pub byte_index: usize,
    /// Lowest bit position within the byte (0..=7).
    pub bit_offset: u8,
    /// How many consecutive bits in this span (1..=8).
    pub num_bits: u8,
    /// Where these bits land in the raw u64, LSB-relative.
    pub value_shift: u8,
}

/// Precomputed mapping from a Motorola (big-endian) signal's bit positions to frame data bytes.
///
/// The same layout is used by both `extract` (decode) and `pack` (encode),
/// so they are inverses by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalLayout {
    pub segments: Vec<BitSpan>,
    pub signal_size: u64,
}

impl SignalLayout {
    /// Build a layout for a big-endian signal whose MSB sits at `start_bit`
    /// (DBC numbering: bit `b` of byte `n` is `8 * n + b`).
    pub fn big_endian(start_bit: u64, signal_size: u64) -> Self {
        let mut segments = Vec::new();
        let mut byte_index = (start_bit / 8) as usize;
        let mut bit_index = (start_bit % 8) as u8;
        let mut remaining = signal_size;

        // Walk downward within each byte, then move to next byte at bit 7.
        // First bits extracted are the MSB of the raw value.
        while remaining > 0 {
            let num_bits = std::cmp::min(bit_index as u64 + 1, remaining) as u8;
            let bit_offset = bit_index + 1 - num_bits;
            remaining -= num_bits as u64;
            segments.push(BitSpan {
                byte_index,
                bit_offset,
                num_bits,
                value_shift: remaining as u8,
            });
            byte_index += 1;
            bit_index = 7;
        }

        Self {
            segments,
            signal_size,
        }
    }

    /// Build a layout from a DBC signal. Intel (little-endian) signals are
    /// not part of the harness wire format and yield `None`.
    pub fn from_spec(spec: &can_dbc::Signal) -> Option<Self> {
        match spec.byte_order() {
            can_dbc::ByteOrder::BigEndian => Some(Self::big_endian(spec.start_bit, spec.signal_size)),
            can_dbc::ByteOrder::LittleEndian => None,
        }
    }

    /// Index of the first byte touched by the signal.
    pub fn first_byte(&self) -> usize {
        self.segments.first().map_or(0, |span| span.byte_index)
    }

    /// One past the last byte touched by the signal.
    pub fn end_byte(&self) -> usize {
        self.segments.last().map_or(0, |span| span.byte_index + 1)
    }

    /// True when the signal fills whole bytes, MSB first.
    pub fn is_byte_aligned(&self) -> bool {
        self.segments
            .iter()
            .all(|span| span.bit_offset == 0 && span.num_bits == 8)
    }

    /// Extract the raw unsigned value from the CAN frame data bytes.
    ///
    /// Callers must have checked that `data` covers `end_byte()`.
    pub fn extract(&self, data: &[u8]) -> u64 {
        let mut result: u64 = 0;
        for span in &self.segments {
            let mask = ((1u16 << span.num_bits) - 1) as u8;
            let bits = (data[span.byte_index] >> span.bit_offset) & mask;
            result |= (bits as u64) << span.value_shift;
        }
        result
    }

    /// Pack a raw unsigned value into the CAN frame data bytes.
    ///
    /// Clears target bits before writing so that multiple signals can be
    /// packed into the same frame.
    pub fn pack(&self, data: &mut [u8], raw: u64) {
        for span in &self.segments {
            let mask = ((1u16 << span.num_bits) - 1) as u8;
            let bits = ((raw >> span.value_shift) as u8) & mask;
            data[span.byte_index] &= !(mask << span.bit_offset);
            data[span.byte_index] |= bits << span.bit_offset;
        }
    }

    /// Interpret a raw value as two's complement of `signal_size` bits.
    pub fn sign_extend(&self, raw: u64) -> i64 {
        let shift_len = 64 - self.signal_size;
        ((raw as i64) << shift_len) >> shift_len
    }
}
