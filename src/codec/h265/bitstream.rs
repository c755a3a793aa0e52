//! Bit-level reader and writer for slice data
//!
//! The arithmetic coder emits whole bytes plus a final partial byte, so the
//! writer is bit-granular. Exp-Golomb helpers are provided for fixed-length
//! side information carried outside the arithmetic coded payload.
//!
//! ### Unsigned Exp-Golomb (ue(v))
//!
//! Format: [M zeros][1][M bits for value]
//!
//! - 0: `1`
//! - 1: `010`
//! - 2: `011`
//! - 3: `00100`

use crate::error::{Error, Result};

/// Bit reader over an RBSP byte slice
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    /// Bit position within the current byte (0 is MSB)
    bit_pos: u8,
}

impl<'a> BitReader<'a> {
    /// Create a new reader
    pub fn new(data: &'a [u8]) -> Self {
        BitReader {
            data,
            byte_pos: 0,
            bit_pos: 0,
        }
    }

    /// Current bit position in the stream
    pub fn position(&self) -> usize {
        self.byte_pos * 8 + self.bit_pos as usize
    }

    /// Number of bits not yet consumed
    pub fn bits_left(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.position())
    }

    /// True while unread bytes remain
    pub fn has_more_data(&self) -> bool {
        self.byte_pos < self.data.len()
    }

    /// Read a single bit
    pub fn read_bit(&mut self) -> Result<u8> {
        let byte = *self.data.get(self.byte_pos).ok_or(Error::EndOfStream)?;
        let bit = (byte >> (7 - self.bit_pos)) & 1;

        self.bit_pos += 1;
        if self.bit_pos == 8 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }

        Ok(bit)
    }

    /// Read N bits MSB first (N <= 32)
    pub fn read_bits(&mut self, n: u32) -> Result<u32> {
        if n > 32 {
            return Err(Error::invalid_input("Cannot read more than 32 bits at once"));
        }

        let mut value = 0u32;
        for _ in 0..n {
            value = (value << 1) | (self.read_bit()? as u32);
        }
        Ok(value)
    }

    /// Read one byte-aligned byte
    pub fn read_byte(&mut self) -> Result<u8> {
        if self.bit_pos != 0 {
            return Err(Error::codec("Byte read on unaligned position"));
        }
        let byte = *self.data.get(self.byte_pos).ok_or(Error::EndOfStream)?;
        self.byte_pos += 1;
        Ok(byte)
    }

    /// Read ue(v)
    pub fn read_ue(&mut self) -> Result<u32> {
        let mut leading_zeros = 0;
        while self.read_bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(Error::conformance("Exp-Golomb code too long (>31 leading zeros)"));
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let value_part = self.read_bits(leading_zeros)?;
        Ok(((1u64 << leading_zeros) - 1 + value_part as u64) as u32)
    }

    /// Read se(v)
    pub fn read_se(&mut self) -> Result<i32> {
        let unsigned = self.read_ue()?;
        let signed = if unsigned % 2 == 1 {
            ((unsigned / 2) + 1) as i32
        } else {
            -((unsigned / 2) as i32)
        };
        Ok(signed)
    }

    /// Skip to the next byte boundary
    pub fn byte_align(&mut self) {
        if self.bit_pos != 0 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }
    }

    /// Read rbsp_stop_one_bit followed by alignment zero bits
    pub fn read_rbsp_trailing_bits(&mut self) -> Result<()> {
        if self.read_bit()? != 1 {
            return Err(Error::conformance("RBSP trailing: stop bit is not 1"));
        }
        while self.bit_pos != 0 {
            if self.read_bit()? != 0 {
                return Err(Error::conformance("RBSP trailing: alignment bit is not 0"));
            }
        }
        Ok(())
    }
}

/// Bit writer producing an RBSP byte vector
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    buffer: Vec<u8>,
    current_byte: u8,
    /// Bits already written into `current_byte` (0-7)
    bit_position: u8,
}

impl BitWriter {
    /// Create a new writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a single bit
    pub fn write_bit(&mut self, bit: bool) {
        if bit {
            self.current_byte |= 1 << (7 - self.bit_position);
        }
        self.bit_position += 1;
        if self.bit_position == 8 {
            self.buffer.push(self.current_byte);
            self.current_byte = 0;
            self.bit_position = 0;
        }
    }

    /// Write the low `num_bits` bits of `value`, MSB first
    pub fn write_bits(&mut self, value: u32, num_bits: u32) {
        debug_assert!(num_bits <= 32);
        if self.bit_position == 0 && num_bits % 8 == 0 {
            for i in (0..num_bits / 8).rev() {
                self.buffer.push((value >> (i * 8)) as u8);
            }
            return;
        }
        for i in (0..num_bits).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    /// Write ue(v)
    pub fn write_ue(&mut self, value: u32) {
        let value_plus1 = value as u64 + 1;
        let len = 63 - value_plus1.leading_zeros();
        self.write_bits(0, len);
        for i in (0..=len).rev() {
            self.write_bit((value_plus1 >> i) & 1 == 1);
        }
    }

    /// Write se(v)
    pub fn write_se(&mut self, value: i32) {
        let mapped = if value <= 0 {
            (-(value as i64) * 2) as u32
        } else {
            (value as i64 * 2 - 1) as u32
        };
        self.write_ue(mapped);
    }

    /// True when the write position is byte aligned
    pub fn is_aligned(&self) -> bool {
        self.bit_position == 0
    }

    /// Pad with zero bits to the next byte boundary
    pub fn align_zero(&mut self) {
        while self.bit_position != 0 {
            self.write_bit(false);
        }
    }

    /// rbsp_stop_one_bit plus zero alignment
    pub fn write_rbsp_trailing_bits(&mut self) {
        self.write_bit(true);
        self.align_zero();
    }

    /// Number of bits written so far
    pub fn num_bits(&self) -> usize {
        self.buffer.len() * 8 + self.bit_position as usize
    }

    /// Bytes completed so far
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Zero-pad and return the written data
    pub fn finish(mut self) -> Vec<u8> {
        self.align_zero();
        self.buffer
    }
}
