//! CABAC (Context-Adaptive Binary Arithmetic Coding) engines
//!
//! Three engines share the same context models:
//!
//! - [`CabacWriter`]: arithmetic encoder producing slice data bytes
//! - [`CabacReader`]: arithmetic decoder consuming slice data bytes
//! - [`BinCounter`]: rate estimator that accumulates fractional bit costs
//!   from the current context states and writes nothing
//!
//! The writer and counter implement [`BinEncoder`], so any syntax routine
//! generic over `BinEncoder` can either emit bits or measure them.
//!
//! # Probability model
//!
//! Each context holds a 6-bit probability state for the least probable
//! symbol and the value of the most probable symbol. States advance through
//! fixed transition tables; the LPS sub-range comes from a 64x4 table
//! indexed by state and quantized range.

use super::bitstream::{BitReader, BitWriter};
use crate::error::{Error, Result};
use std::sync::OnceLock;

/// Fractional bits are fixed point with this many fraction bits
pub const FRAC_BITS_SHIFT: u32 = 15;

/// One bit in fractional-bit units
pub const FRAC_BITS_ONE: u64 = 1 << FRAC_BITS_SHIFT;

/// Zero bytes the decoder may consume past the end of its data
pub const MAX_OVERREAD_BYTES: u32 = 4;

/// Adaptive binary probability model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextModel {
    /// LPS probability state (0-63)
    state: u8,
    /// Most probable symbol (0 or 1)
    mps: u8,
}

impl Default for ContextModel {
    fn default() -> Self {
        Self::init(154, 26)
    }
}

impl ContextModel {
    /// Create a context from an explicit state and MPS
    pub fn new(state: u8, mps: u8) -> Self {
        Self {
            state: state.min(62),
            mps: mps & 1,
        }
    }

    /// Initialize from an 8-bit init value at the given slice QP
    pub fn init(init_value: u8, qp: i32) -> Self {
        let slope = ((init_value >> 4) as i32) * 5 - 45;
        let offset = (((init_value & 15) as i32) << 3) - 16;
        let qp = qp.clamp(0, 51);
        let init_state = (((slope * qp) >> 4) + offset).clamp(1, 126);

        if init_state >= 64 {
            Self {
                state: (init_state - 64) as u8,
                mps: 1,
            }
        } else {
            Self {
                state: (63 - init_state) as u8,
                mps: 0,
            }
        }
    }

    /// Probability state index
    #[inline]
    pub fn state(&self) -> u8 {
        self.state
    }

    /// Most probable symbol
    #[inline]
    pub fn mps(&self) -> u8 {
        self.mps
    }

    /// Advance after coding `bin`
    #[inline]
    pub fn update(&mut self, bin: u32) {
        if bin as u8 == self.mps {
            self.state = NEXT_STATE_MPS[self.state as usize];
        } else {
            if self.state == 0 {
                self.mps ^= 1;
            }
            self.state = NEXT_STATE_LPS[self.state as usize];
        }
    }

    /// Estimated cost of coding `bin` in this state, in fractional bits
    #[inline]
    pub fn entropy_bits(&self, bin: u32) -> u32 {
        let table = entropy_bits_table();
        if bin as u8 == self.mps {
            table[self.state as usize].0
        } else {
            table[self.state as usize].1
        }
    }
}

const NEXT_STATE_MPS: [u8; 64] = [
    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16,
    17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32,
    33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48,
    49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 62, 63,
];

const NEXT_STATE_LPS: [u8; 64] = [
    0, 0, 1, 2, 2, 4, 4, 5, 6, 7, 8, 9, 9, 11, 11, 12,
    13, 13, 15, 15, 16, 16, 18, 18, 19, 19, 21, 21, 22, 22, 23, 24,
    24, 25, 26, 26, 27, 27, 28, 29, 29, 30, 30, 30, 31, 32, 32, 33,
    33, 33, 34, 34, 35, 35, 35, 36, 36, 36, 37, 37, 37, 38, 38, 63,
];

/// LPS sub-range indexed by [state][(range >> 6) & 3]
const RANGE_TAB_LPS: [[u8; 4]; 64] = [
    [128, 176, 208, 240], [128, 167, 197, 227], [128, 158, 187, 216], [123, 150, 178, 205],
    [116, 142, 169, 195], [111, 135, 160, 185], [105, 128, 152, 175], [100, 122, 144, 166],
    [95, 116, 137, 158], [90, 110, 130, 150], [85, 104, 123, 142], [81, 99, 117, 135],
    [77, 94, 111, 128], [73, 89, 105, 122], [69, 85, 100, 116], [66, 80, 95, 110],
    [62, 76, 90, 104], [59, 72, 86, 99], [56, 69, 81, 94], [53, 65, 77, 89],
    [51, 62, 73, 85], [48, 59, 69, 80], [46, 56, 66, 76], [43, 53, 63, 72],
    [41, 50, 59, 69], [39, 48, 56, 65], [37, 45, 54, 62], [35, 43, 51, 59],
    [33, 41, 48, 56], [32, 39, 46, 53], [30, 37, 43, 50], [29, 35, 41, 48],
    [27, 33, 39, 45], [26, 31, 37, 43], [24, 30, 35, 41], [23, 28, 33, 39],
    [22, 27, 32, 37], [21, 26, 30, 35], [20, 24, 29, 33], [19, 23, 27, 31],
    [18, 22, 26, 30], [17, 21, 25, 28], [16, 20, 23, 27], [15, 19, 22, 25],
    [14, 18, 21, 24], [14, 17, 20, 23], [13, 16, 19, 22], [12, 15, 18, 21],
    [12, 14, 17, 20], [11, 14, 16, 19], [11, 13, 15, 18], [10, 12, 15, 17],
    [10, 12, 14, 16], [9, 11, 13, 15], [9, 11, 12, 14], [8, 10, 12, 14],
    [8, 9, 11, 13], [7, 9, 11, 12], [7, 9, 10, 12], [7, 8, 10, 11],
    [6, 8, 9, 11], [6, 7, 9, 10], [6, 7, 8, 9], [2, 2, 2, 2],
];

/// Renormalization shift indexed by lps >> 3
const RENORM_TABLE: [u8; 32] = [
    6, 5, 4, 4, 3, 3, 3, 3, 2, 2, 2, 2, 2, 2, 2, 2,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
];

/// (mps cost, lps cost) per state, derived from p_lps(s) = 0.5 * alpha^s
fn entropy_bits_table() -> &'static [(u32, u32); 64] {
    static TABLE: OnceLock<[(u32, u32); 64]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let alpha = (0.01875f64 / 0.5).powf(1.0 / 63.0);
        let scale = FRAC_BITS_ONE as f64;
        let mut table = [(0u32, 0u32); 64];
        for (s, entry) in table.iter_mut().enumerate() {
            let p_lps = 0.5 * alpha.powi(s as i32);
            let mps = -(1.0 - p_lps).log2() * scale;
            let lps = -p_lps.log2() * scale;
            *entry = (mps.round() as u32, lps.round() as u32);
        }
        table
    })
}

/// Encoder-side bin engine
pub trait BinEncoder {
    /// Code a context-modelled bin and update the context
    fn encode_bin(&mut self, bin: u32, ctx: &mut ContextModel);

    /// Code an equiprobable bin
    fn encode_bin_ep(&mut self, bin: u32);

    /// Code a terminating bin
    fn encode_bin_trm(&mut self, bin: u32);

    /// Code the low `num_bins` bits of `value` as bypass bins, MSB first
    fn encode_bins_ep(&mut self, value: u32, num_bins: u32) {
        for i in (0..num_bins).rev() {
            self.encode_bin_ep((value >> i) & 1);
        }
    }

    /// Bits produced or estimated so far, in fractional-bit units
    fn frac_bits(&self) -> u64;
}

/// Decoder-side bin engine
pub trait BinDecoder {
    /// Decode a context-modelled bin and update the context
    fn decode_bin(&mut self, ctx: &mut ContextModel) -> Result<u32>;

    /// Decode an equiprobable bin
    fn decode_bin_ep(&mut self) -> Result<u32>;

    /// Decode a terminating bin
    fn decode_bin_trm(&mut self) -> Result<u32>;

    /// Decode `num_bins` bypass bins, MSB first
    fn decode_bins_ep(&mut self, num_bins: u32) -> Result<u32> {
        let mut value = 0u32;
        for _ in 0..num_bins {
            value = (value << 1) | self.decode_bin_ep()?;
        }
        Ok(value)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Arithmetic encoder
// ─────────────────────────────────────────────────────────────────────────────

/// Arithmetic encoder with carry propagation through buffered 0xFF bytes
#[derive(Debug, Clone)]
pub struct CabacWriter {
    low: u32,
    range: u32,
    bits_left: i32,
    buffered_byte: u32,
    num_buffered_bytes: u32,
    writer: BitWriter,
    /// Last coded bin was a terminating 1
    terminated: bool,
}

impl Default for CabacWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl CabacWriter {
    /// Start a new arithmetic codeword
    pub fn new() -> Self {
        Self {
            low: 0,
            range: 510,
            bits_left: 23,
            buffered_byte: 0xFF,
            num_buffered_bytes: 0,
            writer: BitWriter::new(),
            terminated: false,
        }
    }

    /// Bits written, including buffered and pending bits
    pub fn num_written_bits(&self) -> u64 {
        self.writer.num_bits() as u64
            + 8 * self.num_buffered_bytes as u64
            + (23 - self.bits_left) as u64
    }

    #[inline]
    fn test_and_write_out(&mut self) {
        if self.bits_left < 12 {
            self.write_out();
        }
    }

    fn write_out(&mut self) {
        let lead_byte = self.low >> (24 - self.bits_left);
        self.bits_left += 8;
        self.low &= 0xFFFF_FFFFu32 >> self.bits_left;

        if lead_byte == 0xFF {
            self.num_buffered_bytes += 1;
        } else if self.num_buffered_bytes > 0 {
            let carry = lead_byte >> 8;
            let byte = self.buffered_byte + carry;
            self.buffered_byte = lead_byte & 0xFF;
            self.writer.write_bits(byte, 8);

            let byte = (0xFF + carry) & 0xFF;
            while self.num_buffered_bytes > 1 {
                self.writer.write_bits(byte, 8);
                self.num_buffered_bytes -= 1;
            }
        } else {
            self.num_buffered_bytes = 1;
            self.buffered_byte = lead_byte;
        }
    }

    /// Flush the arithmetic codeword into the bit writer
    pub fn flush(&mut self) {
        if (self.low >> (32 - self.bits_left)) != 0 {
            self.writer.write_bits(self.buffered_byte + 1, 8);
            while self.num_buffered_bytes > 1 {
                self.writer.write_bits(0x00, 8);
                self.num_buffered_bytes -= 1;
            }
            self.low -= 1 << (32 - self.bits_left);
        } else {
            if self.num_buffered_bytes > 0 {
                self.writer.write_bits(self.buffered_byte, 8);
            }
            while self.num_buffered_bytes > 1 {
                self.writer.write_bits(0xFF, 8);
                self.num_buffered_bytes -= 1;
            }
        }
        self.writer
            .write_bits(self.low >> 8, (24 - self.bits_left) as u32);
        self.num_buffered_bytes = 0;
    }

    /// Flush and append RBSP trailing bits
    ///
    /// The caller must code a terminating bin of value 1 first (for example
    /// `end_of_slice_segment_flag`); without it the decoder reads stale low bits.
    pub fn finish(mut self) -> Vec<u8> {
        debug_assert!(self.terminated, "CABAC stream finished without a terminating bin");
        self.flush();
        self.writer.write_rbsp_trailing_bits();
        self.writer.finish()
    }
}

impl BinEncoder for CabacWriter {
    fn encode_bin(&mut self, bin: u32, ctx: &mut ContextModel) {
        self.terminated = false;
        let lps = RANGE_TAB_LPS[ctx.state() as usize][((self.range >> 6) & 3) as usize] as u32;
        self.range -= lps;

        if bin as u8 != ctx.mps() {
            let num_bits = RENORM_TABLE[(lps >> 3) as usize] as i32;
            self.low = (self.low + self.range) << num_bits;
            self.range = lps << num_bits;
            self.bits_left -= num_bits;
            ctx.update(bin);
        } else {
            ctx.update(bin);
            if self.range >= 256 {
                return;
            }
            self.low <<= 1;
            self.range <<= 1;
            self.bits_left -= 1;
        }
        self.test_and_write_out();
    }

    fn encode_bin_ep(&mut self, bin: u32) {
        self.terminated = false;
        self.low <<= 1;
        if bin != 0 {
            self.low += self.range;
        }
        self.bits_left -= 1;
        self.test_and_write_out();
    }

    fn encode_bin_trm(&mut self, bin: u32) {
        self.terminated = bin != 0;
        self.range -= 2;
        if bin != 0 {
            self.low += self.range;
            self.low <<= 7;
            self.range = 2 << 7;
            self.bits_left -= 7;
        } else if self.range >= 256 {
            return;
        } else {
            self.low <<= 1;
            self.range <<= 1;
            self.bits_left -= 1;
        }
        self.test_and_write_out();
    }

    fn frac_bits(&self) -> u64 {
        self.num_written_bits() << FRAC_BITS_SHIFT
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Arithmetic decoder
// ─────────────────────────────────────────────────────────────────────────────

/// Arithmetic decoder over a slice data byte slice
pub struct CabacReader<'a> {
    reader: BitReader<'a>,
    range: u32,
    value: u32,
    bits_needed: i32,
    overread: u32,
}

impl<'a> CabacReader<'a> {
    /// Initialize the decoder from the first two bytes of `data`
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::invalid_input("Empty CABAC data"));
        }
        let mut decoder = Self {
            reader: BitReader::new(data),
            range: 510,
            value: 0,
            bits_needed: -8,
            overread: 0,
        };
        let high = decoder.next_byte()?;
        let low = decoder.next_byte()?;
        decoder.value = (high << 8) | low;
        Ok(decoder)
    }

    /// Zero bytes substituted past the end of the data so far
    pub fn overread_bytes(&self) -> u32 {
        self.overread
    }

    fn next_byte(&mut self) -> Result<u32> {
        if self.reader.has_more_data() {
            return Ok(self.reader.read_byte()? as u32);
        }
        self.overread += 1;
        if self.overread > MAX_OVERREAD_BYTES {
            return Err(Error::EndOfStream);
        }
        Ok(0)
    }
}

impl BinDecoder for CabacReader<'_> {
    fn decode_bin(&mut self, ctx: &mut ContextModel) -> Result<u32> {
        let lps = RANGE_TAB_LPS[ctx.state() as usize][((self.range >> 6) & 3) as usize] as u32;
        self.range -= lps;
        let scaled_range = self.range << 7;

        let bin;
        if self.value < scaled_range {
            bin = ctx.mps() as u32;
            ctx.update(bin);
            if scaled_range < (256 << 7) {
                self.range = scaled_range >> 6;
                self.value <<= 1;
                self.bits_needed += 1;
                if self.bits_needed == 0 {
                    self.bits_needed = -8;
                    self.value += self.next_byte()?;
                }
            }
        } else {
            let num_bits = RENORM_TABLE[(lps >> 3) as usize] as i32;
            self.value = (self.value - scaled_range) << num_bits;
            self.range = lps << num_bits;
            bin = 1 - ctx.mps() as u32;
            ctx.update(bin);
            self.bits_needed += num_bits;
            if self.bits_needed >= 0 {
                self.value += self.next_byte()? << self.bits_needed;
                self.bits_needed -= 8;
            }
        }
        Ok(bin)
    }

    fn decode_bin_ep(&mut self) -> Result<u32> {
        self.value <<= 1;
        self.bits_needed += 1;
        if self.bits_needed >= 0 {
            self.bits_needed = -8;
            self.value += self.next_byte()?;
        }

        let scaled_range = self.range << 7;
        if self.value >= scaled_range {
            self.value -= scaled_range;
            Ok(1)
        } else {
            Ok(0)
        }
    }

    fn decode_bin_trm(&mut self) -> Result<u32> {
        self.range -= 2;
        let scaled_range = self.range << 7;
        if self.value >= scaled_range {
            return Ok(1);
        }
        if scaled_range < (256 << 7) {
            self.range = scaled_range >> 6;
            self.value <<= 1;
            self.bits_needed += 1;
            if self.bits_needed == 0 {
                self.bits_needed = -8;
                self.value += self.next_byte()?;
            }
        }
        Ok(0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rate estimator
// ─────────────────────────────────────────────────────────────────────────────

/// Bin engine that accumulates estimated bits instead of writing them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinCounter {
    frac_bits: u64,
}

impl BinCounter {
    /// Create a counter at zero bits
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to zero bits
    pub fn reset(&mut self) {
        self.frac_bits = 0;
    }

    /// Estimated whole bits, rounded
    pub fn bits(&self) -> u64 {
        (self.frac_bits + (FRAC_BITS_ONE >> 1)) >> FRAC_BITS_SHIFT
    }
}

impl BinEncoder for BinCounter {
    fn encode_bin(&mut self, bin: u32, ctx: &mut ContextModel) {
        self.frac_bits += ctx.entropy_bits(bin) as u64;
        ctx.update(bin);
    }

    fn encode_bin_ep(&mut self, _bin: u32) {
        self.frac_bits += FRAC_BITS_ONE;
    }

    fn encode_bins_ep(&mut self, _value: u32, num_bins: u32) {
        self.frac_bits += FRAC_BITS_ONE * num_bins as u64;
    }

    fn encode_bin_trm(&mut self, bin: u32) {
        // Terminating bins behave like a context pinned at state 62, MPS 0
        self.frac_bits += ContextModel::new(62, 0).entropy_bits(bin) as u64;
    }

    fn frac_bits(&self) -> u64 {
        self.frac_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_init() {
        // init value 154 is the equiprobable default at every QP
        for qp in [0, 22, 37, 51] {
            let ctx = ContextModel::init(154, qp);
            assert_eq!(ctx.state(), 0);
            assert_eq!(ctx.mps(), 1);
        }
        let ctx = ContextModel::init(63, 26);
        assert_eq!(ctx.mps(), 0);
    }

    #[test]
    fn test_context_update() {
        let mut ctx = ContextModel::new(0, 0);
        ctx.update(1);
        assert_eq!(ctx.mps(), 1);
        assert_eq!(ctx.state(), 0);
        ctx.update(1);
        assert_eq!(ctx.state(), 1);
        let mut saturated = ContextModel::new(62, 1);
        saturated.update(1);
        assert_eq!(saturated.state(), 62);
    }

    #[test]
    fn test_entropy_bits_monotonic() {
        let equiprobable = ContextModel::new(0, 0);
        let lo = equiprobable.entropy_bits(0) as i64;
        assert!((lo - FRAC_BITS_ONE as i64).abs() < 8);

        let skewed = ContextModel::new(40, 0);
        assert!(skewed.entropy_bits(0) < skewed.entropy_bits(1));
        assert!(skewed.entropy_bits(0) < equiprobable.entropy_bits(0));
    }

    fn roundtrip(bins: &[(u32, bool)]) {
        let mut enc_ctx = [ContextModel::init(140, 30); 4];
        let mut writer = CabacWriter::new();
        for (i, &(bin, bypass)) in bins.iter().enumerate() {
            if bypass {
                writer.encode_bin_ep(bin);
            } else {
                writer.encode_bin(bin, &mut enc_ctx[i % 4]);
            }
        }
        writer.encode_bin_trm(1);
        let data = writer.finish();

        let mut dec_ctx = [ContextModel::init(140, 30); 4];
        let mut reader = CabacReader::new(&data).unwrap();
        for (i, &(bin, bypass)) in bins.iter().enumerate() {
            let decoded = if bypass {
                reader.decode_bin_ep().unwrap()
            } else {
                reader.decode_bin(&mut dec_ctx[i % 4]).unwrap()
            };
            assert_eq!(decoded, bin, "bin {} mismatch", i);
        }
        assert_eq!(reader.decode_bin_trm().unwrap(), 1);
        assert_eq!(enc_ctx, dec_ctx);
    }

    #[test]
    fn test_roundtrip_skewed() {
        let bins: Vec<(u32, bool)> = (0..2000).map(|i| ((i % 13 == 0) as u32, false)).collect();
        roundtrip(&bins);
    }

    #[test]
    fn test_roundtrip_mixed() {
        let mut seed = 0x1234_5678u32;
        let bins: Vec<(u32, bool)> = (0..3000)
            .map(|_| {
                seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                ((seed >> 16) & 1, (seed >> 20) & 3 == 0)
            })
            .collect();
        roundtrip(&bins);
    }

    #[test]
    fn test_roundtrip_carry_chain() {
        // Long runs of LPS bins drive low toward carry propagation
        let bins: Vec<(u32, bool)> = (0..4000).map(|i| (((i / 7) % 2) as u32, i % 5 == 0)).collect();
        roundtrip(&bins);
    }

    #[test]
    fn test_multi_bin_bypass() {
        let mut writer = CabacWriter::new();
        writer.encode_bins_ep(0b1011_0110_1, 9);
        writer.encode_bins_ep(0xFFFF, 16);
        writer.encode_bin_trm(1);
        let data = writer.finish();

        let mut reader = CabacReader::new(&data).unwrap();
        assert_eq!(reader.decode_bins_ep(9).unwrap(), 0b1011_0110_1);
        assert_eq!(reader.decode_bins_ep(16).unwrap(), 0xFFFF);
        assert_eq!(reader.decode_bin_trm().unwrap(), 1);
    }

    #[test]
    fn test_empty_data_rejected() {
        assert!(CabacReader::new(&[]).is_err());
    }

    #[test]
    fn test_overread_limit() {
        let data = [0u8];
        let mut reader = CabacReader::new(&data).unwrap();
        let mut result = Ok(0);
        for _ in 0..200 {
            result = reader.decode_bin_ep();
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(Error::EndOfStream));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "terminating bin")]
    fn test_finish_requires_terminating_bin() {
        let mut writer = CabacWriter::new();
        writer.encode_bins_ep(0b101, 3);
        writer.encode_bin_trm(0);
        let _ = writer.finish();
    }

    #[test]
    fn test_counter_matches_bypass() {
        let mut counter = BinCounter::new();
        counter.encode_bins_ep(0, 5);
        counter.encode_bin_ep(1);
        assert_eq!(counter.bits(), 6);
        assert_eq!(counter.frac_bits(), 6 * FRAC_BITS_ONE);
    }

    #[test]
    fn test_counter_updates_contexts() {
        let mut ctx = ContextModel::init(154, 26);
        let mut counter = BinCounter::new();
        for _ in 0..20 {
            counter.encode_bin(1, &mut ctx);
        }
        assert!(ctx.state() > 10);
        assert!(counter.bits() < 20);
    }
}
