//! Run-length compression for fixed-size raster blocks.
//!
//! The codec is independent of the schema engine: it sees a block as a flat
//! array of 1/2/4/8/16/32-bit samples, encodes maximal runs of equal values
//! into a "counts" stream of variable-length run tokens and a "values"
//! stream of minimum-relative values, and rejects compression whenever the
//! result would not shrink the block. The caller persists the two streams
//! together with a 13-byte header built from the scalar results.

use byteorder::{ByteOrder, LittleEndian};
use log::trace;

use super::error::{HfaError, Result};

/// Bytes of the logical block header the caller stores alongside the two
/// streams (minimum value, run count, values offset, bits per value). The
/// codec itself never writes it, but it charges for it when deciding whether
/// compression shrinks the block.
pub const BLOCK_HEADER_SIZE: usize = 13;

/// Whether blocks of the given sample bit depth can be run-length
/// compressed. Anything else must be stored uncompressed.
pub fn supported(bits: usize) -> bool {
    matches!(bits, 1 | 2 | 4 | 8 | 16 | 32)
}

/// The product of a successful compression.
#[derive(Debug, Clone)]
pub struct CompressedBlock {
    counts: Vec<u8>,
    values: Vec<u8>,
    min: u32,
    num_runs: u32,
    value_bits: u8,
}

impl CompressedBlock {
    /// The run-count token stream.
    pub fn counts(&self) -> &[u8] {
        &self.counts
    }

    /// The minimum-relative value stream.
    pub fn values(&self) -> &[u8] {
        &self.values
    }

    /// Minimum sample value of the block; every entry of the value stream is
    /// relative to it.
    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn num_runs(&self) -> u32 {
        self.num_runs
    }

    /// Output width of each value-stream entry: 8, 16, or 32 bits.
    pub fn value_bits(&self) -> u8 {
        self.value_bits
    }

    /// Total compressed size, header charge included.
    pub fn total_size(&self) -> usize {
        self.counts.len() + self.values.len() + BLOCK_HEADER_SIZE
    }
}

/// Read the `i`-th sample of `block` as an unsigned 32-bit value.
fn get_sample(block: &[u8], i: usize, bits: usize) -> u32 {
    match bits {
        1 | 2 | 4 => {
            let bit = i * bits;
            let mask = (1u16 << bits) as u8 - 1;
            ((block[bit / 8] >> (bit % 8)) & mask) as u32
        }
        8 => block[i] as u32,
        16 => LittleEndian::read_u16(&block[i * 2..]) as u32,
        32 => LittleEndian::read_u32(&block[i * 4..]),
        _ => unreachable!("unsupported bit depth"),
    }
}

/// Write the `i`-th sample of `block`, the reverse of [`get_sample`].
fn put_sample(block: &mut [u8], i: usize, bits: usize, value: u32) {
    match bits {
        1 | 2 | 4 => {
            let bit = i * bits;
            let shift = bit % 8;
            let mask = ((1u16 << bits) as u8 - 1) << shift;
            let byte = &mut block[bit / 8];
            *byte = (*byte & !mask) | (((value as u8) << shift) & mask);
        }
        8 => block[i] = value as u8,
        16 => LittleEndian::write_u16(&mut block[i * 2..], value as u16),
        32 => LittleEndian::write_u32(&mut block[i * 4..], value),
        _ => unreachable!("unsupported bit depth"),
    }
}

/// Append one variable-length run-count token.
///
/// The top two bits of the first byte select the token width, leaving 6,
/// 14, 22, or 30 payload bits for the count itself, big-endian.
fn push_count(counts: &mut Vec<u8>, count: u32) {
    if count < 0x40 {
        counts.push(count as u8);
    } else if count < 0x4000 {
        counts.push(0x40 | (count >> 8) as u8);
        counts.push(count as u8);
    } else if count < 0x40_0000 {
        counts.push(0x80 | (count >> 16) as u8);
        counts.push((count >> 8) as u8);
        counts.push(count as u8);
    } else {
        counts.push(0xC0 | (count >> 24) as u8);
        counts.push((count >> 16) as u8);
        counts.push((count >> 8) as u8);
        counts.push(count as u8);
    }
}

/// Decode one run-count token, returning the count and the bytes consumed.
fn read_count(counts: &[u8], at: usize) -> Result<(u32, usize)> {
    let first = *counts.get(at).ok_or(HfaError::Bounds {
        context: "run count stream",
        needed: at + 1,
        available: counts.len(),
    })?;
    let extra = (first >> 6) as usize;
    let tail = counts.get(at + 1..at + 1 + extra).ok_or(HfaError::Bounds {
        context: "run count stream",
        needed: at + 1 + extra,
        available: counts.len(),
    })?;
    let mut count = (first & 0x3F) as u32;
    for &b in tail {
        count = (count << 8) | b as u32;
    }
    Ok((count, 1 + extra))
}

/// Append one minimum-relative value in the chosen output width.
fn push_value(values: &mut Vec<u8>, value: u32, value_bits: u8) {
    match value_bits {
        8 => values.push(value as u8),
        16 => {
            let mut buf = [0u8; 2];
            LittleEndian::write_u16(&mut buf, value as u16);
            values.extend_from_slice(&buf);
        }
        _ => {
            let mut buf = [0u8; 4];
            LittleEndian::write_u32(&mut buf, value);
            values.extend_from_slice(&buf);
        }
    }
}

/// Compress one raster block of `bits`-deep samples.
///
/// Returns `None` when compression is rejected: either the depth is not
/// run-length compressible, or the compressed form (header charge included)
/// would not be strictly smaller than the raw block. Rejection is a normal
/// outcome; the caller stores the block uncompressed.
pub fn compress(block: &[u8], bits: usize) -> Option<CompressedBlock> {
    if !supported(bits) || block.is_empty() {
        return None;
    }
    let num_samples = block.len() * 8 / bits;
    if num_samples == 0 {
        return None;
    }
    // A run length must fit the widest token's 30 payload bits.
    if num_samples >= 0x4000_0000 {
        return None;
    }

    // First pass: value range decides the output width.
    let mut min = u32::MAX;
    let mut max = 0u32;
    for i in 0..num_samples {
        let v = get_sample(block, i, bits);
        min = min.min(v);
        max = max.max(v);
    }
    let range = max - min;
    let value_bits: u8 = if range <= 0xFF {
        8
    } else if range <= 0xFFFF {
        16
    } else {
        32
    };

    // Second pass: emit one token and one value per maximal run. Bail out
    // as soon as the value stream alone outgrows the raw block.
    let mut counts = Vec::new();
    let mut values = Vec::new();
    let mut num_runs = 0u32;
    let mut run_value = get_sample(block, 0, bits);
    let mut run_len = 1u32;
    for i in 1..=num_samples {
        let v = if i < num_samples {
            get_sample(block, i, bits)
        } else {
            // Sentinel different from the open run, forcing a flush.
            !run_value
        };
        if v == run_value && i < num_samples {
            run_len += 1;
            continue;
        }
        push_count(&mut counts, run_len);
        push_value(&mut values, run_value - min, value_bits);
        num_runs += 1;
        if values.len() > block.len() {
            trace!("run-length rejected: value stream exceeds raw block");
            return None;
        }
        run_value = v;
        run_len = 1;
    }

    let total = counts.len() + values.len() + BLOCK_HEADER_SIZE;
    if total >= block.len() {
        trace!(
            "run-length rejected: {} bytes does not shrink {}-byte block",
            total,
            block.len()
        );
        return None;
    }

    trace!(
        "run-length compressed {} bytes to {} ({} runs, {}-bit values)",
        block.len(),
        total,
        num_runs,
        value_bits
    );
    Some(CompressedBlock {
        counts,
        values,
        min,
        num_runs,
        value_bits,
    })
}

/// Decompress the two streams produced by [`compress`] back into a raw
/// block of `sample_count` samples at `bits` depth.
///
/// # Errors
/// Fails if either stream is truncated, a run overruns the expected sample
/// count, or the streams do not cover it exactly.
pub fn decompress(
    counts: &[u8],
    values: &[u8],
    min: u32,
    num_runs: u32,
    value_bits: u8,
    bits: usize,
    sample_count: usize,
) -> Result<Vec<u8>> {
    if !supported(bits) {
        return Err(HfaError::InvalidFormat(format!(
            "bit depth {} is not run-length compressible",
            bits
        )));
    }
    if !matches!(value_bits, 8 | 16 | 32) {
        return Err(HfaError::InvalidFormat(format!(
            "bad value width {} in compressed block",
            value_bits
        )));
    }
    let mut block = vec![0u8; (sample_count * bits).div_ceil(8)];
    let mut count_at = 0usize;
    let value_width = value_bits as usize / 8;
    let mut sample = 0usize;
    for run in 0..num_runs as usize {
        let (run_len, used) = read_count(counts, count_at)?;
        count_at += used;
        let at = run * value_width;
        let relative = match value_bits {
            8 => *values.get(at).ok_or(HfaError::Bounds {
                context: "value stream",
                needed: at + 1,
                available: values.len(),
            })? as u32,
            16 => values
                .get(at..at + 2)
                .map(LittleEndian::read_u16)
                .ok_or(HfaError::Bounds {
                    context: "value stream",
                    needed: at + 2,
                    available: values.len(),
                })? as u32,
            _ => values
                .get(at..at + 4)
                .map(LittleEndian::read_u32)
                .ok_or(HfaError::Bounds {
                    context: "value stream",
                    needed: at + 4,
                    available: values.len(),
                })?,
        };
        let value = min.wrapping_add(relative);
        if sample + run_len as usize > sample_count {
            return Err(HfaError::InvalidFormat(format!(
                "run of {} overruns {}-sample block",
                run_len, sample_count
            )));
        }
        for _ in 0..run_len {
            put_sample(&mut block, sample, bits, value);
            sample += 1;
        }
    }
    if sample != sample_count {
        return Err(HfaError::InvalidFormat(format!(
            "runs cover {} of {} samples",
            sample, sample_count
        )));
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_depths() {
        for bits in [1, 2, 4, 8, 16, 32] {
            assert!(supported(bits), "{} bits", bits);
        }
        for bits in [0, 3, 64, 12] {
            assert!(!supported(bits), "{} bits", bits);
        }
    }

    #[test]
    fn count_tokens_use_tiered_widths() {
        let mut counts = Vec::new();
        push_count(&mut counts, 0x3F);
        push_count(&mut counts, 0x40);
        push_count(&mut counts, 0x3FFF);
        push_count(&mut counts, 0x4000);
        push_count(&mut counts, 0x3F_FFFF);
        push_count(&mut counts, 0x40_0000);
        push_count(&mut counts, 0x0100_0000);
        assert_eq!(
            counts,
            vec![
                0x3F, // one byte, tag 00
                0x40, 0x40, // two bytes, tag 01
                0x7F, 0xFF, // two-byte tier maximum
                0x80, 0x40, 0x00, // three bytes, tag 10
                0xBF, 0xFF, 0xFF, // three-byte tier maximum
                0xC0, 0x40, 0x00, 0x00, // four bytes, tag 11
                0xC1, 0x00, 0x00, 0x00,
            ]
        );
        let mut at = 0;
        for expect in [
            0x3F,
            0x40,
            0x3FFF,
            0x4000,
            0x3F_FFFF,
            0x40_0000,
            0x0100_0000u32,
        ] {
            let (count, used) = read_count(&counts, at).unwrap();
            assert_eq!(count, expect);
            at += used;
        }
        assert_eq!(at, counts.len());
    }

    #[test]
    fn run_spanning_a_tier_boundary_round_trips() {
        // 0x4000 equal samples: the first count past the two-byte tier.
        let block = vec![5u8; 0x4000];
        let c = compress(&block, 8).expect("constant block must compress");
        assert_eq!(c.num_runs(), 1);
        assert_eq!(c.counts(), &[0x80, 0x40, 0x00]);
        let back = decompress(
            c.counts(),
            c.values(),
            c.min(),
            c.num_runs(),
            c.value_bits(),
            8,
            0x4000,
        )
        .unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn constant_block_collapses_to_one_run() {
        let block = vec![7u8; 1000];
        let c = compress(&block, 8).expect("constant block must compress");
        assert_eq!(c.num_runs(), 1);
        assert_eq!(c.min(), 7);
        assert_eq!(c.value_bits(), 8);
        assert_eq!(c.values(), &[0]);
        // 1000 = 0x3E8: two-byte token with tag 01.
        assert_eq!(c.counts(), &[0x43, 0xE8]);
        assert!(c.total_size() < 100);

        let back = decompress(c.counts(), c.values(), c.min(), c.num_runs(), c.value_bits(), 8, 1000)
            .unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn sixty_four_repeats_use_second_tier_token() {
        let block = vec![7u8; 64];
        let c = compress(&block, 8).expect("must compress");
        assert_eq!(c.num_runs(), 1);
        assert_eq!(c.min(), 7);
        // 64 is the first value past the one-byte tier.
        assert_eq!(c.counts(), &[0x40, 0x40]);
        assert_eq!(c.values(), &[0]);
    }

    #[test]
    fn all_distinct_block_is_rejected() {
        let block: Vec<u8> = (0..=255).collect();
        assert!(compress(&block, 8).is_none());
    }

    #[test]
    fn wide_range_selects_wider_values() {
        let mut block = vec![0u8; 4 * 64];
        for i in 0..64 {
            let v = if i < 32 { 5u32 } else { 0x0001_0005 };
            LittleEndian::write_u32(&mut block[i * 4..], v);
        }
        let c = compress(&block, 32).expect("two runs must compress");
        assert_eq!(c.num_runs(), 2);
        assert_eq!(c.min(), 5);
        assert_eq!(c.value_bits(), 32);
        let back = decompress(c.counts(), c.values(), c.min(), c.num_runs(), c.value_bits(), 32, 64)
            .unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn sub_byte_depths_round_trip() {
        for bits in [1usize, 2, 4] {
            let mut block = vec![0u8; 64];
            let samples = block.len() * 8 / bits;
            // Long runs of alternating low values.
            for i in 0..samples {
                let v = if i < samples / 2 { 1 } else { 0 };
                put_sample(&mut block, i, bits, v);
            }
            let c = compress(&block, bits).unwrap_or_else(|| panic!("{} bits must compress", bits));
            assert_eq!(c.num_runs(), 2);
            let back = decompress(
                c.counts(),
                c.values(),
                c.min(),
                c.num_runs(),
                c.value_bits(),
                bits,
                samples,
            )
            .unwrap();
            assert_eq!(back, block, "{} bits", bits);
        }
    }

    #[test]
    fn sixteen_bit_values_standardized_little_endian() {
        let mut block = vec![0u8; 2 * 512];
        for i in 0..512 {
            let v = if i < 400 { 0x0102u16 } else { 0x0304 };
            LittleEndian::write_u16(&mut block[i * 2..], v);
        }
        let c = compress(&block, 16).expect("two runs must compress");
        assert_eq!(c.num_runs(), 2);
        assert_eq!(c.min(), 0x0102);
        assert_eq!(c.value_bits(), 16);
        // Values are minimum-relative and little-endian on the wire.
        assert_eq!(c.values(), &[0x00, 0x00, 0x02, 0x02]);
        let back = decompress(c.counts(), c.values(), c.min(), c.num_runs(), c.value_bits(), 16, 512)
            .unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn truncated_streams_fail_decompress() {
        let block = vec![9u8; 100];
        let c = compress(&block, 8).unwrap();
        assert!(decompress(&[], c.values(), c.min(), c.num_runs(), c.value_bits(), 8, 100).is_err());
        assert!(decompress(c.counts(), &[], c.min(), c.num_runs(), c.value_bits(), 8, 100).is_err());
        // A run count that does not cover the block exactly is invalid.
        assert!(
            decompress(c.counts(), c.values(), c.min(), c.num_runs(), c.value_bits(), 8, 101)
                .is_err()
        );
    }
}
