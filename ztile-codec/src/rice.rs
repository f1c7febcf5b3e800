//! A Rice-style predictive residual coder for 16-bit samples.
//!
//! Residuals against the previous sample are zigzag-mapped and Golomb-Rice
//! coded in blocks of `rice_block` samples (default 1); each block stores its
//! own 5-bit `k`. The escape value `k = 31` stores the block's residuals as
//! raw 17-bit values, bounding the worst case on hostile data.

use ztile_error::{ztile_bail, ZTileResult};

use crate::bits::{BitReader, BitWriter};
use crate::{check_multiple, Stage};

const ESCAPE_K: u64 = 31;

fn zigzag(v: i32) -> u32 {
    ((v << 1) ^ (v >> 31)) as u32
}

fn unzigzag(v: u32) -> i32 {
    ((v >> 1) as i32) ^ -((v & 1) as i32)
}

pub fn rice16_encode(src: &[u8], block: usize) -> ZTileResult<Vec<u8>> {
    check_multiple(Stage::Rice, src.len())?;
    let block = block.max(1);
    let samples: Vec<u16> = src
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();

    let mut out = Vec::new();
    out.extend_from_slice(&(samples.len() as u32).to_le_bytes());
    if samples.is_empty() {
        return Ok(out);
    }

    let mut writer = BitWriter::new();
    writer.write_bits(u64::from(samples[0]), 16);

    let mut prev = samples[0];
    let residuals: Vec<u32> = samples[1..]
        .iter()
        .map(|&s| {
            let r = zigzag(i32::from(s) - i32::from(prev));
            prev = s;
            r
        })
        .collect();

    for chunk in residuals.chunks(block) {
        // Pick the k minimizing the coded size of this block, with the raw
        // escape as the upper bound.
        let mut best_k = ESCAPE_K;
        let mut best_bits = 17 * chunk.len() as u64;
        for k in 0..=16u64 {
            let bits: u64 = chunk
                .iter()
                .map(|&r| u64::from(r >> k) + 1 + k)
                .sum();
            if bits < best_bits {
                best_bits = bits;
                best_k = k;
            }
        }
        writer.write_bits(best_k, 5);
        for &r in chunk {
            if best_k == ESCAPE_K {
                writer.write_bits(u64::from(r), 17);
            } else {
                writer.write_unary(r >> best_k);
                writer.write_bits(u64::from(r), best_k as u32);
            }
        }
    }

    out.extend_from_slice(&writer.finish());
    Ok(out)
}

pub fn rice16_decode(src: &[u8], block: usize, out: &mut Vec<u8>) -> ZTileResult<()> {
    if src.len() < 4 {
        ztile_bail!(InvalidSerde: "rice blob truncated: {} bytes", src.len());
    }
    let block = block.max(1);
    let num_samples = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if num_samples == 0 {
        return Ok(());
    }

    let mut reader = BitReader::new(&src[4..]);
    let mut prev = reader.read_bits(16)? as u16;
    out.extend_from_slice(&prev.to_le_bytes());

    let mut remaining = num_samples - 1;
    while remaining > 0 {
        let this_block = remaining.min(block);
        let k = reader.read_bits(5)?;
        if k != ESCAPE_K && k > 16 {
            ztile_bail!(InvalidSerde: "rice parameter {} out of range", k);
        }
        for _ in 0..this_block {
            let zz = if k == ESCAPE_K {
                reader.read_bits(17)? as u32
            } else {
                let quotient = reader.read_unary()?;
                let remainder = reader.read_bits(k as u32)? as u32;
                (quotient << k) | remainder
            };
            let value = (i32::from(prev) + unzigzag(zz)) as u16;
            out.extend_from_slice(&value.to_le_bytes());
            prev = value;
        }
        remaining -= this_block;
    }
    Ok(())
}
