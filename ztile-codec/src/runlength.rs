//! Run-length transforms over 32-bit values.
//!
//! Both transforms are only effective on data with long runs; on data without
//! that structure their intermediate form grows past the input, and they must
//! then fail loudly rather than corrupt the block. `max_len` is the size of
//! the compression buffer backing this column.

use ztile_error::{ztile_bail, ZTileResult};

use crate::{check_multiple, Stage};

fn read_u32s(buf: &[u8]) -> Vec<u32> {
    buf.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn write_u32s(values: &[u32], out: &mut Vec<u8>) {
    out.clear();
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// Collapse runs of identical values into `(count, value)` pairs, prefixed by
/// the pair count.
pub fn same_values_encode(buf: &mut Vec<u8>, max_len: usize) -> ZTileResult<()> {
    check_multiple(Stage::SameValues32, buf.len())?;
    let values = read_u32s(buf);

    let mut pairs = Vec::new();
    let mut i = 0;
    while i < values.len() {
        let value = values[i];
        let mut count = 1u32;
        while i + (count as usize) < values.len() && values[i + count as usize] == value {
            count += 1;
        }
        pairs.push(count);
        pairs.push(value);
        i += count as usize;
    }

    let encoded_len = (pairs.len() + 1) * 4;
    if encoded_len > max_len {
        ztile_bail!(
            BufferOverflow: "SameValues32 output ({} bytes for {} input bytes) exceeds the {} byte compression buffer; this scheme requires long runs of identical values",
            encoded_len,
            buf.len(),
            max_len
        );
    }

    let mut out = Vec::with_capacity(pairs.len() + 1);
    out.push(pairs.len() as u32 / 2);
    out.extend_from_slice(&pairs);
    write_u32s(&out, buf);
    Ok(())
}

pub fn same_values_decode(buf: &mut Vec<u8>, max_len: usize) -> ZTileResult<()> {
    check_multiple(Stage::SameValues32, buf.len())?;
    let values = read_u32s(buf);
    if values.is_empty() {
        ztile_bail!(InvalidSerde: "SameValues32 block without a pair count");
    }
    let num_pairs = values[0] as usize;
    if (num_pairs * 2 + 1) * 4 != buf.len() {
        ztile_bail!(
            InvalidSerde: "SameValues32 pair count {} does not match block size {}", num_pairs, buf.len()
        );
    }

    let mut out = Vec::new();
    for pair in values[1..].chunks_exact(2) {
        let (count, value) = (pair[0] as usize, pair[1]);
        if (out.len() + count) * 4 > max_len {
            ztile_bail!(
                BufferOverflow: "SameValues32 expansion exceeds the {} byte tile buffer", max_len
            );
        }
        out.extend(std::iter::repeat_n(value, count));
    }
    write_u32s(&out, buf);
    Ok(())
}

/// Collapse runs of the hollow sentinel to bare run lengths; non-hollow
/// values are stored verbatim between them. Prefixed by the sentinel and the
/// output element count.
pub fn sparse_values_encode(buf: &mut Vec<u8>, max_len: usize, hollow: i32) -> ZTileResult<()> {
    check_multiple(Stage::SparseValues32, buf.len())?;
    let values: Vec<i32> = read_u32s(buf).iter().map(|&v| v as i32).collect();

    let mut out: Vec<i32> = Vec::new();
    let mut i = 0;
    while i < values.len() {
        let mut hollow_run = 0i32;
        while i < values.len() && values[i] == hollow {
            hollow_run += 1;
            i += 1;
        }
        out.push(hollow_run);
        if i >= values.len() {
            break;
        }
        out.push(values[i]);
        i += 1;
    }

    let encoded_len = (out.len() + 2) * 4;
    if encoded_len > max_len {
        ztile_bail!(
            BufferOverflow: "SparseValues32 output ({} bytes for {} input bytes) exceeds the {} byte compression buffer; this scheme requires runs of the hollow value {}",
            encoded_len,
            buf.len(),
            max_len,
            hollow
        );
    }

    let mut encoded = Vec::with_capacity(out.len() + 2);
    encoded.push(hollow as u32);
    encoded.push(out.len() as u32);
    encoded.extend(out.iter().map(|&v| v as u32));
    write_u32s(&encoded, buf);
    Ok(())
}

pub fn sparse_values_decode(buf: &mut Vec<u8>, max_len: usize) -> ZTileResult<()> {
    check_multiple(Stage::SparseValues32, buf.len())?;
    let values = read_u32s(buf);
    if values.len() < 2 {
        ztile_bail!(InvalidSerde: "SparseValues32 block without its two-word header");
    }
    let hollow = values[0] as i32;
    let num_values = values[1] as usize;
    if (num_values + 2) * 4 != buf.len() {
        ztile_bail!(
            InvalidSerde: "SparseValues32 element count {} does not match block size {}", num_values, buf.len()
        );
    }

    let body = &values[2..];
    let mut out: Vec<u32> = Vec::new();
    let mut i = 0;
    while i < num_values {
        let hollow_run = body[i] as usize;
        if (out.len() + hollow_run) * 4 > max_len {
            ztile_bail!(
                BufferOverflow: "SparseValues32 expansion exceeds the {} byte tile buffer", max_len
            );
        }
        out.extend(std::iter::repeat_n(hollow as u32, hollow_run));
        i += 1;
        if i >= num_values {
            break;
        }
        out.push(body[i]);
        i += 1;
    }
    write_u32s(&out, buf);
    Ok(())
}
