//! Canonical Huffman coding over 16-bit symbols.
//!
//! The code is rebuilt per invocation from the symbol frequencies of the
//! input, then serialized ahead of the bit stream so the decoder needs no
//! out-of-band state. Layout: `num_symbols: u32`, `num_distinct: u32`, then
//! `(symbol: u16, code_len: u8)` per distinct symbol, then the MSB-first bit
//! stream. A single-symbol alphabet stores length 0 and no bit stream.

use std::collections::BinaryHeap;

use rustc_hash::FxHashMap;
use ztile_error::{ztile_bail, ZTileResult};

use crate::bits::{BitReader, BitWriter};
use crate::{check_multiple, Stage};

/// Encode `src` (an even number of bytes, read as LE u16 symbols).
pub fn huffman16_encode(src: &[u8]) -> ZTileResult<Vec<u8>> {
    check_multiple(Stage::Huffman16, src.len())?;
    let symbols: Vec<u16> = src
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();

    let mut freqs = FxHashMap::default();
    for &s in &symbols {
        *freqs.entry(s).or_insert(0u64) += 1;
    }

    let lengths = code_lengths(&freqs);
    let table = canonical_table(&lengths);

    let mut out = Vec::new();
    out.extend_from_slice(&(symbols.len() as u32).to_le_bytes());
    out.extend_from_slice(&(table.len() as u32).to_le_bytes());
    for entry in &table {
        out.extend_from_slice(&entry.symbol.to_le_bytes());
        out.push(entry.len);
    }

    if table.len() > 1 {
        let codes: FxHashMap<u16, (u64, u8)> = table
            .iter()
            .map(|e| (e.symbol, (e.code, e.len)))
            .collect();
        let mut writer = BitWriter::new();
        for s in &symbols {
            let (code, len) = codes[s];
            writer.write_bits(code, u32::from(len));
        }
        out.extend_from_slice(&writer.finish());
    }

    Ok(out)
}

/// Decode a blob produced by [`huffman16_encode`], appending LE bytes.
pub fn huffman16_decode(src: &[u8], out: &mut Vec<u8>) -> ZTileResult<()> {
    if src.len() < 8 {
        ztile_bail!(InvalidSerde: "huffman blob truncated: {} bytes", src.len());
    }
    let num_symbols = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
    let num_distinct = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;
    let table_end = 8 + num_distinct * 3;
    if src.len() < table_end {
        ztile_bail!(
            InvalidSerde: "huffman table truncated: need {} bytes, have {}", table_end, src.len()
        );
    }

    let mut lengths = Vec::with_capacity(num_distinct);
    for i in 0..num_distinct {
        let off = 8 + i * 3;
        let symbol = u16::from_le_bytes([src[off], src[off + 1]]);
        lengths.push((symbol, src[off + 2]));
    }

    if num_symbols == 0 {
        return Ok(());
    }
    if num_distinct == 0 {
        ztile_bail!(InvalidSerde: "huffman blob with {} symbols but empty alphabet", num_symbols);
    }
    if num_distinct == 1 {
        for _ in 0..num_symbols {
            out.extend_from_slice(&lengths[0].0.to_le_bytes());
        }
        return Ok(());
    }

    let table = canonical_table(
        &lengths
            .iter()
            .map(|&(s, l)| (s, u32::from(l)))
            .collect::<FxHashMap<u16, u32>>(),
    );

    // Group canonical codes by length for first-code decoding.
    let max_len = table.iter().map(|e| e.len).max().unwrap_or(0) as usize;
    let mut first_code = vec![0u64; max_len + 1];
    let mut first_index = vec![0usize; max_len + 1];
    let mut count = vec![0usize; max_len + 1];
    for entry in &table {
        count[entry.len as usize] += 1;
    }
    let mut code = 0u64;
    let mut index = 0usize;
    for len in 1..=max_len {
        code <<= 1;
        first_code[len] = code;
        first_index[len] = index;
        code += count[len] as u64;
        index += count[len];
    }

    let mut reader = BitReader::new(&src[table_end..]);
    for _ in 0..num_symbols {
        let mut code = 0u64;
        let mut len = 0usize;
        let symbol = loop {
            code = (code << 1) | u64::from(reader.read_bit()?);
            len += 1;
            if len > max_len {
                ztile_bail!(InvalidSerde: "huffman code longer than {} bits", max_len);
            }
            if count[len] > 0 && code >= first_code[len] && code - first_code[len] < count[len] as u64 {
                break table[first_index[len] + (code - first_code[len]) as usize].symbol;
            }
        };
        out.extend_from_slice(&symbol.to_le_bytes());
    }
    Ok(())
}

struct CodeEntry {
    symbol: u16,
    len: u8,
    code: u64,
}

/// Standard two-queue Huffman construction; returns bit lengths per symbol.
fn code_lengths(freqs: &FxHashMap<u16, u64>) -> FxHashMap<u16, u32> {
    #[derive(PartialEq, Eq)]
    struct Node {
        weight: u64,
        id: usize,
    }
    impl Ord for Node {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            // Min-heap with deterministic tie-breaking.
            other
                .weight
                .cmp(&self.weight)
                .then(other.id.cmp(&self.id))
        }
    }
    impl PartialOrd for Node {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    let mut symbols: Vec<(u16, u64)> = freqs.iter().map(|(&s, &f)| (s, f)).collect();
    symbols.sort_unstable();

    if symbols.len() <= 1 {
        return symbols.into_iter().map(|(s, _)| (s, 0)).collect();
    }

    // parent[i] links tree nodes; leaves are 0..n.
    let n = symbols.len();
    let mut parent = vec![usize::MAX; 2 * n - 1];
    let mut heap: BinaryHeap<Node> = symbols
        .iter()
        .enumerate()
        .map(|(id, &(_, weight))| Node { weight, id })
        .collect();
    let mut next_id = n;
    while heap.len() > 1 {
        let a = heap.pop().expect("heap len checked");
        let b = heap.pop().expect("heap len checked");
        parent[a.id] = next_id;
        parent[b.id] = next_id;
        heap.push(Node {
            weight: a.weight + b.weight,
            id: next_id,
        });
        next_id += 1;
    }

    symbols
        .iter()
        .enumerate()
        .map(|(id, &(symbol, _))| {
            let mut len = 0u32;
            let mut node = id;
            while parent[node] != usize::MAX {
                node = parent[node];
                len += 1;
            }
            (symbol, len)
        })
        .collect()
}

/// Canonical code assignment: sort by (length, symbol), number sequentially.
fn canonical_table(lengths: &FxHashMap<u16, u32>) -> Vec<CodeEntry> {
    let mut entries: Vec<(u16, u32)> = lengths.iter().map(|(&s, &l)| (s, l)).collect();
    entries.sort_unstable_by_key(|&(s, l)| (l, s));

    let mut table = Vec::with_capacity(entries.len());
    let mut code = 0u64;
    let mut prev_len = 0u32;
    for (symbol, len) in entries {
        code <<= len - prev_len;
        table.push(CodeEntry {
            symbol,
            len: len as u8,
            code,
        });
        code += 1;
        prev_len = len;
    }
    table
}

/// The "Halfman" variant: the input is split into two halves (e.g. the high
/// and low planes a split stage produced) and each half is Huffman-coded
/// independently, prefixed by two 4-byte blob lengths.
pub fn halfman16_encode(src: &[u8]) -> ZTileResult<Vec<u8>> {
    check_multiple(Stage::Halfman16, src.len())?;
    let num1 = src.len() / 4 * 2; // first half, in bytes
    let first = huffman16_encode(&src[..num1])?;
    let second = huffman16_encode(&src[num1..])?;

    let mut out = Vec::with_capacity(8 + first.len() + second.len());
    out.extend_from_slice(&(first.len() as u32).to_le_bytes());
    out.extend_from_slice(&(second.len() as u32).to_le_bytes());
    out.extend_from_slice(&first);
    out.extend_from_slice(&second);
    Ok(out)
}

pub fn halfman16_decode(src: &[u8], out: &mut Vec<u8>) -> ZTileResult<()> {
    if src.len() < 8 {
        ztile_bail!(InvalidSerde: "halfman blob truncated: {} bytes", src.len());
    }
    let len1 = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
    let len2 = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;
    if src.len() < 8 + len1 + len2 {
        ztile_bail!(
            InvalidSerde: "halfman blob truncated: need {} bytes, have {}", 8 + len1 + len2, src.len()
        );
    }
    huffman16_decode(&src[8..8 + len1], out)?;
    huffman16_decode(&src[8 + len1..8 + len1 + len2], out)
}
