//! Tile assembly: serialize, compress and frame one batch of records.

use ztile_codec::{BlockHeader, CodecParams};
use ztile_error::{ztile_bail, ZTileResult};
use ztile_record::Record;

use crate::catalog::CatalogEntry;
use crate::column::ColumnDescriptor;
use crate::serialize::serialize_column;

pub const TILE_MAGIC: [u8; 4] = *b"TILE";
pub const TILE_HEADER_SIZE: usize = 12;

/// The 12-byte header preceding each tile's column blocks in the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileHeader {
    pub num_rows: u32,
    /// Payload bytes following the header.
    pub size: u32,
}

impl TileHeader {
    pub fn write_to(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&TILE_MAGIC);
        out[4..8].copy_from_slice(&self.num_rows.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
    }

    pub fn read_from(src: &[u8]) -> ZTileResult<Self> {
        if src.len() < TILE_HEADER_SIZE {
            ztile_bail!(InvalidSerde: "truncated tile header: {} bytes", src.len());
        }
        if src[..4] != TILE_MAGIC {
            ztile_bail!(InvalidSerde: "bad tile magic {:02x?}", &src[..4]);
        }
        Ok(Self {
            num_rows: u32::from_le_bytes([src[4], src[5], src[6], src[7]]),
            size: u32::from_le_bytes([src[8], src[9], src[10], src[11]]),
        })
    }
}

/// The product of compressing one tile.
#[derive(Debug)]
pub struct CompressedTile {
    /// Tile header plus all column blocks, ready for the heap.
    pub bytes_used: usize,
    /// Per-column `(block size, offset)` entries; offsets are filled in at
    /// finalize time, sizes here.
    pub entries: Vec<CatalogEntry>,
    /// Uncompressed bytes gathered, for the compression-ratio accounting.
    pub raw_bytes: u64,
    /// Checksum over the padded raw column bytes.
    pub rawsum: crate::checksum::Checksum,
}

/// Serialize and compress `records` into `out` (sized to the table's
/// compression block size). Returns the catalog sizes and raw byte count.
///
/// Exceeding `out` is a configuration error: the compression buffer was
/// sized too small for the declared rows per tile.
pub fn compress_tile(
    records: &[Record],
    columns: &[ColumnDescriptor],
    params: &CodecParams,
    gather: &mut Vec<u8>,
    scratch: &mut [u8],
    out: &mut [u8],
) -> ZTileResult<CompressedTile> {
    let mut entries = Vec::with_capacity(columns.len());
    let mut raw_bytes = 0u64;
    let mut rawsum = crate::checksum::Checksum::new();
    let mut used = TILE_HEADER_SIZE;

    for column in columns {
        serialize_column(records, column, gather)?;
        raw_bytes += gather.len() as u64;

        // Pad the raw bytes up to a 4-byte multiple before compressing.
        while gather.len() % 4 != 0 {
            gather.push(0);
        }
        rawsum.update(gather);

        let head_len = BlockHeader::encoded_len_for(column.pipeline.stages().len());
        if used + head_len >= out.len() {
            ztile_bail!(
                Configuration: "compression buffer of {} bytes cannot hold column {} of this tile; increase the compression block size or lower the rows per tile",
                out.len(),
                column.name
            );
        }

        let available = (out.len() - used - head_len).min(scratch.len());
        let compressed_size = column
            .pipeline
            .compress(gather, &mut scratch[..available], params)
            .map_err(|e| match e {
                ztile_error::ZTileError::BufferOverflow(msg) => ztile_error::ztile_err!(
                    Configuration: "compression buffer too small for column {}: {}", column.name, msg
                ),
                other => other,
            })?;

        let header = BlockHeader::new(
            column.pipeline.stages().to_vec(),
            (head_len + compressed_size) as u32,
        );
        let mut head_bytes = Vec::with_capacity(head_len);
        header.write_to(&mut head_bytes);
        out[used..used + head_len].copy_from_slice(&head_bytes);
        out[used + head_len..used + head_len + compressed_size]
            .copy_from_slice(&scratch[..compressed_size]);
        used += head_len + compressed_size;

        entries.push(CatalogEntry {
            size: (head_len + compressed_size) as i64,
            offset: 0,
        });
    }

    TileHeader {
        num_rows: records.len() as u32,
        size: (used - TILE_HEADER_SIZE) as u32,
    }
    .write_to(&mut out[..TILE_HEADER_SIZE]);

    Ok(CompressedTile {
        bytes_used: used,
        entries,
        raw_bytes,
        rawsum,
    })
}

#[cfg(test)]
mod test {
    use rustc_hash::FxHashSet;
    use ztile_codec::CodecParams;
    use ztile_record::{PType, Record, Schema, Value};

    use super::{compress_tile, TileHeader, TILE_HEADER_SIZE};
    use crate::config::CompressionConfig;
    use crate::flatten::flatten;

    fn records(n: u32) -> Vec<Record> {
        let schema = Schema::builder("Row")
            .scalar("id", PType::U32)
            .repeated_scalar("samples", PType::I16)
            .build();
        (0..n)
            .map(|i| {
                let mut rec = Record::new(schema.clone());
                rec.set("id", Value::U32(i)).unwrap();
                rec.set(
                    "samples",
                    (0..8).map(|j| Value::I16((i * 8 + j) as i16)).collect::<Vec<_>>(),
                )
                .unwrap();
                rec
            })
            .collect()
    }

    #[test]
    fn tile_layout_matches_catalog_sizes() {
        let batch = records(10);
        let config = CompressionConfig::new("zlib").unwrap();
        let flat = flatten(&batch[0], &config, &FxHashSet::default(), &FxHashSet::default())
            .unwrap();

        let mut gather = Vec::new();
        let mut scratch = vec![0u8; 1 << 16];
        let mut out = vec![0u8; 1 << 16];
        let tile = compress_tile(
            &batch,
            &flat.columns,
            &CodecParams::default(),
            &mut gather,
            &mut scratch,
            &mut out,
        )
        .unwrap();

        let header = TileHeader::read_from(&out).unwrap();
        assert_eq!(header.num_rows, 10);
        assert_eq!(header.size as usize, tile.bytes_used - TILE_HEADER_SIZE);
        let total: i64 = tile.entries.iter().map(|e| e.size).sum();
        assert_eq!(total as usize, tile.bytes_used - TILE_HEADER_SIZE);
        // id column: 10 * 4 bytes raw; samples: 10 * (4 + 16) bytes.
        assert_eq!(tile.raw_bytes, 40 + 200);
    }

    #[test]
    fn undersized_buffer_is_a_configuration_error() {
        let batch = records(10);
        let config = CompressionConfig::default();
        let flat = flatten(&batch[0], &config, &FxHashSet::default(), &FxHashSet::default())
            .unwrap();

        let mut gather = Vec::new();
        let mut scratch = vec![0u8; 64];
        let mut out = vec![0u8; 64];
        let err = compress_tile(
            &batch,
            &flat.columns,
            &CodecParams::default(),
            &mut gather,
            &mut scratch,
            &mut out,
        )
        .unwrap_err();
        assert!(matches!(err, ztile_error::ZTileError::Configuration(_)), "{err}");
    }
}
