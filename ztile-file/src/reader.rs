//! The reading side: catalog-driven random access to compressed tiles.
//!
//! A reader links a record schema at open time and maps every stored column
//! back to a field through its `TPBIDn` id path. Columns whose path does not
//! resolve in the linked schema are skipped silently, which is what makes
//! files readable across schema additions and removals in either direction.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use rustc_hash::{FxHashMap, FxHashSet};
use ztile_codec::{BlockHeader, CodecParams, Pipeline};
use ztile_error::{ztile_bail, ZTileResult};
use ztile_record::{
    AnyArrayValue, FieldKind, FieldValue, PType, Record, SchemaRef, Value,
};

use crate::cards::{Header, CARDS_PER_BLOCK, CARD_SIZE};
use crate::catalog::{Catalog, CATALOG_ENTRY_SIZE};
use crate::checksum::Checksum;
use crate::column::ColumnShape;
use crate::pool::RecordPool;
use crate::tile::{TileHeader, TILE_HEADER_SIZE};
use crate::FITS_BLOCK_SIZE;

/// One navigation step from the record root toward a leaf field.
#[derive(Debug, Clone, Copy)]
enum ReadSeg {
    Field(usize),
    Repetition(usize),
}

/// A stored column resolved (or not) against the linked schema.
struct ReaderColumn {
    name: String,
    ptype: PType,
    count: u32,
    /// `None` when the id path has no counterpart in the linked schema.
    target: Option<ResolvedLeaf>,
}

struct ResolvedLeaf {
    segs: Vec<ReadSeg>,
    leaf: usize,
    shape: ColumnShape,
    is_enum: bool,
}

pub struct TableReader {
    file: File,
    schema: SchemaRef,
    header: Header,
    columns: Vec<ReaderColumn>,
    catalog: Catalog,
    table_start: u64,
    data_start: u64,
    heap_off: u64,
    rows_per_tile: u64,
    num_records: u64,
    num_tiles: u64,
    shrink_factor: u32,
    /// Id paths of stored columns with no counterpart in the linked schema.
    unknown_ids: FxHashSet<String>,
    params: CodecParams,
    loaded_tile: Option<u64>,
    available: FxHashMap<u64, Record>,
    pool: RecordPool,
    returned: Vec<Record>,
    tile_buf: Vec<u8>,
    column_buf: Vec<u8>,
}

/// Read header units block by block until the END card shows up.
fn read_header(file: &mut File) -> ZTileResult<(Header, u64)> {
    let mut bytes = Vec::new();
    loop {
        let mut block = [0u8; FITS_BLOCK_SIZE];
        file.read_exact(&mut block)?;
        bytes.extend_from_slice(&block);
        let has_end = block
            .chunks_exact(CARD_SIZE)
            .take(CARDS_PER_BLOCK)
            .any(|card| card[..8].eq(b"END     "));
        if has_end {
            break;
        }
    }
    let len = bytes.len() as u64;
    let (header, _) = Header::parse(&bytes)?;
    Ok((header, len))
}

fn require_int(header: &Header, key: &str) -> ZTileResult<i64> {
    header
        .get_int(key)
        .ok_or_else(|| ztile_error::ztile_err!(InvalidSerde: "table header lacks the {} key", key))
}

impl TableReader {
    /// Open the first compressed table in `path`, linked to `schema`.
    pub fn open(path: impl AsRef<Path>, schema: SchemaRef) -> ZTileResult<Self> {
        Self::open_named(path, schema, None)
    }

    /// Open the table whose `EXTNAME` matches, or the first one when `None`.
    pub fn open_named(
        path: impl AsRef<Path>,
        schema: SchemaRef,
        extname: Option<&str>,
    ) -> ZTileResult<Self> {
        let mut file = File::open(path.as_ref())?;

        // Primary header first, then walk extensions.
        let (_primary, _) = read_header(&mut file)?;
        let (header, table_start, header_len) = loop {
            let table_start = file.stream_position()?;
            let (header, header_len) = read_header(&mut file)?;
            let is_table = header.get_bool("ZTABLE").unwrap_or(false);
            let name_matches = match extname {
                Some(wanted) => header.get_str("EXTNAME") == Some(wanted),
                None => true,
            };
            if is_table && name_matches {
                break (header, table_start, header_len);
            }
            // Skip this extension's data region.
            let naxis1 = require_int(&header, "NAXIS1")?;
            let naxis2 = require_int(&header, "NAXIS2")?;
            let pcount = header.get_int("PCOUNT").unwrap_or(0);
            let data = (naxis1 * naxis2 + pcount) as u64;
            let padded = data.div_ceil(FITS_BLOCK_SIZE as u64) * FITS_BLOCK_SIZE as u64;
            file.seek(SeekFrom::Current(padded as i64))?;
        };

        let num_cols = require_int(&header, "TFIELDS")? as usize;
        let heap_ptr = require_int(&header, "ZHEAPPTR")? as u64;
        let capacity = heap_ptr as usize / (num_cols * CATALOG_ENTRY_SIZE);
        let rows_per_tile = require_int(&header, "ZTILELEN")? as u64;
        let num_records = require_int(&header, "ZNAXIS2")? as u64;
        let shrink_factor = header.get_int("ZSHRINK").unwrap_or(1) as u32;
        if rows_per_tile == 0 {
            ztile_bail!(InvalidSerde: "table declares zero rows per tile");
        }

        let data_start = table_start + header_len;
        let mut catalog_bytes = vec![0u8; capacity * num_cols * CATALOG_ENTRY_SIZE];
        file.seek(SeekFrom::Start(data_start))?;
        file.read_exact(&mut catalog_bytes)?;
        let catalog = Catalog::parse(&catalog_bytes, num_cols, capacity)?;

        let mut columns = Vec::with_capacity(num_cols);
        let mut unknown = FxHashSet::default();
        for n in 1..=num_cols {
            let zform = header
                .get_str(&format!("ZFORM{n}"))
                .ok_or_else(|| ztile_error::ztile_err!(InvalidSerde: "missing ZFORM{}", n))?;
            let (count, type_char) = parse_zform(zform)?;
            let name = header
                .get_str(&format!("TTYPE{n}"))
                .unwrap_or_default()
                .to_string();
            let id_path = header
                .get_str(&format!("TPBID{n}"))
                .ok_or_else(|| ztile_error::ztile_err!(InvalidSerde: "missing TPBID{}", n))?;

            let target = resolve_id_path(&schema, id_path);
            if target.is_none() {
                unknown.insert(id_path.to_string());
                log::debug!("column {name} ({id_path}) has no field in the linked schema");
            }
            columns.push(ReaderColumn {
                name,
                ptype: PType::from_type_char(type_char)?,
                count,
                target,
            });
        }

        let num_tiles = num_records.div_ceil(rows_per_tile);

        Ok(Self {
            file,
            schema,
            header,
            columns,
            catalog,
            table_start,
            data_start,
            heap_off: data_start + heap_ptr,
            rows_per_tile,
            num_records,
            num_tiles,
            shrink_factor,
            unknown_ids: unknown,
            params: CodecParams::default(),
            loaded_tile: None,
            available: FxHashMap::default(),
            pool: RecordPool::new(),
            returned: Vec::new(),
            tile_buf: Vec::new(),
            column_buf: Vec::new(),
        })
    }

    pub fn num_records(&self) -> u64 {
        self.num_records
    }

    pub fn num_tiles(&self) -> u64 {
        self.num_tiles
    }

    pub fn shrink_factor(&self) -> u32 {
        self.shrink_factor
    }

    /// The tile currently materialized in memory, if any.
    pub fn loaded_tile(&self) -> Option<u64> {
        self.loaded_tile
    }

    /// Raw compressed payload of the loaded tile, for diagnostics.
    pub fn loaded_tile_bytes(&self) -> Option<&[u8]> {
        self.loaded_tile.map(|_| self.tile_buf.as_slice())
    }

    /// Stored column id paths the linked schema cannot place.
    pub fn unknown_ids(&self) -> &FxHashSet<String> {
        &self.unknown_ids
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Read record `index` (zero-based). The returned record is owned by
    /// the caller until handed back via [`TableReader::recycle`].
    pub fn read_record(&mut self, index: u64) -> ZTileResult<Record> {
        if index >= self.num_records {
            ztile_bail!(
                Configuration: "record {} out of range; the table holds {} records", index, self.num_records
            );
        }
        let tile = index / self.rows_per_tile;
        if !self.available.contains_key(&index) {
            self.load_tile(tile)?;
        }
        self.available.remove(&index).ok_or_else(|| {
            ztile_error::ztile_err!(
                InvalidSerde: "record {} is not present in tile {}; it was either already handed out or its tile was discarded by a catalog shrink",
                index,
                tile
            )
        })
    }

    /// Hand a record back for reuse by later tile loads.
    pub fn recycle(&mut self, record: Record) {
        self.returned.push(record);
    }

    fn load_tile(&mut self, tile: u64) -> ZTileResult<()> {
        if tile >= self.catalog.len() as u64 {
            ztile_bail!(
                InvalidSerde: "tile {} beyond the {} catalog rows", tile, self.catalog.len()
            );
        }
        let first = self.catalog.row(tile as usize)[0];
        let tile_start = first.offset - TILE_HEADER_SIZE as i64;
        if first.size == 0 || tile_start < 0 {
            ztile_bail!(InvalidSerde: "catalog row {} does not point at a tile", tile);
        }

        self.file
            .seek(SeekFrom::Start(self.heap_off + tile_start as u64))?;
        let mut head = [0u8; TILE_HEADER_SIZE];
        self.file.read_exact(&mut head)?;
        let tile_header = TileHeader::read_from(&head)?;

        self.tile_buf.resize(tile_header.size as usize, 0);
        self.file.read_exact(&mut self.tile_buf)?;

        // Recycle whatever the caller did not claim from the old tile.
        for (_, record) in self.available.drain() {
            self.pool.release(record);
        }
        self.pool.release_all(self.returned.drain(..));

        let start_index = tile * self.rows_per_tile;
        let mut records: Vec<Record> = (0..tile_header.num_rows)
            .map(|_| self.pool.acquire(&self.schema))
            .collect();

        let mut data = self.tile_buf.as_slice();
        for column in &self.columns {
            let (block, head_len) = BlockHeader::read_from(data)?;
            let payload_len = block.payload_size()?;
            if head_len + payload_len > data.len() {
                ztile_bail!(
                    InvalidSerde: "block of column {} overruns the tile payload", column.name
                );
            }
            let payload = &data[head_len..head_len + payload_len];
            data = &data[head_len + payload_len..];

            let Some(target) = column.target.as_ref() else {
                continue;
            };

            let pipeline = Pipeline::from_stages(block.stages())?;
            let bound = (4 + column.ptype.byte_width() * column.count as usize + 64)
                * records.len().max(1);
            let mut column_buf = std::mem::take(&mut self.column_buf);
            pipeline.decompress(payload, &mut column_buf, bound, &self.params)?;
            let populated =
                populate_column(&mut records, column, target, &column_buf);
            self.column_buf = column_buf;
            populated?;
        }

        for (i, record) in records.into_iter().enumerate() {
            self.available.insert(start_index + i as u64, record);
        }
        self.loaded_tile = Some(tile);
        Ok(())
    }

    /// Recompute the checksum over the whole table HDU and check the
    /// closing identity.
    pub fn verify_checksum(&mut self) -> ZTileResult<()> {
        let naxis1 = require_int(&self.header, "NAXIS1")?;
        let naxis2 = require_int(&self.header, "NAXIS2")?;
        let pcount = self.header.get_int("PCOUNT").unwrap_or(0);
        let data = (naxis1 * naxis2 + pcount) as u64;
        let padded = data.div_ceil(FITS_BLOCK_SIZE as u64) * FITS_BLOCK_SIZE as u64;
        let total = (self.data_start - self.table_start) + padded;

        self.file.seek(SeekFrom::Start(self.table_start))?;
        let mut sum = Checksum::new();
        let mut remaining = total;
        let mut buf = vec![0u8; FITS_BLOCK_SIZE];
        while remaining > 0 {
            let n = remaining.min(FITS_BLOCK_SIZE as u64) as usize;
            self.file.read_exact(&mut buf[..n])?;
            sum.update(&buf[..n]);
            remaining -= n as u64;
        }
        if !sum.is_all_ones() {
            ztile_bail!(
                ChecksumMismatch: "table checksum is {:#010x} instead of all ones", sum.value()
            );
        }
        Ok(())
    }
}

fn parse_zform(zform: &str) -> ZTileResult<(u32, char)> {
    let split = zform
        .char_indices()
        .find(|(_, c)| c.is_ascii_alphabetic())
        .map(|(i, _)| i)
        .unwrap_or(zform.len());
    let count: u32 = zform[..split]
        .parse()
        .map_err(|_| ztile_error::ztile_err!(InvalidSerde: "malformed ZFORM value '{}'", zform))?;
    let type_char = zform[split..]
        .chars()
        .next()
        .ok_or_else(|| ztile_error::ztile_err!(InvalidSerde: "malformed ZFORM value '{}'", zform))?;
    Ok((count, type_char))
}

/// Resolve a dotted field-number path against the linked schema. `None`
/// means some component has no counterpart, which is the lenient
/// compatibility case.
fn resolve_id_path(schema: &SchemaRef, id_path: &str) -> Option<ResolvedLeaf> {
    let mut segs = Vec::new();
    let mut current = schema.clone();
    let mut components = id_path.split('.').peekable();

    loop {
        let component = components.next()?;
        let number: u32 = component.parse().ok()?;
        let (index, field) = current.field_by_number(number)?;

        match field.kind() {
            FieldKind::Message(child) => {
                segs.push(ReadSeg::Field(index));
                if field.is_repeated() {
                    let rep: usize = components.next()?.parse().ok()?;
                    segs.push(ReadSeg::Repetition(rep));
                }
                current = child.clone();
            }
            FieldKind::AnyArray => {
                return Some(ResolvedLeaf {
                    segs,
                    leaf: index,
                    shape: ColumnShape::AnyArray,
                    is_enum: false,
                });
            }
            FieldKind::Bytes => {
                return components.peek().is_none().then_some(ResolvedLeaf {
                    segs,
                    leaf: index,
                    shape: ColumnShape::VarBytes,
                    is_enum: false,
                });
            }
            FieldKind::Scalar(_) | FieldKind::Enum => {
                let shape = if field.is_repeated() {
                    ColumnShape::FixedArray
                } else {
                    ColumnShape::Scalar
                };
                return components.peek().is_none().then_some(ResolvedLeaf {
                    segs,
                    leaf: index,
                    shape,
                    is_enum: matches!(field.kind(), FieldKind::Enum),
                });
            }
            FieldKind::Group => return None,
        }
    }
}

/// Consume `n` bytes from the front of the column data.
fn take<'d>(data: &'d [u8], cursor: &mut usize, n: usize, name: &str) -> ZTileResult<&'d [u8]> {
    if *cursor + n > data.len() {
        ztile_bail!(InvalidSerde: "column {} data ends early at byte {}", name, *cursor);
    }
    let slice = &data[*cursor..*cursor + n];
    *cursor += n;
    Ok(slice)
}

fn read_i32(data: &[u8], cursor: &mut usize, name: &str) -> ZTileResult<i32> {
    let raw = take(data, cursor, 4, name)?;
    Ok(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Write one column's decompressed bytes into the tile's records, walking
/// each record through the resolved path and deserializing by shape.
fn populate_column(
    records: &mut [Record],
    column: &ReaderColumn,
    target: &ResolvedLeaf,
    data: &[u8],
) -> ZTileResult<()> {
    let name = column.name.as_str();
    let width = column.ptype.byte_width();
    let mut cursor = 0usize;
    for record in records.iter_mut() {
        // Navigate to the leaf's parent, materializing slots on demand.
        let mut current = &mut *record;
        let mut segs = target.segs.iter().peekable();
        while let Some(seg) = segs.next() {
            let ReadSeg::Field(index) = *seg else {
                ztile_bail!("column path for {} starts with a repetition", name);
            };
            current = match segs.peek() {
                Some(ReadSeg::Repetition(k)) => {
                    let k = *k;
                    segs.next();
                    current.repeated_message_mut(index, k)?
                }
                _ => current.message_mut(index)?,
            };
        }

        let value = match target.shape {
            ColumnShape::Scalar => {
                if target.is_enum {
                    FieldValue::Enum(read_i32(data, &mut cursor, name)?)
                } else {
                    let raw = take(data, &mut cursor, width, name)?;
                    FieldValue::Scalar(Value::read_le(column.ptype, raw)?)
                }
            }
            ColumnShape::FixedArray => {
                let n = read_i32(data, &mut cursor, name)? as u32 as usize;
                if target.is_enum {
                    let mut values = Vec::with_capacity(n);
                    for _ in 0..n {
                        values.push(read_i32(data, &mut cursor, name)?);
                    }
                    FieldValue::EnumArray(values)
                } else {
                    let mut values = Vec::with_capacity(n);
                    for _ in 0..n {
                        let raw = take(data, &mut cursor, width, name)?;
                        values.push(Value::read_le(column.ptype, raw)?);
                    }
                    FieldValue::ScalarArray(values)
                }
            }
            ColumnShape::VarBytes => {
                let n = read_i32(data, &mut cursor, name)?;
                if n < 0 {
                    ztile_bail!(InvalidSerde: "negative byte length in column {}", name);
                }
                FieldValue::Bytes(take(data, &mut cursor, n as usize, name)?.to_vec())
            }
            ColumnShape::AnyArray => {
                let n = read_i32(data, &mut cursor, name)?;
                if n < 0 {
                    ztile_bail!(InvalidSerde: "negative byte length in column {}", name);
                }
                let payload = take(data, &mut cursor, n as usize, name)?.to_vec();
                FieldValue::AnyArray(AnyArrayValue::new(column.ptype, payload))
            }
        };
        *current.value_mut(target.leaf) = value;
    }
    Ok(())
}
