//! The disk side of the writer: append-only heap writes, header and catalog
//! serialization, checksum maintenance and table finalization.
//!
//! Everything here runs on the single ordered write stage; the only state
//! shared with the submitting thread is the catalog (behind its own lock)
//! and the column descriptors (whose counts are atomic).

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use ztile_error::{ztile_bail, ZTileResult};

use crate::cards::Header;
use crate::catalog::{Catalog, CATALOG_ENTRY_SIZE};
use crate::checksum::Checksum;
use crate::flatten::FlattenedSchema;
use crate::FITS_BLOCK_SIZE;

/// One tile's compressed output as it reaches the disk stage.
pub(crate) struct FinishedTile {
    pub buffer: crate::pool::PoolBuffer,
    pub used: usize,
    pub entries: Vec<crate::catalog::CatalogEntry>,
    pub catalog_row: usize,
    pub num_rows: u32,
    pub raw_bytes: u64,
    pub rawsum: Checksum,
}

/// Per-table disk state.
pub(crate) struct TableState {
    pub name: String,
    pub header: Header,
    pub table_start: u64,
    pub flat: Option<Arc<FlattenedSchema>>,
    pub catalog: Option<Arc<Mutex<Catalog>>>,
    pub rows_per_tile: u32,
    pub capacity: u32,
    pub catalog_offset: u64,
    pub heap_start: u64,
    pub heap_bytes: u64,
    pub heapsum: Checksum,
    pub rawsum: Checksum,
    pub raw_heap_size: u64,
    pub tiles_written: usize,
    pub rows_written: u64,
    pub header_written: bool,
}

/// Cumulative statistics surfaced after `close`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterStats {
    pub records_written: u64,
    pub tiles_written: u64,
    pub bytes_written: u64,
    pub raw_bytes: u64,
}

impl WriterStats {
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes_written == 0 {
            return 0.0;
        }
        self.raw_bytes as f64 / self.bytes_written as f64
    }
}

pub(crate) struct DiskState {
    file: File,
    current: Option<TableState>,
    user_cards: Vec<(String, String, String)>,
    pub slot: crate::registry::WriterSlot,
    pub stats: WriterStats,
    pub record_type_name: String,
}

impl DiskState {
    /// Create the file and write the primary header block.
    pub fn create(
        path: &Path,
        user_cards: &[(String, String, String)],
        slot: crate::registry::WriterSlot,
    ) -> ZTileResult<Self> {
        let mut file = File::create(path)?;

        let mut primary = Header::new();
        primary.set_bool("SIMPLE", true, "file conforms to the standard")?;
        primary.set_int("BITPIX", 8, "bits per data pixel")?;
        primary.set_int("NAXIS", 0, "number of data axes")?;
        primary.set_bool("EXTEND", true, "extensions may be present")?;
        for (key, value, comment) in user_cards {
            primary.set_str(key, value.clone(), comment)?;
        }
        let bytes = primary.to_bytes()?;
        file.write_all(&bytes)?;

        Ok(Self {
            file,
            current: None,
            user_cards: user_cards.to_vec(),
            slot,
            stats: WriterStats::default(),
            record_type_name: String::new(),
        })
    }

    /// Begin a new table at the current end of file.
    pub fn start_table(
        &mut self,
        name: &str,
        rows_per_tile: u32,
        capacity: u32,
    ) -> ZTileResult<u64> {
        if self.current.is_some() {
            ztile_bail!(
                Configuration: "a table is already open for writing; finish it before starting another"
            );
        }
        let table_start = self.file.seek(SeekFrom::End(0))?;
        self.slot.push_table_start(table_start);
        self.current = Some(TableState {
            name: name.to_string(),
            header: Header::new(),
            table_start,
            flat: None,
            catalog: None,
            rows_per_tile,
            capacity,
            catalog_offset: 0,
            heap_start: 0,
            heap_bytes: 0,
            heapsum: Checksum::new(),
            rawsum: Checksum::new(),
            raw_heap_size: 0,
            tiles_written: 0,
            rows_written: 0,
            header_written: false,
        });
        Ok(table_start)
    }

    /// Write the table header with placeholder values, followed by the
    /// zeroed catalog region. All cards the finalize step updates are
    /// created here so the rewrite never changes the header's byte size.
    pub fn write_table_header(
        &mut self,
        flat: Arc<FlattenedSchema>,
        catalog: Arc<Mutex<Catalog>>,
    ) -> ZTileResult<()> {
        let user_cards = self.user_cards.clone();
        let record_type = self.record_type_name.clone();
        let Some(table) = self.current.as_mut() else {
            ztile_bail!("table header requested with no open table");
        };
        if table.header_written {
            return Ok(());
        }

        let num_cols = flat.num_columns();
        let catalog_row_width = (num_cols * CATALOG_ENTRY_SIZE) as i64;
        let capacity = i64::from(table.capacity);

        let header = &mut table.header;
        header.set_str("XTENSION", "BINTABLE", "binary table extension")?;
        header.set_int("BITPIX", 8, "8-bit bytes")?;
        header.set_int("NAXIS", 2, "2-dimensional binary table")?;
        header.set_int("NAXIS1", catalog_row_width, "width of table in bytes")?;
        header.set_int("NAXIS2", 0, "number of rows in table")?;
        header.set_int("PCOUNT", 0, "size of special data area")?;
        header.set_int("GCOUNT", 1, "one data group")?;
        header.set_int("TFIELDS", num_cols as i64, "number of fields in each row")?;
        header.set_str("EXTNAME", table.name.clone(), "name of extension table")?;
        header.set_bool("ZTABLE", true, "table is compressed")?;
        header.set_int("ZTILELEN", i64::from(table.rows_per_tile), "number of rows per tile")?;
        header.set_int("ZSHRINK", 1, "catalog shrink factor")?;
        header.set_int(
            "ZHEAPPTR",
            capacity * catalog_row_width,
            "offset of the heap area",
        )?;
        header.set_int("ZNAXIS1", 0, "width of uncompressed rows")?;
        header.set_int("ZNAXIS2", 0, "number of uncompressed rows")?;
        header.set_int("THEAP", 0, "")?;
        header.set_str("PBFHEAD", record_type, "record type name")?;
        for (i, column) in flat.columns.iter().enumerate() {
            let n = i + 1;
            header.set_str(&format!("TTYPE{n}"), column.name.clone(), "")?;
            header.set_str(&format!("TFORM{n}"), "2K", "catalog entry")?;
            header.set_str(
                &format!("ZFORM{n}"),
                format!("{}{}", column.count(), column.ptype.type_char()),
                "",
            )?;
            header.set_str(&format!("ZCTYP{n}"), column.scheme_name.clone(), "")?;
            header.set_str(&format!("TPBID{n}"), column.id_path.clone(), "Field ID")?;
        }
        for (key, value, comment) in &user_cards {
            header.set_str(key, value.clone(), comment)?;
        }
        header.set_str("RAWSUM", "0", "")?;
        header.set_float("ZRATIO", 0.0, "compression ratio")?;
        header.set_str("DATASUM", "0", "checksum of the data records")?;
        header.set_str("CHECKSUM", "0000000000000000", "checksum of the whole HDU")?;

        let bytes = table.header.to_bytes()?;
        self.file.seek(SeekFrom::Start(table.table_start))?;
        self.file.write_all(&bytes)?;
        table.catalog_offset = table.table_start + bytes.len() as u64;

        // Reserve the catalog region; real entries land here at finalize.
        let catalog_region = vec![0u8; (capacity * catalog_row_width) as usize];
        self.file.write_all(&catalog_region)?;
        table.heap_start = table.catalog_offset + catalog_region.len() as u64;

        table.flat = Some(flat);
        table.catalog = Some(catalog);
        table.header_written = true;
        Ok(())
    }

    /// Append one tile's bytes to the heap and record its catalog sizes.
    pub fn write_tile(&mut self, tile: &FinishedTile) -> ZTileResult<()> {
        let Some(table) = self.current.as_mut() else {
            ztile_bail!("tile arrived with no open table");
        };
        if !table.header_written {
            ztile_bail!("tile arrived before the table header was written");
        }

        let bytes = &tile.buffer.as_slice()[..tile.used];
        self.file
            .seek(SeekFrom::Start(table.heap_start + table.heap_bytes))?;
        self.file.write_all(bytes)?;

        if let Some(catalog) = table.catalog.as_ref() {
            catalog
                .lock()
                .set_row_sizes(tile.catalog_row, &tile.entries);
        }
        table.heapsum.update(bytes);
        table.rawsum.combine(&tile.rawsum);
        table.heap_bytes += bytes.len() as u64;
        table.raw_heap_size += tile.raw_bytes;
        table.tiles_written += 1;
        table.rows_written += u64::from(tile.num_rows);

        self.stats.bytes_written += bytes.len() as u64;
        self.stats.raw_bytes += tile.raw_bytes;
        self.stats.records_written += u64::from(tile.num_rows);
        self.stats.tiles_written += 1;
        Ok(())
    }

    /// Finalize the open table: shrink if over capacity, compute heap
    /// offsets, write the catalog, update every header key, checksum the
    /// HDU, and pad the file to the 2880-byte boundary.
    pub fn finish_table(&mut self, display_stats: bool) -> ZTileResult<()> {
        let Some(mut table) = self.current.take() else {
            return Ok(());
        };
        if !table.header_written {
            // A table that never saw a record leaves nothing but its name.
            return Ok(());
        }
        let flat = table
            .flat
            .clone()
            .ok_or_else(|| ztile_error::ztile_err!("finalizing a table without columns"))?;
        let catalog_arc = table
            .catalog
            .clone()
            .ok_or_else(|| ztile_error::ztile_err!("finalizing a table without a catalog"))?;
        let mut catalog = catalog_arc.lock();

        let heap_size = catalog.finalize_offsets(table.tiles_written)?;
        let shrink_factor = catalog.shrink();
        let rows_per_tile = i64::from(table.rows_per_tile) * i64::from(shrink_factor);

        let num_cols = flat.num_columns();
        let catalog_row_width = (num_cols * CATALOG_ENTRY_SIZE) as i64;
        let capacity = i64::from(table.capacity);
        let catalog_rows = table.tiles_written.min(table.capacity as usize) as i64;

        let header = &mut table.header;
        for (i, column) in flat.columns.iter().enumerate() {
            header.set_str(
                &format!("ZFORM{}", i + 1),
                format!("{}{}", column.count(), column.ptype.type_char()),
                "",
            )?;
        }
        header.set_int("ZNAXIS1", flat.row_width() as i64, "width of uncompressed rows")?;
        header.set_int("ZNAXIS2", table.rows_written as i64, "number of uncompressed rows")?;
        header.set_int("ZTILELEN", rows_per_tile, "number of rows per tile")?;
        header.set_int("ZSHRINK", i64::from(shrink_factor), "catalog shrink factor")?;
        header.set_int("NAXIS2", catalog_rows, "number of rows in table")?;
        header.set_int("THEAP", catalog_rows * catalog_row_width, "")?;
        // The data region is the full catalog reservation plus the heap.
        let pcount = capacity * catalog_row_width + heap_size - catalog_rows * catalog_row_width;
        header.set_int("PCOUNT", pcount, "size of special data area")?;
        if heap_size != 0 {
            header.set_float(
                "ZRATIO",
                table.raw_heap_size as f64 / heap_size as f64,
                "compression ratio",
            )?;
        }
        header.set_str("RAWSUM", table.rawsum.value().to_string(), "")?;

        // Write the catalog (big-endian) and compute the data checksum.
        let catalog_bytes = catalog.serialize();
        drop(catalog);
        self.file.seek(SeekFrom::Start(table.catalog_offset))?;
        self.file.write_all(&catalog_bytes)?;

        let mut catalogsum = Checksum::new();
        catalogsum.update(&catalog_bytes);
        let mut datasum = catalogsum;
        datasum.combine(&table.heapsum);

        // Pad the data region with zeros; they leave the checksum unchanged.
        let data_end = table.heap_start + table.heap_bytes;
        let aligned = data_end.div_ceil(FITS_BLOCK_SIZE as u64) * FITS_BLOCK_SIZE as u64;
        if aligned > data_end {
            self.file.seek(SeekFrom::Start(data_end))?;
            self.file.write_all(&vec![0u8; (aligned - data_end) as usize])?;
        }

        // Two-pass checksum closure: set DATASUM and a placeholder, sum the
        // header, then encode the complement into CHECKSUM.
        header.set_str("DATASUM", datasum.value().to_string(), "checksum of the data records")?;
        header.set_str("CHECKSUM", "0000000000000000", "checksum of the whole HDU")?;
        let mut hdusum = Checksum::new();
        hdusum.update(&header.to_bytes()?);
        hdusum.combine(&datasum);
        header.set_str("CHECKSUM", hdusum.encode(), "checksum of the whole HDU")?;

        let final_header = header.to_bytes()?;
        self.file.seek(SeekFrom::Start(table.table_start))?;
        self.file.write_all(&final_header)?;
        self.file.flush()?;

        // The closing identity must hold; anything else is a logic bug.
        let mut verify = Checksum::new();
        verify.update(&final_header);
        verify.combine(&datasum);
        if !verify.is_all_ones() {
            ztile_bail!(
                ChecksumMismatch: "table {} closed with checksum {:#010x} instead of all ones", table.name, verify.value()
            );
        }

        if display_stats && heap_size != 0 {
            log::info!(
                "table {}: {} rows in {} tiles, {} heap bytes, ratio {:.2}",
                table.name,
                table.rows_written,
                table.tiles_written,
                heap_size,
                table.raw_heap_size as f64 / heap_size as f64
            );
        }
        Ok(())
    }

    /// Total bytes written to the file so far.
    pub fn size_written_to_disk(&mut self) -> ZTileResult<u64> {
        Ok(self.file.seek(SeekFrom::End(0))?)
    }
}
