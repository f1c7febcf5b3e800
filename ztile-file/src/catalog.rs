//! The per-tile, per-column catalog and its heap-offset accounting.

use ztile_error::{ztile_bail, ZTileResult};

use crate::tile::TILE_HEADER_SIZE;

pub const CATALOG_ENTRY_SIZE: usize = 16;

/// One `(compressed size, heap offset)` pair. A zero/zero entry is a valid
/// "no data for this column in this tile" marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogEntry {
    pub size: i64,
    pub offset: i64,
}

pub type CatalogRow = Vec<CatalogEntry>;

/// Catalog rows in strict tile-arrival order.
///
/// Offsets only become meaningful after [`Catalog::finalize_offsets`]; until
/// then rows carry sizes filled in by completed tiles.
#[derive(Debug)]
pub struct Catalog {
    rows: Vec<CatalogRow>,
    num_cols: usize,
    /// The declared tile capacity (`num_tiles` at table creation).
    capacity: usize,
}

impl Catalog {
    pub fn new(num_cols: usize, capacity: usize) -> Self {
        Self {
            rows: Vec::new(),
            num_cols,
            capacity,
        }
    }

    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> &CatalogRow {
        &self.rows[index]
    }

    /// Append an empty row and return its index.
    pub fn add_row(&mut self) -> usize {
        self.rows.push(vec![CatalogEntry::default(); self.num_cols]);
        self.rows.len() - 1
    }

    /// Fill in one tile's sizes.
    pub fn set_row_sizes(&mut self, row: usize, entries: &[CatalogEntry]) {
        self.rows[row].copy_from_slice(entries);
    }

    /// Recompute heap offsets as a prefix sum over the first `tiles_written`
    /// rows, one tile header per row, and return the heap size so far.
    /// Zero-size entries keep offset zero; a negative size is a logic bug.
    pub fn finalize_offsets(&mut self, tiles_written: usize) -> ZTileResult<i64> {
        let mut heap_size = 0i64;
        let mut offset = 0i64;
        for row in self.rows.iter_mut().take(tiles_written) {
            offset += TILE_HEADER_SIZE as i64;
            heap_size += TILE_HEADER_SIZE as i64;
            for entry in row.iter_mut() {
                if entry.size < 0 {
                    ztile_bail!("negative block size {} in catalog", entry.size);
                }
                heap_size += entry.size;
                entry.offset = if entry.size == 0 { 0 } else { offset };
                offset += entry.size;
            }
        }
        Ok(heap_size)
    }

    /// The lossy accommodation for writing more tiles than declared: pad to
    /// a multiple of the capacity with empty rows, then keep only every
    /// `shrink_factor`-th row. Returns the factor (1 = nothing happened).
    pub fn shrink(&mut self) -> u32 {
        while self.rows.len() % self.capacity != 0 {
            self.add_row();
        }
        if self.rows.len() <= self.capacity {
            return 1;
        }
        let shrink_factor = (self.rows.len() / self.capacity) as u32;
        log::warn!(
            "more tiles were written than the catalog can hold; keeping every {}th of {} rows. \
             Index-based tools will disagree with the true tile count in this file.",
            shrink_factor,
            self.rows.len()
        );

        for target in 1..self.capacity {
            self.rows[target] = self.rows[target * shrink_factor as usize].clone();
        }
        self.rows.truncate(self.capacity);
        shrink_factor
    }

    /// On-disk form: `capacity × num_cols` big-endian `(size, offset)`
    /// pairs, rows beyond what was written zero-filled.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.capacity * self.num_cols * CATALOG_ENTRY_SIZE);
        for row in &self.rows {
            for entry in row {
                out.extend_from_slice(&entry.size.to_be_bytes());
                out.extend_from_slice(&entry.offset.to_be_bytes());
            }
        }
        out.resize(self.capacity * self.num_cols * CATALOG_ENTRY_SIZE, 0);
        out
    }

    /// Parse a catalog region read back from disk.
    pub fn parse(bytes: &[u8], num_cols: usize, capacity: usize) -> ZTileResult<Self> {
        let expected = capacity * num_cols * CATALOG_ENTRY_SIZE;
        if bytes.len() < expected {
            ztile_bail!(
                InvalidSerde: "catalog region of {} bytes, expected {}", bytes.len(), expected
            );
        }
        let mut rows = Vec::with_capacity(capacity);
        let mut pos = 0;
        for _ in 0..capacity {
            let mut row = Vec::with_capacity(num_cols);
            for _ in 0..num_cols {
                let mut size = [0u8; 8];
                let mut offset = [0u8; 8];
                size.copy_from_slice(&bytes[pos..pos + 8]);
                offset.copy_from_slice(&bytes[pos + 8..pos + 16]);
                pos += CATALOG_ENTRY_SIZE;
                let entry = CatalogEntry {
                    size: i64::from_be_bytes(size),
                    offset: i64::from_be_bytes(offset),
                };
                if entry.size < 0 {
                    ztile_bail!(InvalidSerde: "negative block size {} in catalog", entry.size);
                }
                row.push(entry);
            }
            rows.push(row);
        }
        Ok(Self {
            rows,
            num_cols,
            capacity,
        })
    }
}

#[cfg(test)]
mod test {
    use super::{Catalog, CatalogEntry};
    use crate::tile::TILE_HEADER_SIZE;

    fn sized(catalog: &mut Catalog, sizes: &[&[i64]]) {
        for row_sizes in sizes {
            let row = catalog.add_row();
            let entries: Vec<CatalogEntry> = row_sizes
                .iter()
                .map(|&s| CatalogEntry { size: s, offset: 0 })
                .collect();
            catalog.set_row_sizes(row, &entries);
        }
    }

    #[test]
    fn offsets_are_a_prefix_sum_with_tile_headers() {
        let mut catalog = Catalog::new(2, 10);
        sized(&mut catalog, &[&[100, 50], &[70, 0]]);
        let heap = catalog.finalize_offsets(2).unwrap();

        let h = TILE_HEADER_SIZE as i64;
        assert_eq!(heap, 2 * h + 100 + 50 + 70);
        assert_eq!(catalog.row(0)[0], CatalogEntry { size: 100, offset: h });
        assert_eq!(
            catalog.row(0)[1],
            CatalogEntry { size: 50, offset: h + 100 }
        );
        assert_eq!(
            catalog.row(1)[0],
            CatalogEntry { size: 70, offset: 2 * h + 150 }
        );
        // Empty entries keep offset zero.
        assert_eq!(catalog.row(1)[1], CatalogEntry { size: 0, offset: 0 });
    }

    #[test]
    fn negative_sizes_are_a_logic_bug() {
        let mut catalog = Catalog::new(1, 4);
        sized(&mut catalog, &[&[-1]]);
        assert!(catalog.finalize_offsets(1).is_err());
    }

    #[test]
    fn shrink_keeps_every_nth_row() {
        let mut catalog = Catalog::new(1, 3);
        sized(
            &mut catalog,
            &[&[10], &[11], &[12], &[13], &[14], &[15], &[16]],
        );
        // 7 rows pad to 9, factor 3: rows kept are 0, 3, 6.
        let factor = catalog.shrink();
        assert_eq!(factor, 3);
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.row(0)[0].size, 10);
        assert_eq!(catalog.row(1)[0].size, 13);
        assert_eq!(catalog.row(2)[0].size, 16);
    }

    #[test]
    fn shrink_is_identity_within_capacity() {
        let mut catalog = Catalog::new(1, 8);
        sized(&mut catalog, &[&[10], &[11]]);
        assert_eq!(catalog.shrink(), 1);
        assert_eq!(catalog.len(), 8, "padded to a multiple of the capacity");
        assert_eq!(catalog.row(1)[0].size, 11);
    }

    #[test]
    fn serialization_round_trips_big_endian() {
        let mut catalog = Catalog::new(2, 4);
        sized(&mut catalog, &[&[100, 50]]);
        catalog.finalize_offsets(1).unwrap();
        let bytes = catalog.serialize();
        assert_eq!(bytes.len(), 4 * 2 * 16);
        // Big-endian size in the first eight bytes.
        assert_eq!(&bytes[..8], &100i64.to_be_bytes());

        let parsed = Catalog::parse(&bytes, 2, 4).unwrap();
        assert_eq!(parsed.row(0)[0], catalog.row(0)[0]);
        assert_eq!(parsed.row(3)[1], CatalogEntry::default());
    }
}
