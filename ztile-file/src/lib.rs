//! A tiled, compressed columnar container for structured records.
//!
//! Records are grouped into row tiles; each tile's columns are compressed
//! independently through per-column codec pipelines, and a catalog of
//! per-tile, per-column byte offsets and sizes makes any record reachable
//! without scanning the heap. The on-disk shape is a FITS-style binary
//! table: 80-byte ASCII header cards, a big-endian catalog region, then the
//! heap of compressed tiles, everything padded to 2880-byte blocks.
//!
//! [`TableWriter`] is the writing entry point, [`TableReader`] the reading
//! one; both speak the dynamic record model of `ztile-record`.

pub use cards::{Card, CardValue, Header};
pub use catalog::{Catalog, CatalogEntry, CatalogRow, CATALOG_ENTRY_SIZE};
pub use checksum::Checksum;
pub use column::{ColumnDescriptor, ColumnShape, PathSeg};
pub use config::CompressionConfig;
pub use flatten::{flatten, FlattenedSchema};
pub use pool::{BufferPool, PoolBuffer, RecordPool};
pub use reader::TableReader;
pub use registry::{
    process_default_scheme, set_process_default_scheme, WriterSlot, MAX_WRITER_SLOTS,
};
pub use tile::{CompressedTile, TileHeader, TILE_HEADER_SIZE, TILE_MAGIC};
pub use writer::{TableWriter, WriterOptions, WriterStats};

mod cards;
mod catalog;
mod checksum;
mod column;
mod config;
mod flatten;
mod orchestrator;
mod output;
mod pool;
mod reader;
mod registry;
mod serialize;
#[cfg(test)]
mod tests;
mod tile;
mod writer;

/// Everything in the container is padded to this block size.
pub const FITS_BLOCK_SIZE: usize = 2880;
