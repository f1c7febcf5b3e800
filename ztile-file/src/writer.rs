//! The public writing API.
//!
//! A [`TableWriter`] owns a file, a bounded buffer pool, a compression
//! worker pool and the ordered disk stage. The table-mutating calls run on
//! the caller's thread and only enqueue work; they block solely when the
//! buffer pool is exhausted, and `flush`/`move_to_new_table`/`close` are the
//! synchronization barriers at which deferred worker errors surface.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use ztile_codec::CodecParams;
use ztile_error::{ztile_bail, ZTileResult};
use ztile_record::{Record, SchemaRef};

use crate::catalog::Catalog;
use crate::config::CompressionConfig;
use crate::flatten::{flatten, FlattenedSchema};
use crate::orchestrator::{CompressionJob, ControlOp, Orchestrator};
use crate::output::DiskState;
pub use crate::output::WriterStats;
use crate::pool::{BufferPool, RecordPool};
use crate::registry::{self, WriterSlot};
use crate::tile::TILE_HEADER_SIZE;

/// The registry kind of this writer; at most one may be live per process.
const WRITER_KIND: &str = "flat-table";

#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Catalog capacity: the declared number of tiles per table.
    pub num_tiles: u32,
    pub rows_per_tile: u32,
    /// Budget for the shared compression buffer pool, in bytes.
    pub max_compression_memory: usize,
    /// Compression workers. Zero runs the whole pipeline synchronously on
    /// the calling thread.
    pub num_threads: usize,
    /// Per-tile compression buffer size; zero derives it from the schema.
    pub compression_block_size: usize,
    pub default_scheme: String,
    /// Artificial worker latency spread used by scheduling tests.
    pub(crate) jitter_ms: u64,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            num_tiles: 1000,
            rows_per_tile: 100,
            max_compression_memory: 64 << 20,
            num_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            compression_block_size: 0,
            default_scheme: registry::process_default_scheme()
                .unwrap_or_else(|| "raw".to_string()),
            jitter_ms: 0,
        }
    }
}

impl WriterOptions {
    #[cfg(test)]
    pub(crate) fn with_jitter(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }
}

pub struct TableWriter {
    options: WriterOptions,
    config: CompressionConfig,
    vetoed: FxHashSet<String>,
    allowed: FxHashSet<String>,
    flat: Option<Arc<FlattenedSchema>>,
    catalog: Option<Arc<Mutex<Catalog>>>,
    params: CodecParams,
    disk: Arc<Mutex<DiskState>>,
    orchestrator: Orchestrator,
    buffer_pool: Arc<BufferPool>,
    record_pool: Arc<RecordPool>,
    batch: Vec<Record>,
    next_seq: u64,
    header_sent: bool,
    closed: bool,
}

impl std::fmt::Debug for TableWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableWriter")
            .field("next_seq", &self.next_seq)
            .field("header_sent", &self.header_sent)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl TableWriter {
    /// Open `path` for writing, write the primary header, and start the
    /// worker pool. Fails while another writer of this kind is live.
    pub fn create(path: impl AsRef<Path>, options: WriterOptions) -> ZTileResult<Self> {
        Self::create_with_cards(path, options, &[])
    }

    /// Like [`TableWriter::create`] with extra string cards for the headers.
    pub fn create_with_cards(
        path: impl AsRef<Path>,
        options: WriterOptions,
        user_cards: &[(String, String, String)],
    ) -> ZTileResult<Self> {
        let slot = WriterSlot::acquire(WRITER_KIND)?;
        let disk = Arc::new(Mutex::new(DiskState::create(
            path.as_ref(),
            user_cards,
            slot,
        )?));
        let record_pool = Arc::new(RecordPool::new());
        let orchestrator = Orchestrator::new(
            Arc::clone(&disk),
            Arc::clone(&record_pool),
            options.num_threads,
            options.jitter_ms,
        );
        let buffer_pool = BufferPool::new(
            options.compression_block_size.max(1 << 16),
            options.max_compression_memory,
        );
        let config = CompressionConfig::new(&options.default_scheme)?;
        let params = config.params().clone();

        let mut writer = Self {
            options,
            config,
            vetoed: FxHashSet::default(),
            allowed: FxHashSet::default(),
            flat: None,
            catalog: None,
            params,
            disk,
            orchestrator,
            buffer_pool,
            record_pool,
            batch: Vec::new(),
            next_seq: 0,
            header_sent: false,
            closed: false,
        };
        writer.start_table("DATA")?;
        Ok(writer)
    }

    fn start_table(&mut self, name: &str) -> ZTileResult<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.orchestrator.submit_control(
            seq,
            ControlOp::StartTable {
                name: name.to_string(),
                rows_per_tile: self.options.rows_per_tile,
                capacity: self.options.num_tiles,
            },
            false,
        );
        Ok(())
    }

    /// Replace the table default compression. Only allowed before the
    /// schema is fixed by the first record.
    pub fn set_default_compression(&mut self, scheme: &str) -> ZTileResult<()> {
        if self.flat.is_some() {
            ztile_bail!(
                Configuration: "compression cannot change after the first record fixed the columns"
            );
        }
        self.config.set_default(scheme)?;
        self.params = self.config.params().clone();
        Ok(())
    }

    /// Bind a dotted field path to a compression scheme.
    pub fn request_explicit_compression(&mut self, field: &str, scheme: &str) -> ZTileResult<()> {
        if self.flat.is_some() {
            ztile_bail!(
                Configuration: "compression cannot change after the first record fixed the columns"
            );
        }
        self.config.request_explicit(field, scheme)?;
        self.params = self.config.params().clone();
        Ok(())
    }

    /// Exclude a field (dotted path) from the columns even when present.
    pub fn veto_field(&mut self, field: &str) {
        self.vetoed.insert(field.to_string());
    }

    /// Admit a field that would otherwise be skipped for being empty on the
    /// example record.
    pub fn allow_field(&mut self, field: &str) {
        self.allowed.insert(field.to_string());
    }

    /// Fix the table's columns from an example record. Called implicitly by
    /// the first [`TableWriter::write_record`]; calling it again is fatal.
    pub fn init_columns(&mut self, example: &Record) -> ZTileResult<()> {
        if self.flat.is_some() {
            ztile_bail!(Configuration: "columns were already initialized for this table");
        }
        let flat = Arc::new(flatten(
            example,
            &self.config,
            &self.vetoed,
            &self.allowed,
        )?);
        if flat.num_columns() == 0 {
            ztile_bail!(Configuration: "the example record produced no columns");
        }
        let catalog = Arc::new(Mutex::new(Catalog::new(
            flat.num_columns(),
            self.options.num_tiles as usize,
        )));

        self.disk.lock().record_type_name = example.schema().name().to_string();
        self.ensure_block_size(&flat)?;
        self.flat = Some(flat);
        self.catalog = Some(catalog);
        Ok(())
    }

    /// Make sure the pool's chunk size can hold a worst-case tile.
    fn ensure_block_size(&mut self, flat: &FlattenedSchema) -> ZTileResult<()> {
        let per_row = flat.max_serialized_width();
        let overhead: u64 = flat
            .columns
            .iter()
            .map(|c| {
                ztile_codec::BlockHeader::encoded_len_for(c.pipeline.stages().len()) as u64 + 16
            })
            .sum::<u64>()
            + TILE_HEADER_SIZE as u64
            + 1024;
        let needed = if self.options.compression_block_size > 0 {
            self.options.compression_block_size as u64
        } else {
            per_row * u64::from(self.options.rows_per_tile) + overhead
        };
        self.buffer_pool.set_chunk_size(needed as usize);
        if !self.buffer_pool.can_ever_hold(3) {
            ztile_bail!(
                Configuration: "not enough compression memory: one tile needs 3 x {} bytes but the budget is {} bytes; increase the memory or lower the rows per tile",
                self.buffer_pool.chunk_size(),
                self.buffer_pool.max_memory()
            );
        }
        Ok(())
    }

    /// Queue one record. Blocks only when the buffer pool is exhausted.
    pub fn write_record(&mut self, record: Record) -> ZTileResult<()> {
        if self.closed {
            ztile_bail!(Configuration: "the writer is closed");
        }
        if self.flat.is_none() {
            self.init_columns(&record)?;
        }
        let flat = self.flat.as_ref().expect("columns initialized");
        if record.schema() != &flat.schema {
            ztile_bail!(
                Configuration: "record schema {} does not match the table's fixed schema {}",
                record.schema().name(),
                flat.schema.name()
            );
        }

        self.batch.push(record);
        if self.batch.len() >= self.options.rows_per_tile as usize {
            self.dispatch_tile()?;
        }
        Ok(())
    }

    /// A recycled (or fresh) record for the caller to fill.
    pub fn acquire_record(&self, schema: &SchemaRef) -> Record {
        self.record_pool.acquire(schema)
    }

    fn dispatch_tile(&mut self) -> ZTileResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let flat = Arc::clone(self.flat.as_ref().expect("columns initialized"));
        let catalog = Arc::clone(self.catalog.as_ref().expect("catalog initialized"));

        // Late records can have grown the variable-width ceilings; keep the
        // chunk size ahead of both the ceilings and this batch's true size.
        self.ensure_block_size(&flat)?;
        let batch_bytes = self
            .batch
            .iter()
            .map(|r| crate::serialize::serialized_size(r, &flat.columns))
            .sum::<ZTileResult<u64>>()?;
        let padded = batch_bytes + 4 * flat.num_columns() as u64 + 1024;
        if padded > self.buffer_pool.chunk_size() as u64 {
            self.buffer_pool.set_chunk_size(padded as usize);
            if !self.buffer_pool.can_ever_hold(3) {
                ztile_bail!(
                    Configuration: "not enough compression memory for a {} byte tile within the {} byte budget",
                    padded,
                    self.buffer_pool.max_memory()
                );
            }
        }

        if !self.header_sent {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.orchestrator.submit_control(
                seq,
                ControlOp::WriteTableHeader {
                    flat: Arc::clone(&flat),
                    catalog: Arc::clone(&catalog),
                },
                false,
            );
            self.header_sent = true;
        }

        let catalog_row = catalog.lock().add_row();
        let records = std::mem::take(&mut self.batch);
        let seq = self.next_seq;
        self.next_seq += 1;

        let job = CompressionJob {
            seq,
            records,
            catalog_row,
            columns: flat,
            params: self.params.clone(),
            gather: self.buffer_pool.acquire(),
            scratch: self.buffer_pool.acquire(),
            out: self.buffer_pool.acquire(),
        };
        self.orchestrator.submit_tile(job);
        Ok(())
    }

    /// Wait for all queued compression and disk work to finish; any error
    /// captured since the last barrier is re-raised here.
    pub fn flush(&mut self) -> ZTileResult<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.orchestrator.barrier(seq)
    }

    /// Explicitly write the table header now. Requires the schema to be
    /// fixed; normally this happens automatically with the first full tile.
    pub fn write_table_header(&mut self) -> ZTileResult<()> {
        let (Some(flat), Some(catalog)) = (self.flat.as_ref(), self.catalog.as_ref()) else {
            ztile_bail!(
                Configuration: "cannot write a table header before the first record fixes the schema"
            );
        };
        if self.header_sent {
            return Ok(());
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.orchestrator.submit_control(
            seq,
            ControlOp::WriteTableHeader {
                flat: Arc::clone(flat),
                catalog: Arc::clone(catalog),
            },
            false,
        );
        self.header_sent = true;
        Ok(())
    }

    /// Finish the current table and start a new one. Flushes the partial
    /// tile, drains all queues and finalizes the catalog and header.
    pub fn move_to_new_table(&mut self, name: &str, display_stats: bool) -> ZTileResult<()> {
        if self.closed {
            ztile_bail!(Configuration: "the writer is closed");
        }
        self.dispatch_tile()?;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.orchestrator
            .submit_control(seq, ControlOp::FinishTable { display_stats }, false);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.orchestrator.barrier(seq)?;

        self.flat = None;
        self.catalog = None;
        self.header_sent = false;
        self.start_table(name)
    }

    /// Finalize the file: flush the partial tile, drain every queue, write
    /// catalog, header keys and checksums, and validate the closing
    /// checksum identity.
    pub fn close(mut self, display_stats: bool) -> ZTileResult<WriterStats> {
        self.close_inner(display_stats)
    }

    fn close_inner(&mut self, display_stats: bool) -> ZTileResult<WriterStats> {
        if self.closed {
            ztile_bail!(Configuration: "the writer is already closed");
        }
        let dispatched = self.dispatch_tile();
        self.closed = true;
        dispatched?;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.orchestrator
            .submit_control(seq, ControlOp::FinishTable { display_stats }, false);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.orchestrator.barrier(seq)?;
        Ok(self.disk.lock().stats)
    }

    pub fn num_records_written(&self) -> u64 {
        self.disk.lock().stats.records_written + self.batch.len() as u64
    }

    pub fn bytes_written(&self) -> u64 {
        self.disk.lock().stats.bytes_written
    }

    /// Total file size so far, headers and padding included.
    pub fn size_written_to_disk(&self) -> ZTileResult<u64> {
        self.disk.lock().size_written_to_disk()
    }

    pub fn percent_mem_used(&self) -> u32 {
        self.buffer_pool.percent_used()
    }

    /// Mean per-chunk quantization error of the lossy integer stages.
    pub fn lossy_average_error(&self) -> f64 {
        self.params.lossy_stats.average_error()
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }
}

impl Drop for TableWriter {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close_inner(false) {
                log::warn!("closing a dropped writer failed: {e}");
            }
        }
    }
}
