//! The concurrency layer: a pool of compression workers, greedy least-loaded
//! dispatch, and a single strictly sequence-ordered disk stage.
//!
//! Every unit of work carries a monotonically increasing sequence number
//! assigned at submission. Compression finishes out of order across workers;
//! the disk stage holds a reorder buffer and applies an operation only when
//! its number is the next expected one, so tiles land on disk in submission
//! order. Table lifecycle operations ride the same numbering as virtual
//! tiles, which totally orders them against the data.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use ztile_codec::CodecParams;
use ztile_error::{ztile_err, ZTileError, ZTileResult};
use ztile_record::Record;

use crate::catalog::Catalog;
use crate::flatten::FlattenedSchema;
use crate::output::{DiskState, FinishedTile};
use crate::pool::{PoolBuffer, RecordPool};
use crate::tile::compress_tile;

/// A filled tile on its way to a compression worker.
pub(crate) struct CompressionJob {
    pub seq: u64,
    pub records: Vec<Record>,
    pub catalog_row: usize,
    pub columns: Arc<FlattenedSchema>,
    pub params: CodecParams,
    pub gather: PoolBuffer,
    pub scratch: PoolBuffer,
    pub out: PoolBuffer,
}

/// Lifecycle operations sequenced through the disk stage.
pub(crate) enum ControlOp {
    StartTable {
        name: String,
        rows_per_tile: u32,
        capacity: u32,
    },
    WriteTableHeader {
        flat: Arc<FlattenedSchema>,
        catalog: Arc<Mutex<Catalog>>,
    },
    FinishTable {
        display_stats: bool,
    },
    Sync,
}

pub(crate) enum DiskOp {
    Tile {
        seq: u64,
        result: ZTileResult<FinishedTile>,
    },
    Control {
        seq: u64,
        op: ControlOp,
        ack: Option<flume::Sender<ZTileResult<()>>>,
    },
}

impl DiskOp {
    fn seq(&self) -> u64 {
        match self {
            DiskOp::Tile { seq, .. } => *seq,
            DiskOp::Control { seq, .. } => *seq,
        }
    }
}

/// First error wins; everything after it is skipped until the next barrier
/// surfaces the stored error.
#[derive(Default)]
pub(crate) struct ErrorSlot {
    inner: Mutex<ErrorState>,
}

#[derive(Default)]
struct ErrorState {
    error: Option<ZTileError>,
    poisoned: bool,
}

impl ErrorSlot {
    pub fn poison(&self, error: ZTileError) {
        let mut state = self.inner.lock();
        state.poisoned = true;
        if state.error.is_none() {
            state.error = Some(error);
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.inner.lock().poisoned
    }

    /// Take the stored error; later calls report a generic poisoned state.
    pub fn take(&self) -> Option<ZTileError> {
        let mut state = self.inner.lock();
        if !state.poisoned {
            return None;
        }
        Some(state.error.take().unwrap_or_else(|| {
            ztile_err!(Configuration: "the write pipeline was poisoned by an earlier error")
        }))
    }
}

struct WorkerHandle {
    tx: flume::Sender<CompressionJob>,
    handle: JoinHandle<()>,
}

pub(crate) struct Orchestrator {
    workers: Vec<WorkerHandle>,
    disk_tx: Option<flume::Sender<DiskOp>>,
    disk_handle: Option<JoinHandle<()>>,
    disk: Arc<Mutex<DiskState>>,
    error: Arc<ErrorSlot>,
    record_pool: Arc<RecordPool>,
    /// Synchronous fallback sequencing when no workers are running.
    sync_next: u64,
    /// Per-worker artificial latency for scheduling-adversarial tests.
    jitter_ms: u64,
}

impl Orchestrator {
    pub fn new(
        disk: Arc<Mutex<DiskState>>,
        record_pool: Arc<RecordPool>,
        num_workers: usize,
        jitter_ms: u64,
    ) -> Self {
        let error = Arc::new(ErrorSlot::default());
        if num_workers == 0 {
            return Self {
                workers: Vec::new(),
                disk_tx: None,
                disk_handle: None,
                disk,
                error,
                record_pool,
                sync_next: 0,
                jitter_ms,
            };
        }

        let (disk_tx, disk_rx) = flume::unbounded::<DiskOp>();
        let disk_handle = {
            let disk = Arc::clone(&disk);
            let error = Arc::clone(&error);
            std::thread::Builder::new()
                .name("ztile-disk".to_string())
                .spawn(move || disk_loop(disk_rx, disk, error))
                .expect("spawn disk thread")
        };

        let workers = (0..num_workers)
            .map(|i| {
                let (tx, rx) = flume::unbounded::<CompressionJob>();
                let disk_tx = disk_tx.clone();
                let record_pool = Arc::clone(&record_pool);
                let handle = std::thread::Builder::new()
                    .name(format!("ztile-compress-{i}"))
                    .spawn(move || worker_loop(rx, disk_tx, record_pool, jitter_ms))
                    .expect("spawn compression worker");
                WorkerHandle { tx, handle }
            })
            .collect();

        Self {
            workers,
            disk_tx: Some(disk_tx),
            disk_handle: Some(disk_handle),
            disk,
            error,
            record_pool,
            sync_next: 0,
            jitter_ms,
        }
    }

    /// Dispatch a filled tile to the least-loaded worker queue, or run the
    /// whole path inline in synchronous mode.
    pub fn submit_tile(&mut self, job: CompressionJob) {
        if self.workers.is_empty() {
            let seq = job.seq;
            debug_assert_eq!(seq, self.sync_next);
            self.sync_next = seq + 1;
            let result = compress_job(job, &self.record_pool, self.jitter_ms);
            apply_tile(&self.disk, &self.error, result);
            return;
        }
        let worker = self
            .workers
            .iter()
            .min_by_key(|w| w.tx.len())
            .expect("at least one worker");
        // Send can only fail if the worker died, which poisons the pipeline.
        if worker.tx.send(job).is_err() {
            self.error
                .poison(ztile_err!("a compression worker terminated unexpectedly"));
        }
    }

    /// Sequence a lifecycle operation. Returns a receiver for its outcome
    /// when `ack` is requested.
    pub fn submit_control(
        &mut self,
        seq: u64,
        op: ControlOp,
        want_ack: bool,
    ) -> Option<flume::Receiver<ZTileResult<()>>> {
        if let Some(disk_tx) = self.disk_tx.as_ref() {
            let (tx, rx) = flume::bounded(1);
            let ack = want_ack.then(|| tx.clone());
            if disk_tx
                .send(DiskOp::Control { seq, op, ack })
                .is_err()
            {
                self.error
                    .poison(ztile_err!("the disk stage terminated unexpectedly"));
                return None;
            }
            return want_ack.then_some(rx);
        }

        // Synchronous mode: apply in place.
        debug_assert_eq!(seq, self.sync_next);
        self.sync_next = seq + 1;
        let result = apply_control(&self.disk, &self.error, op);
        if want_ack {
            let (tx, rx) = flume::bounded(1);
            let _ = tx.send(result);
            return Some(rx);
        }
        if let Err(e) = result {
            self.error.poison(e);
        }
        None
    }

    /// Wait for every operation up to and including `seq` to be applied.
    pub fn barrier(&mut self, seq: u64) -> ZTileResult<()> {
        let rx = self.submit_control(seq, ControlOp::Sync, true);
        if let Some(rx) = rx {
            match rx.recv() {
                Ok(result) => result?,
                Err(_) => {
                    if let Some(e) = self.error.take() {
                        return Err(e);
                    }
                    return Err(ztile_err!("the disk stage dropped a sync acknowledgement"));
                }
            }
        }
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        for worker in self.workers.drain(..) {
            drop(worker.tx);
            let _ = worker.handle.join();
        }
        self.disk_tx.take();
        if let Some(handle) = self.disk_handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    rx: flume::Receiver<CompressionJob>,
    disk_tx: flume::Sender<DiskOp>,
    record_pool: Arc<RecordPool>,
    jitter_ms: u64,
) {
    while let Ok(job) = rx.recv() {
        let seq = job.seq;
        let result = compress_job(job, &record_pool, jitter_ms);
        if disk_tx
            .send(DiskOp::Tile {
                seq,
                result: result.map(|(_, tile)| tile),
            })
            .is_err()
        {
            return;
        }
    }
}

type SequencedTile = (u64, FinishedTile);

/// Serialize and compress one tile, recycling its records afterwards.
fn compress_job(
    mut job: CompressionJob,
    record_pool: &RecordPool,
    jitter_ms: u64,
) -> ZTileResult<SequencedTile> {
    if jitter_ms > 0 {
        // Deterministically uneven latency, so tiles finish out of order.
        let delay = (job.seq * 7919) % jitter_ms;
        std::thread::sleep(std::time::Duration::from_millis(delay));
    }

    let gather = job.gather.as_vec_mut();
    let compressed = compress_tile(
        &job.records,
        &job.columns.columns,
        &job.params,
        gather,
        job.scratch.as_mut_slice(),
        job.out.as_mut_slice(),
    )?;

    let num_rows = job.records.len() as u32;
    record_pool.release_all(job.records.drain(..));

    Ok((
        job.seq,
        FinishedTile {
            buffer: job.out,
            used: compressed.bytes_used,
            entries: compressed.entries,
            catalog_row: job.catalog_row,
            num_rows,
            raw_bytes: compressed.raw_bytes,
            rawsum: compressed.rawsum,
        },
    ))
}

fn disk_loop(
    rx: flume::Receiver<DiskOp>,
    disk: Arc<Mutex<DiskState>>,
    error: Arc<ErrorSlot>,
) {
    let mut pending: BTreeMap<u64, DiskOp> = BTreeMap::new();
    let mut next = 0u64;
    while let Ok(op) = rx.recv() {
        pending.insert(op.seq(), op);
        // Apply the run of consecutive operations starting at the expected
        // sequence number; anything else waits in the reorder buffer.
        while let Some(op) = pending.remove(&next) {
            next += 1;
            match op {
                DiskOp::Tile { result, .. } => {
                    apply_tile(&disk, &error, result.map(|t| (next - 1, t)));
                }
                DiskOp::Control { op, ack, .. } => {
                    let result = apply_control(&disk, &error, op);
                    match ack {
                        Some(ack) => {
                            let _ = ack.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                error.poison(e);
                            }
                        }
                    }
                }
            }
        }
    }
}

fn apply_tile(
    disk: &Arc<Mutex<DiskState>>,
    error: &Arc<ErrorSlot>,
    result: ZTileResult<SequencedTile>,
) {
    let outcome = result.and_then(|(_, tile)| {
        if error.is_poisoned() {
            return Ok(());
        }
        disk.lock().write_tile(&tile)
    });
    if let Err(e) = outcome {
        error.poison(e);
    }
}

fn apply_control(
    disk: &Arc<Mutex<DiskState>>,
    error: &Arc<ErrorSlot>,
    op: ControlOp,
) -> ZTileResult<()> {
    if error.is_poisoned() && !matches!(op, ControlOp::Sync) {
        return Err(
            ztile_err!(Configuration: "the write pipeline was poisoned by an earlier error"),
        );
    }
    match op {
        ControlOp::StartTable {
            name,
            rows_per_tile,
            capacity,
        } => disk
            .lock()
            .start_table(&name, rows_per_tile, capacity)
            .map(|_| ()),
        ControlOp::WriteTableHeader { flat, catalog } => {
            disk.lock().write_table_header(flat, catalog)
        }
        ControlOp::FinishTable { display_stats } => disk.lock().finish_table(display_stats),
        ControlOp::Sync => Ok(()),
    }
}
