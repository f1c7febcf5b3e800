//! Bounded buffer memory pool and the record recycling pool.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use ztile_record::{Record, SchemaRef};

struct PoolState {
    chunk_size: usize,
    max_memory: usize,
    allocated: usize,
    free: Vec<Vec<u8>>,
}

/// A fixed-budget pool of equally sized byte buffers shared by every
/// compression worker. Acquiring blocks the caller until a buffer frees up,
/// which is the backpressure that keeps a fast producer from outrunning the
/// compression and disk stages.
pub struct BufferPool {
    state: Mutex<PoolState>,
    freed: Condvar,
}

impl BufferPool {
    pub fn new(chunk_size: usize, max_memory: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                chunk_size: chunk_size.max(1),
                max_memory: max_memory.max(chunk_size),
                allocated: 0,
                free: Vec::new(),
            }),
            freed: Condvar::new(),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.state.lock().chunk_size
    }

    pub fn max_memory(&self) -> usize {
        self.state.lock().max_memory
    }

    /// Grow the chunk size (a record turned out bigger than planned).
    /// Cached buffers of the old size are dropped.
    pub fn set_chunk_size(&self, chunk_size: usize) {
        let mut state = self.state.lock();
        if chunk_size > state.chunk_size {
            state.chunk_size = chunk_size;
            state.free.clear();
        }
    }

    /// Percentage of the memory budget currently handed out.
    pub fn percent_used(&self) -> u32 {
        let state = self.state.lock();
        let in_use = state.allocated - state.free.len() * state.chunk_size;
        (in_use * 100 / state.max_memory.max(1)) as u32
    }

    /// Whether `buffers` more chunks fit in the budget at all.
    pub fn can_ever_hold(&self, buffers: usize) -> bool {
        let state = self.state.lock();
        buffers * state.chunk_size <= state.max_memory
    }

    /// Take a buffer, blocking until the budget allows one.
    pub fn acquire(self: &Arc<Self>) -> PoolBuffer {
        let mut state = self.state.lock();
        loop {
            if let Some(buf) = state.free.pop() {
                let nominal = state.chunk_size;
                return PoolBuffer {
                    buf: Some(buf),
                    nominal,
                    pool: Arc::clone(self),
                };
            }
            if state.allocated + state.chunk_size <= state.max_memory {
                state.allocated += state.chunk_size;
                let buf = vec![0u8; state.chunk_size];
                let nominal = state.chunk_size;
                return PoolBuffer {
                    buf: Some(buf),
                    nominal,
                    pool: Arc::clone(self),
                };
            }
            self.freed.wait(&mut state);
        }
    }

    fn release(&self, mut buf: Vec<u8>, nominal: usize) {
        let mut state = self.state.lock();
        if nominal == state.chunk_size && buf.capacity() >= state.chunk_size {
            buf.clear();
            buf.resize(state.chunk_size, 0);
            state.free.push(buf);
        } else {
            // The chunk size grew while this buffer was out; retire it.
            state.allocated = state.allocated.saturating_sub(nominal);
        }
        drop(state);
        self.freed.notify_one();
    }
}

/// An owned buffer that returns to its pool on drop.
pub struct PoolBuffer {
    buf: Option<Vec<u8>>,
    nominal: usize,
    pool: Arc<BufferPool>,
}

impl PoolBuffer {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("buffer present until drop")
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_ref().expect("buffer present until drop")
    }

    /// Growable view for code that assembles variable-length output.
    pub fn as_vec_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer present until drop")
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf, self.nominal);
        }
    }
}

/// Recycles record allocations across tiles, keyed by schema identity.
#[derive(Default)]
pub struct RecordPool {
    state: Mutex<FxHashMap<String, Vec<Record>>>,
}

impl RecordPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cleared record of `schema`, reusing an allocation when one exists.
    pub fn acquire(&self, schema: &SchemaRef) -> Record {
        let mut state = self.state.lock();
        if let Some(pool) = state.get_mut(schema.name()) {
            while let Some(mut rec) = pool.pop() {
                if rec.schema() == schema {
                    rec.clear();
                    return rec;
                }
                // Schema changed under the same name; drop the stale record.
            }
        }
        Record::new(schema.clone())
    }

    /// Hand a record back for reuse.
    pub fn release(&self, record: Record) {
        self.state
            .lock()
            .entry(record.schema().name().to_string())
            .or_default()
            .push(record);
    }

    pub fn release_all(&self, records: impl IntoIterator<Item = Record>) {
        let mut state = self.state.lock();
        for record in records {
            state
                .entry(record.schema().name().to_string())
                .or_default()
                .push(record);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use ztile_record::{PType, Schema, Value};

    use super::{BufferPool, RecordPool};

    #[test]
    fn pool_blocks_at_budget_and_wakes_on_release() {
        let pool = BufferPool::new(1024, 2048);
        let a = pool.acquire();
        let _b = pool.acquire();

        let pool2 = Arc::clone(&pool);
        let waiter = std::thread::spawn(move || {
            let _c = pool2.acquire();
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished(), "third acquire must block");

        drop(a);
        waiter.join().unwrap();
    }

    #[test]
    fn buffers_are_zeroed_on_reuse() {
        let pool = BufferPool::new(64, 64);
        let mut buf = pool.acquire();
        buf.as_mut_slice()[0] = 0xFF;
        drop(buf);
        let buf = pool.acquire();
        assert_eq!(buf.as_slice()[0], 0);
    }

    #[test]
    fn chunk_size_grows_monotonically() {
        let pool = BufferPool::new(64, 1 << 20);
        pool.set_chunk_size(256);
        assert_eq!(pool.chunk_size(), 256);
        pool.set_chunk_size(128);
        assert_eq!(pool.chunk_size(), 256);
        assert_eq!(pool.acquire().len(), 256);
    }

    #[test]
    fn record_pool_recycles_by_schema() {
        let schema = Schema::builder("S").scalar("x", PType::I32).build();
        let pool = RecordPool::new();
        let mut rec = pool.acquire(&schema);
        rec.set("x", Value::I32(7)).unwrap();
        pool.release(rec);

        let rec = pool.acquire(&schema);
        assert!(!rec.is_set(0), "recycled record must come back cleared");
    }
}
