use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Tunables consumed by individual stages.
///
/// A single instance is shared by every pipeline of a table, so the lossy
/// error diagnostics aggregate across columns and tiles.
#[derive(Debug, Clone)]
pub struct CodecParams {
    /// Zstandard level; 0 selects the library default.
    pub zstd_level: i32,
    /// Quantization step for the lossy integer stages. 1 is lossless.
    pub quantization: u32,
    /// The hollow value collapsed by [`crate::Stage::SparseValues32`].
    pub sparse_value: i32,
    /// Precision step for [`crate::Stage::LossyFloats`].
    pub float_precision: f32,
    /// Samples per Rice coding block.
    pub rice_block: usize,
    /// Running quantization-error diagnostics for the lossy integer stages.
    pub lossy_stats: Arc<LossyStats>,
}

impl Default for CodecParams {
    fn default() -> Self {
        Self {
            zstd_level: 0,
            quantization: 1,
            sparse_value: 0,
            float_precision: 0.01,
            rice_block: 1,
            lossy_stats: Arc::new(LossyStats::default()),
        }
    }
}

/// Accumulates the average absolute quantization error per processed chunk.
///
/// Stored in micro-units behind atomics so parallel compression workers can
/// update it without a lock.
#[derive(Debug, Default)]
pub struct LossyStats {
    error_micros: AtomicU64,
    chunks: AtomicU64,
}

impl LossyStats {
    pub fn record_chunk(&self, average_error: f64) {
        self.error_micros
            .fetch_add((average_error * 1e6) as u64, Ordering::Relaxed);
        self.chunks.fetch_add(1, Ordering::Relaxed);
    }

    /// Mean of the per-chunk average errors recorded so far.
    pub fn average_error(&self) -> f64 {
        let chunks = self.chunks.load(Ordering::Relaxed);
        if chunks == 0 {
            return 0.0;
        }
        self.error_micros.load(Ordering::Relaxed) as f64 / 1e6 / chunks as f64
    }

    pub fn num_chunks(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }
}
