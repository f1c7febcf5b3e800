use std::sync::atomic::{AtomicU32, Ordering};

use ztile_codec::Pipeline;
use ztile_record::PType;

/// How a leaf column's per-record bytes are laid out in the gather buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnShape {
    /// One fixed-width value per record.
    Scalar,
    /// A 4-byte element count followed by that many fixed-width values; the
    /// arity ceiling is fixed by the example record.
    FixedArray,
    /// A 4-byte byte length followed by the raw bytes; the width ceiling is
    /// the running maximum.
    VarBytes,
    /// A 4-byte byte length followed by the raw payload of the tagged-union
    /// array; the element count ceiling is the running maximum.
    AnyArray,
}

/// One step of the fixed pre-order walk from the record root to a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSeg {
    /// Descend into field `index` of the current schema.
    Field { index: usize, number: u32 },
    /// Descend into repetition `k` of a repeated message field whose arity
    /// was fixed at `expected` by the example record.
    Index { k: usize, expected: usize },
}

/// Static metadata describing one flattened leaf field.
///
/// Name, type, shape and path never change after creation; `count` is the
/// arity and grows monotonically for the variable-width shapes until the
/// table is finalized.
#[derive(Debug)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Dot-separated field-number path recorded as `TPBIDn`.
    pub id_path: String,
    pub ptype: PType,
    count: AtomicU32,
    /// Byte offset of this column within the uncompressed row, fixed at
    /// creation from the example record's widths.
    pub offset: u64,
    pub shape: ColumnShape,
    pub path: Vec<PathSeg>,
    pub pipeline: Pipeline,
    /// The scheme name this pipeline was resolved from, recorded as `ZCTYPn`.
    pub scheme_name: String,
}

impl ColumnDescriptor {
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Grow the arity ceiling to at least `observed`.
    pub fn observe_count(&self, observed: u32) {
        self.count.fetch_max(observed, Ordering::Relaxed);
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        id_path: String,
        ptype: PType,
        count: u32,
        shape: ColumnShape,
        path: Vec<PathSeg>,
        pipeline: Pipeline,
        scheme_name: String,
        offset: u64,
    ) -> Self {
        Self {
            name,
            id_path,
            ptype,
            count: AtomicU32::new(count),
            offset,
            shape,
            path,
            pipeline,
            scheme_name,
        }
    }

    /// The column's contribution to the uncompressed row width, excluding
    /// count/length prefixes, matching what `ZNAXIS1` declares.
    pub fn row_width(&self) -> u64 {
        self.ptype.byte_width() as u64 * u64::from(self.count())
    }

    /// Worst-case serialized bytes per record, prefixes included.
    pub fn max_serialized_width(&self) -> u64 {
        let data = self.ptype.byte_width() as u64 * u64::from(self.count());
        match self.shape {
            ColumnShape::Scalar => data,
            ColumnShape::FixedArray | ColumnShape::VarBytes | ColumnShape::AnyArray => 4 + data,
        }
    }
}
