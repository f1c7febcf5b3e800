//! Process-wide writer coordination.
//!
//! A fixed-size table of writer-context slots replaces ad-hoc globals: each
//! writer instance acquires a slot (its "file index") at construction and
//! releases it on drop, the single-owner-per-kind invariant is enforced with
//! a runtime check, and the per-slot table-start offsets let asynchronous
//! multi-table writes stitch a file together correctly.

use std::sync::OnceLock;

use parking_lot::Mutex;
use ztile_error::{ztile_bail, ZTileResult};

pub const MAX_WRITER_SLOTS: usize = 64;

#[derive(Debug, Default)]
struct SlotState {
    kind: &'static str,
    /// Byte offset of each table started in this writer's file.
    table_starts: Vec<u64>,
}

#[derive(Default)]
struct Registry {
    slots: Vec<Option<SlotState>>,
    /// The process-wide default scheme, write-once before the first writer.
    default_scheme: Option<String>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            slots: (0..MAX_WRITER_SLOTS).map(|_| None).collect(),
            default_scheme: None,
        })
    })
}

/// Set the process-wide default compression scheme.
///
/// This is a write-once-before-use setting: it must happen before any writer
/// slot is live.
pub fn set_process_default_scheme(scheme: &str) -> ZTileResult<()> {
    let mut reg = registry().lock();
    if reg.slots.iter().any(Option::is_some) {
        ztile_bail!(
            Configuration: "the process-wide default compression must be set before any writer exists"
        );
    }
    reg.default_scheme = Some(scheme.to_string());
    Ok(())
}

pub fn process_default_scheme() -> Option<String> {
    registry().lock().default_scheme.clone()
}

/// An acquired writer slot; releasing happens on drop.
#[derive(Debug)]
pub struct WriterSlot {
    index: usize,
}

impl WriterSlot {
    /// Claim a slot for a writer of `kind`. At most one writer of a given
    /// kind may be live at a time.
    pub fn acquire(kind: &'static str) -> ZTileResult<Self> {
        let mut reg = registry().lock();
        if reg
            .slots
            .iter()
            .flatten()
            .any(|s| s.kind == kind)
        {
            ztile_bail!(
                Configuration: "only one {} writer can exist at a time; drop the live one first", kind
            );
        }
        let index = match reg.slots.iter().position(Option::is_none) {
            Some(i) => i,
            None => ztile_bail!(Configuration: "all {} writer slots are in use", MAX_WRITER_SLOTS),
        };
        reg.slots[index] = Some(SlotState {
            kind,
            table_starts: Vec::new(),
        });
        Ok(Self { index })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Record the start offset of a new table in this writer's file.
    pub fn push_table_start(&self, offset: u64) {
        let mut reg = registry().lock();
        if let Some(slot) = reg.slots[self.index].as_mut() {
            slot.table_starts.push(offset);
        }
    }

    pub fn table_starts(&self) -> Vec<u64> {
        registry().lock().slots[self.index]
            .as_ref()
            .map(|s| s.table_starts.clone())
            .unwrap_or_default()
    }
}

impl Drop for WriterSlot {
    fn drop(&mut self) {
        registry().lock().slots[self.index] = None;
    }
}
