//! Umbrella crate re-exporting the whole ZTile stack.
//!
//! ```no_run
//! use ztile::file::{TableWriter, WriterOptions};
//! use ztile::record::{PType, Record, Schema, Value};
//!
//! # fn main() -> ztile::error::ZTileResult<()> {
//! let schema = Schema::builder("Event")
//!     .scalar("event_id", PType::U32)
//!     .repeated_scalar("samples", PType::I16)
//!     .build();
//!
//! let mut writer = TableWriter::create("events.ztile", WriterOptions::default())?;
//! writer.set_default_compression("doublediffman16")?;
//!
//! let mut record = Record::new(schema);
//! record.set("event_id", Value::U32(1))?;
//! record.set("samples", vec![Value::I16(10), Value::I16(12)])?;
//! writer.write_record(record)?;
//! writer.close(false)?;
//! # Ok(())
//! # }
//! ```

pub use ztile_codec as codec;
pub use ztile_error as error;
pub use ztile_file as file;
pub use ztile_record as record;
