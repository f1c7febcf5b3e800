//! A dynamic structured-record model.
//!
//! This crate is the reflection boundary of the ZTile stack: the schema
//! flattener, the column serializer, and the reader all operate on
//! [`Schema`]/[`Record`] and never on a concrete generated message type. A
//! code-generated schema can be bridged by building the equivalent [`Schema`]
//! and converting values.

pub use ptype::*;
pub use record::*;
pub use schema::*;
pub use value::*;

mod ptype;
mod record;
mod schema;
mod value;
