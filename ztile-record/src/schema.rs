use std::fmt::{Display, Formatter};
use std::sync::Arc;

use ztile_error::{ztile_bail, ZTileResult};

use crate::PType;

pub type SchemaRef = Arc<Schema>;

/// What a single field holds.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Scalar(PType),
    /// Variable-length byte/string payload.
    Bytes,
    /// Enumerations serialize as their i32 discriminant.
    Enum,
    Message(SchemaRef),
    /// The tagged-union array shape: an element type tag plus a raw byte
    /// payload. Never recursed into; becomes a single column.
    AnyArray,
    /// Legacy wire kind nothing can serialize; always skipped.
    Group,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    name: String,
    /// Wire number of the field, unique within its schema. Joined with dots
    /// these form the id paths the container stores per column.
    number: u32,
    kind: FieldKind,
    repeated: bool,
}

impl Field {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_repeated(&self) -> bool {
        self.repeated
    }

    pub fn message_schema(&self) -> Option<&SchemaRef> {
        match &self.kind {
            FieldKind::Message(schema) => Some(schema),
            _ => None,
        }
    }
}

/// A named, ordered collection of fields. Field order is declaration order
/// and is the traversal contract between writer and reader.
#[derive(Debug, PartialEq)]
pub struct Schema {
    name: String,
    fields: Vec<Field>,
}

impl Schema {
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    pub fn field_by_name(&self, name: &str) -> Option<(usize, &Field)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
    }

    pub fn field_by_number(&self, number: u32) -> Option<(usize, &Field)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.number == number)
    }

    pub fn index_of(&self, name: &str) -> ZTileResult<usize> {
        match self.field_by_name(name) {
            Some((i, _)) => Ok(i),
            None => ztile_bail!(UnknownFieldType: "schema {} has no field named {}", self.name, name),
        }
    }
}

impl Display for Schema {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({} fields)", self.name, self.fields.len())
    }
}

pub struct SchemaBuilder {
    name: String,
    fields: Vec<Field>,
}

impl SchemaBuilder {
    fn push(mut self, name: impl Into<String>, kind: FieldKind, repeated: bool) -> Self {
        let number = self.fields.len() as u32 + 1;
        self.fields.push(Field {
            name: name.into(),
            number,
            kind,
            repeated,
        });
        self
    }

    pub fn scalar(self, name: impl Into<String>, ptype: PType) -> Self {
        self.push(name, FieldKind::Scalar(ptype), false)
    }

    pub fn repeated_scalar(self, name: impl Into<String>, ptype: PType) -> Self {
        self.push(name, FieldKind::Scalar(ptype), true)
    }

    pub fn bytes(self, name: impl Into<String>) -> Self {
        self.push(name, FieldKind::Bytes, false)
    }

    pub fn enumeration(self, name: impl Into<String>) -> Self {
        self.push(name, FieldKind::Enum, false)
    }

    pub fn message(self, name: impl Into<String>, schema: SchemaRef) -> Self {
        self.push(name, FieldKind::Message(schema), false)
    }

    pub fn repeated_message(self, name: impl Into<String>, schema: SchemaRef) -> Self {
        self.push(name, FieldKind::Message(schema), true)
    }

    pub fn any_array(self, name: impl Into<String>) -> Self {
        self.push(name, FieldKind::AnyArray, false)
    }

    pub fn group(self, name: impl Into<String>) -> Self {
        self.push(name, FieldKind::Group, false)
    }

    pub fn build(self) -> SchemaRef {
        Arc::new(Schema {
            name: self.name,
            fields: self.fields,
        })
    }
}
