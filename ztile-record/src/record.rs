use std::fmt::{Display, Formatter};

use ztile_error::{ztile_bail, ZTileResult};

use crate::{AnyArrayValue, Field, FieldKind, FieldValue, SchemaRef, Value};

/// A value instance of a [`crate::Schema`].
///
/// Records are plain owned data: cloning is deep, equality is structural.
/// An unset field reports absent and serializes as the default, which is what
/// makes default-instance padding of short repeated-message arrays work.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    schema: SchemaRef,
    values: Vec<FieldValue>,
}

impl Record {
    pub fn new(schema: SchemaRef) -> Self {
        let values = vec![FieldValue::Unset; schema.fields().len()];
        Self { schema, values }
    }

    /// The all-defaults instance substituted for missing repeated-message
    /// slots. Identical to [`Record::new`]; the alias documents intent.
    pub fn default_instance(schema: SchemaRef) -> Self {
        Self::new(schema)
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.values
            .get(index)
            .map(|v| !v.is_unset())
            .unwrap_or(false)
    }

    pub fn value(&self, index: usize) -> &FieldValue {
        &self.values[index]
    }

    pub fn value_mut(&mut self, index: usize) -> &mut FieldValue {
        &mut self.values[index]
    }

    /// Reset every field to unset so the allocation can be recycled.
    pub fn clear(&mut self) {
        for v in self.values.iter_mut() {
            *v = FieldValue::Unset;
        }
    }

    fn check_kind(field: &Field, value: &FieldValue) -> ZTileResult<()> {
        let ok = match (field.kind(), value) {
            (_, FieldValue::Unset) => true,
            (FieldKind::Scalar(p), FieldValue::Scalar(v)) => !field.is_repeated() && v.ptype() == *p,
            (FieldKind::Scalar(p), FieldValue::ScalarArray(vs)) => {
                field.is_repeated() && vs.iter().all(|v| v.ptype() == *p)
            }
            (FieldKind::Bytes, FieldValue::Bytes(_)) => true,
            (FieldKind::Enum, FieldValue::Enum(_)) => !field.is_repeated(),
            (FieldKind::Enum, FieldValue::EnumArray(_)) => field.is_repeated(),
            (FieldKind::Message(schema), FieldValue::Message(r)) => {
                !field.is_repeated() && r.schema() == schema
            }
            (FieldKind::Message(schema), FieldValue::MessageArray(rs)) => {
                field.is_repeated() && rs.iter().all(|r| r.schema() == schema)
            }
            (FieldKind::AnyArray, FieldValue::AnyArray(_)) => true,
            _ => false,
        };
        if !ok {
            ztile_bail!(
                UnknownFieldType: "value shape does not match field {} ({:?}, repeated={})",
                field.name(),
                field.kind(),
                field.is_repeated()
            );
        }
        Ok(())
    }

    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) -> ZTileResult<()> {
        let index = self.schema.index_of(name)?;
        let value = value.into();
        Self::check_kind(&self.schema.fields()[index], &value)?;
        self.values[index] = value;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        let (index, _) = self.schema.field_by_name(name)?;
        Some(&self.values[index])
    }

    /// Nested message access; `None` when unset or not a message field.
    pub fn message(&self, index: usize) -> Option<&Record> {
        match self.value(index) {
            FieldValue::Message(r) => Some(r),
            _ => None,
        }
    }

    /// Nested message access, materializing the default instance on demand.
    pub fn message_mut(&mut self, index: usize) -> ZTileResult<&mut Record> {
        let schema = match self.schema.fields()[index].kind() {
            FieldKind::Message(s) => s.clone(),
            other => {
                ztile_bail!(UnknownFieldType: "field {} is not a message ({:?})", index, other)
            }
        };
        if self.values[index].is_unset() {
            self.values[index] = FieldValue::Message(Record::new(schema));
        }
        match &mut self.values[index] {
            FieldValue::Message(r) => Ok(r),
            _ => ztile_bail!("message slot {} holds a non-message value", index),
        }
    }

    /// Repeated-message element access, growing the array with default
    /// instances up to `k + 1` elements when needed.
    pub fn repeated_message_mut(&mut self, index: usize, k: usize) -> ZTileResult<&mut Record> {
        let schema = match self.schema.fields()[index].kind() {
            FieldKind::Message(s) => s.clone(),
            other => {
                ztile_bail!(UnknownFieldType: "field {} is not a message ({:?})", index, other)
            }
        };
        if self.values[index].is_unset() {
            self.values[index] = FieldValue::MessageArray(Vec::new());
        }
        match &mut self.values[index] {
            FieldValue::MessageArray(rs) => {
                while rs.len() <= k {
                    rs.push(Record::new(schema.clone()));
                }
                Ok(&mut rs[k])
            }
            _ => ztile_bail!("message slot {} holds a non-array value", index),
        }
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Record<{}>", self.schema.name())
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        FieldValue::Scalar(v)
    }
}

impl From<Vec<Value>> for FieldValue {
    fn from(v: Vec<Value>) -> Self {
        FieldValue::ScalarArray(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Bytes(v)
    }
}

impl From<Record> for FieldValue {
    fn from(v: Record) -> Self {
        FieldValue::Message(v)
    }
}

impl From<Vec<Record>> for FieldValue {
    fn from(v: Vec<Record>) -> Self {
        FieldValue::MessageArray(v)
    }
}

impl From<AnyArrayValue> for FieldValue {
    fn from(v: AnyArrayValue) -> Self {
        FieldValue::AnyArray(v)
    }
}
