//! Projection of a record batch onto per-column byte buffers.
//!
//! Visits leaves through the exact paths the flattener produced, so column
//! `i` always holds the bytes of the `i`-th field of that fixed pre-order
//! walk. Records missing a repeated-message slot contribute the
//! default-constructed instance, which serializes as zeros and empty arrays.

use ztile_error::{ztile_bail, ZTileResult};
use ztile_record::{FieldValue, PType, Record, Value};

use crate::column::{ColumnDescriptor, ColumnShape, PathSeg};

/// Resolve a column path against one record.
///
/// `None` means a repeated-message slot was absent along the way; the leaf
/// must then be serialized as the default instance's value. Arity above the
/// example-fixed ceiling is fatal.
fn resolve<'a>(record: &'a Record, path: &[PathSeg]) -> ZTileResult<Option<&'a FieldValue>> {
    let mut current = record;
    let mut segs = path.iter().peekable();
    while let Some(seg) = segs.next() {
        let PathSeg::Field { index, .. } = seg else {
            ztile_bail!("column path starts with an array index");
        };
        let value = current.value(*index);
        match segs.peek() {
            None => return Ok(Some(value)),
            Some(PathSeg::Index { k, expected }) => {
                segs.next();
                let children = match value {
                    FieldValue::MessageArray(rs) => rs.as_slice(),
                    FieldValue::Unset => &[],
                    other => {
                        ztile_bail!("expected a message array along a column path, found {other:?}")
                    }
                };
                if children.len() > *expected {
                    ztile_bail!(
                        ArityGrowth: "record carries {} repetitions of a message field fixed at {} by the first record",
                        children.len(),
                        expected
                    );
                }
                match children.get(*k) {
                    Some(child) => current = child,
                    None => return Ok(None),
                }
            }
            Some(PathSeg::Field { .. }) => match value {
                FieldValue::Message(child) => current = child,
                // An unset nested message serializes as its default instance.
                FieldValue::Unset => return Ok(None),
                other => {
                    ztile_bail!("expected a nested message along a column path, found {other:?}")
                }
            },
        }
    }
    ztile_bail!("empty column path")
}

fn write_scalar(out: &mut Vec<u8>, ptype: PType, value: Option<&Value>) {
    match value {
        Some(v) => v.write_le(out),
        None => Value::default_of(ptype).write_le(out),
    }
}

/// Append one record's bytes for `column` to the gather buffer.
pub fn serialize_record_column(
    record: &Record,
    column: &ColumnDescriptor,
    gather: &mut Vec<u8>,
) -> ZTileResult<()> {
    let value = resolve(record, &column.path)?;
    match column.shape {
        ColumnShape::Scalar => match value {
            Some(FieldValue::Scalar(v)) => write_scalar(gather, column.ptype, Some(v)),
            Some(FieldValue::Enum(e)) => gather.extend_from_slice(&e.to_le_bytes()),
            Some(FieldValue::Unset) | None => write_scalar(gather, column.ptype, None),
            Some(other) => {
                ztile_bail!("scalar column {} fed a {other:?}", column.name)
            }
        },
        ColumnShape::FixedArray => {
            let values: &[Value] = match value {
                Some(FieldValue::ScalarArray(vs)) => vs,
                Some(FieldValue::EnumArray(es)) => {
                    // Enum arrays share the fixed-arity contract but carry
                    // i32 discriminants rather than typed values.
                    if es.len() as u32 > column.count() {
                        ztile_bail!(
                            ArityGrowth: "column {} carries {} elements but its width was fixed at {} by the first record",
                            column.name,
                            es.len(),
                            column.count()
                        );
                    }
                    gather.extend_from_slice(&(es.len() as u32).to_le_bytes());
                    for e in es {
                        gather.extend_from_slice(&e.to_le_bytes());
                    }
                    return Ok(());
                }
                Some(FieldValue::Unset) | None => &[],
                Some(other) => {
                    ztile_bail!("array column {} fed a {other:?}", column.name)
                }
            };
            if values.len() as u32 > column.count() {
                ztile_bail!(
                    ArityGrowth: "column {} carries {} elements but its width was fixed at {} by the first record",
                    column.name,
                    values.len(),
                    column.count()
                );
            }
            gather.extend_from_slice(&(values.len() as u32).to_le_bytes());
            for v in values {
                v.write_le(gather);
            }
        }
        ColumnShape::VarBytes => {
            let bytes: &[u8] = match value {
                Some(FieldValue::Bytes(b)) => b,
                Some(FieldValue::Unset) | None => &[],
                Some(other) => {
                    ztile_bail!("bytes column {} fed a {other:?}", column.name)
                }
            };
            column.observe_count(bytes.len() as u32);
            gather.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
            gather.extend_from_slice(bytes);
        }
        ColumnShape::AnyArray => {
            let (payload, elem): (&[u8], PType) = match value {
                Some(FieldValue::AnyArray(any)) => {
                    (&any.data, any.elem.unwrap_or(column.ptype))
                }
                Some(FieldValue::Unset) | None => (&[], column.ptype),
                Some(other) => {
                    ztile_bail!("any-array column {} fed a {other:?}", column.name)
                }
            };
            column.observe_count((payload.len() / elem.byte_width()) as u32);
            gather.extend_from_slice(&(payload.len() as i32).to_le_bytes());
            gather.extend_from_slice(payload);
        }
    }
    Ok(())
}

/// Exact serialized size of one record across all columns, prefixes
/// included. Used to size compression buffers from the actual batch rather
/// than the column ceilings.
pub fn serialized_size(record: &Record, columns: &[ColumnDescriptor]) -> ZTileResult<u64> {
    let mut total = 0u64;
    for column in columns {
        let value = resolve(record, &column.path)?;
        total += match column.shape {
            ColumnShape::Scalar => column.ptype.byte_width() as u64,
            ColumnShape::FixedArray => {
                let n = value.map(FieldValue::repeated_len).unwrap_or(0) as u64;
                4 + n * column.ptype.byte_width() as u64
            }
            ColumnShape::VarBytes => match value {
                Some(FieldValue::Bytes(b)) => 4 + b.len() as u64,
                _ => 4,
            },
            ColumnShape::AnyArray => match value {
                Some(FieldValue::AnyArray(any)) => 4 + any.data.len() as u64,
                _ => 4,
            },
        };
    }
    Ok(total)
}

/// Gather one column's bytes across the whole batch.
pub fn serialize_column(
    records: &[Record],
    column: &ColumnDescriptor,
    gather: &mut Vec<u8>,
) -> ZTileResult<()> {
    gather.clear();
    for record in records {
        serialize_record_column(record, column, gather)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use rustc_hash::FxHashSet;
    use ztile_record::{PType, Record, Schema, Value};

    use super::serialize_column;
    use crate::config::CompressionConfig;
    use crate::flatten::flatten;

    fn batch_schema() -> ztile_record::SchemaRef {
        let item = Schema::builder("Item")
            .scalar("weight", PType::I16)
            .build();
        Schema::builder("Row")
            .scalar("id", PType::U32)
            .repeated_scalar("samples", PType::I16)
            .repeated_message("items", item)
            .bytes("tag")
            .build()
    }

    fn make(id: u32, samples: &[i16], item_weights: &[i16], tag: &[u8]) -> Record {
        let mut rec = Record::new(batch_schema());
        rec.set("id", Value::U32(id)).unwrap();
        rec.set(
            "samples",
            samples.iter().map(|&v| Value::I16(v)).collect::<Vec<_>>(),
        )
        .unwrap();
        for (k, &w) in item_weights.iter().enumerate() {
            rec.repeated_message_mut(2, k)
                .unwrap()
                .set("weight", Value::I16(w))
                .unwrap();
        }
        rec.set("tag", tag.to_vec()).unwrap();
        rec
    }

    #[test]
    fn batch_serialization_interleaves_nothing() {
        let example = make(1, &[10, 20, 30], &[7, 8], b"ab");
        let config = CompressionConfig::default();
        let flat = flatten(&example, &config, &FxHashSet::default(), &FxHashSet::default())
            .unwrap();

        let records = vec![example, make(2, &[5], &[1, 2], b"wxyz")];

        let mut gather = Vec::new();
        serialize_column(&records, &flat.columns[0], &mut gather).unwrap();
        assert_eq!(gather, [1u32.to_le_bytes(), 2u32.to_le_bytes()].concat());

        serialize_column(&records, &flat.columns[1], &mut gather).unwrap();
        let mut expect = Vec::new();
        expect.extend_from_slice(&3u32.to_le_bytes());
        for v in [10i16, 20, 30] {
            expect.extend_from_slice(&v.to_le_bytes());
        }
        expect.extend_from_slice(&1u32.to_le_bytes());
        expect.extend_from_slice(&5i16.to_le_bytes());
        assert_eq!(gather, expect);
    }

    #[test]
    fn missing_repeated_message_slots_pad_with_defaults() {
        let example = make(1, &[1], &[7, 8, 9], b"x");
        let config = CompressionConfig::default();
        let flat = flatten(&example, &config, &FxHashSet::default(), &FxHashSet::default())
            .unwrap();
        // Record 1 has a single item; slots 1 and 2 must serialize as the
        // default instance (weight = 0).
        let records = vec![example, make(2, &[1], &[42], b"y")];

        let weight_col_2 = flat
            .columns
            .iter()
            .find(|c| c.name == "items_2_weight")
            .unwrap();
        let mut gather = Vec::new();
        serialize_column(&records, weight_col_2, &mut gather).unwrap();
        assert_eq!(gather, [9i16.to_le_bytes(), 0i16.to_le_bytes()].concat());
    }

    #[test]
    fn arity_growth_is_fatal() {
        let example = make(1, &[1, 2], &[7], b"x");
        let config = CompressionConfig::default();
        let flat = flatten(&example, &config, &FxHashSet::default(), &FxHashSet::default())
            .unwrap();

        // More repeated scalars than the example declared.
        let fat = make(2, &[1, 2, 3], &[1], b"y");
        let mut gather = Vec::new();
        let err = serialize_column(&[fat], &flat.columns[1], &mut gather).unwrap_err();
        assert!(matches!(err, ztile_error::ZTileError::ArityGrowth(_)));

        // More repeated messages than the example declared.
        let fat = make(3, &[1], &[1, 2], b"y");
        let col = flat.columns.iter().find(|c| c.name == "items_0_weight").unwrap();
        let err = serialize_column(&[fat], col, &mut gather).unwrap_err();
        assert!(matches!(err, ztile_error::ZTileError::ArityGrowth(_)));
    }

    #[test]
    fn var_bytes_grow_the_count_ceiling() {
        let example = make(1, &[1], &[1], b"ab");
        let config = CompressionConfig::default();
        let flat = flatten(&example, &config, &FxHashSet::default(), &FxHashSet::default())
            .unwrap();
        let tag_col = flat.columns.iter().find(|c| c.name == "tag").unwrap();
        assert_eq!(tag_col.count(), 2);

        let mut gather = Vec::new();
        serialize_column(&[make(2, &[1], &[1], b"longer-tag")], tag_col, &mut gather).unwrap();
        assert_eq!(tag_col.count(), 10);
        assert_eq!(&gather[..4], &10i32.to_le_bytes());
        assert_eq!(&gather[4..], b"longer-tag");
    }
}
