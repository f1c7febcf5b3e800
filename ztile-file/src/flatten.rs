//! The recursive schema flattener.
//!
//! Walks an example record's fields in declaration order and produces the
//! ordered leaf-column list that is the traversal contract between writer and
//! reader. Nested messages recurse with dotted names, repeated messages
//! recurse once per repetition with a `#k` marker, and the tagged-union array
//! shape becomes a single column typed by its element tag.

use rustc_hash::FxHashSet;
use ztile_codec::Stage;
use ztile_error::{ztile_bail, ZTileResult};
use ztile_record::{FieldKind, FieldValue, PType, Record, SchemaRef};

use crate::column::{ColumnDescriptor, ColumnShape, PathSeg};
use crate::config::CompressionConfig;

/// The product of flattening: the fixed column list plus bookkeeping.
#[derive(Debug)]
pub struct FlattenedSchema {
    pub schema: SchemaRef,
    pub columns: Vec<ColumnDescriptor>,
    /// Field paths that were empty on the example record and not
    /// allow-listed; they never become columns and later references to them
    /// are ignored.
    pub missing: FxHashSet<String>,
}

impl FlattenedSchema {
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Uncompressed row width as declared by `ZNAXIS1`.
    pub fn row_width(&self) -> u64 {
        self.columns.iter().map(|c| c.row_width()).sum()
    }

    /// Worst-case serialized bytes per record across all columns.
    pub fn max_serialized_width(&self) -> u64 {
        self.columns.iter().map(|c| c.max_serialized_width()).sum()
    }
}

pub fn flatten(
    example: &Record,
    config: &CompressionConfig,
    vetoed: &FxHashSet<String>,
    allowed: &FxHashSet<String>,
) -> ZTileResult<FlattenedSchema> {
    let mut flattener = Flattener {
        config,
        vetoed,
        allowed,
        missing: FxHashSet::default(),
        columns: Vec::new(),
        offset: 0,
    };
    flattener.walk(example, "", "", &[])?;
    Ok(FlattenedSchema {
        schema: example.schema().clone(),
        columns: flattener.columns,
        missing: flattener.missing,
    })
}

struct Flattener<'a> {
    config: &'a CompressionConfig,
    vetoed: &'a FxHashSet<String>,
    allowed: &'a FxHashSet<String>,
    missing: FxHashSet<String>,
    columns: Vec<ColumnDescriptor>,
    offset: u64,
}

impl Flattener<'_> {
    fn walk(
        &mut self,
        record: &Record,
        prefix_name: &str,
        prefix_id: &str,
        path: &[PathSeg],
    ) -> ZTileResult<()> {
        let schema = record.schema().clone();
        for (index, field) in schema.fields().iter().enumerate() {
            let full_name = join(prefix_name, '.', field.name());
            let full_id = join(prefix_id, '.', &field.number().to_string());

            if self.vetoed.contains(&full_name) || self.missing.contains(&full_name) {
                continue;
            }
            if matches!(field.kind(), FieldKind::Group) {
                log::warn!("skipping field {full_name} because of unhandled type");
                continue;
            }

            // Fields left empty on the example record never become columns
            // unless explicitly allow-listed.
            let value = record.value(index);
            let present = if field.is_repeated() {
                value.repeated_len() > 0
            } else {
                !value.is_unset()
            };
            if !present && !self.allowed.contains(&full_name) {
                self.missing.insert(full_name);
                continue;
            }

            let mut seg_path = path.to_vec();
            seg_path.push(PathSeg::Field {
                index,
                number: field.number(),
            });

            let (scheme_name, pipeline) = self.config.lookup(&full_name);
            if pipeline.stages().contains(&Stage::LossyFloats) {
                let is_float = matches!(field.kind(), FieldKind::Scalar(PType::F32))
                    || matches!(field.kind(), FieldKind::AnyArray);
                if !is_float {
                    ztile_bail!(
                        Configuration: "lossy-floats compression requested for non-float field {}", full_name
                    );
                }
            }

            let column_name: String = full_name
                .chars()
                .map(|c| if c == '.' || c == '#' { '_' } else { c })
                .collect();

            match field.kind() {
                FieldKind::Message(_) => {
                    if field.is_repeated() {
                        let children = match value {
                            FieldValue::MessageArray(rs) => rs.as_slice(),
                            _ => &[],
                        };
                        let expected = children.len();
                        for (k, child) in children.iter().enumerate() {
                            let mut child_path = seg_path.clone();
                            child_path.push(PathSeg::Index { k, expected });
                            self.walk(
                                child,
                                &format!("{full_name}#{k}"),
                                &format!("{full_id}.{k}"),
                                &child_path,
                            )?;
                        }
                    } else {
                        let child = match value {
                            FieldValue::Message(r) => r,
                            _ => {
                                ztile_bail!(
                                    "present message field {} without a message value", full_name
                                )
                            }
                        };
                        self.walk(child, &full_name, &full_id, &seg_path)?;
                    }
                }
                FieldKind::AnyArray => {
                    let (elem, count) = match value {
                        FieldValue::AnyArray(any) => {
                            (any.elem.unwrap_or(PType::Char), any.arity() as u32)
                        }
                        _ => (PType::Char, 0),
                    };
                    self.push_column(
                        column_name,
                        full_id,
                        elem,
                        count,
                        ColumnShape::AnyArray,
                        seg_path,
                        scheme_name,
                        pipeline.clone(),
                    );
                }
                FieldKind::Scalar(ptype) => {
                    let (count, shape) = if field.is_repeated() {
                        (value.repeated_len() as u32, ColumnShape::FixedArray)
                    } else {
                        (1, ColumnShape::Scalar)
                    };
                    self.push_column(
                        column_name,
                        full_id,
                        *ptype,
                        count,
                        shape,
                        seg_path,
                        scheme_name,
                        pipeline.clone(),
                    );
                }
                FieldKind::Enum => {
                    let (count, shape) = if field.is_repeated() {
                        (value.repeated_len() as u32, ColumnShape::FixedArray)
                    } else {
                        (1, ColumnShape::Scalar)
                    };
                    self.push_column(
                        column_name,
                        full_id,
                        PType::I32,
                        count,
                        shape,
                        seg_path,
                        scheme_name,
                        pipeline.clone(),
                    );
                }
                FieldKind::Bytes => {
                    let count = match value {
                        FieldValue::Bytes(b) => b.len() as u32,
                        _ => 0,
                    };
                    self.push_column(
                        column_name,
                        full_id,
                        PType::Char,
                        count,
                        ColumnShape::VarBytes,
                        seg_path,
                        scheme_name,
                        pipeline.clone(),
                    );
                }
                FieldKind::Group => unreachable!("group fields are skipped above"),
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn push_column(
        &mut self,
        name: String,
        id_path: String,
        ptype: PType,
        count: u32,
        shape: ColumnShape,
        path: Vec<PathSeg>,
        scheme_name: &str,
        pipeline: ztile_codec::Pipeline,
    ) {
        let column = ColumnDescriptor::new(
            name,
            id_path,
            ptype,
            count,
            shape,
            path,
            pipeline,
            scheme_name.to_string(),
            self.offset,
        );
        self.offset += column.row_width();
        self.columns.push(column);
    }
}

fn join(prefix: &str, sep: char, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}{sep}{name}")
    }
}
