use std::fmt::{Display, Formatter};

use ztile_error::{ztile_bail, ZTileResult};

/// Primitive element types a leaf column can hold.
///
/// Each variant maps to a one-character binary-table type code. Unsigned
/// variants fold onto their signed storage codes when the on-disk row width
/// is computed, mirroring how the table header reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PType {
    Bool,
    /// A raw byte; also the element type of variable-length byte columns.
    Char,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl PType {
    pub const fn byte_width(self) -> usize {
        match self {
            PType::Bool | PType::Char => 1,
            PType::I16 | PType::U16 => 2,
            PType::I32 | PType::U32 | PType::F32 => 4,
            PType::I64 | PType::U64 | PType::F64 => 8,
        }
    }

    /// The type character written into `ZFORMn` entries.
    pub const fn type_char(self) -> char {
        match self {
            PType::Bool => 'L',
            PType::Char => 'A',
            PType::I16 => 'I',
            PType::U16 => 'U',
            PType::I32 => 'J',
            PType::U32 => 'V',
            PType::I64 => 'K',
            PType::U64 => 'W',
            PType::F32 => 'E',
            PType::F64 => 'D',
        }
    }

    /// The storage character after folding unsigned codes onto signed ones,
    /// used when computing row widths for the header.
    pub const fn storage_char(self) -> char {
        match self {
            PType::U16 => 'I',
            PType::U32 => 'J',
            PType::U64 => 'K',
            other => other.type_char(),
        }
    }

    pub fn from_type_char(c: char) -> ZTileResult<Self> {
        Ok(match c {
            'L' => PType::Bool,
            'A' | 'B' => PType::Char,
            'I' => PType::I16,
            'U' => PType::U16,
            'J' => PType::I32,
            'V' => PType::U32,
            'K' => PType::I64,
            'W' => PType::U64,
            'E' => PType::F32,
            'D' => PType::F64,
            _ => ztile_bail!(UnknownFieldType: "no primitive type for column code '{}'", c),
        })
    }
}

impl Display for PType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PType::Bool => "bool",
            PType::Char => "char",
            PType::I16 => "i16",
            PType::U16 => "u16",
            PType::I32 => "i32",
            PType::U32 => "u32",
            PType::I64 => "i64",
            PType::U64 => "u64",
            PType::F32 => "f32",
            PType::F64 => "f64",
        };
        write!(f, "{name}")
    }
}
