//! Error handling for the ZTile container stack.
//!
//! All fallible operations across the workspace return [`ZTileResult`]. The
//! error enum is deliberately coarse: each variant corresponds to one class of
//! failure a caller can meaningfully react to, and the payload is a
//! preformatted message carrying the details.

use std::borrow::Cow;
use std::fmt::{Debug, Display};

pub use ext::*;

mod ext;

/// A string-ish wrapper for error payloads, cheap to build from both literals
/// and formatted strings.
#[derive(Debug)]
pub struct ErrString(Cow<'static, str>);

impl<T> From<T> for ErrString
where
    T: Into<Cow<'static, str>>,
{
    fn from(msg: T) -> Self {
        ErrString(msg.into())
    }
}

impl Display for ErrString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl AsRef<str> for ErrString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The top-level error type for the ZTile stack.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ZTileError {
    /// The caller configured the stack incorrectly: unknown scheme name,
    /// double column initialization, undersized compression buffers, opening
    /// a table while one is already open.
    #[error("configuration error: {0}")]
    Configuration(ErrString),
    /// A byte buffer handed to a codec stage does not satisfy the stage's
    /// element-width precondition.
    #[error("size mismatch: {0}")]
    SizeMismatch(ErrString),
    /// A codec stage would have written past its destination bound.
    #[error("buffer overflow: {0}")]
    BufferOverflow(ErrString),
    /// A record carried more repetitions of a field than the schema-fixing
    /// example record declared.
    #[error("arity growth: {0}")]
    ArityGrowth(ErrString),
    /// A field kind the flattener cannot map onto a column.
    #[error("unknown field type: {0}")]
    UnknownFieldType(ErrString),
    /// The on-disk bytes do not parse as the structure they claim to be.
    #[error("invalid serialization: {0}")]
    InvalidSerde(ErrString),
    /// The arithmetic checksum identity did not hold at finalize time.
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(ErrString),
    /// An internal invariant was violated; always indicates a logic bug.
    #[error("invariant violated: {0}")]
    InvariantViolation(ErrString),
    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

pub type ZTileResult<T> = Result<T, ZTileError>;

/// Construct a [`ZTileError`] in place.
///
/// ```
/// use ztile_error::{ztile_err, ZTileError};
/// let e = ztile_err!("tile {} out of range", 7);
/// assert!(matches!(e, ZTileError::InvariantViolation(_)));
/// let e = ztile_err!(Configuration: "unknown scheme {}", "bogus");
/// assert!(matches!(e, ZTileError::Configuration(_)));
/// ```
#[macro_export]
macro_rules! ztile_err {
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::ZTileError::$variant(format!($fmt $(, $arg)*).into())
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::ZTileError::InvariantViolation(format!($fmt $(, $arg)*).into())
    };
}

/// Return early with a [`ZTileError`].
#[macro_export]
macro_rules! ztile_bail {
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        return Err($crate::ztile_err!($variant: $fmt $(, $arg)*))
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        return Err($crate::ztile_err!($fmt $(, $arg)*))
    };
}

/// Panic with a [`ZTileError`]-formatted message. Reserved for unrecoverable
/// logic bugs on paths that cannot return a `Result`.
#[macro_export]
macro_rules! ztile_panic {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        panic!("{}", $crate::ztile_err!($fmt $(, $arg)*))
    };
    ($err:expr) => {{
        let e: $crate::ZTileError = $err;
        panic!("{}", e)
    }};
}
