use std::fmt::Display;

use crate::{ZTileError, ZTileResult};

/// `expect`-with-context for results carrying a [`ZTileError`].
///
/// Prefer this over `Result::expect` so that the underlying error is kept in
/// the panic message instead of being flattened into `Debug` output.
pub trait ZTileExpect {
    type Output;

    fn ztile_expect(self, msg: &str) -> Self::Output;
}

impl<T> ZTileExpect for ZTileResult<T> {
    type Output = T;

    fn ztile_expect(self, msg: &str) -> T {
        self.unwrap_or_else(|e| panic!("{msg}: {e}"))
    }
}

impl<T> ZTileExpect for Option<T> {
    type Output = T;

    fn ztile_expect(self, msg: &str) -> T {
        self.unwrap_or_else(|| panic!("{msg}"))
    }
}

/// Unwrap a result, panicking with the display form of the error.
pub trait ZTileUnwrap {
    type Output;

    fn ztile_unwrap(self) -> Self::Output;
}

impl<T, E: Display> ZTileUnwrap for Result<T, E>
where
    E: Into<ZTileError>,
{
    type Output = T;

    fn ztile_unwrap(self) -> T {
        self.map_err(Into::into)
            .unwrap_or_else(|e: ZTileError| panic!("{e}"))
    }
}
