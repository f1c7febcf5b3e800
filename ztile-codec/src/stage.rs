use std::fmt::{Display, Formatter};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use ztile_error::{ztile_err, ZTileError, ZTileResult};

/// One step of a compression pipeline.
///
/// The discriminants are the on-disk processing ids recorded in block
/// headers; the numbering has gaps where retired codecs used to live, and
/// those ids must stay unassigned forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Stage {
    /// Byte-for-byte copy; the baseline terminal stage.
    Raw = 0,
    /// Subtract the average of the two previous 16-bit samples.
    Smoothing = 1,
    /// Canonical Huffman over 16-bit symbols, 4-byte length prefix.
    Huffman16 = 2,
    /// 16-bit difference with the previous sample.
    Delta = 3,
    /// [`Stage::Delta`] applied twice.
    DoubleDelta = 4,
    /// De-interleave 16-bit elements into two half-width planes.
    SplitHiLo16 = 5,
    /// Deflate.
    Zlib = 7,
    /// LZO-class one-shot block compressor.
    Lzo = 9,
    /// Predictive residual coder over 16-bit samples.
    Rice = 10,
    /// Two Huffman passes, one per half of the input, 2x4-byte prefixes.
    Halfman16 = 12,
    /// De-interleave 32-bit elements into two half-width planes.
    SplitHiLo32 = 14,
    /// Re-center signed 16-bit deltas by adding 128.
    Offset128 = 16,
    /// Collapse runs of identical 32-bit values into (count, value) pairs.
    SameValues32 = 17,
    /// Quantize length-prefixed float chunks to a fixed precision step.
    LossyFloats = 18,
    /// Collapse runs of a sentinel 32-bit value to run lengths.
    SparseValues32 = 19,
    /// Round 16-bit ints to a quantization step. Irreversible.
    LossyInt16 = 21,
    /// Round 32-bit ints to a quantization step. Irreversible.
    LossyInt32 = 22,
    /// Zstandard with a configurable level.
    Zstd = 23,
}

/// How a stage participates in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Mutates the source span in place; may change its length.
    Transform,
    /// Consumes the source span and emits the block payload.
    Entropy,
}

impl Stage {
    pub fn kind(self) -> StageKind {
        match self {
            Stage::Raw
            | Stage::Huffman16
            | Stage::Halfman16
            | Stage::Zlib
            | Stage::Lzo
            | Stage::Rice
            | Stage::Zstd => StageKind::Entropy,
            Stage::Smoothing
            | Stage::Delta
            | Stage::DoubleDelta
            | Stage::SplitHiLo16
            | Stage::SplitHiLo32
            | Stage::Offset128
            | Stage::SameValues32
            | Stage::SparseValues32
            | Stage::LossyFloats
            | Stage::LossyInt16
            | Stage::LossyInt32 => StageKind::Transform,
        }
    }

    /// Element width this stage requires the input length to be a multiple
    /// of, if any.
    pub fn required_multiple(self) -> Option<usize> {
        match self {
            Stage::Smoothing
            | Stage::Huffman16
            | Stage::Delta
            | Stage::DoubleDelta
            | Stage::SplitHiLo16
            | Stage::Rice
            | Stage::Offset128
            | Stage::LossyInt16 => Some(2),
            Stage::Halfman16
            | Stage::SplitHiLo32
            | Stage::SameValues32
            | Stage::SparseValues32
            | Stage::LossyFloats
            | Stage::LossyInt32 => Some(4),
            _ => None,
        }
    }

    pub fn from_id(id: u16) -> ZTileResult<Self> {
        Stage::try_from(id)
            .map_err(|_| ztile_err!(InvalidSerde: "unsupported processing stage id {}", id))
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Raw => "Raw",
            Stage::Smoothing => "Smoothing",
            Stage::Huffman16 => "Huffman16",
            Stage::Delta => "Delta",
            Stage::DoubleDelta => "DoubleDelta",
            Stage::SplitHiLo16 => "SplitHiLo16",
            Stage::Zlib => "Zlib",
            Stage::Lzo => "Lzo",
            Stage::Rice => "Rice",
            Stage::Halfman16 => "Halfman16",
            Stage::SplitHiLo32 => "SplitHiLo32",
            Stage::Offset128 => "Offset128",
            Stage::SameValues32 => "SameValues32",
            Stage::LossyFloats => "LossyFloats",
            Stage::SparseValues32 => "SparseValues32",
            Stage::LossyInt16 => "LossyInt16",
            Stage::LossyInt32 => "LossyInt32",
            Stage::Zstd => "Zstd",
        };
        write!(f, "{name}")
    }
}

/// Up-front check that a stage's element-width precondition holds.
pub fn check_multiple(stage: Stage, num_bytes: usize) -> ZTileResult<()> {
    if let Some(multiple) = stage.required_multiple() {
        if num_bytes % multiple != 0 {
            return Err(ZTileError::SizeMismatch(
                format!(
                    "array size {num_bytes} is not a multiple of {multiple} bytes as required by stage {stage}"
                )
                .into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{check_multiple, Stage};

    #[test]
    fn retired_ids_are_rejected() {
        for id in [6u16, 8, 11, 13, 15, 20, 24, 999] {
            assert!(Stage::from_id(id).is_err(), "id {id} should be unassigned");
        }
        assert_eq!(Stage::from_id(7).unwrap(), Stage::Zlib);
        assert_eq!(u16::from(Stage::Zstd), 23);
    }

    #[test]
    fn multiple_check_names_the_stage() {
        let err = check_multiple(Stage::Delta, 13).unwrap_err();
        assert!(err.to_string().contains("Delta"));
        assert!(check_multiple(Stage::Delta, 14).is_ok());
        assert!(check_multiple(Stage::Zlib, 13).is_ok());
    }
}
