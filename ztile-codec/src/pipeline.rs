use std::fmt::{Display, Formatter};

use itertools::Itertools;
use ztile_error::{ztile_bail, ZTileResult};

use crate::{
    check_multiple, entropy, huffman, lossy, rice, runlength, transform, CodecParams, Stage,
    StageKind,
};

/// An ordered list of stages: zero or more in-place transforms followed by
/// one terminal entropy coder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> ZTileResult<Self> {
        let pipeline = Self { stages };
        pipeline.validate()?;
        Ok(pipeline)
    }

    pub fn raw() -> Self {
        Self {
            stages: vec![Stage::Raw],
        }
    }

    /// Rebuild a pipeline from the stage ids of a block header. Shape
    /// problems surface as serde errors at decompress time rather than the
    /// configuration errors `new` raises.
    pub fn from_stages(stages: &[Stage]) -> ZTileResult<Self> {
        if stages.is_empty() {
            ztile_bail!(InvalidSerde: "empty stage list in block header");
        }
        Ok(Self {
            stages: stages.to_vec(),
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    fn validate(&self) -> ZTileResult<()> {
        let Some((last, init)) = self.stages.split_last() else {
            ztile_bail!(Configuration: "a compression pipeline needs at least one stage");
        };
        if last.kind() != StageKind::Entropy {
            ztile_bail!(
                Configuration: "pipeline [{}] must end with an entropy stage", self
            );
        }
        if let Some(stage) = init.iter().find(|s| s.kind() == StageKind::Entropy) {
            ztile_bail!(
                Configuration: "entropy stage {} must be the last stage of pipeline [{}]", stage, self
            );
        }
        Ok(())
    }

    /// Run the pipeline forward. Transform stages mutate `src` in place (and
    /// may change its length); the terminal entropy stage writes the block
    /// payload into `dst` and its size is returned. `src` is left in its
    /// transformed state — callers reuse it as scratch, never as data.
    pub fn compress(
        &self,
        src: &mut Vec<u8>,
        dst: &mut [u8],
        params: &CodecParams,
    ) -> ZTileResult<usize> {
        self.validate()?;
        let (entropy_stage, transforms) = self
            .stages
            .split_last()
            .expect("validate checked non-empty");

        let max_len = dst.len();
        for stage in transforms {
            apply_transform(*stage, src, max_len, params)?;
        }
        apply_entropy(*entropy_stage, src, dst, params)
    }

    /// Run the pipeline backward: entropy decode into `out`, then unwind the
    /// transforms in reverse order. `max_out` bounds every intermediate
    /// expansion.
    pub fn decompress(
        &self,
        payload: &[u8],
        out: &mut Vec<u8>,
        max_out: usize,
        params: &CodecParams,
    ) -> ZTileResult<usize> {
        let Some((entropy_stage, transforms)) = self.stages.split_last() else {
            ztile_bail!(InvalidSerde: "empty stage list in block header");
        };
        if entropy_stage.kind() != StageKind::Entropy {
            ztile_bail!(
                InvalidSerde: "block pipeline [{}] does not end with an entropy stage", self
            );
        }

        // Run-length intermediates can be larger than the raw data they
        // expand to, so the scratch bound leaves headroom over `max_out`.
        let scratch = max_out * 2 + 64;
        out.clear();
        decode_entropy(*entropy_stage, payload, out, scratch, params)?;
        for stage in transforms.iter().rev() {
            invert_transform(*stage, out, scratch, params)?;
        }
        Ok(out.len())
    }
}

impl Display for Pipeline {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stages.iter().format(","))
    }
}

fn apply_transform(
    stage: Stage,
    src: &mut Vec<u8>,
    max_len: usize,
    params: &CodecParams,
) -> ZTileResult<()> {
    match stage {
        Stage::Delta => transform::delta_encode(src),
        Stage::DoubleDelta => transform::double_delta_encode(src),
        Stage::Offset128 => transform::offset128_encode(src),
        Stage::SplitHiLo16 => transform::split_hi_lo_16(src),
        Stage::SplitHiLo32 => transform::split_hi_lo_32(src),
        Stage::Smoothing => transform::smoothing_encode(src),
        Stage::SameValues32 => runlength::same_values_encode(src, max_len),
        Stage::SparseValues32 => runlength::sparse_values_encode(src, max_len, params.sparse_value),
        Stage::LossyFloats => lossy::lossy_floats_encode(src, params),
        Stage::LossyInt16 => lossy::lossy_int16_encode(src, params),
        Stage::LossyInt32 => lossy::lossy_int32_encode(src, params),
        other => ztile_bail!("stage {} is not a transform", other),
    }
}

fn invert_transform(
    stage: Stage,
    out: &mut Vec<u8>,
    max_out: usize,
    params: &CodecParams,
) -> ZTileResult<()> {
    match stage {
        Stage::Delta => transform::delta_decode(out),
        Stage::DoubleDelta => transform::double_delta_decode(out),
        Stage::Offset128 => transform::offset128_decode(out),
        Stage::SplitHiLo16 => transform::merge_hi_lo_16(out),
        Stage::SplitHiLo32 => transform::merge_hi_lo_32(out),
        Stage::Smoothing => transform::smoothing_decode(out),
        Stage::SameValues32 => runlength::same_values_decode(out, max_out),
        Stage::SparseValues32 => runlength::sparse_values_decode(out, max_out),
        Stage::LossyFloats => lossy::lossy_floats_decode(out, params),
        // Quantization cannot be undone; the stored values are the data.
        Stage::LossyInt16 | Stage::LossyInt32 => Ok(()),
        other => ztile_bail!(InvalidSerde: "stage {} is not a transform", other),
    }
}

fn apply_entropy(
    stage: Stage,
    src: &[u8],
    dst: &mut [u8],
    params: &CodecParams,
) -> ZTileResult<usize> {
    match stage {
        Stage::Raw => {
            if src.len() > dst.len() {
                ztile_bail!(
                    BufferOverflow: "Raw copy of {} bytes exceeds the {} byte destination", src.len(), dst.len()
                );
            }
            dst[..src.len()].copy_from_slice(src);
            Ok(src.len())
        }
        Stage::Zlib => entropy::zlib_compress(src, dst),
        Stage::Zstd => entropy::zstd_compress(src, dst, params.zstd_level),
        Stage::Lzo => entropy::lzo_compress(src, dst),
        Stage::Huffman16 => write_prefixed(dst, stage, &huffman::huffman16_encode(src)?),
        Stage::Halfman16 => {
            // Halfman carries its own two length prefixes.
            let blob = huffman::halfman16_encode(src)?;
            copy_bounded(dst, stage, &blob)
        }
        Stage::Rice => {
            check_multiple(Stage::Rice, src.len())?;
            let mut blob = (src.len() as i32).to_le_bytes().to_vec();
            blob.extend(rice::rice16_encode(src, params.rice_block)?);
            copy_bounded(dst, stage, &blob)
        }
        other => ztile_bail!("stage {} is not an entropy coder", other),
    }
}

fn decode_entropy(
    stage: Stage,
    payload: &[u8],
    out: &mut Vec<u8>,
    max_out: usize,
    params: &CodecParams,
) -> ZTileResult<()> {
    match stage {
        Stage::Raw => {
            if payload.len() > max_out {
                ztile_bail!(
                    BufferOverflow: "Raw block of {} bytes exceeds the {} byte tile buffer", payload.len(), max_out
                );
            }
            out.extend_from_slice(payload);
            Ok(())
        }
        Stage::Zlib => {
            out.resize(max_out, 0);
            let n = entropy::zlib_decompress(payload, out)?;
            out.truncate(n);
            Ok(())
        }
        Stage::Zstd => {
            out.resize(max_out, 0);
            let n = entropy::zstd_decompress(payload, out)?;
            out.truncate(n);
            Ok(())
        }
        Stage::Lzo => {
            out.resize(max_out, 0);
            let n = entropy::lzo_decompress(payload, out)?;
            out.truncate(n);
            Ok(())
        }
        Stage::Huffman16 => {
            let blob = read_prefixed(payload, stage)?;
            huffman::huffman16_decode(blob, out)
        }
        Stage::Halfman16 => huffman::halfman16_decode(payload, out),
        Stage::Rice => {
            if payload.len() < 4 {
                ztile_bail!(InvalidSerde: "Rice block missing its size prefix");
            }
            rice::rice16_decode(&payload[4..], params.rice_block, out)
        }
        other => ztile_bail!(InvalidSerde: "stage {} is not an entropy coder", other),
    }
}

/// A 4-byte length prefix followed by the blob, bounds-checked.
fn write_prefixed(dst: &mut [u8], stage: Stage, blob: &[u8]) -> ZTileResult<usize> {
    let total = blob.len() + 4;
    if total >= dst.len() {
        ztile_bail!(
            BufferOverflow: "{} output of {} bytes exceeds the {} byte destination", stage, total, dst.len()
        );
    }
    dst[..4].copy_from_slice(&(blob.len() as u32).to_le_bytes());
    dst[4..total].copy_from_slice(blob);
    Ok(total)
}

fn read_prefixed<'a>(payload: &'a [u8], stage: Stage) -> ZTileResult<&'a [u8]> {
    if payload.len() < 4 {
        ztile_bail!(InvalidSerde: "{} block missing its length prefix", stage);
    }
    let len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if payload.len() < 4 + len {
        ztile_bail!(
            InvalidSerde: "{} blob of {} bytes overruns its {} byte block", stage, len, payload.len()
        );
    }
    Ok(&payload[4..4 + len])
}

fn copy_bounded(dst: &mut [u8], stage: Stage, blob: &[u8]) -> ZTileResult<usize> {
    if blob.len() >= dst.len() {
        ztile_bail!(
            BufferOverflow: "{} output of {} bytes exceeds the {} byte destination", stage, blob.len(), dst.len()
        );
    }
    dst[..blob.len()].copy_from_slice(blob);
    Ok(blob.len())
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::Pipeline;
    use crate::{CodecParams, Stage};

    fn waveform() -> Vec<u8> {
        (0..2000u32)
            .map(|i| (1000.0 + 200.0 * (i as f64 / 30.0).sin()) as i16)
            .flat_map(|v| v.to_le_bytes())
            .collect()
    }

    #[rstest]
    #[case::raw(vec![Stage::Raw])]
    #[case::zlib(vec![Stage::Zlib])]
    #[case::fact(vec![Stage::Smoothing, Stage::Huffman16])]
    #[case::diffman(vec![Stage::Delta, Stage::Huffman16])]
    #[case::doublediffman(vec![Stage::Delta, Stage::Offset128, Stage::SplitHiLo16, Stage::Zlib])]
    #[case::ricefact(vec![Stage::SplitHiLo16, Stage::Smoothing, Stage::Halfman16])]
    #[case::zrice(vec![Stage::SplitHiLo16, Stage::Zlib])]
    #[case::zrice32(vec![Stage::SplitHiLo32, Stage::Zlib])]
    #[case::rrice(vec![Stage::SplitHiLo16, Stage::Rice])]
    #[case::zstd(vec![Stage::Zstd])]
    #[case::lzo(vec![Stage::Lzo])]
    fn lossless_round_trip(#[case] stages: Vec<Stage>) {
        let pipeline = Pipeline::new(stages).unwrap();
        let params = CodecParams::default();
        let original = waveform();

        let mut src = original.clone();
        let mut dst = vec![0u8; original.len() * 2 + 1024];
        let n = pipeline.compress(&mut src, &mut dst, &params).unwrap();

        let mut out = Vec::new();
        pipeline
            .decompress(&dst[..n], &mut out, original.len(), &params)
            .unwrap();
        assert_eq!(out, original, "pipeline [{pipeline}]");
    }

    #[test]
    fn transform_only_pipeline_is_rejected() {
        assert!(Pipeline::new(vec![Stage::Delta]).is_err());
        assert!(Pipeline::new(vec![]).is_err());
    }

    #[test]
    fn entropy_must_be_terminal() {
        let err = Pipeline::new(vec![Stage::Zlib, Stage::Delta]).unwrap_err();
        assert!(err.to_string().contains("Zlib"));
    }

    #[test]
    fn odd_input_to_sixteen_bit_pipeline_names_the_stage() {
        let pipeline = Pipeline::new(vec![Stage::Delta, Stage::Huffman16]).unwrap();
        let mut src = vec![1u8, 2, 3];
        let mut dst = vec![0u8; 256];
        let err = pipeline
            .compress(&mut src, &mut dst, &CodecParams::default())
            .unwrap_err();
        assert!(err.to_string().contains("Delta"), "{err}");
    }

    #[test]
    fn undersized_destination_overflows_loudly() {
        let pipeline = Pipeline::raw();
        let mut src = waveform();
        let mut dst = vec![0u8; 16];
        let err = pipeline
            .compress(&mut src, &mut dst, &CodecParams::default())
            .unwrap_err();
        assert!(matches!(err, ztile_error::ZTileError::BufferOverflow(_)));
    }

    #[test]
    fn run_length_pipeline_round_trips_structured_data() {
        let pipeline = Pipeline::new(vec![Stage::SameValues32, Stage::SplitHiLo32, Stage::Zlib])
            .unwrap();
        let params = CodecParams::default();
        let original: Vec<u8> = [42u32; 300]
            .iter()
            .chain([7u32; 200].iter())
            .flat_map(|v| v.to_le_bytes())
            .collect();

        let mut src = original.clone();
        let mut dst = vec![0u8; original.len() + 1024];
        let n = pipeline.compress(&mut src, &mut dst, &params).unwrap();
        assert!(n < 100, "run-length data should collapse, got {n} bytes");

        let mut out = Vec::new();
        pipeline
            .decompress(&dst[..n], &mut out, original.len(), &params)
            .unwrap();
        assert_eq!(out, original);
    }
}
