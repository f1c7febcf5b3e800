//! Lossy quantization transforms.
//!
//! All three stages walk the gather buffer as a sequence of chunks, each a
//! 4-byte byte-length prefix followed by that many payload bytes — the layout
//! length-prefixed (any-array) columns serialize to. The float stage is
//! reversed on read by multiplying the precision back; the integer stages are
//! intentionally irreversible and decode as no-ops.

use ztile_error::{ztile_bail, ZTileResult};

use crate::{check_multiple, CodecParams, Stage};

fn chunk_bounds(buf: &[u8], pos: usize, stage: Stage) -> ZTileResult<(usize, usize)> {
    if pos + 4 > buf.len() {
        ztile_bail!(InvalidSerde: "{} chunk prefix overruns the buffer at offset {}", stage, pos);
    }
    let len = i32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
    if len < 0 {
        ztile_bail!(InvalidSerde: "{} chunk has negative length {}", stage, len);
    }
    let start = pos + 4;
    let end = start + len as usize;
    if end > buf.len() {
        ztile_bail!(
            InvalidSerde: "{} chunk of {} bytes at offset {} overruns the buffer", stage, len, pos
        );
    }
    check_multiple(stage, len as usize)?;
    Ok((start, end))
}

/// Quantize each chunk's floats to `precision` steps, storing them as i32.
pub fn lossy_floats_encode(buf: &mut [u8], params: &CodecParams) -> ZTileResult<()> {
    check_multiple(Stage::LossyFloats, buf.len())?;
    let precision = params.float_precision;
    let delta = precision / 2.0;
    let mut pos = 0;
    while pos < buf.len() {
        let (start, end) = chunk_bounds(buf, pos, Stage::LossyFloats)?;
        for i in (start..end).step_by(4) {
            let f = f32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
            let q = if f >= 0.0 {
                ((f + delta) / precision) as i32
            } else {
                ((f - delta) / precision) as i32
            };
            buf[i..i + 4].copy_from_slice(&q.to_le_bytes());
        }
        pos = end;
    }
    Ok(())
}

/// Multiply the precision back, restoring floats to within half a step.
pub fn lossy_floats_decode(buf: &mut [u8], params: &CodecParams) -> ZTileResult<()> {
    check_multiple(Stage::LossyFloats, buf.len())?;
    let precision = params.float_precision;
    let mut pos = 0;
    while pos < buf.len() {
        let (start, end) = chunk_bounds(buf, pos, Stage::LossyFloats)?;
        for i in (start..end).step_by(4) {
            let q = i32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
            let f = q as f32 * precision;
            buf[i..i + 4].copy_from_slice(&f.to_le_bytes());
        }
        pos = end;
    }
    Ok(())
}

/// Round every 16-bit value to the nearest multiple of the quantization step.
pub fn lossy_int16_encode(buf: &mut [u8], params: &CodecParams) -> ZTileResult<()> {
    let step = params.quantization.max(1) as u16;
    if step == 1 {
        return Ok(());
    }
    let shift = step / 2;
    let mut pos = 0;
    while pos < buf.len() {
        let (start, end) = chunk_bounds(buf, pos, Stage::LossyInt16)?;
        let mut chunk_error = 0.0f64;
        let mut samples = 0u64;
        for i in (start..end).step_by(2) {
            let v = u16::from_le_bytes([buf[i], buf[i + 1]]);
            let q = v.wrapping_add(shift) / step * step;
            chunk_error += f64::from(v.abs_diff(q));
            samples += 1;
            buf[i..i + 2].copy_from_slice(&q.to_le_bytes());
        }
        if samples > 0 {
            params.lossy_stats.record_chunk(chunk_error / samples as f64);
        }
        pos = end;
    }
    Ok(())
}

/// 32-bit flavor of [`lossy_int16_encode`].
pub fn lossy_int32_encode(buf: &mut [u8], params: &CodecParams) -> ZTileResult<()> {
    let step = params.quantization.max(1);
    if step == 1 {
        return Ok(());
    }
    let shift = step / 2;
    let mut pos = 0;
    while pos < buf.len() {
        let (start, end) = chunk_bounds(buf, pos, Stage::LossyInt32)?;
        let mut chunk_error = 0.0f64;
        let mut samples = 0u64;
        for i in (start..end).step_by(4) {
            let v = u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
            let q = v.wrapping_add(shift) / step * step;
            chunk_error += f64::from(v.abs_diff(q));
            samples += 1;
            buf[i..i + 4].copy_from_slice(&q.to_le_bytes());
        }
        if samples > 0 {
            params.lossy_stats.record_chunk(chunk_error / samples as f64);
        }
        pos = end;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::CodecParams;

    fn float_chunk(values: &[f32]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((values.len() * 4) as i32).to_le_bytes());
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf
    }

    #[test]
    fn floats_quantize_to_precision() {
        let params = CodecParams::default();
        let original = [1.234f32, -5.678, 0.0, 100.009];
        let mut buf = float_chunk(&original);
        lossy_floats_encode(&mut buf, &params).unwrap();
        lossy_floats_decode(&mut buf, &params).unwrap();

        for (i, &want) in original.iter().enumerate() {
            let off = 4 + i * 4;
            let got = f32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
            assert!((got - want).abs() <= 0.005 + 1e-6, "{want} -> {got}");
        }
    }

    #[test]
    fn multiple_chunks_walk_cleanly() {
        let params = CodecParams::default();
        let mut buf = float_chunk(&[1.0, 2.0]);
        buf.extend(float_chunk(&[3.0]));
        lossy_floats_encode(&mut buf, &params).unwrap();
        lossy_floats_decode(&mut buf, &params).unwrap();
        let got = f32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        assert!((got - 3.0).abs() <= 0.005);
    }

    #[test]
    fn truncated_chunk_is_an_error() {
        let params = CodecParams::default();
        let mut buf = float_chunk(&[1.0, 2.0]);
        buf.truncate(buf.len() - 2);
        assert!(lossy_floats_encode(&mut buf, &params).is_err());
    }

    #[test]
    fn int16_quantization_accumulates_error() {
        let params = CodecParams {
            quantization: 10,
            ..Default::default()
        };
        let mut buf = Vec::new();
        buf.extend_from_slice(&6i32.to_le_bytes());
        for v in [13u16, 27, 95] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        lossy_int16_encode(&mut buf, &params).unwrap();

        let q: Vec<u16> = buf[4..]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(q, vec![10, 30, 100]);
        assert_eq!(params.lossy_stats.num_chunks(), 1);
        assert!(params.lossy_stats.average_error() > 0.0);
    }

    #[test]
    fn unit_step_is_identity() {
        let params = CodecParams::default();
        let mut buf = Vec::new();
        buf.extend_from_slice(&4i32.to_le_bytes());
        buf.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        let before = buf.clone();
        lossy_int32_encode(&mut buf, &params).unwrap();
        assert_eq!(buf, before);
    }
}
