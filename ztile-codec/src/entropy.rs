//! Terminal entropy coders wrapping external codec libraries.
//!
//! Each function writes into a caller-allocated destination and fails with a
//! buffer-overflow error naming the stage when the output would meet or
//! exceed the destination bound; nothing here silently truncates.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use ztile_error::{ztile_bail, ZTileResult};

pub fn zlib_compress(src: &[u8], dst: &mut [u8]) -> ZTileResult<usize> {
    let mut encoder = Compress::new(Compression::default(), true);
    loop {
        let consumed = encoder.total_in() as usize;
        let written = encoder.total_out() as usize;
        let status = encoder
            .compress(&src[consumed..], &mut dst[written..], FlushCompress::Finish)
            .map_err(|e| ztile_error::ztile_err!(InvalidSerde: "Zlib compression failed: {}", e))?;
        match status {
            Status::StreamEnd => break,
            _ if encoder.total_out() as usize > written => {}
            _ => ztile_bail!(
                BufferOverflow: "Zlib output for {} input bytes exceeds the {} byte destination",
                src.len(),
                dst.len()
            ),
        }
    }
    let written = encoder.total_out() as usize;
    if written >= dst.len() {
        ztile_bail!(
            BufferOverflow: "Zlib wrote {} bytes into a {} byte destination", written, dst.len()
        );
    }
    Ok(written)
}

pub fn zlib_decompress(src: &[u8], dst: &mut [u8]) -> ZTileResult<usize> {
    let mut decoder = Decompress::new(true);
    loop {
        let consumed = decoder.total_in() as usize;
        let written = decoder.total_out() as usize;
        let status = decoder
            .decompress(&src[consumed..], &mut dst[written..], FlushDecompress::Finish)
            .map_err(|e| {
                ztile_error::ztile_err!(InvalidSerde: "Zlib decompression failed: {}", e)
            })?;
        match status {
            Status::StreamEnd => return Ok(decoder.total_out() as usize),
            _ if decoder.total_out() as usize > written => {}
            _ => ztile_bail!(
                BufferOverflow: "Zlib decompression exceeds the {} byte destination", dst.len()
            ),
        }
    }
}

pub fn zstd_compress(src: &[u8], dst: &mut [u8], level: i32) -> ZTileResult<usize> {
    zstd::bulk::compress_to_buffer(src, dst, level).map_err(|e| {
        ztile_error::ztile_err!(
            BufferOverflow: "Zstd failed on {} input bytes into a {} byte destination: {}",
            src.len(),
            dst.len(),
            e
        )
    })
}

pub fn zstd_decompress(src: &[u8], dst: &mut [u8]) -> ZTileResult<usize> {
    zstd::bulk::decompress_to_buffer(src, dst)
        .map_err(|e| ztile_error::ztile_err!(InvalidSerde: "Zstd decompression failed: {}", e))
}

/// LZO-class one-shot block compression (lz4 block format).
pub fn lzo_compress(src: &[u8], dst: &mut [u8]) -> ZTileResult<usize> {
    lz4_flex::block::compress_into(src, dst).map_err(|e| {
        ztile_error::ztile_err!(
            BufferOverflow: "Lzo failed on {} input bytes into a {} byte destination: {}",
            src.len(),
            dst.len(),
            e
        )
    })
}

pub fn lzo_decompress(src: &[u8], dst: &mut [u8]) -> ZTileResult<usize> {
    lz4_flex::block::decompress_into(src, dst)
        .map_err(|e| ztile_error::ztile_err!(InvalidSerde: "Lzo decompression failed: {}", e))
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    type CodecFn = fn(&[u8], &mut [u8]) -> ztile_error::ZTileResult<usize>;

    fn sample_data() -> Vec<u8> {
        (0..5000u32).flat_map(|i| ((i / 7) as u16).to_le_bytes()).collect()
    }

    #[rstest]
    #[case::zlib(zlib_compress, zlib_decompress)]
    #[case::lzo(lzo_compress, lzo_decompress)]
    fn round_trip(#[case] compress: CodecFn, #[case] decompress: CodecFn) {
        let src = sample_data();
        let mut compressed = vec![0u8; src.len() + 1024];
        let n = compress(&src, &mut compressed).unwrap();
        assert!(n < src.len());

        let mut out = vec![0u8; src.len()];
        let m = decompress(&compressed[..n], &mut out).unwrap();
        assert_eq!(m, src.len());
        assert_eq!(out, src);
    }

    #[test]
    fn zstd_round_trip_with_level() {
        let src = sample_data();
        let mut compressed = vec![0u8; src.len() + 1024];
        let n = zstd_compress(&src, &mut compressed, 5).unwrap();
        let mut out = vec![0u8; src.len()];
        let m = zstd_decompress(&compressed[..n], &mut out).unwrap();
        assert_eq!(m, src.len());
        assert_eq!(out, src);
    }

    #[test]
    fn tiny_destination_fails_loudly() {
        let src = sample_data();
        let mut dst = vec![0u8; 8];
        assert!(zlib_compress(&src, &mut dst).is_err());
        assert!(zstd_compress(&src, &mut dst, 0).is_err());
        assert!(lzo_compress(&src, &mut dst).is_err());
    }
}
