use ztile_error::{ztile_bail, ZTileResult};

use crate::Stage;

/// The per-column header preceding each compressed block within a tile.
///
/// Layout: `num_procs: u16`, `proc_ids: [u16; num_procs]`, `block_size: u32`,
/// all little-endian. `block_size` counts the header itself plus the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    stages: Vec<Stage>,
    block_size: u32,
}

impl BlockHeader {
    pub fn new(stages: Vec<Stage>, block_size: u32) -> Self {
        Self { stages, block_size }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Payload bytes following this header.
    pub fn payload_size(&self) -> ZTileResult<usize> {
        let head = self.encoded_len();
        let total = self.block_size as usize;
        if total < head {
            ztile_bail!(
                InvalidSerde: "block size {} smaller than its own header ({} bytes)", total, head
            );
        }
        Ok(total - head)
    }

    pub fn encoded_len(&self) -> usize {
        Self::encoded_len_for(self.stages.len())
    }

    pub const fn encoded_len_for(num_stages: usize) -> usize {
        2 + 2 * num_stages + 4
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.stages.len() as u16).to_le_bytes());
        for stage in &self.stages {
            out.extend_from_slice(&u16::from(*stage).to_le_bytes());
        }
        out.extend_from_slice(&self.block_size.to_le_bytes());
    }

    /// Decode a header from the front of `src`, returning it and the number
    /// of bytes consumed.
    pub fn read_from(src: &[u8]) -> ZTileResult<(Self, usize)> {
        if src.len() < 2 {
            ztile_bail!(InvalidSerde: "truncated block header: {} bytes", src.len());
        }
        let num_procs = u16::from_le_bytes([src[0], src[1]]) as usize;
        let needed = Self::encoded_len_for(num_procs);
        if src.len() < needed {
            ztile_bail!(
                InvalidSerde: "truncated block header: need {} bytes, have {}", needed, src.len()
            );
        }
        let mut stages = Vec::with_capacity(num_procs);
        for i in 0..num_procs {
            let off = 2 + 2 * i;
            let id = u16::from_le_bytes([src[off], src[off + 1]]);
            stages.push(Stage::from_id(id)?);
        }
        let off = 2 + 2 * num_procs;
        let block_size = u32::from_le_bytes([src[off], src[off + 1], src[off + 2], src[off + 3]]);
        Ok((Self { stages, block_size }, needed))
    }
}
