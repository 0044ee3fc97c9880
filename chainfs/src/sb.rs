use std::convert::TryFrom;
use std::mem::size_of;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::fs::{FsError, Result};
use crate::io::BlockNumber;

pub const SB_MAGIC: u32 = 0x4346_5342; // CFSB

/// Known locations.
pub const SUPERBLOCK_INDEX: BlockNumber = 0;
pub const BITMAP_START: BlockNumber = 1;

/// The first block of the file system storing information critical for mounting
/// the file system and verifying the underlying disk is formatted correctly.
///
/// # Layout
/// ======================================================================
/// | SuperBlock | Bitmap (all blocks) ... | Root folder | Nodes and data |
/// ======================================================================
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug, PartialEq)]
pub struct SuperBlock {
    /// A 32-bit identifying string, in this case CFSB.
    pub sb_magic: u32,
    /// Size of every block on the medium the image was formatted for.
    pub block_size: u32,
    /// Total number of blocks, metadata included.
    pub block_count: u32,
    /// Where the allocation bitmap starts.
    pub bitmap_start: u32,
    /// How many consecutive blocks the bitmap occupies.
    pub bitmap_blocks: u32,
    /// Node block of the root folder.
    pub root: u32,
}

pub const SB_SIZE: usize = size_of::<SuperBlock>();

impl SuperBlock {
    /// Computes the layout for a medium of the given geometry. The bitmap needs one
    /// bit per block and the root folder takes the first block after it.
    pub fn new(block_size: usize, block_count: usize) -> Result<Self> {
        let bits_per_block = block_size * 8;
        let bitmap_blocks = (block_count + bits_per_block - 1) / bits_per_block;
        let root = BITMAP_START + bitmap_blocks;
        if root >= block_count {
            return Err(FsError::InvalidArgument(format!(
                "{} blocks cannot hold the super block, {} bitmap block(s) and a root folder",
                block_count, bitmap_blocks
            )));
        }
        Ok(Self {
            sb_magic: SB_MAGIC,
            block_size: to_u32(block_size, "block size")?,
            block_count: to_u32(block_count, "block count")?,
            bitmap_start: BITMAP_START as u32,
            bitmap_blocks: bitmap_blocks as u32,
            root: root as u32,
        })
    }

    /// Reads the super block from the front of a block and validates it against
    /// the geometry of the medium it was read from.
    pub fn parse(buf: &[u8], block_size: usize, block_count: usize) -> Result<Self> {
        let sb = buf
            .get(..SB_SIZE)
            .and_then(SuperBlock::read_from)
            .ok_or_else(|| FsError::Corrupt("super block does not fit in block".to_string()))?;
        if sb.sb_magic != SB_MAGIC {
            return Err(FsError::Corrupt(format!(
                "super block magic {:#x} invalid",
                sb.sb_magic
            )));
        }
        if sb.block_size as usize != block_size || sb.block_count as usize != block_count {
            return Err(FsError::Corrupt(format!(
                "image formatted for {} blocks of {} bytes, medium has {} blocks of {} bytes",
                sb.block_count, sb.block_size, block_count, block_size
            )));
        }
        // The bitmap and root positions follow from the geometry alone.
        let expected = SuperBlock::new(block_size, block_count)
            .map_err(|e| FsError::Corrupt(e.to_string()))?;
        if (sb.bitmap_start, sb.bitmap_blocks, sb.root)
            != (expected.bitmap_start, expected.bitmap_blocks, expected.root)
        {
            return Err(FsError::Corrupt(format!(
                "bitmap at {} ({} block(s)) and root {} do not match the expected layout \
                 (bitmap at {}, {} block(s), root {})",
                sb.bitmap_start,
                sb.bitmap_blocks,
                sb.root,
                expected.bitmap_start,
                expected.bitmap_blocks,
                expected.root
            )));
        }
        Ok(sb)
    }

    /// Blocks permanently owned by file system metadata, root folder included.
    pub fn reserved_blocks(&self) -> std::ops::Range<BlockNumber> {
        SUPERBLOCK_INDEX..self.root as usize + 1
    }
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| FsError::InvalidArgument(format!("{} {} does not fit in 32 bits", what, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_encode_and_decode_superblocks() {
        let sb = SuperBlock::new(256, 16).unwrap();
        let mut block = vec![0; 256];
        block[..SB_SIZE].copy_from_slice(sb.as_bytes());

        let parsed = SuperBlock::parse(&block, 256, 16).unwrap();

        assert_eq!(parsed, sb);
        assert_eq!(parsed.bitmap_blocks, 1);
        assert_eq!(parsed.root, 2);
    }

    #[test]
    fn large_devices_get_more_bitmap_blocks() {
        // 32 bytes per block track 256 blocks each.
        let sb = SuperBlock::new(32, 1000).unwrap();
        assert_eq!(sb.bitmap_blocks, 4);
        assert_eq!(sb.root, 5);
        assert_eq!(sb.reserved_blocks(), 0..6);
    }

    #[test]
    fn parsing_buffer_with_invalid_magic_fails() {
        let zero_buffer_with_right_size = vec![0; 256];
        assert!(matches!(
            SuperBlock::parse(&zero_buffer_with_right_size, 256, 16),
            Err(FsError::Corrupt(_))
        ));
    }

    #[test]
    fn parsing_with_mismatched_geometry_fails() {
        let sb = SuperBlock::new(256, 16).unwrap();
        let mut block = vec![0; 256];
        block[..SB_SIZE].copy_from_slice(sb.as_bytes());

        assert!(SuperBlock::parse(&block, 256, 32).is_err());
        assert!(SuperBlock::parse(&block, 512, 16).is_err());
    }

    #[test]
    fn parsing_with_inconsistent_bitmap_layout_fails() {
        let good = SuperBlock::new(256, 16).unwrap();
        let layouts = [
            (BITMAP_START as u32 + 1, 0, good.root),
            (good.bitmap_start, 0, good.root),
            (good.bitmap_start, good.bitmap_blocks + 1, good.root + 1),
            (good.bitmap_start, good.bitmap_blocks, good.root + 1),
        ];
        for &(bitmap_start, bitmap_blocks, root) in &layouts {
            let sb = SuperBlock {
                bitmap_start,
                bitmap_blocks,
                root,
                ..good
            };
            let mut block = vec![0; 256];
            block[..SB_SIZE].copy_from_slice(sb.as_bytes());
            assert!(matches!(
                SuperBlock::parse(&block, 256, 16),
                Err(FsError::Corrupt(_))
            ));
        }
    }

    #[test]
    fn too_small_device_is_rejected() {
        assert!(matches!(
            SuperBlock::new(256, 2),
            Err(FsError::InvalidArgument(_))
        ));
    }
}
