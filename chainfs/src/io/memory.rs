use super::block::{out_of_range, BlockNumber, BlockStorage};
use std::io::ErrorKind;

/// Keeps every block in memory. Useful for tests and for throwaway images.
#[derive(Debug, Clone)]
pub struct MemoryBlockDevice {
    blocks: Vec<Box<[u8]>>,
    block_size: usize,
}

impl MemoryBlockDevice {
    /// Creates `block_count` zeroed blocks of `block_size` bytes each.
    pub fn new(block_count: usize, block_size: usize) -> Self {
        Self {
            blocks: vec![vec![0; block_size].into_boxed_slice(); block_count],
            block_size,
        }
    }
}

impl BlockStorage for MemoryBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        let count = self.blocks.len();
        let block = self
            .blocks
            .get(blocknr)
            .ok_or_else(|| out_of_range(blocknr, count))?;
        if buf.len() < self.block_size {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }
        buf[..self.block_size].copy_from_slice(block);
        Ok(())
    }

    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        let count = self.blocks.len();
        let block = self
            .blocks
            .get_mut(blocknr)
            .ok_or_else(|| out_of_range(blocknr, count))?;
        let max = buf.len().min(block.len());
        block[..max].copy_from_slice(&buf[..max]);
        Ok(())
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
