use log::trace;

use crate::accessor::BlockAccessor;
use crate::fs::{FsError, Result};
use crate::io::{BlockNumber, BlockStorage};
use crate::sb::SuperBlock;

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// One bit per block over a bitmap buffer: 0 is free, 1 is used. A block of `n`
/// bytes tracks `8 * n` blocks.
pub struct Bitmap<B> {
    bits: B,
}

impl<B: AsRef<[u8]>> Bitmap<B> {
    pub fn new(bits: B) -> Self {
        Self { bits }
    }

    pub fn get(&self, bit: usize) -> State {
        match (self.bits.as_ref()[bit / 8] >> (bit % 8)) & 1 {
            0 => State::Free,
            _ => State::Used,
        }
    }

    /// First free bit in `from..to`.
    pub fn first_free(&self, from: usize, to: usize) -> Option<usize> {
        (from..to).find(|&bit| self.get(bit) == State::Free)
    }

    pub fn count_used(&self, to: usize) -> usize {
        (0..to).filter(|&bit| self.get(bit) == State::Used).count()
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Bitmap<B> {
    pub fn set_reserved(&mut self, bit: usize) {
        self.bits.as_mut()[bit / 8] |= 1 << (bit % 8);
    }

    pub fn set_free(&mut self, bit: usize) {
        self.bits.as_mut()[bit / 8] &= !(1 << (bit % 8));
    }
}

/// Hands out and reclaims blocks. The bitmap itself lives on the medium, so every
/// call goes through the block accessor; only a search hint is kept in memory.
///
/// Implements a next-available policy: the search resumes after the last block
/// handed out and wraps around once, which keeps a growing chain roughly
/// sequential on the medium.
pub struct Allocator {
    bitmap_start: BlockNumber,
    bitmap_blocks: usize,
    block_count: usize,
    /// Keeps track of the next starting place for looking for available blocks.
    marker: BlockNumber,
}

impl Allocator {
    pub fn new(sb: &SuperBlock) -> Self {
        Self {
            bitmap_start: sb.bitmap_start as usize,
            bitmap_blocks: sb.bitmap_blocks as usize,
            block_count: sb.block_count as usize,
            marker: 0,
        }
    }

    /// Writes a fresh bitmap with only the metadata blocks marked used.
    pub fn format<T: BlockStorage>(&self, ba: &mut BlockAccessor<T>, sb: &SuperBlock) -> Result<()> {
        let bits_per_block = ba.block_size() * 8;
        let reserved = sb.reserved_blocks();
        for i in 0..self.bitmap_blocks {
            let first = i * bits_per_block;
            ba.modify(self.bitmap_start + i, |bits| {
                bits.fill(0);
                let mut bitmap = Bitmap::new(bits);
                for block in reserved.clone() {
                    if block >= first && block < first + bits_per_block {
                        bitmap.set_reserved(block - first);
                    }
                }
            })?;
        }
        Ok(())
    }

    fn locate<T: BlockStorage>(&self, ba: &BlockAccessor<T>, block: BlockNumber) -> (BlockNumber, usize) {
        let bits_per_block = ba.block_size() * 8;
        (self.bitmap_start + block / bits_per_block, block % bits_per_block)
    }

    /// Finds a free block, marks it used and returns it.
    pub fn allocate<T: BlockStorage>(&mut self, ba: &mut BlockAccessor<T>) -> Result<BlockNumber> {
        let start = self.marker;
        if let Some(block) = self.search(ba, start, self.block_count)? {
            return Ok(block);
        }
        if let Some(block) = self.search(ba, 0, start)? {
            return Ok(block);
        }
        Err(FsError::OutOfSpace)
    }

    fn search<T: BlockStorage>(
        &mut self,
        ba: &mut BlockAccessor<T>,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Option<BlockNumber>> {
        let bits_per_block = ba.block_size() * 8;
        let mut cursor = from;
        while cursor < to {
            let (bitmap_block, bit) = self.locate(ba, cursor);
            let base = cursor - bit;
            let end = to.min(base + bits_per_block);
            let found = ba.modify(bitmap_block, |bits| {
                let mut bitmap = Bitmap::new(bits);
                let free = bitmap.first_free(bit, end - base);
                if let Some(free) = free {
                    bitmap.set_reserved(free);
                }
                free
            })?;
            if let Some(free) = found {
                let block = base + free;
                self.marker = block + 1;
                trace!("allocated block {}", block);
                return Ok(Some(block));
            }
            cursor = end;
        }
        Ok(None)
    }

    /// Returns `block` to the free pool.
    ///
    /// # Panics
    ///
    /// Freeing a block that is not in use means the caller lost track of its own
    /// structure and is not recoverable.
    pub fn free<T: BlockStorage>(&mut self, ba: &mut BlockAccessor<T>, block: BlockNumber) -> Result<()> {
        assert!(block < self.block_count, "freeing block {} out of range", block);
        let (bitmap_block, bit) = self.locate(ba, block);
        let was = ba.modify(bitmap_block, |bits| {
            let mut bitmap = Bitmap::new(bits);
            let was = bitmap.get(bit);
            bitmap.set_free(bit);
            was
        })?;
        assert_eq!(was, State::Used, "freeing block {} which is not in use", block);
        trace!("freed block {}", block);
        Ok(())
    }

    /// Allocates `count` blocks or none at all.
    pub fn allocate_many<T: BlockStorage>(
        &mut self,
        ba: &mut BlockAccessor<T>,
        count: usize,
    ) -> Result<Vec<BlockNumber>> {
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            match self.allocate(ba) {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    for block in blocks {
                        self.free(ba, block)?;
                    }
                    return Err(e);
                }
            }
        }
        Ok(blocks)
    }

    pub fn state<T: BlockStorage>(&self, ba: &mut BlockAccessor<T>, block: BlockNumber) -> Result<State> {
        let (bitmap_block, bit) = self.locate(ba, block);
        ba.read(bitmap_block, |bits| Bitmap::new(bits).get(bit))
    }

    /// Number of blocks currently marked used, metadata included.
    pub fn used_blocks<T: BlockStorage>(&self, ba: &mut BlockAccessor<T>) -> Result<usize> {
        let bits_per_block = ba.block_size() * 8;
        let mut used = 0;
        for i in 0..self.bitmap_blocks {
            let tracked = self.block_count.saturating_sub(i * bits_per_block).min(bits_per_block);
            used += ba.read(self.bitmap_start + i, |bits| {
                Bitmap::new(bits).count_used(tracked)
            })?;
        }
        Ok(used)
    }

    pub fn free_blocks<T: BlockStorage>(&self, ba: &mut BlockAccessor<T>) -> Result<usize> {
        Ok(self.block_count - self.used_blocks(ba)?)
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }
}
