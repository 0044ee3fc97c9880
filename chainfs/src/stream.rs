//! Byte-addressed content on top of a node's block chain.
//!
//! A node block holds the content length together with the first and last
//! blocks of a singly linked chain. Every data block carries
//! `block_size - NEXT_PTR_SIZE` content bytes followed by the address of the next
//! block. The chain always holds exactly `ceil(length / payload)` blocks: growth
//! allocates before touching anything, shrinkage frees what falls off the end.
//!
//! Files use the stream for their content, folders for their entry records.

use log::debug;

use crate::accessor::BlockAccessor;
use crate::alloc::Allocator;
use crate::fs::{FsError, Result};
use crate::io::{BlockNumber, BlockStorage};
use crate::node::{blocks_for, next_of, payload_size, set_next, NodeHeader, NO_BLOCK};

pub struct ContentStream<'a, T: BlockStorage> {
    ba: &'a mut BlockAccessor<T>,
    alloc: &'a mut Allocator,
    node: BlockNumber,
    payload: usize,
}

fn check_range(offset: u64, count: usize, length: u64) -> Result<()> {
    match offset.checked_add(count as u64) {
        Some(end) if end <= length => Ok(()),
        _ => Err(FsError::OutOfRange {
            offset,
            count: count as u64,
            length,
        }),
    }
}

impl<'a, T: BlockStorage> ContentStream<'a, T> {
    pub fn new(ba: &'a mut BlockAccessor<T>, alloc: &'a mut Allocator, node: BlockNumber) -> Self {
        let payload = payload_size(ba.block_size());
        Self {
            ba,
            alloc,
            node,
            payload,
        }
    }

    fn header(&mut self) -> Result<NodeHeader> {
        NodeHeader::load(self.ba, self.node)
    }

    pub fn len(&mut self) -> Result<u64> {
        Ok(self.header()?.length)
    }

    fn follow(&self, next: u32) -> Result<BlockNumber> {
        if next == NO_BLOCK {
            return Err(FsError::Corrupt(format!(
                "chain of node {} ends early",
                self.node
            )));
        }
        Ok(next as usize)
    }

    /// Address of the `index`-th data block.
    fn nth(&mut self, header: &NodeHeader, index: usize) -> Result<BlockNumber> {
        if index + 1 == blocks_for(header.length, self.payload) {
            return self.follow(header.last);
        }
        let mut block = self.follow(header.first)?;
        for _ in 0..index {
            let next = self.ba.read(block, next_of)?;
            block = self.follow(next)?;
        }
        Ok(block)
    }

    /// Every data block of the chain in order.
    pub fn chain(&mut self) -> Result<Vec<BlockNumber>> {
        let header = self.header()?;
        let count = blocks_for(header.length, self.payload);
        let mut blocks = Vec::with_capacity(count);
        if count == 0 {
            return Ok(blocks);
        }
        let mut block = self.follow(header.first)?;
        blocks.push(block);
        while blocks.len() < count {
            let next = self.ba.read(block, next_of)?;
            block = self.follow(next)?;
            blocks.push(block);
        }
        if block != header.last as usize || self.ba.read(block, next_of)? != NO_BLOCK {
            return Err(FsError::Corrupt(format!(
                "chain of node {} does not end at its last block",
                self.node
            )));
        }
        Ok(blocks)
    }

    /// Fills `buf` with the bytes starting at `offset`.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let header = self.header()?;
        check_range(offset, buf.len(), header.length)?;
        if buf.is_empty() {
            return Ok(());
        }

        let payload = self.payload;
        let mut block = self.nth(&header, (offset / payload as u64) as usize)?;
        let mut at = (offset % payload as u64) as usize;
        let mut done = 0;
        loop {
            let n = (payload - at).min(buf.len() - done);
            let dst = &mut buf[done..done + n];
            let next = self.ba.read(block, |data| {
                dst.copy_from_slice(&data[at..at + n]);
                next_of(data)
            })?;
            done += n;
            if done == buf.len() {
                return Ok(());
            }
            block = self.follow(next)?;
            at = 0;
        }
    }

    /// Replaces the bytes starting at `offset` with `data`. Never grows the
    /// content.
    pub fn overwrite(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let header = self.header()?;
        check_range(offset, data.len(), header.length)?;
        if data.is_empty() {
            return Ok(());
        }

        let payload = self.payload;
        let mut block = self.nth(&header, (offset / payload as u64) as usize)?;
        let mut at = (offset % payload as u64) as usize;
        let mut done = 0;
        loop {
            let n = (payload - at).min(data.len() - done);
            let src = &data[done..done + n];
            let next = self.ba.modify(block, |buf| {
                buf[at..at + n].copy_from_slice(src);
                next_of(buf)
            })?;
            done += n;
            if done == data.len() {
                return Ok(());
            }
            block = self.follow(next)?;
            at = 0;
        }
    }

    /// Adds `data` to the end. The partially filled last block is topped up
    /// before new blocks are linked in.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let mut header = self.header()?;
        if data.is_empty() {
            return Ok(());
        }
        let new_length = header
            .length
            .checked_add(data.len() as u64)
            .ok_or(FsError::OutOfRange {
                offset: header.length,
                count: data.len() as u64,
                length: header.length,
            })?;

        let payload = self.payload;
        let have = blocks_for(header.length, payload);
        let need = blocks_for(new_length, payload);
        let fresh = self.alloc.allocate_many(self.ba, need - have)?;
        let first_fresh = fresh.first().map_or(NO_BLOCK, |&b| b as u32);

        let mut written = 0;
        if have > 0 {
            let tail = self.follow(header.last)?;
            let used = (header.length - (have as u64 - 1) * payload as u64) as usize;
            let n = (payload - used).min(data.len());
            if n > 0 || !fresh.is_empty() {
                self.ba.modify(tail, |buf| {
                    buf[used..used + n].copy_from_slice(&data[..n]);
                    set_next(buf, first_fresh);
                })?;
            }
            written = n;
        }

        for (i, &block) in fresh.iter().enumerate() {
            let n = payload.min(data.len() - written);
            let src = &data[written..written + n];
            let next = fresh.get(i + 1).map_or(NO_BLOCK, |&b| b as u32);
            self.ba.modify(block, |buf| {
                buf[..n].copy_from_slice(src);
                set_next(buf, next);
            })?;
            written += n;
        }
        debug_assert_eq!(written, data.len());

        if let Some(&last) = fresh.last() {
            if have == 0 {
                header.first = first_fresh;
            }
            header.last = last as u32;
        }
        header.length = new_length;
        header.store(self.ba, self.node)?;
        debug!(
            "node {} grew to {} bytes ({} new block(s))",
            self.node,
            new_length,
            fresh.len()
        );
        Ok(())
    }

    /// Drops the last `count` bytes and frees blocks no longer needed. Bytes past
    /// the new length in the new last block keep whatever they held.
    pub fn remove(&mut self, count: u64) -> Result<()> {
        let mut header = self.header()?;
        if count > header.length {
            return Err(FsError::OutOfRange {
                offset: 0,
                count,
                length: header.length,
            });
        }
        let new_length = header.length - count;
        let have = blocks_for(header.length, self.payload);
        let keep = blocks_for(new_length, self.payload);

        let mut dropped = Vec::with_capacity(have - keep);
        if keep < have {
            let new_last = if keep == 0 {
                None
            } else {
                Some(self.nth(&header, keep - 1)?)
            };
            let mut block = match new_last {
                Some(last) => {
                    let next = self.ba.read(last, next_of)?;
                    self.follow(next)?
                }
                None => self.follow(header.first)?,
            };
            dropped.push(block);
            while dropped.len() < have - keep {
                let next = self.ba.read(block, next_of)?;
                block = self.follow(next)?;
                dropped.push(block);
            }

            match new_last {
                Some(last) => {
                    self.ba.modify(last, |buf| set_next(buf, NO_BLOCK))?;
                    header.last = last as u32;
                }
                None => {
                    header.first = NO_BLOCK;
                    header.last = NO_BLOCK;
                }
            }
        }

        header.length = new_length;
        header.store(self.ba, self.node)?;
        for &block in &dropped {
            self.alloc.free(self.ba, block)?;
        }
        debug!(
            "node {} shrank to {} bytes ({} block(s) freed)",
            self.node,
            new_length,
            dropped.len()
        );
        Ok(())
    }

    /// Empties the stream, returning every data block to the allocator.
    pub fn clear(&mut self) -> Result<()> {
        let length = self.len()?;
        self.remove(length)
    }
}
