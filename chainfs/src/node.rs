use std::convert::TryInto;
use std::mem::size_of;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::accessor::BlockAccessor;
use crate::fs::{FsError, Result};
use crate::io::{BlockNumber, BlockStorage};

const FILE_MAGIC: u32 = 0x4649_4c45; // FILE
const FOLDER_MAGIC: u32 = 0x464f_4c44; // FOLD

/// Terminates a chain, both in node headers and in data block trailers.
pub const NO_BLOCK: u32 = u32::MAX;

/// Bytes at the tail of every data block holding the next block address.
pub const NEXT_PTR_SIZE: usize = size_of::<u32>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    File,
    Folder,
}

impl ElementKind {
    pub(crate) fn magic(self) -> u32 {
        match self {
            ElementKind::File => FILE_MAGIC,
            ElementKind::Folder => FOLDER_MAGIC,
        }
    }

    pub(crate) fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            FILE_MAGIC => Some(ElementKind::File),
            FOLDER_MAGIC => Some(ElementKind::Folder),
            _ => None,
        }
    }
}

/// Front of every node block. One node block exists per file or folder and its
/// address is the node's identity for as long as it lives.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Copy, Clone, Debug, PartialEq)]
pub struct NodeHeader {
    /// `FILE_MAGIC` or `FOLDER_MAGIC`; zero once the node has been removed.
    kind: u32,
    /// Node block of the owning folder. The root points at itself.
    pub parent: u32,
    /// Content length in bytes.
    pub length: u64,
    /// First data block of the chain or `NO_BLOCK` when empty.
    pub first: u32,
    /// Last data block of the chain or `NO_BLOCK` when empty.
    pub last: u32,
}

pub const HEADER_SIZE: usize = size_of::<NodeHeader>();

impl NodeHeader {
    pub fn new(kind: ElementKind, parent: BlockNumber) -> Self {
        Self {
            kind: kind.magic(),
            parent: parent as u32,
            length: 0,
            first: NO_BLOCK,
            last: NO_BLOCK,
        }
    }

    pub fn kind(&self) -> Option<ElementKind> {
        ElementKind::from_magic(self.kind)
    }

    /// Loads the header of `node`. A block without a valid kind is not a live node.
    pub fn load<T: BlockStorage>(ba: &mut BlockAccessor<T>, node: BlockNumber) -> Result<Self> {
        let header = ba.read(node, |data| NodeHeader::read_from(&data[..HEADER_SIZE]))?;
        match header {
            Some(header) if header.kind().is_some() => Ok(header),
            _ => Err(FsError::DoesNotExist),
        }
    }

    /// Like `load` but also insists on the node's kind.
    pub fn load_kind<T: BlockStorage>(
        ba: &mut BlockAccessor<T>,
        node: BlockNumber,
        expected: ElementKind,
    ) -> Result<Self> {
        let header = Self::load(ba, node)?;
        if header.kind() != Some(expected) {
            return Err(FsError::WrongKind { expected });
        }
        Ok(header)
    }

    pub fn store<T: BlockStorage>(&self, ba: &mut BlockAccessor<T>, node: BlockNumber) -> Result<()> {
        ba.modify(node, |data| data[..HEADER_SIZE].copy_from_slice(self.as_bytes()))
    }

    /// Wipes the header so stale handles to this node stop resolving.
    pub fn clear<T: BlockStorage>(ba: &mut BlockAccessor<T>, node: BlockNumber) -> Result<()> {
        ba.modify(node, |data| data[..HEADER_SIZE].fill(0))
    }
}

/// Content bytes carried by one data block.
pub fn payload_size(block_size: usize) -> usize {
    block_size - NEXT_PTR_SIZE
}

/// Number of data blocks needed to hold `length` bytes.
pub fn blocks_for(length: u64, payload: usize) -> usize {
    ((length + payload as u64 - 1) / payload as u64) as usize
}

pub fn next_of(data: &[u8]) -> u32 {
    let at = data.len() - NEXT_PTR_SIZE;
    u32::from_le_bytes(data[at..].try_into().unwrap_or([0xff; 4]))
}

pub fn set_next(data: &mut [u8], next: u32) {
    let at = data.len() - NEXT_PTR_SIZE;
    data[at..].copy_from_slice(&next.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryBlockDevice;

    #[test]
    fn header_has_no_padding() {
        assert_eq!(HEADER_SIZE, 24);
    }

    #[test]
    fn header_round_trips_through_block() {
        let mut ba = BlockAccessor::new(MemoryBlockDevice::new(2, 64));
        let mut header = NodeHeader::new(ElementKind::File, 0);
        header.length = 300;
        header.first = 1;
        header.last = 1;
        header.store(&mut ba, 1).unwrap();

        assert_eq!(NodeHeader::load(&mut ba, 1).unwrap(), header);
        assert!(matches!(
            NodeHeader::load_kind(&mut ba, 1, ElementKind::Folder),
            Err(FsError::WrongKind { expected: ElementKind::Folder })
        ));
    }

    #[test]
    fn cleared_or_blank_blocks_are_not_nodes() {
        let mut ba = BlockAccessor::new(MemoryBlockDevice::new(2, 64));
        assert!(matches!(NodeHeader::load(&mut ba, 0), Err(FsError::DoesNotExist)));

        NodeHeader::new(ElementKind::Folder, 1).store(&mut ba, 1).unwrap();
        NodeHeader::clear(&mut ba, 1).unwrap();
        assert!(matches!(NodeHeader::load(&mut ba, 1), Err(FsError::DoesNotExist)));
    }

    #[test]
    fn block_counts_round_up() {
        assert_eq!(blocks_for(0, 252), 0);
        assert_eq!(blocks_for(1, 252), 1);
        assert_eq!(blocks_for(252, 252), 1);
        assert_eq!(blocks_for(253, 252), 2);
    }

    #[test]
    fn next_pointer_lives_in_the_tail() {
        let mut data = vec![0u8; 16];
        set_next(&mut data, 7);
        assert_eq!(next_of(&data), 7);
        assert_eq!(&data[..12], &[0u8; 12][..]);
    }
}
