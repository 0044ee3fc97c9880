use log::{debug, warn};
use thiserror::Error;
use zerocopy::AsBytes;

use crate::accessor::BlockAccessor;
use crate::alloc::Allocator;
use crate::dir::{Element, File, Folder, FolderTable};
use crate::io::{BlockNumber, BlockStorage};
use crate::node::{blocks_for, payload_size, ElementKind, NodeHeader};
use crate::sb::{SuperBlock, SB_SIZE, SUPERBLOCK_INDEX};
use crate::stream::ContentStream;

/// Smallest block that fits the super block, a node header and a useful payload.
pub const MIN_BLOCK_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("block {address} out of range (block count {count})")]
    BlockOutOfRange { address: BlockNumber, count: usize },
    #[error("range of {count} bytes at offset {offset} exceeds length {length}")]
    OutOfRange { offset: u64, count: u64, length: u64 },
    #[error("file system is closed")]
    Closed,
    #[error("block {0} is already borrowed")]
    AlreadyBorrowed(BlockNumber),
    #[error("block {0} is not borrowed through this handle")]
    NotBorrowed(BlockNumber),
    #[error("an element named {0:?} already exists")]
    DuplicateName(String),
    #[error("element is not a {expected:?}")]
    WrongKind { expected: ElementKind },
    #[error("no free blocks left")]
    OutOfSpace,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("found no element for handle")]
    DoesNotExist,
    #[error("invalid file system block layout: {0}")]
    Corrupt(String),
    #[error("medium I/O failed")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// A folder/file tree persisted as block chains on a [`BlockStorage`].
///
/// The file system owns its accessor for its whole lifetime. Dropping it (or
/// calling [`close`](FileSystem::close)) syncs the medium and closes the accessor;
/// every operation afterwards fails with [`FsError::Closed`].
pub struct FileSystem<T: BlockStorage> {
    ba: BlockAccessor<T>,
    alloc: Allocator,
    super_block: SuperBlock,
}

impl<T: BlockStorage> FileSystem<T> {
    /// Formats `dev` with an empty root folder. Whatever the medium held before
    /// is treated as garbage.
    ///
    /// # Layout
    /// ======================================================================
    /// | SuperBlock | Bitmap (all blocks) ... | Root folder | Nodes and data |
    /// ======================================================================
    pub fn create(dev: T) -> Result<Self> {
        let block_size = dev.block_size();
        if block_size < MIN_BLOCK_SIZE {
            return Err(FsError::InvalidArgument(format!(
                "block size {} is below the minimum of {}",
                block_size, MIN_BLOCK_SIZE
            )));
        }
        let super_block = SuperBlock::new(block_size, dev.block_count())?;
        let mut ba = BlockAccessor::new(dev);

        ba.modify(SUPERBLOCK_INDEX, |block| {
            block.fill(0);
            block[..SB_SIZE].copy_from_slice(super_block.as_bytes());
        })?;
        let alloc = Allocator::new(&super_block);
        alloc.format(&mut ba, &super_block)?;
        let root = super_block.root as usize;
        NodeHeader::new(ElementKind::Folder, root).store(&mut ba, root)?;
        ba.sync()?;

        debug!(
            "created file system: {} blocks of {} bytes, root folder at {}",
            super_block.block_count, super_block.block_size, root
        );
        Ok(Self {
            ba,
            alloc,
            super_block,
        })
    }

    /// Mounts an image previously written by [`create`](FileSystem::create).
    pub fn open(dev: T) -> Result<Self> {
        let (block_size, block_count) = (dev.block_size(), dev.block_count());
        let mut ba = BlockAccessor::new(dev);
        let super_block = ba.read(SUPERBLOCK_INDEX, |block| {
            SuperBlock::parse(block, block_size, block_count)
        })??;
        NodeHeader::load_kind(&mut ba, super_block.root as usize, ElementKind::Folder)
            .map_err(|_| FsError::Corrupt("root node is not a folder".to_string()))?;

        debug!(
            "opened file system: {} blocks of {} bytes",
            block_count, block_size
        );
        Ok(Self {
            ba,
            alloc: Allocator::new(&super_block),
            super_block,
        })
    }

    fn live(&self) -> Result<()> {
        if self.ba.is_closed() {
            return Err(FsError::Closed);
        }
        Ok(())
    }

    pub fn root(&self) -> Folder {
        Folder {
            node: self.super_block.root as usize,
        }
    }

    pub fn block_size(&self) -> usize {
        self.super_block.block_size as usize
    }

    /// Content bytes each data block carries.
    pub fn payload_size(&self) -> usize {
        payload_size(self.block_size())
    }

    pub fn block_count(&self) -> usize {
        self.alloc.block_count()
    }

    pub fn free_blocks(&mut self) -> Result<usize> {
        self.live()?;
        self.alloc.free_blocks(&mut self.ba)
    }

    pub fn used_blocks(&mut self) -> Result<usize> {
        self.live()?;
        self.alloc.used_blocks(&mut self.ba)
    }

    fn table(&mut self, folder: Folder) -> Result<FolderTable<'_, T>> {
        self.live()?;
        FolderTable::open(&mut self.ba, &mut self.alloc, folder.node)
    }

    fn stream(&mut self, file: File) -> Result<ContentStream<'_, T>> {
        self.live()?;
        NodeHeader::load_kind(&mut self.ba, file.node, ElementKind::File)?;
        Ok(ContentStream::new(&mut self.ba, &mut self.alloc, file.node))
    }

    pub(crate) fn parts(&mut self) -> (&mut BlockAccessor<T>, &mut Allocator, &SuperBlock) {
        (&mut self.ba, &mut self.alloc, &self.super_block)
    }

    /// Creates an empty file or folder called `name` inside `folder`.
    pub fn add_element(&mut self, folder: Folder, name: &str, kind: ElementKind) -> Result<Element> {
        self.table(folder)?.add(name, kind)
    }

    /// Every entry of `folder` in insertion order.
    pub fn elements(&mut self, folder: Folder) -> Result<Vec<Element>> {
        let mut table = self.table(folder)?;
        let records = table.records()?;
        records.iter().map(|record| table.element(record)).collect()
    }

    pub fn find(&mut self, folder: Folder, name: &str) -> Result<Option<Element>> {
        let mut table = self.table(folder)?;
        match table.find(name)? {
            Some(record) => table.element(&record).map(Some),
            None => Ok(None),
        }
    }

    pub fn name(&mut self, element: &Element) -> Result<String> {
        let (_, record) = self.table(element.parent())?.position(element.node)?;
        Ok(record.name()?.to_string())
    }

    /// Renames in place. The element keeps its node, so `File` and `Folder`
    /// handles taken before stay valid.
    pub fn set_name(&mut self, element: &Element, name: &str) -> Result<()> {
        self.table(element.parent())?.rename(element.node, name)
    }

    /// Removes `element` from `folder`, freeing its blocks and, for a folder,
    /// everything below it.
    pub fn remove_element(&mut self, folder: Folder, element: Element) -> Result<()> {
        if element.parent != folder.node {
            return Err(FsError::DoesNotExist);
        }
        self.table(folder)?.remove(element.node)
    }

    /// Content length of `file` in bytes.
    pub fn length(&mut self, file: File) -> Result<u64> {
        self.stream(file)?.len()
    }

    /// Number of data blocks currently chained to `file`.
    pub fn chain_len(&mut self, file: File) -> Result<usize> {
        let payload = self.payload_size();
        let mut stream = self.stream(file)?;
        let chain = stream.chain()?;
        debug_assert_eq!(chain.len(), blocks_for(stream.len()?, payload));
        Ok(chain.len())
    }

    /// Grows `file` by `data`.
    pub fn append(&mut self, file: File, data: &[u8]) -> Result<()> {
        self.stream(file)?.append(data)
    }

    /// Fills `buf` with the content of `file` starting at `offset`.
    pub fn read(&mut self, file: File, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.stream(file)?.read(offset, buf)
    }

    /// Replaces content of `file` starting at `offset`; never grows the file.
    pub fn overwrite(&mut self, file: File, offset: u64, data: &[u8]) -> Result<()> {
        self.stream(file)?.overwrite(offset, data)
    }

    /// Drops the last `count` bytes of `file`.
    pub fn remove(&mut self, file: File, count: u64) -> Result<()> {
        self.stream(file)?.remove(count)
    }

    /// Syncs the medium and shuts the session down. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if self.ba.is_closed() {
            return Ok(());
        }
        let synced = self.ba.sync();
        self.ba.close();
        debug!("closed file system");
        synced
    }
}

impl<T: BlockStorage> Drop for FileSystem<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to close file system: {}", e);
        }
    }
}
