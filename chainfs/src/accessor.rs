use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{trace, warn};

use crate::fs::{FsError, Result};
use crate::io::{BlockNumber, BlockStorage};

/// Tokens are unique across every accessor in the process, so a handle can never
/// be mistaken for a borrow made through a different accessor.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Proof of an outstanding borrow. The only way to give it back is
/// [`BlockAccessor::save_block`] or [`BlockAccessor::unload_block`], both of which
/// consume it.
#[must_use = "a loaded block must be returned with save_block or unload_block"]
#[derive(Debug, PartialEq, Eq)]
pub struct Block {
    address: BlockNumber,
    token: u64,
}

impl Block {
    pub fn address(&self) -> BlockNumber {
        self.address
    }
}

struct Loaded {
    token: u64,
    data: Box<[u8]>,
}

enum Session {
    Open(HashMap<BlockNumber, Loaded>),
    Closed,
}

/// A page cache over a [`BlockStorage`] that hands out each block at most once at
/// a time. Contents reflect the medium when loaded; mutations only reach the
/// medium through `save_block` or `save_all`.
pub struct BlockAccessor<T: BlockStorage> {
    dev: T,
    session: Session,
}

impl<T: BlockStorage> BlockAccessor<T> {
    pub fn new(dev: T) -> Self {
        Self {
            dev,
            session: Session::Open(HashMap::new()),
        }
    }

    /// The length of every buffer handed out by `load_block`.
    pub fn block_size(&self) -> usize {
        self.dev.block_size()
    }

    pub fn block_count(&self) -> usize {
        self.dev.block_count()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.session, Session::Closed)
    }

    /// Number of blocks currently checked out.
    pub fn borrowed_count(&self) -> usize {
        match &self.session {
            Session::Open(loaded) => loaded.len(),
            Session::Closed => 0,
        }
    }

    fn loaded(&self) -> Result<&HashMap<BlockNumber, Loaded>> {
        match &self.session {
            Session::Open(loaded) => Ok(loaded),
            Session::Closed => Err(FsError::Closed),
        }
    }

    fn loaded_mut(&mut self) -> Result<&mut HashMap<BlockNumber, Loaded>> {
        match &mut self.session {
            Session::Open(loaded) => Ok(loaded),
            Session::Closed => Err(FsError::Closed),
        }
    }

    fn check_range(&self, address: BlockNumber) -> Result<()> {
        let count = self.dev.block_count();
        if address >= count {
            return Err(FsError::BlockOutOfRange { address, count });
        }
        Ok(())
    }

    /// Checks out `address`, reading its current content from the medium.
    pub fn load_block(&mut self, address: BlockNumber) -> Result<Block> {
        self.loaded()?;
        self.check_range(address)?;
        if self.loaded()?.contains_key(&address) {
            return Err(FsError::AlreadyBorrowed(address));
        }

        let mut data = vec![0; self.dev.block_size()].into_boxed_slice();
        self.dev.read_block(address, &mut data)?;
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        self.loaded_mut()?.insert(address, Loaded { token, data });
        trace!("loaded block {}", address);
        Ok(Block { address, token })
    }

    fn entry(&self, block: &Block) -> Result<&Loaded> {
        match self.loaded()?.get(&block.address) {
            Some(loaded) if loaded.token == block.token => Ok(loaded),
            _ => Err(FsError::NotBorrowed(block.address)),
        }
    }

    /// Read access to a borrowed block's buffer.
    pub fn bytes(&self, block: &Block) -> Result<&[u8]> {
        Ok(&self.entry(block)?.data[..])
    }

    /// Write access to a borrowed block's buffer.
    pub fn bytes_mut(&mut self, block: &Block) -> Result<&mut [u8]> {
        match self.loaded_mut()?.get_mut(&block.address) {
            Some(loaded) if loaded.token == block.token => Ok(&mut loaded.data[..]),
            _ => Err(FsError::NotBorrowed(block.address)),
        }
    }

    fn take(&mut self, block: &Block) -> Result<Loaded> {
        self.entry(block)?;
        self.loaded_mut()?
            .remove(&block.address)
            .ok_or(FsError::NotBorrowed(block.address))
    }

    /// Persists the block's buffer and ends the borrow. The borrow ends even if
    /// the medium reports an error.
    pub fn save_block(&mut self, block: Block) -> Result<()> {
        let loaded = self.take(&block)?;
        self.dev.write_block(block.address, &loaded.data)?;
        trace!("saved block {}", block.address);
        Ok(())
    }

    /// Ends the borrow and drops any changes made to the buffer.
    pub fn unload_block(&mut self, block: Block) -> Result<()> {
        self.take(&block)?;
        trace!("unloaded block {}", block.address);
        Ok(())
    }

    /// Saves and releases every outstanding borrow in address order. Handles
    /// still held by callers become stale.
    ///
    /// A block is released only once its write succeeded. When the medium fails,
    /// the failing block and every block after it stay borrowed with their
    /// handles intact.
    pub fn save_all(&mut self) -> Result<()> {
        let loaded = match &mut self.session {
            Session::Open(loaded) => loaded,
            Session::Closed => return Err(FsError::Closed),
        };
        let mut addresses: Vec<_> = loaded.keys().copied().collect();
        addresses.sort_unstable();
        for address in addresses {
            if let Some(entry) = loaded.get(&address) {
                self.dev.write_block(address, &entry.data)?;
            }
            loaded.remove(&address);
            trace!("saved block {}", address);
        }
        Ok(())
    }

    /// Releases every outstanding borrow without saving.
    pub fn unload_all(&mut self) -> Result<()> {
        self.loaded_mut()?.clear();
        Ok(())
    }

    /// Flushes the medium.
    pub fn sync(&mut self) -> Result<()> {
        self.loaded()?;
        self.dev.sync_disk()?;
        Ok(())
    }

    /// Drops all borrow bookkeeping and refuses further work. Outstanding changes
    /// are not saved. Closing twice is a no-op.
    pub fn close(&mut self) {
        if let Session::Open(loaded) = &self.session {
            if !loaded.is_empty() {
                warn!(
                    "closing block accessor with {} block(s) still borrowed",
                    loaded.len()
                );
            }
        }
        self.session = Session::Closed;
    }

    /// Gives the medium back, closing the accessor first.
    pub fn into_storage(mut self) -> T {
        self.close();
        self.dev
    }

    /// Loads `address`, hands its bytes to `f` and unloads it again.
    pub fn read<R>(&mut self, address: BlockNumber, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let block = self.load_block(address)?;
        let result = self.bytes(&block).map(f);
        self.unload_block(block)?;
        result
    }

    /// Loads `address`, lets `f` mutate its bytes and saves it.
    pub fn modify<R>(
        &mut self,
        address: BlockNumber,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let block = self.load_block(address)?;
        let result = match self.bytes_mut(&block) {
            Ok(bytes) => f(bytes),
            Err(e) => {
                self.unload_block(block)?;
                return Err(e);
            }
        };
        self.save_block(block)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryBlockDevice;

    fn accessor() -> BlockAccessor<MemoryBlockDevice> {
        BlockAccessor::new(MemoryBlockDevice::new(4, 32))
    }

    #[test]
    fn saved_changes_are_visible_on_next_load() {
        let mut ba = accessor();
        let block = ba.load_block(1).unwrap();
        ba.bytes_mut(&block).unwrap()[0] = 9;
        ba.save_block(block).unwrap();

        let block = ba.load_block(1).unwrap();
        assert_eq!(ba.bytes(&block).unwrap()[0], 9);
        ba.unload_block(block).unwrap();
    }

    #[test]
    fn unloaded_changes_are_dropped() {
        let mut ba = accessor();
        let block = ba.load_block(2).unwrap();
        ba.bytes_mut(&block).unwrap().fill(0xaa);
        ba.unload_block(block).unwrap();

        assert_eq!(ba.read(2, |b| b.to_vec()).unwrap(), vec![0; 32]);
    }

    #[test]
    fn loading_twice_is_rejected() {
        let mut ba = accessor();
        let block = ba.load_block(0).unwrap();
        assert!(matches!(ba.load_block(0), Err(FsError::AlreadyBorrowed(0))));
        ba.unload_block(block).unwrap();
        let again = ba.load_block(0).unwrap();
        ba.unload_block(again).unwrap();
    }

    #[test]
    fn out_of_range_load_is_rejected() {
        let mut ba = accessor();
        assert!(matches!(
            ba.load_block(4),
            Err(FsError::BlockOutOfRange { address: 4, count: 4 })
        ));
        assert_eq!(ba.borrowed_count(), 0);
    }

    #[test]
    fn stale_handle_is_rejected() {
        let mut ba = accessor();
        let stale = ba.load_block(3).unwrap();
        ba.unload_all().unwrap();
        let fresh = ba.load_block(3).unwrap();

        assert!(matches!(ba.bytes(&stale), Err(FsError::NotBorrowed(3))));
        assert!(matches!(ba.save_block(stale), Err(FsError::NotBorrowed(3))));
        // The live borrow survives the failed save.
        ba.save_block(fresh).unwrap();
    }

    #[test]
    fn foreign_handle_is_rejected() {
        let mut first = accessor();
        let mut second = accessor();
        let foreign = first.load_block(1).unwrap();
        let own = second.load_block(1).unwrap();

        assert!(matches!(
            second.unload_block(foreign),
            Err(FsError::NotBorrowed(1))
        ));
        second.unload_block(own).unwrap();
    }

    #[test]
    fn save_all_persists_and_releases() {
        let mut ba = accessor();
        let a = ba.load_block(0).unwrap();
        let b = ba.load_block(1).unwrap();
        ba.bytes_mut(&a).unwrap()[0] = 1;
        ba.bytes_mut(&b).unwrap()[0] = 2;
        ba.save_all().unwrap();

        assert_eq!(ba.borrowed_count(), 0);
        assert!(matches!(ba.save_block(a), Err(FsError::NotBorrowed(0))));
        assert_eq!(ba.read(0, |d| d[0]).unwrap(), 1);
        assert_eq!(ba.read(1, |d| d[0]).unwrap(), 2);
    }

    /// Memory device whose writes to one block always fail.
    struct BrokenBlock {
        inner: MemoryBlockDevice,
        broken: BlockNumber,
    }

    impl BlockStorage for BrokenBlock {
        fn block_size(&self) -> usize {
            self.inner.block_size()
        }

        fn block_count(&self) -> usize {
            self.inner.block_count()
        }

        fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
            self.inner.read_block(blocknr, buf)
        }

        fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
            if blocknr == self.broken {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "bad sector"));
            }
            self.inner.write_block(blocknr, buf)
        }

        fn sync_disk(&mut self) -> std::io::Result<()> {
            self.inner.sync_disk()
        }
    }

    #[test]
    fn save_all_keeps_unwritten_blocks_borrowed() {
        let mut ba = BlockAccessor::new(BrokenBlock {
            inner: MemoryBlockDevice::new(4, 32),
            broken: 1,
        });
        let a = ba.load_block(0).unwrap();
        let b = ba.load_block(1).unwrap();
        let c = ba.load_block(2).unwrap();
        for block in &[&a, &b, &c] {
            ba.bytes_mut(block).unwrap()[0] = 3;
        }

        assert!(matches!(ba.save_all(), Err(FsError::Io(_))));
        assert_eq!(ba.borrowed_count(), 2);
        assert!(matches!(ba.unload_block(a), Err(FsError::NotBorrowed(0))));
        assert_eq!(ba.bytes(&b).unwrap()[0], 3);
        assert_eq!(ba.bytes(&c).unwrap()[0], 3);

        ba.unload_block(b).unwrap();
        ba.save_all().unwrap();
        assert_eq!(ba.borrowed_count(), 0);
        assert_eq!(ba.read(0, |d| d[0]).unwrap(), 3);
        assert_eq!(ba.read(2, |d| d[0]).unwrap(), 3);
    }

    #[test]
    fn closed_accessor_refuses_everything() {
        let mut ba = accessor();
        let block = ba.load_block(0).unwrap();
        ba.close();
        ba.close();

        assert!(ba.is_closed());
        assert!(matches!(ba.load_block(1), Err(FsError::Closed)));
        assert!(matches!(ba.save_block(block), Err(FsError::Closed)));
        assert!(matches!(ba.save_all(), Err(FsError::Closed)));
        assert!(matches!(ba.unload_all(), Err(FsError::Closed)));
        assert_eq!(ba.block_size(), 32);
    }

    #[test]
    fn close_does_not_persist_outstanding_borrows() {
        let mut ba = accessor();
        let block = ba.load_block(2).unwrap();
        ba.bytes_mut(&block).unwrap().fill(5);
        let mut dev = ba.into_storage();

        let mut buf = vec![0xff; 32];
        dev.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, vec![0; 32]);
    }

    #[test]
    fn modify_returns_the_borrow() {
        let mut ba = accessor();
        let old = ba
            .modify(1, |d| {
                let old = d[4];
                d[4] = 77;
                old
            })
            .unwrap();
        assert_eq!(old, 0);
        assert_eq!(ba.borrowed_count(), 0);
        assert_eq!(ba.read(1, |d| d[4]).unwrap(), 77);
    }
}
