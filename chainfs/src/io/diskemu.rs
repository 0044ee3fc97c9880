use super::block::{out_of_range, BlockNumber, BlockStorage};
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};

/// 4k is a common block size for file systems. Disks commonly are composed of
/// 512 byte blocks mapping each file system block to 8 hard disk blocks.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Emulates block disk/flash storage in userspace using a file as block storage.
/// This is only meant to be used for file system development and testing.
pub struct FileBlockEmulator {
    /// The file must be a fixed-size file some exact multiple of the size of a block.
    fd: File,
    /// The total number of blocks available in the file store.
    block_count: usize,
    block_size: usize,
}

impl FileBlockEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }

    fn seek_to(&mut self, blocknr: BlockNumber) -> std::io::Result<()> {
        if blocknr >= self.block_count {
            return Err(out_of_range(blocknr, self.block_count));
        }
        self.fd
            .seek(SeekFrom::Start((blocknr * self.block_size) as u64))?;
        Ok(())
    }
}

impl BlockStorage for FileBlockEmulator {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> usize {
        self.block_count
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        if buf.len() < self.block_size {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }
        self.seek_to(blocknr)?;
        // A medium that was never cleared may be shorter than its nominal size.
        // read_exact surfaces that as UnexpectedEof instead of returning stale bytes.
        self.fd.read_exact(&mut buf[..self.block_size])
    }

    /// This method truncates writes that exceed the total block size.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        self.seek_to(blocknr)?;
        let max = buf.len().min(self.block_size);
        self.fd.write_all(&buf[0..max])
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    block_count: usize,
    block_size: usize,
    clear: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            // A better default here might be the size of the file rounded down
            // to the nearest block.
            block_count: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            clear: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Sets the number of desired blocks in the block store device.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Sets the size in bytes of every block.
    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Whether the builder zeroes the whole medium before handing it out. Turn this
    /// off to reattach to a file that already holds an image.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// This builder assumed ownership of the file descriptor used and does
    /// destructive things to prepare the file for use. Additionally, ownership
    /// of the file is transfered to the emulator meaning this builder can only
    /// be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        if self.block_count == 0 || self.block_size == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block count and block size must be non-zero",
            ));
        }
        if self.clear {
            self.zero_blocks()?;
        }
        Ok(FileBlockEmulator {
            fd: self.fd,
            block_count: self.block_count,
            block_size: self.block_size,
        })
    }

    fn zero_blocks(&mut self) -> std::io::Result<()> {
        self.fd.seek(SeekFrom::Start(0))?;
        let zeroes = vec![0x00; self.block_size];
        let mut bfd = BufWriter::new(&self.fd);
        // Zero out the "disk" block, buffering each write to prevent excessive reads.
        for _ in 0..self.block_count {
            bfd.write_all(&zeroes)?;
        }
        bfd.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emulator(blocks: usize, block_size: usize) -> FileBlockEmulator {
        let fs_block = tempfile::tempfile().unwrap();
        FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(blocks)
            .with_block_size(block_size)
            .build()
            .expect("failed to allocate file block")
    }

    #[test]
    fn file_emulator_allocates_correct_num_bytes() {
        let mut disk_emu = emulator(4, 4096);
        disk_emu.sync_disk().unwrap();
        assert_eq!(disk_emu.into_file().metadata().unwrap().len(), 4 * 4096);
    }

    #[test]
    fn honours_configured_block_size() {
        let mut disk_emu = emulator(16, 256);
        disk_emu.sync_disk().unwrap();
        assert_eq!(disk_emu.block_size(), 256);
        assert_eq!(disk_emu.into_file().metadata().unwrap().len(), 16 * 256);
    }

    #[test]
    fn can_read_and_write_blocks() {
        let mut disk_emu = emulator(4, 256);

        // Allocate a block with a non-zero character.
        disk_emu.write_block(2, &[0x55; 256]).unwrap();
        disk_emu.sync_disk().unwrap();

        let mut read_block = vec![0x00; 256];
        // Read a different block.
        disk_emu.read_block(3, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x00; 256]);

        // Read the block with data.
        disk_emu.read_block(2, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x55; 256]);
    }

    #[test]
    fn can_read_and_write_start_and_end_blocks() {
        let mut disk_emu = emulator(2, 256);

        disk_emu.write_block(0, &[0x55; 256]).unwrap();
        disk_emu.write_block(1, &[0x66; 256]).unwrap();

        let mut read_block = vec![0x00; 256];
        disk_emu.read_block(0, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x55; 256]);
        disk_emu.read_block(1, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x66; 256]);
    }

    #[test]
    fn read_block_beyond_range_returns_error() {
        let mut disk_emu = emulator(1, 256);

        // Attempt to write beyond range.
        let wresult = disk_emu.write_block(1, &[0x55; 256]);
        assert_eq!(wresult.unwrap_err().kind(), ErrorKind::InvalidInput);

        let mut buf = vec![0; 256];
        assert!(disk_emu.read_block(1, &mut buf).is_err());
    }

    #[test]
    fn writing_to_block_with_block_size_lt_max_succeeds() {
        let mut disk_emu = emulator(1, 256);

        // Fill half the block with meaningful data.
        disk_emu
            .write_block(0, &[0x55; 128])
            .expect("failed to write block");

        let mut buf = vec![0xff; 256];
        disk_emu.read_block(0, &mut buf).unwrap();
        assert_eq!(&buf[..128], &[0x55; 128][..]);
        assert_eq!(&buf[128..], &[0x00; 128][..]);
    }

    #[test]
    fn reopening_without_clearing_keeps_content() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let mut first = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(2)
            .with_block_size(64)
            .build()
            .unwrap();
        first.write_block(1, &[0x42; 64]).unwrap();
        first.sync_disk().unwrap();

        let mut second = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(2)
            .with_block_size(64)
            .clear_medium(false)
            .build()
            .unwrap();
        let mut buf = vec![0; 64];
        second.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, vec![0x42; 64]);
    }

    #[test]
    fn building_empty_device_fails() {
        let result = FileBlockEmulatorBuilder::from(tempfile::tempfile().unwrap()).build();
        assert!(result.is_err());
    }
}
