use std::collections::HashSet;

use log::debug;

use crate::alloc::State;
use crate::dir::FolderTable;
use crate::fs::{FileSystem, FsError, Result};
use crate::io::{BlockNumber, BlockStorage};
use crate::node::{blocks_for, payload_size, ElementKind, NodeHeader};
use crate::stream::ContentStream;

/// Block accounting produced by [`FileSystem::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckReport {
    pub folders: usize,
    pub files: usize,
    /// Blocks reachable from the root, metadata included.
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub total_blocks: usize,
}

fn claim(seen: &mut HashSet<BlockNumber>, block: BlockNumber) -> Result<()> {
    if !seen.insert(block) {
        return Err(FsError::Corrupt(format!("block {} is reachable twice", block)));
    }
    Ok(())
}

impl<T: BlockStorage> FileSystem<T> {
    /// Walks the whole tree and verifies that every chain matches its length and
    /// that the blocks marked used are exactly the blocks reachable from the root.
    pub fn check(&mut self) -> Result<CheckReport> {
        let (ba, alloc, sb) = self.parts();
        let sb = *sb;
        if ba.is_closed() {
            return Err(FsError::Closed);
        }
        let payload = payload_size(ba.block_size());

        let mut seen = HashSet::new();
        for block in sb.reserved_blocks() {
            // The root is claimed below with the rest of the tree.
            if block != sb.root as usize {
                claim(&mut seen, block)?;
            }
        }

        let (mut folders, mut files) = (0, 0);
        let root = sb.root as usize;
        let mut pending = vec![(root, root, ElementKind::Folder)];
        while let Some((node, parent, kind)) = pending.pop() {
            claim(&mut seen, node)?;
            let header = NodeHeader::load_kind(ba, node, kind)?;
            if header.parent as usize != parent {
                return Err(FsError::Corrupt(format!(
                    "node {} points at parent {} but lives in {}",
                    node, header.parent, parent
                )));
            }

            let chain = ContentStream::new(ba, alloc, node).chain()?;
            if chain.len() != blocks_for(header.length, payload) {
                return Err(FsError::Corrupt(format!(
                    "node {} holds {} bytes in {} blocks",
                    node,
                    header.length,
                    chain.len()
                )));
            }
            for block in chain {
                claim(&mut seen, block)?;
            }

            match kind {
                ElementKind::File => files += 1,
                ElementKind::Folder => {
                    folders += 1;
                    let mut table = FolderTable::open(ba, alloc, node)?;
                    for record in table.records()? {
                        pending.push((record.node(), node, record.kind()?));
                    }
                }
            }
        }

        for block in 0..alloc.block_count() {
            let used = alloc.state(ba, block)? == State::Used;
            if used != seen.contains(&block) {
                return Err(FsError::Corrupt(format!(
                    "block {} is marked {} but is {}reachable",
                    block,
                    if used { "used" } else { "free" },
                    if used { "not " } else { "" }
                )));
            }
        }

        let report = CheckReport {
            folders,
            files,
            used_blocks: seen.len(),
            free_blocks: alloc.block_count() - seen.len(),
            total_blocks: alloc.block_count(),
        };
        debug!("check passed: {:?}", report);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryBlockDevice;

    #[test]
    fn fresh_image_accounts_for_metadata() {
        let mut fs = FileSystem::create(MemoryBlockDevice::new(16, 256)).unwrap();
        let report = fs.check().unwrap();
        assert_eq!(
            report,
            CheckReport {
                folders: 1,
                files: 0,
                used_blocks: 3,
                free_blocks: 13,
                total_blocks: 16,
            }
        );
    }

    #[test]
    fn leaked_block_is_reported() {
        let mut fs = FileSystem::create(MemoryBlockDevice::new(16, 256)).unwrap();
        {
            let (ba, alloc, _) = fs.parts();
            alloc.allocate(ba).unwrap();
        }
        assert!(matches!(fs.check(), Err(FsError::Corrupt(_))));
    }

    #[test]
    fn tree_is_counted() {
        let mut fs = FileSystem::create(MemoryBlockDevice::new(32, 64)).unwrap();
        let root = fs.root();
        let sub = fs
            .add_element(root, "sub", ElementKind::Folder)
            .unwrap()
            .folder()
            .unwrap();
        let file = fs
            .add_element(sub, "f", ElementKind::File)
            .unwrap()
            .file()
            .unwrap();
        fs.append(file, &[1; 130]).unwrap();

        let report = fs.check().unwrap();
        assert_eq!(report.folders, 2);
        assert_eq!(report.files, 1);
        assert_eq!(report.used_blocks + report.free_blocks, 32);
        assert_eq!(report.free_blocks, fs.free_blocks().unwrap());
    }
}
