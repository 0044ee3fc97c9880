use std::mem::size_of;

use log::debug;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::accessor::BlockAccessor;
use crate::alloc::Allocator;
use crate::fs::{FsError, Result};
use crate::io::{BlockNumber, BlockStorage};
use crate::node::{ElementKind, NodeHeader};
use crate::stream::ContentStream;

/// Longest name, in bytes, an element can carry.
pub const NAME_MAX: usize = 52;

/// A folder's content is a packed array of these records, in insertion order.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy)]
pub(crate) struct EntryRecord {
    node: u32,
    kind: u32,
    name_len: u32,
    name: [u8; NAME_MAX],
}

pub(crate) const ENTRY_SIZE: usize = size_of::<EntryRecord>();

impl EntryRecord {
    fn new(node: BlockNumber, kind: ElementKind, name: &str) -> Self {
        let mut record = Self {
            node: node as u32,
            kind: kind.magic(),
            name_len: 0,
            name: [0; NAME_MAX],
        };
        record.set_name(name);
        record
    }

    fn set_name(&mut self, name: &str) {
        self.name = [0; NAME_MAX];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
        self.name_len = name.len() as u32;
    }

    pub(crate) fn node(&self) -> BlockNumber {
        self.node as usize
    }

    pub(crate) fn kind(&self) -> Result<ElementKind> {
        ElementKind::from_magic(self.kind)
            .ok_or_else(|| FsError::Corrupt(format!("entry for node {} has no kind", self.node)))
    }

    pub(crate) fn name(&self) -> Result<&str> {
        self.name
            .get(..self.name_len as usize)
            .and_then(|name| std::str::from_utf8(name).ok())
            .ok_or_else(|| FsError::Corrupt(format!("entry for node {} has a bad name", self.node)))
    }
}

/// Rejects names that could not be stored or that a path would split.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FsError::InvalidArgument("name must not be empty".to_string()));
    }
    if name.len() > NAME_MAX {
        return Err(FsError::InvalidArgument(format!(
            "name {:?} is longer than {} bytes",
            name, NAME_MAX
        )));
    }
    if name.contains(|c: char| c == '/' || c == '\0') {
        return Err(FsError::InvalidArgument(format!(
            "name {:?} contains '/' or NUL",
            name
        )));
    }
    Ok(())
}

/// Handle to a folder, identified by its node block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Folder {
    pub(crate) node: BlockNumber,
}

/// Handle to a file, identified by its node block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct File {
    pub(crate) node: BlockNumber,
}

/// A named entry of a folder. Renaming keeps the node, so handles taken from
/// an element stay valid across renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Element {
    pub(crate) parent: BlockNumber,
    pub(crate) node: BlockNumber,
    pub(crate) kind: ElementKind,
}

impl Element {
    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    /// The folder holding this entry.
    pub fn parent(&self) -> Folder {
        Folder { node: self.parent }
    }

    pub fn file(&self) -> Result<File> {
        match self.kind {
            ElementKind::File => Ok(File { node: self.node }),
            ElementKind::Folder => Err(FsError::WrongKind {
                expected: ElementKind::File,
            }),
        }
    }

    pub fn folder(&self) -> Result<Folder> {
        match self.kind {
            ElementKind::Folder => Ok(Folder { node: self.node }),
            ElementKind::File => Err(FsError::WrongKind {
                expected: ElementKind::Folder,
            }),
        }
    }
}

/// Entry bookkeeping for one folder node.
pub(crate) struct FolderTable<'a, T: BlockStorage> {
    ba: &'a mut BlockAccessor<T>,
    alloc: &'a mut Allocator,
    node: BlockNumber,
}

impl<'a, T: BlockStorage> FolderTable<'a, T> {
    pub fn open(
        ba: &'a mut BlockAccessor<T>,
        alloc: &'a mut Allocator,
        node: BlockNumber,
    ) -> Result<Self> {
        NodeHeader::load_kind(ba, node, ElementKind::Folder)?;
        Ok(Self { ba, alloc, node })
    }

    fn stream(&mut self) -> ContentStream<'_, T> {
        ContentStream::new(self.ba, self.alloc, self.node)
    }

    pub fn records(&mut self) -> Result<Vec<EntryRecord>> {
        let mut stream = self.stream();
        let mut bytes = vec![0; stream.len()? as usize];
        stream.read(0, &mut bytes)?;
        if bytes.len() % ENTRY_SIZE != 0 {
            return Err(FsError::Corrupt(format!(
                "folder {} holds a partial entry",
                self.node
            )));
        }
        bytes
            .chunks_exact(ENTRY_SIZE)
            .map(|chunk| {
                EntryRecord::read_from(chunk)
                    .ok_or_else(|| FsError::Corrupt("entry record misread".to_string()))
            })
            .collect()
    }

    pub fn element(&self, record: &EntryRecord) -> Result<Element> {
        Ok(Element {
            parent: self.node,
            node: record.node(),
            kind: record.kind()?,
        })
    }

    pub fn find(&mut self, name: &str) -> Result<Option<EntryRecord>> {
        for record in self.records()? {
            if record.name()? == name {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Index and record of the entry pointing at `node`.
    pub fn position(&mut self, node: BlockNumber) -> Result<(usize, EntryRecord)> {
        self.records()?
            .into_iter()
            .enumerate()
            .find(|(_, record)| record.node() == node)
            .ok_or(FsError::DoesNotExist)
    }

    /// Creates an empty file or folder named `name` and links it in.
    pub fn add(&mut self, name: &str, kind: ElementKind) -> Result<Element> {
        validate_name(name)?;
        if self.find(name)?.is_some() {
            return Err(FsError::DuplicateName(name.to_string()));
        }

        let child = self.alloc.allocate(self.ba)?;
        let record = EntryRecord::new(child, kind, name);
        let linked = NodeHeader::new(kind, self.node)
            .store(self.ba, child)
            .and_then(|_| self.stream().append(record.as_bytes()));
        if let Err(e) = linked {
            NodeHeader::clear(self.ba, child)?;
            self.alloc.free(self.ba, child)?;
            return Err(e);
        }
        debug!("added {:?} {:?} as node {} in folder {}", kind, name, child, self.node);
        self.element(&record)
    }

    pub fn rename(&mut self, node: BlockNumber, name: &str) -> Result<()> {
        validate_name(name)?;
        let records = self.records()?;
        let index = records
            .iter()
            .position(|record| record.node() == node)
            .ok_or(FsError::DoesNotExist)?;
        for (i, record) in records.iter().enumerate() {
            if i != index && record.name()? == name {
                return Err(FsError::DuplicateName(name.to_string()));
            }
        }

        let mut record = records[index];
        record.set_name(name);
        self.stream()
            .overwrite((index * ENTRY_SIZE) as u64, record.as_bytes())
    }

    /// Frees `node` with everything below it, then drops its entry. Later
    /// entries move up one slot so listing order is kept.
    pub fn remove(&mut self, node: BlockNumber) -> Result<()> {
        let (index, record) = self.position(node)?;
        if record.kind()? == ElementKind::Folder {
            FolderTable::open(self.ba, self.alloc, node)?.remove_all()?;
        }
        ContentStream::new(self.ba, self.alloc, node).clear()?;
        NodeHeader::clear(self.ba, node)?;
        self.alloc.free(self.ba, node)?;

        let mut stream = self.stream();
        let length = stream.len()?;
        let from = ((index + 1) * ENTRY_SIZE) as u64;
        let mut tail = vec![0; (length - from) as usize];
        stream.read(from, &mut tail)?;
        stream.overwrite((index * ENTRY_SIZE) as u64, &tail)?;
        stream.remove(ENTRY_SIZE as u64)?;
        debug!("removed node {} from folder {}", node, self.node);
        Ok(())
    }

    fn remove_all(&mut self) -> Result<()> {
        while let Some(record) = self.records()?.pop() {
            self.remove(record.node())?;
        }
        Ok(())
    }
}
