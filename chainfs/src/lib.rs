//! A small folder/file tree stored entirely in fixed-size blocks.
//!
//! Every structure goes through one [`BlockAccessor`], which checks blocks out
//! one at a time and insists they are handed back. Files and folders are node
//! blocks heading a chain of data blocks sized to exactly cover their content.
//!
//! ```
//! use chainfs::{ElementKind, FileSystem, MemoryBlockDevice};
//!
//! let mut fs = FileSystem::create(MemoryBlockDevice::new(16, 256)).unwrap();
//! let root = fs.root();
//! let file = fs
//!     .add_element(root, "hello.txt", ElementKind::File)
//!     .unwrap()
//!     .file()
//!     .unwrap();
//! fs.append(file, b"hello world").unwrap();
//!
//! let mut buf = [0; 5];
//! fs.read(file, 6, &mut buf).unwrap();
//! assert_eq!(&buf, b"world");
//! ```

mod accessor;
mod alloc;
mod check;
mod dir;
mod fs;
pub mod io;
mod node;
mod sb;
mod stream;

pub use crate::accessor::{Block, BlockAccessor};
pub use crate::check::CheckReport;
pub use crate::dir::{Element, File, Folder, NAME_MAX};
pub use crate::fs::{FileSystem, FsError, Result, MIN_BLOCK_SIZE};
pub use crate::io::{BlockNumber, BlockStorage, MemoryBlockDevice};
pub use crate::node::ElementKind;
