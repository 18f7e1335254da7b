//! Filesystem tree nodes and the stat record derived from them

use crate::runtime::buffer::Buffer;
use indexmap::IndexMap;
use std::time::SystemTime;

/// The four timestamps every node carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub birthtime: SystemTime,
}

impl Timestamps {
    pub fn now() -> Self {
        let now = SystemTime::now();
        Self {
            atime: now,
            mtime: now,
            ctime: now,
            birthtime: now,
        }
    }

    /// Content changed
    pub fn touch_modified(&mut self) {
        let now = SystemTime::now();
        self.mtime = now;
        self.ctime = now;
    }

    pub fn touch_accessed(&mut self) {
        self.atime = SystemTime::now();
    }
}

#[derive(Debug, Clone)]
pub struct FileNode {
    pub data: Buffer,
    pub times: Timestamps,
}

impl FileNode {
    pub fn new(data: Buffer) -> Self {
        Self {
            data,
            times: Timestamps::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirNode {
    /// Children in insertion order, so readdir is stable
    pub entries: IndexMap<String, Node>,
    pub times: Timestamps,
}

impl DirNode {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
            times: Timestamps::now(),
        }
    }
}

impl Default for DirNode {
    fn default() -> Self {
        Self::new()
    }
}

/// A filesystem node: the tree has no links, every node has one parent
#[derive(Debug, Clone)]
pub enum Node {
    File(FileNode),
    Directory(DirNode),
}

impl Node {
    pub fn kind(&self) -> FileKind {
        match self {
            Node::File(_) => FileKind::File,
            Node::Directory(_) => FileKind::Directory,
        }
    }

    pub fn times(&self) -> &Timestamps {
        match self {
            Node::File(file) => &file.times,
            Node::Directory(dir) => &dir.times,
        }
    }

    pub fn stats(&self, ino: u64) -> Stats {
        let times = *self.times();
        match self {
            Node::File(file) => Stats {
                kind: FileKind::File,
                size: file.data.len() as u64,
                mode: S_IFREG | 0o644,
                ino,
                times,
            },
            Node::Directory(_) => Stats {
                kind: FileKind::Directory,
                size: 4096,
                mode: S_IFDIR | 0o755,
                ino,
                times,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    File,
    Directory,
}

const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;

/// fs.Stats
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub kind: FileKind,
    pub size: u64,
    pub mode: u32,
    pub ino: u64,
    pub times: Timestamps,
}

impl Stats {
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// No symlinks exist in the virtual tree
    pub fn is_symbolic_link(&self) -> bool {
        false
    }
}

/// fs.Dirent, returned by readdir with file types
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

impl DirEntry {
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stats() {
        let node = Node::File(FileNode::new(Buffer::from("abc")));
        let stats = node.stats(7);
        assert!(stats.is_file());
        assert!(!stats.is_directory());
        assert_eq!(stats.size, 3);
        assert_eq!(stats.mode & 0o777, 0o644);
        assert_eq!(stats.ino, 7);
    }

    #[test]
    fn test_directory_stats() {
        let node = Node::Directory(DirNode::new());
        let stats = node.stats(1);
        assert!(stats.is_directory());
        assert!(!stats.is_symbolic_link());
        assert_eq!(stats.mode & 0o170000, S_IFDIR);
    }
}
