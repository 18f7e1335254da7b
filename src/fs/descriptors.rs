//! Node-style `fs` surface over [`VirtualFs`]
//!
//! [`FsShim`] adds what the raw tree lacks: relative paths resolved against
//! the session's current directory, integer file descriptors, Node flag
//! strings, the overloaded whole-file helpers, recursive `rm`, and the
//! callback and promise calling conventions.
//!
//! A descriptor holds a snapshot of the file taken at open time. Reads and
//! writes go to the snapshot; a writable descriptor writes the snapshot
//! back on close. Two descriptors on one path are not synchronized, so the
//! last close wins.

use super::error::{ErrorCode, FsError, FsResult};
use super::memory::{MkdirOptions, VirtualFs, WatchEvent, WatchHandle};
use super::node::{DirEntry, FileNode, Node, Stats};
use super::path;
use crate::runtime::buffer::{Buffer, Encoding};
use crate::runtime::event_loop::EventLoop;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use tracing::trace;

/// Accessor for the session's current working directory
pub type CwdFn = Rc<dyn Fn() -> String>;

/// First handle handed out; 0-2 belong to stdio
const FIRST_DESCRIPTOR: u32 = 3;

/// Largest size a descriptor's contents may grow to
pub const MAX_FILE_LEN: usize = 1 << 31;

/// An open file descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fd(u32);

impl Fd {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl From<u32> for Fd {
    fn from(raw: u32) -> Self {
        Fd(raw)
    }
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parsed Node open flags (`r`, `w+`, `ax`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
}

impl FromStr for OpenFlags {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mode = s.get(..1).unwrap_or("");
        let rest = s.get(1..).unwrap_or("");
        let mut flags = match mode {
            "r" => OpenFlags {
                read: true,
                ..Default::default()
            },
            "w" => OpenFlags {
                write: true,
                create: true,
                truncate: true,
                ..Default::default()
            },
            "a" => OpenFlags {
                write: true,
                append: true,
                create: true,
                ..Default::default()
            },
            _ => return Err(FsError::new(ErrorCode::EINVAL, "open", "")),
        };

        match rest {
            "" => {}
            "+" => {
                flags.read = true;
                flags.write = true;
            }
            "x" | "x+" if mode != "r" => {
                flags.exclusive = true;
                if rest == "x+" {
                    flags.read = true;
                }
            }
            _ => return Err(FsError::new(ErrorCode::EINVAL, "open", "")),
        }
        Ok(flags)
    }
}

/// Argument accepted by the whole-file helpers: a path or an open descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTarget {
    Path(String),
    Descriptor(Fd),
}

impl From<&str> for FileTarget {
    fn from(path: &str) -> Self {
        FileTarget::Path(path.to_string())
    }
}

impl From<String> for FileTarget {
    fn from(path: String) -> Self {
        FileTarget::Path(path)
    }
}

impl From<Fd> for FileTarget {
    fn from(fd: Fd) -> Self {
        FileTarget::Descriptor(fd)
    }
}

/// Data accepted by write helpers: raw bytes or text with an encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteData {
    Bytes(Buffer),
    Text { text: String, encoding: Encoding },
}

impl WriteData {
    pub fn text(text: impl Into<String>, encoding: Encoding) -> Self {
        WriteData::Text {
            text: text.into(),
            encoding,
        }
    }

    fn into_buffer(self, syscall: &'static str) -> FsResult<Buffer> {
        match self {
            WriteData::Bytes(bytes) => Ok(bytes),
            WriteData::Text { text, encoding } => Buffer::from_encoded(&text, encoding)
                .map_err(|_| FsError::new(ErrorCode::EINVAL, syscall, "")),
        }
    }
}

impl From<&str> for WriteData {
    fn from(text: &str) -> Self {
        WriteData::text(text, Encoding::Utf8)
    }
}

impl From<String> for WriteData {
    fn from(text: String) -> Self {
        WriteData::text(text, Encoding::Utf8)
    }
}

impl From<&[u8]> for WriteData {
    fn from(bytes: &[u8]) -> Self {
        WriteData::Bytes(Buffer::from(bytes))
    }
}

impl From<Vec<u8>> for WriteData {
    fn from(bytes: Vec<u8>) -> Self {
        WriteData::Bytes(Buffer::from(bytes))
    }
}

impl From<Buffer> for WriteData {
    fn from(bytes: Buffer) -> Self {
        WriteData::Bytes(bytes)
    }
}

/// Result of `readFile`: a Buffer without an encoding, a string with one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutput {
    Bytes(Buffer),
    Text(String),
}

impl ReadOutput {
    fn encode(data: Buffer, encoding: Option<Encoding>) -> Self {
        match encoding {
            Some(encoding) => ReadOutput::Text(data.to_encoded(encoding)),
            None => ReadOutput::Bytes(data),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ReadOutput::Text(text) => Some(text),
            ReadOutput::Bytes(_) => None,
        }
    }

    pub fn into_bytes(self) -> Buffer {
        match self {
            ReadOutput::Bytes(bytes) => bytes,
            ReadOutput::Text(text) => Buffer::from(text),
        }
    }
}

/// Options for [`FsShim::rm`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RmOptions {
    pub recursive: bool,
    /// Missing paths are not an error
    pub force: bool,
}

struct OpenDescriptor {
    path: String,
    data: Buffer,
    cursor: usize,
    flags: OpenFlags,
}

struct DescriptorTable {
    next: u32,
    open: HashMap<Fd, OpenDescriptor>,
}

impl DescriptorTable {
    fn allocate(&mut self, descriptor: OpenDescriptor) -> Fd {
        let fd = Fd(self.next);
        self.next += 1;
        self.open.insert(fd, descriptor);
        fd
    }
}

/// The `fs` module as user code sees it
#[derive(Clone)]
pub struct FsShim {
    fs: VirtualFs,
    cwd: CwdFn,
    table: Rc<RefCell<DescriptorTable>>,
    event_loop: Rc<EventLoop>,
}

impl FsShim {
    pub fn new(fs: VirtualFs, cwd: CwdFn, event_loop: Rc<EventLoop>) -> Self {
        Self {
            fs,
            cwd,
            table: Rc::new(RefCell::new(DescriptorTable {
                next: FIRST_DESCRIPTOR,
                open: HashMap::new(),
            })),
            event_loop,
        }
    }

    /// The underlying tree
    pub fn vfs(&self) -> &VirtualFs {
        &self.fs
    }

    /// Absolute form of a user-supplied path
    pub fn resolve_path(&self, user_path: &str) -> String {
        path::resolve(&(self.cwd)(), user_path)
    }

    pub fn callbacks(&self) -> FsCallbacks {
        FsCallbacks { shim: self.clone() }
    }

    pub fn promises(&self) -> FsPromises {
        FsPromises { shim: self.clone() }
    }

    // --- descriptors ---

    pub fn open(&self, user_path: &str, flags: &str) -> FsResult<Fd> {
        let path = self.resolve_path(user_path);
        let flags: OpenFlags = flags
            .parse()
            .map_err(|err: FsError| FsError { path: path.clone(), ..err })?;

        let data = match self.fs.stat(&path) {
            Ok(stats) if stats.is_directory() => {
                return Err(FsError::new(ErrorCode::EISDIR, "open", path));
            }
            Ok(_) if flags.exclusive => {
                return Err(FsError::new(ErrorCode::EEXIST, "open", path));
            }
            Ok(_) if flags.truncate => {
                self.fs.write_file(&path, Buffer::new())?;
                Buffer::new()
            }
            Ok(_) => self.fs.read_file(&path)?,
            Err(err) if err.is_not_found() && flags.create => {
                self.fs.write_file(&path, Buffer::new())?;
                Buffer::new()
            }
            Err(err) => return Err(FsError { syscall: "open", ..err }),
        };

        let fd = self.table.borrow_mut().allocate(OpenDescriptor {
            path: path.clone(),
            data,
            cursor: 0,
            flags,
        });
        trace!(fd = %fd, path = %path, ?flags, "open");
        Ok(fd)
    }

    /// Release a descriptor, writing its snapshot back when writable
    pub fn close(&self, fd: Fd) -> FsResult<()> {
        let descriptor = self
            .table
            .borrow_mut()
            .open
            .remove(&fd)
            .ok_or_else(|| FsError::bad_descriptor("close"))?;
        trace!(fd = %fd, path = %descriptor.path, "close");
        if descriptor.flags.write {
            self.fs.write_file(&descriptor.path, descriptor.data)?;
        }
        Ok(())
    }

    /// Read up to `len` bytes. With `position` the cursor is left alone.
    pub fn read(&self, fd: Fd, len: usize, position: Option<usize>) -> FsResult<Buffer> {
        let mut table = self.table.borrow_mut();
        let descriptor = table
            .open
            .get_mut(&fd)
            .filter(|d| d.flags.read)
            .ok_or_else(|| FsError::bad_descriptor("read"))?;

        let start = position.unwrap_or(descriptor.cursor).min(descriptor.data.len());
        let end = start.saturating_add(len).min(descriptor.data.len());
        let chunk = Buffer::from(&descriptor.data[start..end]);
        if position.is_none() {
            descriptor.cursor = end;
        }
        Ok(chunk)
    }

    /// Write bytes, returning the count written. Append descriptors always
    /// write at the end.
    pub fn write(&self, fd: Fd, bytes: &[u8], position: Option<usize>) -> FsResult<usize> {
        let mut table = self.table.borrow_mut();
        let descriptor = table
            .open
            .get_mut(&fd)
            .filter(|d| d.flags.write)
            .ok_or_else(|| FsError::bad_descriptor("write"))?;

        let start = if descriptor.flags.append {
            descriptor.data.len()
        } else {
            position.unwrap_or(descriptor.cursor)
        };
        let end = match start.checked_add(bytes.len()) {
            Some(end) if end <= MAX_FILE_LEN => end,
            _ => return Err(FsError::new(ErrorCode::EINVAL, "write", descriptor.path.clone())),
        };
        if descriptor.data.len() < end {
            descriptor.data.resize(end);
        }
        let mut data = std::mem::take(&mut descriptor.data).into_vec();
        data[start..end].copy_from_slice(bytes);
        descriptor.data = Buffer::from(data);
        if position.is_none() || descriptor.flags.append {
            descriptor.cursor = end;
        }
        Ok(bytes.len())
    }

    pub fn fstat(&self, fd: Fd) -> FsResult<Stats> {
        let table = self.table.borrow();
        let descriptor = table
            .open
            .get(&fd)
            .ok_or_else(|| FsError::bad_descriptor("fstat"))?;
        let size = descriptor.data.len() as u64;
        match self.fs.stat(&descriptor.path) {
            Ok(stats) => Ok(Stats { size, ..stats }),
            // The path may have been unlinked while the descriptor is open
            Err(_) => Ok(Node::File(FileNode::new(descriptor.data.clone())).stats(0)),
        }
    }

    pub fn ftruncate(&self, fd: Fd, len: usize) -> FsResult<()> {
        let mut table = self.table.borrow_mut();
        let descriptor = table
            .open
            .get_mut(&fd)
            .filter(|d| d.flags.write)
            .ok_or_else(|| FsError::bad_descriptor("ftruncate"))?;
        if len > MAX_FILE_LEN {
            return Err(FsError::new(ErrorCode::EINVAL, "ftruncate", descriptor.path.clone()));
        }
        descriptor.data.resize(len);
        descriptor.cursor = descriptor.cursor.min(len);
        Ok(())
    }

    /// Number of descriptors currently open
    pub fn open_descriptors(&self) -> usize {
        self.table.borrow().open.len()
    }

    // --- whole-file helpers ---

    /// `readFile`. A descriptor target reads from its cursor to the end.
    pub fn read_file(
        &self,
        target: impl Into<FileTarget>,
        encoding: Option<Encoding>,
    ) -> FsResult<ReadOutput> {
        let data = match target.into() {
            FileTarget::Path(user_path) => self.fs.read_file(&self.resolve_path(&user_path))?,
            FileTarget::Descriptor(fd) => self.read(fd, usize::MAX, None)?,
        };
        Ok(ReadOutput::encode(data, encoding))
    }

    pub fn write_file(
        &self,
        target: impl Into<FileTarget>,
        data: impl Into<WriteData>,
    ) -> FsResult<()> {
        let bytes = data.into().into_buffer("write")?;
        match target.into() {
            FileTarget::Path(user_path) => self.fs.write_file(&self.resolve_path(&user_path), bytes),
            FileTarget::Descriptor(fd) => self.write(fd, &bytes, None).map(|_| ()),
        }
    }

    pub fn append_file(
        &self,
        target: impl Into<FileTarget>,
        data: impl Into<WriteData>,
    ) -> FsResult<()> {
        let bytes = data.into().into_buffer("write")?;
        match target.into() {
            FileTarget::Path(user_path) => self.fs.append_file(&self.resolve_path(&user_path), bytes),
            FileTarget::Descriptor(fd) => {
                let end = self.fstat(fd)?.size as usize;
                self.write(fd, &bytes, Some(end)).map(|_| ())
            }
        }
    }

    // --- path operations ---

    pub fn mkdir(&self, user_path: &str, options: MkdirOptions) -> FsResult<()> {
        self.fs.mkdir(&self.resolve_path(user_path), options)
    }

    pub fn read_dir(&self, user_path: &str) -> FsResult<Vec<String>> {
        self.fs.read_dir(&self.resolve_path(user_path))
    }

    pub fn read_dir_entries(&self, user_path: &str) -> FsResult<Vec<DirEntry>> {
        self.fs.read_dir_entries(&self.resolve_path(user_path))
    }

    pub fn stat(&self, user_path: &str) -> FsResult<Stats> {
        self.fs.stat(&self.resolve_path(user_path))
    }

    pub fn lstat(&self, user_path: &str) -> FsResult<Stats> {
        self.fs.lstat(&self.resolve_path(user_path))
    }

    pub fn exists(&self, user_path: &str) -> bool {
        self.fs.exists(&self.resolve_path(user_path))
    }

    pub fn unlink(&self, user_path: &str) -> FsResult<()> {
        self.fs.unlink(&self.resolve_path(user_path))
    }

    pub fn rmdir(&self, user_path: &str) -> FsResult<()> {
        self.fs.rmdir(&self.resolve_path(user_path))
    }

    pub fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        self.fs
            .rename(&self.resolve_path(from), &self.resolve_path(to))
    }

    pub fn truncate(&self, user_path: &str, len: usize) -> FsResult<()> {
        self.fs.truncate(&self.resolve_path(user_path), len)
    }

    pub fn copy_file(&self, from: &str, to: &str) -> FsResult<()> {
        self.fs
            .copy_file(&self.resolve_path(from), &self.resolve_path(to))
    }

    pub fn watch(
        &self,
        user_path: &str,
        recursive: bool,
        listener: impl FnMut(&WatchEvent) + 'static,
    ) -> FsResult<WatchHandle> {
        self.fs
            .watch(&self.resolve_path(user_path), recursive, listener)
    }

    /// Remove a file or, with `recursive`, a whole directory tree
    pub fn rm(&self, user_path: &str, options: RmOptions) -> FsResult<()> {
        let path = self.resolve_path(user_path);
        match self.fs.stat(&path) {
            Err(err) if err.is_not_found() && options.force => Ok(()),
            Err(err) => Err(FsError { syscall: "rm", ..err }),
            Ok(stats) if stats.is_directory() => {
                if !options.recursive {
                    return Err(FsError::new(ErrorCode::EISDIR, "rm", path));
                }
                self.remove_tree(&path)
            }
            Ok(_) => self.fs.unlink(&path),
        }
    }

    fn remove_tree(&self, dir: &str) -> FsResult<()> {
        for entry in self.fs.read_dir_entries(dir)? {
            let child = path::join(&[dir, entry.name.as_str()]);
            if entry.is_directory() {
                self.remove_tree(&child)?;
            } else {
                self.fs.unlink(&child)?;
            }
        }
        self.fs.rmdir(dir)
    }
}

/// Callback-style view: every call runs the operation now and queues the
/// completion on the event loop, so callbacks never run synchronously.
pub struct FsCallbacks {
    shim: FsShim,
}

impl FsCallbacks {
    fn complete<T: 'static>(&self, result: T, callback: impl FnOnce(T) + 'static) {
        self.shim.event_loop.queue(move || callback(result));
    }

    pub fn read_file(
        &self,
        target: impl Into<FileTarget>,
        encoding: Option<Encoding>,
        callback: impl FnOnce(FsResult<ReadOutput>) + 'static,
    ) {
        self.complete(self.shim.read_file(target, encoding), callback);
    }

    pub fn write_file(
        &self,
        target: impl Into<FileTarget>,
        data: impl Into<WriteData>,
        callback: impl FnOnce(FsResult<()>) + 'static,
    ) {
        self.complete(self.shim.write_file(target, data), callback);
    }

    pub fn append_file(
        &self,
        target: impl Into<FileTarget>,
        data: impl Into<WriteData>,
        callback: impl FnOnce(FsResult<()>) + 'static,
    ) {
        self.complete(self.shim.append_file(target, data), callback);
    }

    pub fn mkdir(
        &self,
        user_path: &str,
        options: MkdirOptions,
        callback: impl FnOnce(FsResult<()>) + 'static,
    ) {
        self.complete(self.shim.mkdir(user_path, options), callback);
    }

    pub fn read_dir(&self, user_path: &str, callback: impl FnOnce(FsResult<Vec<String>>) + 'static) {
        self.complete(self.shim.read_dir(user_path), callback);
    }

    pub fn stat(&self, user_path: &str, callback: impl FnOnce(FsResult<Stats>) + 'static) {
        self.complete(self.shim.stat(user_path), callback);
    }

    pub fn exists(&self, user_path: &str, callback: impl FnOnce(bool) + 'static) {
        self.complete(self.shim.exists(user_path), callback);
    }

    pub fn unlink(&self, user_path: &str, callback: impl FnOnce(FsResult<()>) + 'static) {
        self.complete(self.shim.unlink(user_path), callback);
    }

    pub fn rmdir(&self, user_path: &str, callback: impl FnOnce(FsResult<()>) + 'static) {
        self.complete(self.shim.rmdir(user_path), callback);
    }

    pub fn rename(&self, from: &str, to: &str, callback: impl FnOnce(FsResult<()>) + 'static) {
        self.complete(self.shim.rename(from, to), callback);
    }

    pub fn rm(&self, user_path: &str, options: RmOptions, callback: impl FnOnce(FsResult<()>) + 'static) {
        self.complete(self.shim.rm(user_path, options), callback);
    }

    pub fn open(&self, user_path: &str, flags: &str, callback: impl FnOnce(FsResult<Fd>) + 'static) {
        self.complete(self.shim.open(user_path, flags), callback);
    }

    pub fn read(
        &self,
        fd: Fd,
        len: usize,
        position: Option<usize>,
        callback: impl FnOnce(FsResult<Buffer>) + 'static,
    ) {
        self.complete(self.shim.read(fd, len, position), callback);
    }

    pub fn write(
        &self,
        fd: Fd,
        bytes: &[u8],
        position: Option<usize>,
        callback: impl FnOnce(FsResult<usize>) + 'static,
    ) {
        self.complete(self.shim.write(fd, bytes, position), callback);
    }

    pub fn close(&self, fd: Fd, callback: impl FnOnce(FsResult<()>) + 'static) {
        self.complete(self.shim.close(fd), callback);
    }
}

/// `fs.promises`
pub struct FsPromises {
    shim: FsShim,
}

impl FsPromises {
    pub async fn read_file(
        &self,
        target: impl Into<FileTarget>,
        encoding: Option<Encoding>,
    ) -> FsResult<ReadOutput> {
        self.shim.read_file(target, encoding)
    }

    pub async fn write_file(
        &self,
        target: impl Into<FileTarget>,
        data: impl Into<WriteData>,
    ) -> FsResult<()> {
        self.shim.write_file(target, data)
    }

    pub async fn append_file(
        &self,
        target: impl Into<FileTarget>,
        data: impl Into<WriteData>,
    ) -> FsResult<()> {
        self.shim.append_file(target, data)
    }

    pub async fn mkdir(&self, user_path: &str, options: MkdirOptions) -> FsResult<()> {
        self.shim.mkdir(user_path, options)
    }

    pub async fn read_dir(&self, user_path: &str) -> FsResult<Vec<String>> {
        self.shim.read_dir(user_path)
    }

    pub async fn stat(&self, user_path: &str) -> FsResult<Stats> {
        self.shim.stat(user_path)
    }

    pub async fn unlink(&self, user_path: &str) -> FsResult<()> {
        self.shim.unlink(user_path)
    }

    pub async fn rmdir(&self, user_path: &str) -> FsResult<()> {
        self.shim.rmdir(user_path)
    }

    pub async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        self.shim.rename(from, to)
    }

    pub async fn rm(&self, user_path: &str, options: RmOptions) -> FsResult<()> {
        self.shim.rm(user_path, options)
    }

    pub async fn copy_file(&self, from: &str, to: &str) -> FsResult<()> {
        self.shim.copy_file(from, to)
    }

    pub async fn open(&self, user_path: &str, flags: &str) -> FsResult<Fd> {
        self.shim.open(user_path, flags)
    }

    pub async fn close(&self, fd: Fd) -> FsResult<()> {
        self.shim.close(fd)
    }
}
