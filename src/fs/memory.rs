//! In-memory hierarchical filesystem
//!
//! [`VirtualFs`] is a cheap, cloneable handle to one tree. Every other
//! component (descriptor shim, resolver, loader plugin, bundle service)
//! reads and writes through the same handle, so the tree is the single
//! source of truth for a runtime session.
//!
//! All operations are synchronous. Watch listeners run synchronously inside
//! the mutating call, after the tree borrow has been released, so a listener
//! may itself touch the filesystem.

use super::error::{ErrorCode, FsError, FsResult};
use super::node::{DirEntry, DirNode, FileNode, Node, Stats};
use super::path;
use crate::runtime::buffer::Buffer;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};
use tracing::trace;

/// Options for [`VirtualFs::mkdir`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MkdirOptions {
    pub recursive: bool,
}

impl MkdirOptions {
    pub fn recursive() -> Self {
        Self { recursive: true }
    }
}

/// fs.watch event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// An entry appeared or disappeared
    Rename,
    /// File contents changed
    Change,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    /// Absolute path of the affected entry
    pub path: String,
    /// Path relative to the watched path, as Node reports it
    pub filename: String,
}

type WatchListener = Rc<RefCell<dyn FnMut(&WatchEvent)>>;

struct Watcher {
    id: u64,
    path: String,
    recursive: bool,
    listener: WatchListener,
}

struct FsInner {
    root: Node,
    watchers: Vec<Watcher>,
    next_watch_id: u64,
    pending: VecDeque<(WatchEventKind, String)>,
    delivering: bool,
}

impl FsInner {
    fn lookup(&self, path: &str) -> Result<&Node, ErrorCode> {
        let mut node = &self.root;
        for segment in path::segments(path) {
            node = match node {
                Node::Directory(dir) => dir.entries.get(segment).ok_or(ErrorCode::ENOENT)?,
                Node::File(_) => return Err(ErrorCode::ENOTDIR),
            };
        }
        Ok(node)
    }

    fn lookup_mut(&mut self, path: &str) -> Result<&mut Node, ErrorCode> {
        let mut node = &mut self.root;
        for segment in path::segments(path) {
            node = match node {
                Node::Directory(dir) => dir
                    .entries
                    .get_mut(segment)
                    .ok_or(ErrorCode::ENOENT)?,
                Node::File(_) => return Err(ErrorCode::ENOTDIR),
            };
        }
        Ok(node)
    }

    /// The directory that holds `path`, plus the entry name inside it
    fn parent_mut<'p>(&mut self, path: &'p str) -> Result<(&mut DirNode, &'p str), ErrorCode> {
        let name = path::basename(path);
        if name.is_empty() {
            return Err(ErrorCode::EINVAL);
        }
        match self.lookup_mut(path::dirname(path))? {
            Node::Directory(dir) => Ok((dir, name)),
            Node::File(_) => Err(ErrorCode::ENOTDIR),
        }
    }

    fn matching_listeners(&self, event_path: &str) -> Vec<(WatchListener, String)> {
        self.watchers
            .iter()
            .filter_map(|watcher| {
                let filename = if event_path == watcher.path
                    || path::dirname(event_path) == watcher.path
                {
                    path::basename(event_path).to_string()
                } else if watcher.recursive && path::is_within(event_path, &watcher.path) {
                    path::strip_ancestor(event_path, &watcher.path).to_string()
                } else {
                    return None;
                };
                Some((Rc::clone(&watcher.listener), filename))
            })
            .collect()
    }
}

/// Handle returned by [`VirtualFs::watch`]; closing it stops delivery
#[derive(Debug)]
pub struct WatchHandle {
    id: u64,
    fs: Weak<RefCell<FsInner>>,
}

impl WatchHandle {
    pub fn close(self) {
        if let Some(inner) = self.fs.upgrade() {
            inner.borrow_mut().watchers.retain(|w| w.id != self.id);
        }
    }
}

/// The in-memory filesystem
#[derive(Clone)]
pub struct VirtualFs {
    inner: Rc<RefCell<FsInner>>,
}

impl Default for VirtualFs {
    fn default() -> Self {
        Self::new()
    }
}

fn absolute(path: &str) -> String {
    path::resolve("/", path)
}

fn inode_number(path: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}

/// Ends a delivery run, even when a listener unwinds out of it. Events still
/// queued behind a panicking listener are dropped.
struct DeliveryGuard<'a>(&'a RefCell<FsInner>);

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.0.try_borrow_mut() {
            inner.delivering = false;
            if std::thread::panicking() {
                inner.pending.clear();
            }
        }
    }
}

impl VirtualFs {
    /// Create an empty filesystem containing only `/`
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(FsInner {
                root: Node::Directory(DirNode::new()),
                watchers: Vec::new(),
                next_watch_id: 1,
                pending: VecDeque::new(),
                delivering: false,
            })),
        }
    }

    /// Whether two handles share one tree
    pub fn same_tree(&self, other: &VirtualFs) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queue an event and, unless a delivery is already running further up
    /// the stack, drain the queue. Mutations made by a listener are queued
    /// behind the event being delivered.
    fn notify(&self, kind: WatchEventKind, event_path: &str) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.pending.push_back((kind, event_path.to_string()));
            if inner.delivering {
                return;
            }
            inner.delivering = true;
        }
        let _delivering = DeliveryGuard(&self.inner);

        loop {
            let (kind, event_path, listeners) = {
                let mut inner = self.inner.borrow_mut();
                match inner.pending.pop_front() {
                    Some((kind, event_path)) => {
                        let listeners = inner.matching_listeners(&event_path);
                        (kind, event_path, listeners)
                    }
                    None => return,
                }
            };
            for (listener, filename) in listeners {
                let event = WatchEvent {
                    kind,
                    path: event_path.clone(),
                    filename,
                };
                if let Ok(mut call) = listener.try_borrow_mut() {
                    call(&event);
                }
            }
        }
    }

    pub fn read_file(&self, path: &str) -> FsResult<Buffer> {
        let path = absolute(path);
        let mut inner = self.inner.borrow_mut();
        match inner.lookup_mut(&path) {
            Ok(Node::File(file)) => {
                file.times.touch_accessed();
                Ok(file.data.clone())
            }
            Ok(Node::Directory(_)) => Err(FsError::new(ErrorCode::EISDIR, "read", path)),
            Err(code) => Err(FsError::new(code, "open", path)),
        }
    }

    pub fn read_to_string(&self, path: &str) -> FsResult<String> {
        self.read_file(path).map(|data| data.to_text())
    }

    /// Create or replace a file. The parent directory must exist.
    pub fn write_file(&self, path: &str, data: impl Into<Buffer>) -> FsResult<()> {
        self.put_file(path, data.into(), false, "open")
    }

    /// Append to a file, creating it when missing
    pub fn append_file(&self, path: &str, data: impl Into<Buffer>) -> FsResult<()> {
        self.put_file(path, data.into(), true, "open")
    }

    fn put_file(&self, path: &str, data: Buffer, append: bool, syscall: &'static str) -> FsResult<()> {
        let path = absolute(path);
        let created = {
            let mut inner = self.inner.borrow_mut();
            let (dir, name) = inner.parent_mut(&path).map_err(|code| {
                let code = if code == ErrorCode::EINVAL { ErrorCode::EISDIR } else { code };
                FsError::new(code, syscall, path.as_str())
            })?;
            match dir.entries.get_mut(name) {
                Some(Node::Directory(_)) => {
                    return Err(FsError::new(ErrorCode::EISDIR, syscall, path.as_str()));
                }
                Some(Node::File(file)) => {
                    if append {
                        file.data.extend_from_slice(&data);
                    } else {
                        file.data = data;
                    }
                    file.times.touch_modified();
                    false
                }
                None => {
                    dir.entries
                        .insert(name.to_string(), Node::File(FileNode::new(data)));
                    dir.times.touch_modified();
                    true
                }
            }
        };

        trace!(path = %path, created, append, "write");
        if created {
            self.notify(WatchEventKind::Rename, &path);
        }
        self.notify(WatchEventKind::Change, &path);
        Ok(())
    }

    /// Create a directory. With `recursive`, missing ancestors are created
    /// and an existing directory is not an error.
    pub fn mkdir(&self, path: &str, options: MkdirOptions) -> FsResult<()> {
        let path = absolute(path);
        let created = if options.recursive {
            self.mkdir_recursive(&path)?
        } else {
            self.mkdir_single(&path)?;
            vec![path.clone()]
        };

        for dir in &created {
            trace!(path = %dir, "mkdir");
            self.notify(WatchEventKind::Rename, dir);
        }
        Ok(())
    }

    fn mkdir_single(&self, path: &str) -> FsResult<()> {
        let mut inner = self.inner.borrow_mut();
        let (dir, name) = inner.parent_mut(path).map_err(|code| {
            let code = if code == ErrorCode::EINVAL { ErrorCode::EEXIST } else { code };
            FsError::new(code, "mkdir", path)
        })?;
        if dir.entries.contains_key(name) {
            return Err(FsError::new(ErrorCode::EEXIST, "mkdir", path));
        }
        dir.entries
            .insert(name.to_string(), Node::Directory(DirNode::new()));
        dir.times.touch_modified();
        Ok(())
    }

    fn mkdir_recursive(&self, path: &str) -> FsResult<Vec<String>> {
        let mut inner = self.inner.borrow_mut();
        let mut created = Vec::new();
        let mut current = String::new();
        let mut node = &mut inner.root;

        for segment in path::segments(path) {
            let dir = match node {
                Node::Directory(dir) => dir,
                Node::File(_) => return Err(FsError::new(ErrorCode::ENOTDIR, "mkdir", path)),
            };
            current.push('/');
            current.push_str(segment);
            if !dir.entries.contains_key(segment) {
                dir.times.touch_modified();
                created.push(current.clone());
            }
            node = dir
                .entries
                .entry(segment.to_string())
                .or_insert_with(|| Node::Directory(DirNode::new()));
        }

        if let Node::File(_) = node {
            return Err(FsError::new(ErrorCode::EEXIST, "mkdir", path));
        }
        Ok(created)
    }

    /// Entry names in insertion order
    pub fn read_dir(&self, path: &str) -> FsResult<Vec<String>> {
        Ok(self
            .read_dir_entries(path)?
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }

    /// Entries with their kinds (readdir withFileTypes)
    pub fn read_dir_entries(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let path = absolute(path);
        let inner = self.inner.borrow();
        match inner.lookup(&path) {
            Ok(Node::Directory(dir)) => Ok(dir
                .entries
                .iter()
                .map(|(name, node)| DirEntry {
                    name: name.clone(),
                    kind: node.kind(),
                })
                .collect()),
            Ok(Node::File(_)) => Err(FsError::new(ErrorCode::ENOTDIR, "scandir", path)),
            Err(code) => Err(FsError::new(code, "scandir", path)),
        }
    }

    pub fn stat(&self, path: &str) -> FsResult<Stats> {
        self.stat_with(path, "stat")
    }

    /// Same as [`stat`](Self::stat): the tree has no symlinks
    pub fn lstat(&self, path: &str) -> FsResult<Stats> {
        self.stat_with(path, "lstat")
    }

    fn stat_with(&self, path: &str, syscall: &'static str) -> FsResult<Stats> {
        let path = absolute(path);
        let inner = self.inner.borrow();
        inner
            .lookup(&path)
            .map(|node| node.stats(inode_number(&path)))
            .map_err(|code| FsError::new(code, syscall, path.as_str()))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.inner.borrow().lookup(&absolute(path)).is_ok()
    }

    pub fn is_file(&self, path: &str) -> bool {
        matches!(self.inner.borrow().lookup(&absolute(path)), Ok(Node::File(_)))
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(
            self.inner.borrow().lookup(&absolute(path)),
            Ok(Node::Directory(_))
        )
    }

    /// Remove a file
    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let path = absolute(path);
        {
            let mut inner = self.inner.borrow_mut();
            let (dir, name) = inner.parent_mut(&path).map_err(|code| {
                let code = if code == ErrorCode::EINVAL { ErrorCode::EISDIR } else { code };
                FsError::new(code, "unlink", path.as_str())
            })?;
            match dir.entries.get(name) {
                None => return Err(FsError::new(ErrorCode::ENOENT, "unlink", path.as_str())),
                Some(Node::Directory(_)) => {
                    return Err(FsError::new(ErrorCode::EISDIR, "unlink", path.as_str()));
                }
                Some(Node::File(_)) => {
                    dir.entries.shift_remove(name);
                    dir.times.touch_modified();
                }
            }
        }
        trace!(path = %path, "unlink");
        self.notify(WatchEventKind::Rename, &path);
        Ok(())
    }

    /// Remove an empty directory
    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        let path = absolute(path);
        {
            let mut inner = self.inner.borrow_mut();
            let (dir, name) = inner.parent_mut(&path).map_err(|code| {
                let code = if code == ErrorCode::EINVAL { ErrorCode::EBUSY } else { code };
                FsError::new(code, "rmdir", path.as_str())
            })?;
            match dir.entries.get(name) {
                None => return Err(FsError::new(ErrorCode::ENOENT, "rmdir", path.as_str())),
                Some(Node::File(_)) => {
                    return Err(FsError::new(ErrorCode::ENOTDIR, "rmdir", path.as_str()));
                }
                Some(Node::Directory(child)) if !child.entries.is_empty() => {
                    return Err(FsError::new(ErrorCode::ENOTEMPTY, "rmdir", path.as_str()));
                }
                Some(Node::Directory(_)) => {
                    dir.entries.shift_remove(name);
                    dir.times.touch_modified();
                }
            }
        }
        trace!(path = %path, "rmdir");
        self.notify(WatchEventKind::Rename, &path);
        Ok(())
    }

    /// Move an entry. An existing file destination is replaced.
    pub fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let from = absolute(from);
        let to = absolute(to);
        let fail = |code: ErrorCode| FsError::new(code, "rename", from.as_str());

        {
            let mut inner = self.inner.borrow_mut();
            let source_kind = inner.lookup(&from).map_err(fail)?.kind();
            if from == to {
                return Ok(());
            }
            if from == "/" {
                return Err(fail(ErrorCode::EBUSY));
            }
            if path::is_within(&to, &from) {
                return Err(fail(ErrorCode::EINVAL));
            }

            match inner.lookup(path::dirname(&to)) {
                Ok(Node::Directory(_)) => {}
                Ok(Node::File(_)) => return Err(fail(ErrorCode::ENOTDIR)),
                Err(code) => return Err(fail(code)),
            }
            match (&source_kind, inner.lookup(&to)) {
                (super::node::FileKind::File, Ok(Node::Directory(_))) => {
                    return Err(fail(ErrorCode::EISDIR));
                }
                (super::node::FileKind::Directory, Ok(Node::File(_))) => {
                    return Err(fail(ErrorCode::ENOTDIR));
                }
                (_, Ok(Node::Directory(existing))) if !existing.entries.is_empty() => {
                    return Err(fail(ErrorCode::ENOTEMPTY));
                }
                _ => {}
            }

            let (source_dir, source_name) = inner.parent_mut(&from).map_err(fail)?;
            let mut moved = source_dir
                .entries
                .shift_remove(source_name)
                .ok_or_else(|| fail(ErrorCode::ENOENT))?;
            source_dir.times.touch_modified();
            match &mut moved {
                Node::File(file) => file.times.ctime = std::time::SystemTime::now(),
                Node::Directory(dir) => dir.times.ctime = std::time::SystemTime::now(),
            }

            let (dest_dir, dest_name) = inner.parent_mut(&to).map_err(fail)?;
            dest_dir.entries.insert(dest_name.to_string(), moved);
            dest_dir.times.touch_modified();
        }

        trace!(from = %from, to = %to, "rename");
        self.notify(WatchEventKind::Rename, &from);
        self.notify(WatchEventKind::Rename, &to);
        Ok(())
    }

    /// Shrink or zero-extend a file to `len` bytes
    pub fn truncate(&self, path: &str, len: usize) -> FsResult<()> {
        let path = absolute(path);
        {
            let mut inner = self.inner.borrow_mut();
            match inner.lookup_mut(&path) {
                Ok(Node::File(file)) => {
                    file.data.resize(len);
                    file.times.touch_modified();
                }
                Ok(Node::Directory(_)) => {
                    return Err(FsError::new(ErrorCode::EISDIR, "open", path));
                }
                Err(code) => return Err(FsError::new(code, "open", path)),
            }
        }
        self.notify(WatchEventKind::Change, &path);
        Ok(())
    }

    pub fn copy_file(&self, from: &str, to: &str) -> FsResult<()> {
        let data = self.read_file(from).map_err(|err| FsError {
            syscall: "copyfile",
            ..err
        })?;
        self.put_file(to, data, false, "copyfile")
    }

    /// Watch `path` for mutations. Non-recursive watches see the path itself
    /// and its direct children.
    pub fn watch(
        &self,
        path: &str,
        recursive: bool,
        listener: impl FnMut(&WatchEvent) + 'static,
    ) -> FsResult<WatchHandle> {
        let path = absolute(path);
        if !self.exists(&path) {
            return Err(FsError::not_found("watch", path));
        }
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_watch_id;
        inner.next_watch_id += 1;
        inner.watchers.push(Watcher {
            id,
            path,
            recursive,
            listener: Rc::new(RefCell::new(listener)),
        });
        Ok(WatchHandle {
            id,
            fs: Rc::downgrade(&self.inner),
        })
    }
}
