//! Virtual filesystem for the tabnode runtime
//!
//! The tab has no disk, so every file lives in an in-memory tree owned by
//! the runtime session:
//! - [`memory`]: the tree itself ([`VirtualFs`]) with POSIX error semantics
//!   and synchronous watchers
//! - [`descriptors`]: the Node `fs` surface ([`FsShim`]) with file
//!   descriptors, flag strings, callback and promise views
//! - [`path`]: POSIX path helpers shared with the resolver and bundler

pub mod descriptors;
pub mod error;
pub mod memory;
pub mod node;
pub mod path;

pub use descriptors::{
    CwdFn, Fd, FileTarget, FsCallbacks, FsPromises, FsShim, OpenFlags, ReadOutput, RmOptions,
    WriteData,
};
pub use error::{ErrorCode, FsError, FsResult};
pub use memory::{MkdirOptions, VirtualFs, WatchEvent, WatchEventKind, WatchHandle};
pub use node::{DirEntry, FileKind, Stats};
