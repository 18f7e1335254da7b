//! tabnode - the Node environment of a browser tab
//!
//! Tools written against Node's standard library run inside a sandboxed tab
//! with no disk, sockets or process table. This crate provides the stateful
//! pieces they lean on:
//! - [`fs`]: an in-memory filesystem with POSIX error semantics and a
//!   descriptor-based `fs` surface
//! - [`resolver`]: Node package resolution with nested `exports` conditions
//! - [`bundler`]: a resolve/load plugin and a package bundle service over a
//!   host-supplied bundler
//! - [`runtime`]: the session, the HTTP client and the WebSocket frame bridge
//! - [`server`]: in-process HTTP servers reachable on loopback

pub mod bundler;
pub mod cli;
pub mod fs;
pub mod resolver;
pub mod runtime;
pub mod server;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use bundler::{BundleError, BundleResult, Bundler, PackageBundleService};
pub use fs::{FsError, FsShim, VirtualFs};
pub use resolver::{ModuleResolver, ResolverProfile};
pub use runtime::{HostPrimitives, Runtime, RuntimeConfig, RuntimeError, RuntimeResult};
pub use server::{Server, ServerError, ServerRegistry, ServerResult};
