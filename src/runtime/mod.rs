//! Runtime session
//!
//! A [`Runtime`] owns everything one browser tab shares: the virtual
//! filesystem, the event loop, the working directory, the listening-port
//! registry and the resolver/bundle caches. Host primitives (fetch, native
//! WebSocket, compiled bundler) are injected through [`HostPrimitives`].
//!
//! Submodules:
//! - [`buffer`], [`events`], [`event_loop`]: the small building blocks
//! - [`http`]: the HTTP client shim
//! - [`frame`], [`handshake`], [`websocket`]: the WebSocket upgrade bridge

pub mod buffer;
pub mod event_loop;
pub mod events;
pub mod frame;
pub mod handshake;
pub mod http;
pub mod websocket;

pub use buffer::{Buffer, BufferError, Encoding};
pub use event_loop::{EventLoop, create_event_loop};
pub use events::{EventEmitter, ListenerId};
pub use frame::{Frame, FrameError, OpCode};
pub use http::{
    ClientEvent, ClientRequest, Headers, HttpClient, IncomingMessage, NativeFetch, NetworkError,
    RequestError, RequestOptions, RequestResult, RequestTarget,
};
pub use websocket::{MockSocket, NativeWebSocket, NativeWebSocketFactory, SocketEvent};

use crate::bundler::service::DEFAULT_ALWAYS_EXTERNAL;
use crate::bundler::{BundleCache, BundleError, Bundler, PackageBundleService};
use crate::fs::{ErrorCode, FsError, FsShim, MkdirOptions, VirtualFs, path};
use crate::resolver::{DEFAULT_MODULES_DIR, ManifestCache, ModuleResolver, ResolverProfile};
use crate::server::{DEFAULT_EPHEMERAL_PORT_START, Server, ServerError, ServerRegistry};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur in a runtime session
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Failed to read config: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("The host did not supply a bundler")]
    NoBundler,
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Initial working directory inside the virtual filesystem
    pub cwd: String,
    /// Directory bare specifiers are resolved from by the bundle service
    pub project_root: String,
    pub modules_dir: String,
    /// GUID mixed into `sec-websocket-accept`
    pub handshake_guid: String,
    /// Packages the page provides itself
    pub always_external: Vec<String>,
    /// First port handed out for `listen(0)`
    pub ephemeral_port_start: u16,
    /// Default client request timeout; 0 disables it
    pub request_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cwd: "/project".to_string(),
            project_root: "/project".to_string(),
            modules_dir: DEFAULT_MODULES_DIR.to_string(),
            handshake_guid: handshake::WEBSOCKET_GUID.to_string(),
            always_external: DEFAULT_ALWAYS_EXTERNAL
                .iter()
                .map(|name| name.to_string())
                .collect(),
            ephemeral_port_start: DEFAULT_EPHEMERAL_PORT_START,
            request_timeout_ms: 0,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(content: &str) -> RuntimeResult<Self> {
        let config: RuntimeConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(file: &Path) -> RuntimeResult<Self> {
        let content = std::fs::read_to_string(file)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        for (field, value) in [("cwd", &self.cwd), ("project_root", &self.project_root)] {
            if !path::is_absolute(value) {
                return Err(RuntimeError::InvalidConfig(format!(
                    "{} must be an absolute path, got '{}'",
                    field, value
                )));
            }
        }
        if self.modules_dir.is_empty() || self.modules_dir.contains('/') {
            return Err(RuntimeError::InvalidConfig(format!(
                "modules_dir must be a single directory name, got '{}'",
                self.modules_dir
            )));
        }
        if self.ephemeral_port_start == 0 {
            return Err(RuntimeError::InvalidConfig(
                "ephemeral_port_start must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

/// What the embedding page provides
#[derive(Clone, Default)]
pub struct HostPrimitives {
    pub fetch: Option<Rc<dyn NativeFetch>>,
    pub websockets: Option<Rc<dyn NativeWebSocketFactory>>,
    pub bundler: Option<Rc<dyn Bundler>>,
}

/// One browser tab's worth of Node environment
pub struct Runtime {
    config: RuntimeConfig,
    fs: VirtualFs,
    event_loop: Rc<EventLoop>,
    cwd: Rc<RefCell<String>>,
    servers: ServerRegistry,
    bundle_cache: BundleCache,
    manifests: ManifestCache,
    host: HostPrimitives,
}

impl Runtime {
    /// Create a session with default configuration and no host primitives
    pub fn new() -> RuntimeResult<Self> {
        Self::with_config(RuntimeConfig::default(), HostPrimitives::default())
    }

    pub fn with_config(config: RuntimeConfig, host: HostPrimitives) -> RuntimeResult<Self> {
        config.validate()?;
        let fs = VirtualFs::new();
        fs.mkdir(&config.cwd, MkdirOptions::recursive())?;
        fs.mkdir(&config.project_root, MkdirOptions::recursive())?;
        debug!(cwd = %config.cwd, root = %config.project_root, "runtime session created");

        Ok(Self {
            cwd: Rc::new(RefCell::new(path::normalize(&config.cwd))),
            servers: ServerRegistry::new(config.ephemeral_port_start),
            event_loop: create_event_loop(),
            bundle_cache: BundleCache::new(),
            manifests: ManifestCache::new(),
            fs,
            config,
            host,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn fs(&self) -> &VirtualFs {
        &self.fs
    }

    pub fn event_loop(&self) -> &Rc<EventLoop> {
        &self.event_loop
    }

    pub fn servers(&self) -> &ServerRegistry {
        &self.servers
    }

    /// The Node `fs` surface, resolving relative paths against [`Runtime::cwd`]
    pub fn fs_shim(&self) -> FsShim {
        let cwd = Rc::clone(&self.cwd);
        FsShim::new(
            self.fs.clone(),
            Rc::new(move || cwd.borrow().clone()),
            Rc::clone(&self.event_loop),
        )
    }

    pub fn cwd(&self) -> String {
        self.cwd.borrow().clone()
    }

    /// `process.chdir`
    pub fn chdir(&self, dir: &str) -> RuntimeResult<()> {
        let target = path::resolve(&self.cwd(), dir);
        if !self.fs.exists(&target) {
            return Err(FsError::new(ErrorCode::ENOENT, "chdir", &target).into());
        }
        if !self.fs.is_dir(&target) {
            return Err(FsError::new(ErrorCode::ENOTDIR, "chdir", &target).into());
        }
        debug!(cwd = %target, "chdir");
        *self.cwd.borrow_mut() = target;
        Ok(())
    }

    /// A resolver sharing the session's manifest cache
    pub fn resolver(&self, profile: ResolverProfile) -> ModuleResolver {
        ModuleResolver::new(self.fs.clone(), profile)
            .with_cache(self.manifests.clone())
            .with_modules_dir(self.config.modules_dir.clone())
    }

    pub fn http(&self) -> HttpClient {
        HttpClient::new(
            self.host.fetch.clone(),
            self.host.websockets.clone(),
            self.servers.clone(),
            self.config.handshake_guid.clone(),
        )
        .with_default_timeout(self.config.request_timeout())
    }

    /// `http.createServer`
    pub fn create_server(&self) -> Rc<Server> {
        Server::new(self.servers.clone())
    }

    pub fn bundle_service(&self) -> RuntimeResult<PackageBundleService> {
        let bundler = self.host.bundler.clone().ok_or(RuntimeError::NoBundler)?;
        Ok(
            PackageBundleService::new(self.fs.clone(), bundler, self.config.project_root.clone())
                .with_caches(self.bundle_cache.clone(), self.manifests.clone())
                .with_modules_dir(self.config.modules_dir.clone())
                .with_always_external(self.config.always_external.clone()),
        )
    }

    /// Drop cached bundles and manifests, e.g. after an install
    pub fn invalidate_caches(&self) {
        self.bundle_cache.clear();
        self.manifests.clear();
    }
}
