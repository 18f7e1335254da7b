//! Test doubles for the host-supplied traits

use crate::bundler::{
    BuildOptions, BuildOutput, Bundler, BundlerPlugin, ImportKind, LoadArgs, LoadOutcome, Message,
    ResolveArgs, ResolveOutcome,
};
use crate::fs::path;
use crate::runtime::buffer::Buffer;
use crate::runtime::http::{FetchRequest, FetchResponse, Headers, NativeFetch, NetworkError};
use crate::runtime::websocket::{
    NativeMessage, NativeSocketEvent, NativeSocketSink, NativeWebSocket, NativeWebSocketFactory,
    ReadyState,
};
use futures_util::future::LocalBoxFuture;
use indexmap::IndexMap;
use regex::Regex;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;
use url::Url;

/// Bundles CommonJS the way esbuild lays it out: one `__commonJS` factory
/// per module, `__require` for externals, `export default require_x();`
#[derive(Default)]
pub struct FakeBundler {
    builds: Cell<usize>,
}

impl FakeBundler {
    pub fn builds(&self) -> usize {
        self.builds.get()
    }
}

impl Bundler for FakeBundler {
    fn build(
        &self,
        options: BuildOptions,
        plugin: Rc<dyn BundlerPlugin>,
    ) -> LocalBoxFuture<'_, Result<BuildOutput, Vec<Message>>> {
        self.builds.set(self.builds.get() + 1);
        Box::pin(async move { FakeBuild::new(&options, plugin.as_ref()).run() })
    }
}

struct FakeBuild<'a> {
    options: &'a BuildOptions,
    plugin: &'a dyn BundlerPlugin,
    factories: HashMap<String, String>,
    modules: IndexMap<String, String>,
    require_call: Regex,
}

impl<'a> FakeBuild<'a> {
    fn new(options: &'a BuildOptions, plugin: &'a dyn BundlerPlugin) -> Self {
        Self {
            options,
            plugin,
            factories: HashMap::new(),
            modules: IndexMap::new(),
            require_call: Regex::new(r#"\brequire\(\s*["']([^"']+)["']\s*\)"#).unwrap(),
        }
    }

    fn run(mut self) -> Result<BuildOutput, Vec<Message>> {
        let entry = ResolveArgs {
            path: self.options.entry_point.clone(),
            importer: String::new(),
            resolve_dir: "/".into(),
            namespace: String::new(),
            kind: ImportKind::EntryPoint,
        };
        let factory = match self.plugin.on_resolve(&entry) {
            ResolveOutcome::Resolved { path, namespace, plugin_data } => {
                self.include(LoadArgs { path, namespace, plugin_data })?
            }
            _ => return Err(vec![Message::new("Could not resolve entry point")]),
        };

        let mut code = String::from(
            "var __require = (x) => { throw Error('Dynamic require of \"' + x + '\" is not supported'); };\n",
        );
        for body in self.modules.values() {
            code.push_str(body);
        }
        code.push_str(&format!("export default {}();\n", factory));
        Ok(BuildOutput {
            code,
            warnings: Vec::new(),
        })
    }

    fn include(&mut self, load: LoadArgs) -> Result<String, Vec<Message>> {
        if let Some(existing) = self.factories.get(&load.path) {
            return Ok(existing.clone());
        }
        let stem: String = path::basename(&load.path)
            .split('.')
            .next()
            .unwrap_or("module")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let factory = match self.factories.len() {
            0 => format!("require_{}", stem),
            n => format!("require_{}{}", stem, n),
        };
        self.factories.insert(load.path.clone(), factory.clone());

        let (contents, resolve_dir) = match self.plugin.on_load(&load) {
            LoadOutcome::Loaded { contents, resolve_dir, .. } => {
                (contents, resolve_dir.unwrap_or_else(|| "/".into()))
            }
            LoadOutcome::Failed(messages) => return Err(messages),
            LoadOutcome::Pass => return Err(vec![Message::new(format!("No loader for {}", load.path))]),
        };

        let mut replacements = HashMap::new();
        let specifiers: Vec<String> = self
            .require_call
            .captures_iter(&contents)
            .map(|capture| capture[1].to_string())
            .collect();
        for specifier in specifiers {
            if replacements.contains_key(&specifier) {
                continue;
            }
            let replacement = if self.options.external.contains(&specifier) {
                format!("__require({:?})", specifier)
            } else {
                let args = ResolveArgs {
                    path: specifier.clone(),
                    importer: load.path.clone(),
                    resolve_dir: resolve_dir.clone(),
                    namespace: load.namespace.clone(),
                    kind: ImportKind::RequireCall,
                };
                match self.plugin.on_resolve(&args) {
                    ResolveOutcome::Resolved { path, namespace, plugin_data } => {
                        format!("{}()", self.include(LoadArgs { path, namespace, plugin_data })?)
                    }
                    ResolveOutcome::External { path } => format!("__require({:?})", path),
                    ResolveOutcome::Pass => {
                        return Err(vec![
                            Message::new(format!("Could not resolve \"{}\"", specifier))
                                .in_file(load.path.clone()),
                        ]);
                    }
                }
            };
            replacements.insert(specifier, replacement);
        }

        let body = self
            .require_call
            .replace_all(&contents, |capture: &regex::Captures| replacements[&capture[1]].clone());
        self.modules.insert(
            load.path.clone(),
            format!(
                "var {} = __commonJS({{\n  {:?}(exports, module) {{\n{}\n  }}\n}});\n",
                factory, load.path, body
            ),
        );
        Ok(factory)
    }
}

/// Records every request and answers with a canned response
pub struct FakeFetch {
    reply: Result<FetchResponse, NetworkError>,
    delay: Option<Duration>,
    calls: RefCell<Vec<FetchRequest>>,
}

impl FakeFetch {
    pub fn ok(status: u16, body: &str) -> Self {
        Self {
            reply: Ok(FetchResponse {
                status,
                status_text: crate::runtime::http::status_text(status).to_string(),
                headers: Headers::new(),
                body: Buffer::from(body),
            }),
            delay: None,
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: Err(NetworkError::failed_to_fetch()),
            delay: None,
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<FetchRequest> {
        self.calls.borrow().clone()
    }
}

impl NativeFetch for FakeFetch {
    fn fetch(&self, request: FetchRequest) -> LocalBoxFuture<'_, Result<FetchResponse, NetworkError>> {
        self.calls.borrow_mut().push(request);
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.reply.clone()
        })
    }
}

/// A browser WebSocket whose events the test delivers by hand
pub struct FakeNativeSocket {
    pub url: Url,
    pub protocols: Vec<String>,
    sink: NativeSocketSink,
    state: Cell<ReadyState>,
    sent: RefCell<Vec<NativeMessage>>,
    closes: RefCell<Vec<(Option<u16>, String)>>,
}

impl FakeNativeSocket {
    pub fn deliver(&self, event: NativeSocketEvent) {
        match event {
            NativeSocketEvent::Open => self.state.set(ReadyState::Open),
            NativeSocketEvent::Close { .. } | NativeSocketEvent::Error => {
                self.state.set(ReadyState::Closed)
            }
            NativeSocketEvent::Message(_) => {}
        }
        self.sink.deliver(event);
    }

    pub fn sent(&self) -> Vec<NativeMessage> {
        self.sent.borrow().clone()
    }

    pub fn closes(&self) -> Vec<(Option<u16>, String)> {
        self.closes.borrow().clone()
    }
}

impl NativeWebSocket for FakeNativeSocket {
    fn send(&self, message: NativeMessage) {
        self.sent.borrow_mut().push(message);
    }

    fn close(&self, code: Option<u16>, reason: &str) {
        self.closes.borrow_mut().push((code, reason.to_string()));
        self.state.set(ReadyState::Closing);
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    fn protocol(&self) -> Option<String> {
        self.protocols.first().cloned()
    }
}

pub struct FakeSocketFactory {
    refuse: bool,
    sockets: RefCell<Vec<Rc<FakeNativeSocket>>>,
}

impl FakeSocketFactory {
    /// Sockets open as soon as they are created
    pub fn opening() -> Self {
        Self {
            refuse: false,
            sockets: RefCell::new(Vec::new()),
        }
    }

    /// Sockets fail with error + close before opening
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            sockets: RefCell::new(Vec::new()),
        }
    }

    pub fn connections(&self) -> usize {
        self.sockets.borrow().len()
    }

    pub fn last(&self) -> Rc<FakeNativeSocket> {
        Rc::clone(self.sockets.borrow().last().expect("no socket was opened"))
    }
}

impl NativeWebSocketFactory for FakeSocketFactory {
    fn connect(
        &self,
        url: &Url,
        protocols: &[String],
        sink: NativeSocketSink,
    ) -> Result<Rc<dyn NativeWebSocket>, NetworkError> {
        let socket = Rc::new(FakeNativeSocket {
            url: url.clone(),
            protocols: protocols.to_vec(),
            sink,
            state: Cell::new(ReadyState::Connecting),
            sent: RefCell::new(Vec::new()),
            closes: RefCell::new(Vec::new()),
        });
        self.sockets.borrow_mut().push(Rc::clone(&socket));

        if self.refuse {
            socket.deliver(NativeSocketEvent::Error);
            socket.deliver(NativeSocketEvent::Close {
                code: Some(1006),
                reason: String::new(),
            });
        } else {
            socket.deliver(NativeSocketEvent::Open);
        }
        Ok(socket)
    }
}
