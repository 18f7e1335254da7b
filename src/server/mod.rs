//! Virtual HTTP servers
//!
//! Servers never bind a socket. `listen` claims a port in the session's
//! [`ServerRegistry`]; requests reach the handler either through the HTTP
//! client shim (loopback requests to a registered port) or directly through
//! [`ServerRegistry::dispatch`], which resolves once the handler calls
//! [`ServerResponse::end`].

use crate::runtime::buffer::Buffer;
use crate::runtime::events::{EventEmitter, ListenerId};
use crate::runtime::http::{Headers, IncomingMessage, status_text};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Errors that can occur in the server layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("listen EADDRINUSE: address already in use :::{0}")]
    AddressInUse(u16),

    #[error("No free port at or above {0}")]
    NoFreePort(u16),

    #[error("Server is not running")]
    NotRunning,

    #[error("Server is already listening on port {0}")]
    AlreadyListening(u16),

    #[error("connect ECONNREFUSED: no server listening on port {0}")]
    ConnectionRefused(u16),

    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    #[error("Cannot set headers after they are sent to the client")]
    HeadersSent,

    #[error("write after end")]
    WriteAfterEnd,

    #[error("Response channel closed before the handler responded")]
    ChannelClosed,
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

/// First port handed out for `listen(0)`
pub const DEFAULT_EPHEMERAL_PORT_START: u16 = 3000;

struct RegistryInner {
    ports: BTreeMap<u16, Weak<Server>>,
    ephemeral_start: u16,
}

/// Listening ports of one runtime session. Clones share one table.
#[derive(Clone)]
pub struct ServerRegistry {
    inner: Rc<RefCell<RegistryInner>>,
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_EPHEMERAL_PORT_START)
    }
}

impl ServerRegistry {
    pub fn new(ephemeral_start: u16) -> Self {
        Self {
            inner: Rc::new(RefCell::new(RegistryInner {
                ports: BTreeMap::new(),
                ephemeral_start,
            })),
        }
    }

    fn live(&self, port: u16) -> Option<Rc<Server>> {
        self.inner.borrow().ports.get(&port).and_then(Weak::upgrade)
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.live(port).is_some()
    }

    pub fn ports(&self) -> Vec<u16> {
        self.inner
            .borrow()
            .ports
            .iter()
            .filter(|(_, server)| server.strong_count() > 0)
            .map(|(port, _)| *port)
            .collect()
    }

    /// Claim `port` (0 picks the first free port from the ephemeral start)
    fn claim(&self, port: u16, server: &Rc<Server>) -> ServerResult<u16> {
        let mut inner = self.inner.borrow_mut();
        inner.ports.retain(|_, existing| existing.strong_count() > 0);

        let port = if port == 0 {
            let start = inner.ephemeral_start;
            (start..=u16::MAX)
                .find(|candidate| !inner.ports.contains_key(candidate))
                .ok_or(ServerError::NoFreePort(start))?
        } else if inner.ports.contains_key(&port) {
            return Err(ServerError::AddressInUse(port));
        } else {
            port
        };
        inner.ports.insert(port, Rc::downgrade(server));
        Ok(port)
    }

    fn release(&self, port: u16) {
        self.inner.borrow_mut().ports.remove(&port);
    }

    /// Hand a request to the server on `port` and wait for its response
    pub async fn dispatch(&self, port: u16, request: InjectedRequest) -> ServerResult<InjectedResponse> {
        let server = self.live(port).ok_or(ServerError::ConnectionRefused(port))?;
        debug!(port, method = %request.method, url = %request.url, "dispatching in-process request");

        let (tx, rx) = oneshot::channel();
        let response = Rc::new(ServerResponse::new(tx));
        let message = Rc::new(IncomingMessage::request(
            request.method,
            request.url,
            request.headers,
            request.body,
        ));
        server.events.emit(&ServerEvent::Request(message, response));
        drop(server);

        rx.await.map_err(|_| ServerError::ChannelClosed)
    }
}

/// A request delivered without a network round trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedRequest {
    pub method: String,
    /// Path and query
    pub url: String,
    pub headers: Headers,
    pub body: Buffer,
}

impl InjectedRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Headers::new(),
            body: Buffer::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedResponse {
    pub status_code: u16,
    pub status_message: String,
    pub headers: Headers,
    pub body: Buffer,
}

impl InjectedResponse {
    pub fn text(&self) -> String {
        self.body.to_text()
    }
}

impl From<InjectedResponse> for IncomingMessage {
    fn from(response: InjectedResponse) -> Self {
        IncomingMessage::response(
            response.status_code,
            response.status_message,
            response.headers,
            response.body,
        )
    }
}

#[derive(Clone)]
pub enum ServerEvent {
    Listening(u16),
    Request(Rc<IncomingMessage>, Rc<ServerResponse>),
    Close,
}

/// `http.Server` without a socket
pub struct Server {
    registry: ServerRegistry,
    port: Cell<Option<u16>>,
    events: EventEmitter<ServerEvent>,
}

impl Server {
    pub fn new(registry: ServerRegistry) -> Rc<Self> {
        Rc::new(Self {
            registry,
            port: Cell::new(None),
            events: EventEmitter::new(),
        })
    }

    pub fn on(&self, listener: impl FnMut(&ServerEvent) + 'static) -> ListenerId {
        self.events.on(listener)
    }

    /// Register a request handler (`http.createServer(handler)`)
    pub fn on_request(
        &self,
        mut handler: impl FnMut(&Rc<IncomingMessage>, &Rc<ServerResponse>) + 'static,
    ) -> ListenerId {
        self.events.on(move |event| {
            if let ServerEvent::Request(request, response) = event {
                handler(request, response);
            }
        })
    }

    /// Start accepting requests on `port` and return the bound port
    pub fn listen(self: &Rc<Self>, port: u16) -> ServerResult<u16> {
        if let Some(current) = self.port.get() {
            return Err(ServerError::AlreadyListening(current));
        }
        let bound = self.registry.claim(port, self).inspect_err(|err| {
            warn!(port, error = %err, "listen failed");
        })?;
        self.port.set(Some(bound));
        debug!(port = bound, "server listening");
        self.events.emit(&ServerEvent::Listening(bound));
        Ok(bound)
    }

    /// Stop accepting requests. In-flight responses still complete.
    pub fn close(&self) -> ServerResult<()> {
        let port = self.port.take().ok_or(ServerError::NotRunning)?;
        self.registry.release(port);
        debug!(port, "server closed");
        self.events.emit(&ServerEvent::Close);
        Ok(())
    }

    /// The bound port while listening
    pub fn address(&self) -> Option<u16> {
        self.port.get()
    }

    pub fn is_listening(&self) -> bool {
        self.port.get().is_some()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(port) = self.port.take() {
            self.registry.release(port);
        }
    }
}

struct ResponseState {
    status_code: u16,
    status_message: Option<String>,
    headers: Headers,
    headers_sent: bool,
    body: Vec<u8>,
    finished: bool,
}

/// `http.ServerResponse`
pub struct ServerResponse {
    state: RefCell<ResponseState>,
    reply: RefCell<Option<oneshot::Sender<InjectedResponse>>>,
}

impl ServerResponse {
    fn new(reply: oneshot::Sender<InjectedResponse>) -> Self {
        Self {
            state: RefCell::new(ResponseState {
                status_code: 200,
                status_message: None,
                headers: Headers::new(),
                headers_sent: false,
                body: Vec::new(),
                finished: false,
            }),
            reply: RefCell::new(Some(reply)),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.state.borrow().status_code
    }

    pub fn set_status_code(&self, status: u16) -> ServerResult<()> {
        if !(100..=999).contains(&status) {
            return Err(ServerError::InvalidStatusCode(status));
        }
        let mut state = self.state.borrow_mut();
        if state.headers_sent {
            return Err(ServerError::HeadersSent);
        }
        state.status_code = status;
        Ok(())
    }

    /// Explicit message, else the canonical phrase for the status code
    pub fn status_message(&self) -> String {
        let state = self.state.borrow();
        state
            .status_message
            .clone()
            .unwrap_or_else(|| status_text(state.status_code).to_string())
    }

    pub fn set_status_message(&self, message: impl Into<String>) {
        self.state.borrow_mut().status_message = Some(message.into());
    }

    pub fn get_header(&self, name: &str) -> Option<String> {
        self.state.borrow().headers.get(name).map(str::to_string)
    }

    pub fn set_header(&self, name: &str, value: impl Into<String>) -> ServerResult<()> {
        let mut state = self.state.borrow_mut();
        if state.headers_sent {
            return Err(ServerError::HeadersSent);
        }
        state.headers.set(name, value);
        Ok(())
    }

    pub fn remove_header(&self, name: &str) -> ServerResult<bool> {
        let mut state = self.state.borrow_mut();
        if state.headers_sent {
            return Err(ServerError::HeadersSent);
        }
        Ok(state.headers.remove(name))
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.state.borrow().headers.has(name)
    }

    pub fn headers_sent(&self) -> bool {
        self.state.borrow().headers_sent
    }

    pub fn finished(&self) -> bool {
        self.state.borrow().finished
    }

    /// Set status and headers in one call and mark them sent
    pub fn write_head(
        &self,
        status: u16,
        status_message: Option<&str>,
        headers: &[(&str, &str)],
    ) -> ServerResult<()> {
        self.set_status_code(status)?;
        let mut state = self.state.borrow_mut();
        if let Some(message) = status_message {
            state.status_message = Some(message.to_string());
        }
        for (name, value) in headers {
            state.headers.set(*name, *value);
        }
        state.headers_sent = true;
        Ok(())
    }

    /// Stream a body chunk. Without a content length the response becomes
    /// chunked.
    pub fn write(&self, chunk: impl Into<Buffer>) -> ServerResult<()> {
        let mut state = self.state.borrow_mut();
        if state.finished {
            return Err(ServerError::WriteAfterEnd);
        }
        if !state.headers_sent {
            if !state.headers.has("content-length") {
                state.headers.set("transfer-encoding", "chunked");
            }
            state.headers_sent = true;
        }
        state.body.extend_from_slice(&chunk.into());
        Ok(())
    }

    /// Finish the response and deliver it to whoever is waiting
    pub fn end(&self, chunk: Option<Buffer>) -> ServerResult<()> {
        let response = {
            let mut state = self.state.borrow_mut();
            if state.finished {
                return Err(ServerError::WriteAfterEnd);
            }
            if let Some(chunk) = chunk {
                state.body.extend_from_slice(&chunk);
            }
            if !state.headers.has("transfer-encoding") && !state.headers.has("content-length") {
                let length = state.body.len().to_string();
                state.headers.set("content-length", length);
            }
            state.headers_sent = true;
            state.finished = true;

            InjectedResponse {
                status_code: state.status_code,
                status_message: state
                    .status_message
                    .clone()
                    .unwrap_or_else(|| status_text(state.status_code).to_string()),
                headers: state.headers.clone(),
                body: Buffer::from(std::mem::take(&mut state.body)),
            }
        };

        let reply = self.reply.borrow_mut().take();
        if let Some(reply) = reply {
            // The requester may have gone away (aborted or timed out)
            if reply.send(response).is_err() {
                debug!("response finished after the requester left");
            }
        }
        Ok(())
    }
}
