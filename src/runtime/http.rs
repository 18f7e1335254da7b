//! HTTP client shim
//!
//! `ClientRequest` mirrors Node's `http.request`: headers and body chunks are
//! collected until `end`, which picks one route for the request:
//! - upgrade headers go to the WebSocket bridge before any network call
//! - loopback hosts with a registered virtual server are dispatched in
//!   process through the session's [`ServerRegistry`]
//! - everything else is one call to the host's [`NativeFetch`]
//!
//! Outcomes are reported both as the `end` result and as [`ClientEvent`]s.

use super::buffer::Buffer;
use super::events::{EventEmitter, ListenerId};
use super::handshake::is_upgrade_request;
use super::websocket::{MockSocket, NativeWebSocketFactory, Upgraded, open_bridge};
use crate::server::{InjectedRequest, ServerError, ServerRegistry};
use futures_util::future::{AbortHandle, Abortable, LocalBoxFuture};
use http::Method;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Failure reported by the host's network primitives
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct NetworkError {
    pub message: String,
}

impl NetworkError {
    /// The browser's only description of a failed fetch
    pub const FAILED_TO_FETCH: &'static str = "Failed to fetch";

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn failed_to_fetch() -> Self {
        Self::new(Self::FAILED_TO_FETCH)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("{0}")]
    Network(#[from] NetworkError),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("socket hang up")]
    Aborted,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Protocol \"{0}\" not supported")]
    UnsupportedProtocol(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("write after end")]
    WriteAfterEnd,

    #[error("Cannot set headers after they are sent")]
    HeadersSent,

    #[error(transparent)]
    Server(#[from] ServerError),
}

pub type RequestResult<T> = Result<T, RequestError>;

/// Ordered header list with case-insensitive names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect()
    }

    /// Replace every value of `name`, keeping the position of the first one
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(&name))
        {
            Some(index) => {
                self.entries[index] = (name.clone(), value);
                let mut seen = 0;
                self.entries.retain(|(key, _)| {
                    if !key.eq_ignore_ascii_case(&name) {
                        return true;
                    }
                    seen += 1;
                    seen == 1
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

/// Canonical reason phrase for a status code
pub fn status_text(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("")
}

/// A request as seen by a server handler, or a response as seen by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub http_version: &'static str,
    /// Set on server-side requests
    pub method: Option<String>,
    /// Path and query, set on server-side requests
    pub url: Option<String>,
    /// Set on client-side responses
    pub status_code: Option<u16>,
    pub status_message: Option<String>,
    pub headers: Headers,
    pub body: Buffer,
}

impl IncomingMessage {
    pub fn request(
        method: impl Into<String>,
        url: impl Into<String>,
        headers: Headers,
        body: Buffer,
    ) -> Self {
        Self {
            http_version: "1.1",
            method: Some(method.into()),
            url: Some(url.into()),
            status_code: None,
            status_message: None,
            headers,
            body,
        }
    }

    pub fn response(
        status: u16,
        status_message: impl Into<String>,
        headers: Headers,
        body: Buffer,
    ) -> Self {
        Self {
            http_version: "1.1",
            method: None,
            url: None,
            status_code: Some(status),
            status_message: Some(status_message.into()),
            headers,
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn text(&self) -> String {
        self.body.to_text()
    }

    /// Parse the body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_slice(&self.body).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Headers,
    pub body: Option<Buffer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: Buffer,
}

/// The browser's `fetch`
pub trait NativeFetch {
    fn fetch(&self, request: FetchRequest) -> LocalBoxFuture<'_, Result<FetchResponse, NetworkError>>;
}

/// `http.request(options)` in object form
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Option<String>,
    /// `http:` or `https:`
    pub protocol: Option<String>,
    /// May carry a port: `example.com:8080`
    pub host: Option<String>,
    /// Wins over `host` when both are set
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub headers: Headers,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum RequestTarget {
    Url(String),
    Options(RequestOptions),
}

impl From<&str> for RequestTarget {
    fn from(url: &str) -> Self {
        RequestTarget::Url(url.to_string())
    }
}

impl From<String> for RequestTarget {
    fn from(url: String) -> Self {
        RequestTarget::Url(url)
    }
}

impl From<RequestOptions> for RequestTarget {
    fn from(options: RequestOptions) -> Self {
        RequestTarget::Options(options)
    }
}

/// A request target after normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Headers,
    pub timeout: Option<Duration>,
}

impl PreparedRequest {
    /// Path plus query, as a server sees it
    pub fn path_and_query(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }
}

fn parse_method(method: &str) -> RequestResult<Method> {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| RequestError::InvalidMethod(method.to_string()))
}

/// `example.com:8080` -> (`example.com`, 8080); `[::1]:3000` -> (`::1`, 3000)
fn split_host_port(host: &str) -> (String, Option<u16>) {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some((address, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (address.to_string(), port);
        }
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') => match port.parse() {
            Ok(port) => (name.to_string(), Some(port)),
            Err(_) => (host.to_string(), None),
        },
        _ => (host.to_string(), None),
    }
}

impl RequestTarget {
    pub fn normalize(self) -> RequestResult<PreparedRequest> {
        match self {
            RequestTarget::Url(text) => {
                let url = Url::parse(&text)
                    .map_err(|e| RequestError::InvalidUrl(format!("{}: {}", text, e)))?;
                check_protocol(&url)?;
                Ok(PreparedRequest {
                    method: Method::GET,
                    url,
                    headers: Headers::new(),
                    timeout: None,
                })
            }
            RequestTarget::Options(options) => {
                let method = parse_method(options.method.as_deref().unwrap_or("GET"))?;
                let scheme = options
                    .protocol
                    .as_deref()
                    .unwrap_or("http:")
                    .trim_end_matches(':')
                    .to_ascii_lowercase();

                let (name, host_port) = match (&options.hostname, &options.host) {
                    (Some(hostname), _) => (hostname.clone(), None),
                    (None, Some(host)) => split_host_port(host),
                    (None, None) => ("localhost".to_string(), None),
                };
                let authority = if name.contains(':') {
                    format!("[{}]", name)
                } else {
                    name
                };
                let port = options
                    .port
                    .or(host_port)
                    .map(|port| format!(":{}", port))
                    .unwrap_or_default();
                let path = match options.path.as_deref() {
                    None | Some("") => "/".to_string(),
                    Some(path) if path.starts_with('/') => path.to_string(),
                    Some(path) => format!("/{}", path),
                };

                let text = format!("{}://{}{}{}", scheme, authority, port, path);
                let url = Url::parse(&text)
                    .map_err(|e| RequestError::InvalidUrl(format!("{}: {}", text, e)))?;
                check_protocol(&url)?;
                Ok(PreparedRequest {
                    method,
                    url,
                    headers: options.headers,
                    timeout: options.timeout,
                })
            }
        }
    }
}

fn check_protocol(url: &Url) -> RequestResult<()> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(RequestError::UnsupportedProtocol(format!("{}:", other))),
    }
}

pub fn is_loopback(url: &Url) -> bool {
    matches!(
        url.host_str(),
        Some("localhost" | "127.0.0.1" | "0.0.0.0" | "[::1]" | "::1")
    )
}

#[derive(Clone)]
pub enum ClientEvent {
    Response(Rc<IncomingMessage>),
    Upgrade {
        response: Rc<IncomingMessage>,
        socket: Rc<MockSocket>,
        head: Buffer,
    },
    Timeout,
    Error(RequestError),
    Abort,
    Close,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Response(_) => "response",
            ClientEvent::Upgrade { .. } => "upgrade",
            ClientEvent::Timeout => "timeout",
            ClientEvent::Error(_) => "error",
            ClientEvent::Abort => "abort",
            ClientEvent::Close => "close",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Upgrade,
    InProcess(u16),
    Native,
}

enum Reply {
    Response(IncomingMessage),
    Upgrade(Upgraded),
}

/// Handles to the host primitives and the session's virtual servers
#[derive(Clone)]
pub struct HttpClient {
    fetch: Option<Rc<dyn NativeFetch>>,
    websockets: Option<Rc<dyn NativeWebSocketFactory>>,
    servers: ServerRegistry,
    handshake_guid: String,
    timeout: Option<Duration>,
}

impl HttpClient {
    pub fn new(
        fetch: Option<Rc<dyn NativeFetch>>,
        websockets: Option<Rc<dyn NativeWebSocketFactory>>,
        servers: ServerRegistry,
        handshake_guid: impl Into<String>,
    ) -> Self {
        Self {
            fetch,
            websockets,
            servers,
            handshake_guid: handshake_guid.into(),
            timeout: None,
        }
    }

    /// Timeout applied to requests that do not set their own
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn request(&self, target: impl Into<RequestTarget>) -> RequestResult<Rc<ClientRequest>> {
        let mut prepared = target.into().normalize()?;
        if prepared.timeout.is_none() {
            prepared.timeout = self.timeout;
        }
        Ok(Rc::new(ClientRequest {
            client: self.clone(),
            request: RefCell::new(prepared),
            chunks: RefCell::new(Vec::new()),
            phase: Cell::new(Phase::Open),
            abort_handle: RefCell::new(None),
            events: EventEmitter::new(),
        }))
    }

    /// `http.get`: a GET request ended immediately
    pub async fn get(&self, target: impl Into<RequestTarget>) -> RequestResult<Rc<IncomingMessage>> {
        let request = self.request(target)?;
        request.end().await
    }

    pub fn route(&self, request: &PreparedRequest) -> Route {
        if is_upgrade_request(&request.headers) {
            return Route::Upgrade;
        }
        match request.url.port_or_known_default() {
            Some(port) if is_loopback(&request.url) && self.servers.is_listening(port) => {
                Route::InProcess(port)
            }
            _ => Route::Native,
        }
    }

    fn send(&self, route: Route, request: PreparedRequest, body: Buffer) -> LocalBoxFuture<'static, RequestResult<Reply>> {
        match route {
            Route::Upgrade => {
                let factory = self.websockets.clone();
                let guid = self.handshake_guid.clone();
                Box::pin(async move {
                    let upgraded = open_bridge(factory, request.url, request.headers, guid).await?;
                    Ok(Reply::Upgrade(upgraded))
                })
            }
            Route::InProcess(port) => {
                let servers = self.servers.clone();
                Box::pin(async move {
                    let mut headers = request.headers.clone();
                    if !headers.has("host") {
                        headers.set("host", format!("localhost:{}", port));
                    }
                    let injected = InjectedRequest {
                        method: request.method.to_string(),
                        url: request.path_and_query(),
                        headers,
                        body,
                    };
                    let response = servers.dispatch(port, injected).await?;
                    Ok(Reply::Response(response.into()))
                })
            }
            Route::Native => {
                let fetch = self.fetch.clone();
                Box::pin(async move {
                    let fetch = fetch.ok_or_else(NetworkError::failed_to_fetch)?;
                    let body = (!body.is_empty()).then_some(body);
                    let response = fetch
                        .fetch(FetchRequest {
                            method: request.method,
                            url: request.url,
                            headers: request.headers,
                            body,
                        })
                        .await?;
                    Ok(Reply::Response(IncomingMessage::response(
                        response.status,
                        response.status_text,
                        response.headers,
                        response.body,
                    )))
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    InFlight,
    Finished,
    Aborted,
}

/// An outgoing request (`http.ClientRequest`)
pub struct ClientRequest {
    client: HttpClient,
    request: RefCell<PreparedRequest>,
    chunks: RefCell<Vec<Buffer>>,
    phase: Cell<Phase>,
    abort_handle: RefCell<Option<AbortHandle>>,
    events: EventEmitter<ClientEvent>,
}

impl ClientRequest {
    pub fn on(&self, listener: impl FnMut(&ClientEvent) + 'static) -> ListenerId {
        self.events.on(listener)
    }

    pub fn once(&self, listener: impl FnMut(&ClientEvent) + 'static) -> ListenerId {
        self.events.once(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    pub fn method(&self) -> Method {
        self.request.borrow().method.clone()
    }

    pub fn url(&self) -> Url {
        self.request.borrow().url.clone()
    }

    pub fn get_header(&self, name: &str) -> Option<String> {
        self.request.borrow().headers.get(name).map(str::to_string)
    }

    pub fn set_header(&self, name: &str, value: impl Into<String>) -> RequestResult<()> {
        self.ensure_open()?;
        self.request.borrow_mut().headers.set(name, value);
        Ok(())
    }

    pub fn remove_header(&self, name: &str) -> RequestResult<bool> {
        self.ensure_open()?;
        Ok(self.request.borrow_mut().headers.remove(name))
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.request.borrow_mut().timeout = Some(timeout);
    }

    fn ensure_open(&self) -> RequestResult<()> {
        match self.phase.get() {
            Phase::Open => Ok(()),
            Phase::Aborted => Err(RequestError::Aborted),
            Phase::InFlight | Phase::Finished => Err(RequestError::HeadersSent),
        }
    }

    /// Buffer a body chunk; everything is sent as one body on `end`
    pub fn write(&self, chunk: impl Into<Buffer>) -> RequestResult<()> {
        match self.phase.get() {
            Phase::Open => {
                self.chunks.borrow_mut().push(chunk.into());
                Ok(())
            }
            Phase::Aborted => Err(RequestError::Aborted),
            Phase::InFlight | Phase::Finished => Err(RequestError::WriteAfterEnd),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.phase.get() == Phase::Aborted
    }

    /// Cancel the request; nothing from the in-flight call is observed after
    /// this returns
    pub fn abort(&self) {
        if matches!(self.phase.get(), Phase::Finished | Phase::Aborted) {
            return;
        }
        self.phase.set(Phase::Aborted);
        let handle = self.abort_handle.borrow_mut().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        debug!(url = %self.request.borrow().url, "request aborted");
        self.events.emit(&ClientEvent::Abort);
        self.events.emit(&ClientEvent::Close);
    }

    /// Send the request and wait for the outcome
    pub async fn end(&self) -> RequestResult<Rc<IncomingMessage>> {
        match self.phase.get() {
            Phase::Open => {}
            Phase::Aborted => return Err(RequestError::Aborted),
            Phase::InFlight | Phase::Finished => return Err(RequestError::WriteAfterEnd),
        }
        self.phase.set(Phase::InFlight);

        let request = self.request.borrow().clone();
        let body = {
            let chunks = self.chunks.borrow();
            Buffer::concat(chunks.iter())
        };
        self.chunks.borrow_mut().clear();

        let route = self.client.route(&request);
        debug!(method = %request.method, url = %request.url, ?route, "sending request");
        let timeout = request.timeout;

        let (handle, registration) = AbortHandle::new_pair();
        *self.abort_handle.borrow_mut() = Some(handle);
        let call = Abortable::new(self.client.send(route, request, body), registration);

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.abort_handle.borrow_mut().take();
                    self.phase.set(Phase::Finished);
                    let err = RequestError::Timeout(limit.as_millis() as u64);
                    warn!(error = %err, "request timed out");
                    self.events.emit(&ClientEvent::Timeout);
                    self.events.emit(&ClientEvent::Error(err.clone()));
                    self.events.emit(&ClientEvent::Close);
                    return Err(err);
                }
            },
            None => call.await,
        };
        self.abort_handle.borrow_mut().take();

        let Ok(reply) = outcome else {
            return Err(RequestError::Aborted);
        };
        self.phase.set(Phase::Finished);

        match reply {
            Ok(Reply::Response(message)) => {
                let message = Rc::new(message);
                self.events.emit(&ClientEvent::Response(Rc::clone(&message)));
                self.events.emit(&ClientEvent::Close);
                Ok(message)
            }
            Ok(Reply::Upgrade(upgraded)) => {
                let response = Rc::new(upgraded.response);
                self.events.emit(&ClientEvent::Upgrade {
                    response: Rc::clone(&response),
                    socket: upgraded.socket,
                    head: Buffer::new(),
                });
                Ok(response)
            }
            Err(err) => {
                warn!(error = %err, "request failed");
                self.events.emit(&ClientEvent::Error(err.clone()));
                self.events.emit(&ClientEvent::Close);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use crate::testing::FakeFetch;
    use pretty_assertions::assert_eq;

    fn options() -> RequestOptions {
        RequestOptions::default()
    }

    fn url_of(options: RequestOptions) -> String {
        RequestTarget::Options(options)
            .normalize()
            .unwrap()
            .url
            .to_string()
    }

    fn client(fetch: Option<Rc<FakeFetch>>, servers: ServerRegistry) -> HttpClient {
        let fetch = fetch.map(|fetch| fetch as Rc<dyn NativeFetch>);
        HttpClient::new(fetch, None, servers, crate::runtime::handshake::WEBSOCKET_GUID)
    }

    fn record(request: &ClientRequest) -> Rc<RefCell<Vec<&'static str>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        request.on(move |event| sink.borrow_mut().push(event.name()));
        log
    }

    #[test]
    fn test_headers_case_insensitive_and_ordered() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "text/plain");
        headers.append("X-Tag", "a");
        headers.append("x-tag", "b");
        headers.set("Accept", "*/*");

        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get_all("X-TAG"), vec!["a", "b"]);

        headers.set("X-TAG", "c");
        let names: Vec<&str> = headers.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["Content-Type", "X-TAG", "Accept"]);

        assert!(headers.remove("accept"));
        assert!(!headers.has("Accept"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_url_building() {
        assert_eq!(url_of(options()), "http://localhost/");
        assert_eq!(
            url_of(RequestOptions {
                host: Some("example.com:8080".into()),
                path: Some("/a?b=1".into()),
                ..options()
            }),
            "http://example.com:8080/a?b=1"
        );
        assert_eq!(
            url_of(RequestOptions {
                host: Some("ignored.test:9".into()),
                hostname: Some("api.test".into()),
                port: Some(3000),
                ..options()
            }),
            "http://api.test:3000/"
        );
        assert_eq!(
            url_of(RequestOptions {
                protocol: Some("https:".into()),
                hostname: Some("::1".into()),
                port: Some(8443),
                path: Some("x".into()),
                ..options()
            }),
            "https://[::1]:8443/x"
        );
    }

    #[test]
    fn test_target_errors() {
        assert!(matches!(
            RequestTarget::from("ftp://files.test/").normalize(),
            Err(RequestError::UnsupportedProtocol(p)) if p == "ftp:"
        ));
        assert!(matches!(
            RequestTarget::from("not a url").normalize(),
            Err(RequestError::InvalidUrl(_))
        ));
        assert!(matches!(
            RequestTarget::Options(RequestOptions {
                method: Some("GE T".into()),
                ..options()
            })
            .normalize(),
            Err(RequestError::InvalidMethod(_))
        ));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("a.test"), ("a.test".to_string(), None));
        assert_eq!(split_host_port("a.test:81"), ("a.test".to_string(), Some(81)));
        assert_eq!(split_host_port("[::1]:3000"), ("::1".to_string(), Some(3000)));
        assert_eq!(split_host_port("a.test:nope"), ("a.test:nope".to_string(), None));
    }

    #[tokio::test]
    async fn test_native_fetch_receives_one_buffered_body() {
        let fetch = Rc::new(FakeFetch::ok(201, "created"));
        let client = client(Some(fetch.clone()), ServerRegistry::default());

        let request = client
            .request(RequestOptions {
                method: Some("post".into()),
                hostname: Some("api.test".into()),
                path: Some("/items".into()),
                ..options()
            })
            .unwrap();
        request.set_header("Content-Type", "application/json").unwrap();
        request.write("{\"a\":").unwrap();
        request.write("1}").unwrap();
        let log = record(&request);

        let response = request.end().await.unwrap();
        assert_eq!(response.status_code, Some(201));
        assert_eq!(response.text(), "created");
        assert_eq!(*log.borrow(), vec!["response", "close"]);

        let calls = fetch.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, Method::POST);
        assert_eq!(calls[0].url.as_str(), "http://api.test/items");
        assert_eq!(calls[0].body.as_ref().map(Buffer::to_text), Some("{\"a\":1}".to_string()));
        assert_eq!(calls[0].headers.get("content-type"), Some("application/json"));

        assert_eq!(request.write("late"), Err(RequestError::WriteAfterEnd));
        assert_eq!(request.set_header("x", "y"), Err(RequestError::HeadersSent));
    }

    #[tokio::test]
    async fn test_network_failure_emits_error_then_close() {
        let fetch = Rc::new(FakeFetch::failing());
        let client = client(Some(fetch), ServerRegistry::default());
        let request = client.request("http://down.test/").unwrap();
        let log = record(&request);

        let err = request.end().await.unwrap_err();
        assert_eq!(err, RequestError::Network(NetworkError::failed_to_fetch()));
        assert_eq!(*log.borrow(), vec!["error", "close"]);
    }

    #[tokio::test]
    async fn test_timeout_emits_timeout_then_error() {
        let fetch = Rc::new(FakeFetch::ok(200, "slow").with_delay(Duration::from_millis(500)));
        let client = client(Some(fetch.clone()), ServerRegistry::default());
        let request = client.request("http://slow.test/").unwrap();
        request.set_timeout(Duration::from_millis(20));
        let log = record(&request);

        let err = request.end().await.unwrap_err();
        assert_eq!(err, RequestError::Timeout(20));
        assert_eq!(*log.borrow(), vec!["timeout", "error", "close"]);
        assert_eq!(fetch.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_abort_suppresses_in_flight_outcome() {
        let fetch = Rc::new(FakeFetch::ok(200, "late").with_delay(Duration::from_millis(50)));
        let client = client(Some(fetch), ServerRegistry::default());
        let request = client.request("http://slow.test/").unwrap();
        let log = record(&request);

        let aborter = Rc::clone(&request);
        let (result, ()) = tokio::join!(request.end(), async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            aborter.abort();
        });

        assert_eq!(result, Err(RequestError::Aborted));
        assert_eq!(*log.borrow(), vec!["abort", "close"]);
        assert!(request.is_aborted());
        request.abort();
        assert_eq!(log.borrow().len(), 2);
    }

    #[tokio::test]
    async fn test_loopback_dispatches_to_virtual_server() {
        let fetch = Rc::new(FakeFetch::ok(200, "network"));
        let servers = ServerRegistry::new(3000);
        let server = Server::new(servers.clone());
        server.on_request(|req, res| {
            let reply = format!(
                "{} {} {}",
                req.method.as_deref().unwrap_or(""),
                req.url.as_deref().unwrap_or(""),
                req.text()
            );
            res.set_header("x-served-by", "virtual").unwrap();
            res.end(Some(reply.into())).unwrap();
        });
        let port = server.listen(0).unwrap();

        let client = client(Some(fetch.clone()), servers);
        let request = client
            .request(format!("http://localhost:{}/echo?q=1", port))
            .unwrap();
        request.write("ping").unwrap();
        assert_eq!(client.route(&request.request.borrow()), Route::InProcess(port));

        let response = request.end().await.unwrap();
        assert_eq!(response.status_code, Some(200));
        assert_eq!(response.status_message.as_deref(), Some("OK"));
        assert_eq!(response.header("X-Served-By"), Some("virtual"));
        assert_eq!(response.text(), "GET /echo?q=1 ping");
        assert!(fetch.calls().is_empty());

        // other hosts on the same port still go to the network
        let remote = client.request(format!("http://remote.test:{}/", port)).unwrap();
        assert_eq!(remote.end().await.unwrap().text(), "network");
        assert_eq!(fetch.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_no_fetch_is_a_network_error() {
        let client = client(None, ServerRegistry::default());
        let err = client.get("http://anywhere.test/").await.unwrap_err();
        assert_eq!(err.to_string(), NetworkError::FAILED_TO_FETCH);
    }
}
