//! WebSocket upgrade bridge
//!
//! Client libraries written for Node perform an HTTP upgrade and then speak
//! raw frames over a socket. The browser only offers a message-oriented
//! WebSocket. The bridge sits between the two:
//!
//! - the upgrade request opens a native WebSocket to the same target
//!   (`http` -> `ws`, `https` -> `wss`) and answers with a synthesized
//!   `101 Switching Protocols`
//! - bytes the library writes to the [`MockSocket`] are decoded into frames
//!   and forwarded as native messages
//! - native messages come back as unmasked frames on the readable side
//!
//! State moves `Opening -> Open -> Closing -> Closed`; either side closing
//! ends the session.

use super::buffer::Buffer;
use super::events::{EventEmitter, ListenerId};
use super::frame::{self, CLOSE_NORMAL, Frame, FrameResult, OpCode, parse_close_payload};
use super::handshake::{accept_key, generate_nonce};
use super::http::{Headers, IncomingMessage, NetworkError};
use bytes::{Buf, BytesMut};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeMessage {
    Text(String),
    Binary(Buffer),
}

/// What the host reports about a native socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeSocketEvent {
    Open,
    Message(NativeMessage),
    Close { code: Option<u16>, reason: String },
    Error,
}

/// `WebSocket.readyState`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// A browser WebSocket
pub trait NativeWebSocket {
    fn send(&self, message: NativeMessage);

    fn close(&self, code: Option<u16>, reason: &str);

    fn ready_state(&self) -> ReadyState;

    /// Subprotocol the server selected
    fn protocol(&self) -> Option<String> {
        None
    }
}

/// Opens browser WebSockets. The host reports socket events through the
/// given sink.
pub trait NativeWebSocketFactory {
    fn connect(
        &self,
        url: &Url,
        protocols: &[String],
        sink: NativeSocketSink,
    ) -> Result<Rc<dyn NativeWebSocket>, NetworkError>;
}

/// Where the host delivers native socket events. Events for a finished
/// session are dropped.
#[derive(Clone)]
pub struct NativeSocketSink {
    socket: Weak<MockSocket>,
}

impl NativeSocketSink {
    pub fn deliver(&self, event: NativeSocketEvent) {
        match self.socket.upgrade() {
            Some(socket) => socket.on_native_event(event),
            None => trace!(?event, "native event for a dropped bridge"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Events on the readable side of a [`MockSocket`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Data(Buffer),
    End,
    Close,
    Error(NetworkError),
}

/// The socket handed to the client library in the `upgrade` event
pub struct MockSocket {
    url: Url,
    state: Cell<BridgeState>,
    native: RefCell<Option<Rc<dyn NativeWebSocket>>>,
    outbound: RefCell<BytesMut>,
    fragments: RefCell<Option<(OpCode, Vec<u8>)>>,
    readable: RefCell<VecDeque<SocketEvent>>,
    events: EventEmitter<SocketEvent>,
    flushing: Cell<bool>,
    opened: RefCell<Option<oneshot::Sender<Result<(), NetworkError>>>>,
}

impl fmt::Debug for MockSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSocket")
            .field("url", &self.url.as_str())
            .field("state", &self.state.get())
            .field("retained", &self.outbound.borrow().len())
            .finish()
    }
}

impl MockSocket {
    fn new(url: Url, opened: oneshot::Sender<Result<(), NetworkError>>) -> Self {
        Self {
            url,
            state: Cell::new(BridgeState::Opening),
            native: RefCell::new(None),
            outbound: RefCell::new(BytesMut::new()),
            fragments: RefCell::new(None),
            readable: RefCell::new(VecDeque::new()),
            events: EventEmitter::new(),
            flushing: Cell::new(false),
            opened: RefCell::new(Some(opened)),
        }
    }

    /// The `ws:`/`wss:` URL of the native socket
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> BridgeState {
        self.state.get()
    }

    /// Bytes of an incomplete frame waiting for the next write
    pub fn retained(&self) -> usize {
        self.outbound.borrow().len()
    }

    /// Attach a listener; events buffered so far are delivered to it at once
    pub fn on(&self, listener: impl FnMut(&SocketEvent) + 'static) -> ListenerId {
        let id = self.events.on(listener);
        self.flush();
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    fn set_state(&self, next: BridgeState) {
        let previous = self.state.replace(next);
        if previous != next {
            debug!(url = %self.url, from = ?previous, to = ?next, "bridge state");
        }
    }

    fn native(&self) -> Option<Rc<dyn NativeWebSocket>> {
        self.native.borrow().clone()
    }

    fn push_readable(&self, event: SocketEvent) {
        self.readable.borrow_mut().push_back(event);
        if self.events.listener_count() > 0 {
            self.flush();
        }
    }

    /// Deliver buffered events in order. Events pushed by a listener while
    /// a flush runs are picked up by the outer drain.
    fn flush(&self) {
        if self.flushing.replace(true) {
            return;
        }
        loop {
            let next = self.readable.borrow_mut().pop_front();
            match next {
                Some(event) => {
                    self.events.emit(&event);
                }
                None => break,
            }
        }
        self.flushing.set(false);
    }

    /// Feed bytes written by the client library. Complete frames are
    /// forwarded, a trailing partial frame is kept for the next write.
    /// Returns the number of frames handled.
    pub fn write(&self, data: &[u8]) -> FrameResult<usize> {
        if self.state.get() == BridgeState::Closed {
            trace!(len = data.len(), "write to closed bridge ignored");
            return Ok(0);
        }
        self.outbound.borrow_mut().extend_from_slice(data);

        let mut handled = 0;
        loop {
            let decoded = frame::decode(&self.outbound.borrow());
            match decoded {
                Ok(None) => break,
                Ok(Some((frame, used))) => {
                    self.outbound.borrow_mut().advance(used);
                    self.forward(frame);
                    handled += 1;
                }
                Err(err) => {
                    self.outbound.borrow_mut().clear();
                    warn!(url = %self.url, error = %err, "malformed frame from client");
                    self.push_readable(SocketEvent::Error(NetworkError::new(err.to_string())));
                    return Err(err);
                }
            }
        }
        Ok(handled)
    }

    /// Write `data`, then tear the session down
    pub fn end(&self, data: Option<&[u8]>) -> FrameResult<()> {
        if let Some(data) = data {
            self.write(data)?;
        }
        self.destroy();
        Ok(())
    }

    /// Close the native socket if it is still connecting or open
    pub fn destroy(&self) {
        if self.state.get() == BridgeState::Closed {
            return;
        }
        self.set_state(BridgeState::Closed);
        self.outbound.borrow_mut().clear();
        self.fragments.borrow_mut().take();

        let native = self.native.borrow_mut().take();
        if let Some(native) = native {
            if matches!(native.ready_state(), ReadyState::Connecting | ReadyState::Open) {
                native.close(Some(CLOSE_NORMAL), "");
            }
        }
        self.push_readable(SocketEvent::Close);
    }

    fn send_native(&self, opcode: OpCode, payload: Vec<u8>) {
        let message = match opcode {
            OpCode::Text => NativeMessage::Text(String::from_utf8_lossy(&payload).into_owned()),
            _ => NativeMessage::Binary(Buffer::from(payload)),
        };
        match self.native() {
            Some(native) => native.send(message),
            None => warn!(url = %self.url, "frame dropped: no native socket"),
        }
    }

    fn forward(&self, frame: Frame) {
        trace!(opcode = %frame.opcode, fin = frame.fin, len = frame.payload.len(), "client frame");
        match frame.opcode {
            OpCode::Text | OpCode::Binary if frame.fin => {
                self.send_native(frame.opcode, frame.payload);
            }
            OpCode::Text | OpCode::Binary => {
                *self.fragments.borrow_mut() = Some((frame.opcode, frame.payload));
            }
            OpCode::Continuation => {
                let started = self.fragments.borrow_mut().take();
                match started {
                    Some((opcode, mut payload)) => {
                        payload.extend_from_slice(&frame.payload);
                        if frame.fin {
                            self.send_native(opcode, payload);
                        } else {
                            *self.fragments.borrow_mut() = Some((opcode, payload));
                        }
                    }
                    None => warn!(url = %self.url, "continuation frame without a start"),
                }
            }
            OpCode::Close => {
                let (code, reason) = parse_close_payload(&frame.payload);
                self.set_state(BridgeState::Closing);
                if let Some(native) = self.native() {
                    native.close(code, &reason);
                }
            }
            OpCode::Ping => {
                let pong = frame::encode(&Frame::pong(frame.payload), None);
                self.push_readable(SocketEvent::Data(Buffer::from(pong)));
            }
            OpCode::Pong => {}
        }
    }

    fn on_native_event(&self, event: NativeSocketEvent) {
        match event {
            NativeSocketEvent::Open => {
                self.set_state(BridgeState::Open);
                let opened = self.opened.borrow_mut().take();
                if let Some(opened) = opened {
                    let _ = opened.send(Ok(()));
                }
            }
            NativeSocketEvent::Message(message) => {
                let frame = match message {
                    NativeMessage::Text(text) => Frame::text(&text),
                    NativeMessage::Binary(bytes) => Frame::binary(bytes.into_vec()),
                };
                self.push_readable(SocketEvent::Data(Buffer::from(frame::encode(&frame, None))));
            }
            NativeSocketEvent::Close { code, reason } => {
                let opened = self.opened.borrow_mut().take();
                if let Some(opened) = opened {
                    self.set_state(BridgeState::Closed);
                    let _ = opened.send(Err(NetworkError::failed_to_fetch()));
                    return;
                }
                if self.state.get() == BridgeState::Closed {
                    return;
                }
                self.set_state(BridgeState::Closed);
                self.native.borrow_mut().take();
                let close = frame::encode(&Frame::close(code, &reason), None);
                self.push_readable(SocketEvent::Data(Buffer::from(close)));
                self.push_readable(SocketEvent::End);
                self.push_readable(SocketEvent::Close);
            }
            NativeSocketEvent::Error => {
                let opened = self.opened.borrow_mut().take();
                match opened {
                    Some(opened) => {
                        self.set_state(BridgeState::Closed);
                        let _ = opened.send(Err(NetworkError::failed_to_fetch()));
                    }
                    None => {
                        warn!(url = %self.url, "native socket error");
                        self.push_readable(SocketEvent::Error(NetworkError::failed_to_fetch()));
                    }
                }
            }
        }
    }
}

/// A completed upgrade
pub struct Upgraded {
    pub response: IncomingMessage,
    pub socket: Rc<MockSocket>,
}

/// Open a native WebSocket for an upgrade request and wait until it is open
pub async fn open_bridge(
    factory: Option<Rc<dyn NativeWebSocketFactory>>,
    mut url: Url,
    headers: Headers,
    guid: String,
) -> Result<Upgraded, NetworkError> {
    let Some(factory) = factory else {
        warn!(url = %url, "upgrade requested but the host has no WebSocket");
        return Err(NetworkError::failed_to_fetch());
    };

    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    if url.set_scheme(scheme).is_err() {
        return Err(NetworkError::new(format!("Cannot open a WebSocket to {}", url)));
    }
    let protocols: Vec<String> = headers
        .get("sec-websocket-protocol")
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|protocol| !protocol.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let (opened_tx, opened_rx) = oneshot::channel();
    let socket = Rc::new(MockSocket::new(url.clone(), opened_tx));
    let sink = NativeSocketSink {
        socket: Rc::downgrade(&socket),
    };
    debug!(url = %url, "opening native socket");
    let native = factory.connect(&url, &protocols, sink)?;
    *socket.native.borrow_mut() = Some(Rc::clone(&native));

    match opened_rx.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            socket.native.borrow_mut().take();
            warn!(url = %url, "native socket failed to open");
            return Err(err);
        }
        Err(_) => return Err(NetworkError::failed_to_fetch()),
    }

    let mut response_headers = Headers::new();
    response_headers.set("upgrade", "websocket");
    response_headers.set("connection", "Upgrade");
    let nonce = match headers.get("sec-websocket-key") {
        Some(nonce) => nonce.to_string(),
        None => {
            let minted = generate_nonce();
            debug!(url = %url, nonce = %minted, "upgrade request without a key");
            minted
        }
    };
    response_headers.set("sec-websocket-accept", accept_key(&nonce, &guid));
    if let Some(protocol) = native.protocol() {
        response_headers.set("sec-websocket-protocol", protocol);
    }

    Ok(Upgraded {
        response: IncomingMessage::response(101, "Switching Protocols", response_headers, Buffer::new()),
        socket,
    })
}
