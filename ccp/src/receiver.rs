//! The host side of a session: decodes the handshake, dispatches `DATA`
//! frames to whichever handler the plugin name names, and tears the session
//! down on `COMM_END`, a protocol violation, or a transport event.

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn, Span};

use crate::codes::{inbound, outbound, CommunicationMode};
use crate::error::CcpError;
use crate::frame;
use crate::registry::{RawHandler, Registry};
use crate::worker::FrameSink;

/// Shared, thread-safe session state. A [`HostConnection`] owns one of
/// these; a [`SessionHandle`] is a cheap clone of the `Arc` around it, handed
/// to a live [`RawHandler`] so it can act on the session without owning it.
struct SessionShared {
    stream: TcpStream,
    send_lock: Mutex<()>,
    mode: Mutex<CommunicationMode>,
    peer_addr: SocketAddr,
    abort_delivered: AtomicBool,
}

impl SessionShared {
    fn write(&self, payload: &[u8]) -> Result<(), CcpError> {
        let _guard = self.send_lock.lock().unwrap();
        frame::write_frame(&self.stream, payload)
    }

    fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// A non-owning reference to a live raw-mode session. Cloning is cheap;
/// holding one does not keep the session or its handler alive.
#[derive(Clone)]
pub struct SessionHandle(Arc<SessionShared>);

impl SessionHandle {
    pub fn peer_addr(&self) -> SocketAddr {
        self.0.peer_addr
    }

    /// Sends one `DATA` frame. Valid only while the session is in `Raw`
    /// mode; any other mode is a usage error on the handler's part.
    pub fn send_data(&self, data: impl Into<Vec<u8>>) -> Result<(), CcpError> {
        self.guarded_send(outbound::DATA, Some(data.into()), "send_data outside RAW mode")
    }

    /// Ends the session normally: outbound `COMM_END`, then awaits the
    /// client's own `COMM_END` before the socket closes.
    pub fn stop(&self) -> Result<(), CcpError> {
        self.guarded_send(outbound::COMM_END, None, "stop outside RAW mode")
    }

    /// Tells the client nobody is home for this plugin anymore and ends the
    /// session. Distinct from [`SessionHandle::stop`] only in the code sent.
    pub fn unload(&self) -> Result<(), CcpError> {
        self.guarded_send(outbound::NOBODY_HOME, None, "unload outside RAW mode")
    }

    fn guarded_send(&self, code: u8, data: Option<Vec<u8>>, reason: &'static str) -> Result<(), CcpError> {
        let mut mode = self.0.mode.lock().unwrap();
        if *mode != CommunicationMode::Raw {
            return Err(CcpError::Protocol {
                peer: self.0.peer_addr,
                reason,
            });
        }
        let mut payload = vec![code];
        if let Some(data) = data {
            payload.extend_from_slice(&data);
        } else {
            *mode = CommunicationMode::EndRequestSent;
        }
        drop(mode);
        self.0.write(&payload)
    }
}

/// The host-side per-session state machine. One instance is built per
/// accepted connection and handed to [`crate::worker::ConnectionWorker::spawn`]
/// as its [`FrameSink`].
pub struct HostConnection {
    shared: Arc<SessionShared>,
    registry: Arc<Registry>,
    plugin_name: Option<String>,
    raw_handler: Option<Box<dyn RawHandler>>,
    span: Span,
}

impl HostConnection {
    /// Builds a connection bound to `stream` and returns it alongside a
    /// [`SessionHandle`] for whatever raw handler the handshake ends up
    /// constructing.
    pub fn new(peer_addr: SocketAddr, stream: TcpStream, registry: Arc<Registry>) -> (HostConnection, SessionHandle) {
        let shared = Arc::new(SessionShared {
            stream,
            send_lock: Mutex::new(()),
            mode: Mutex::new(CommunicationMode::Undefined),
            peer_addr,
            abort_delivered: AtomicBool::new(false),
        });
        let handle = SessionHandle(shared.clone());
        let connection = HostConnection {
            shared,
            registry,
            plugin_name: None,
            raw_handler: None,
            span: tracing::info_span!("ccp_session", peer = %peer_addr),
        };
        (connection, handle)
    }

    fn mode(&self) -> CommunicationMode {
        *self.shared.mode.lock().unwrap()
    }

    fn set_mode(&self, mode: CommunicationMode) {
        *self.shared.mode.lock().unwrap() = mode;
    }

    fn send(&self, payload: &[u8]) {
        if let Err(e) = self.shared.write(payload) {
            warn!(parent: &self.span, error = %e, "failed to write outbound frame");
        }
    }

    fn protocol_error(&mut self, reason: &'static str) {
        warn!(parent: &self.span, reason, "protocol error, ending session");
        self.set_mode(CommunicationMode::Error);
        self.send(&[outbound::PROTOCOL_ERROR]);
        self.shared.close();
    }

    fn handle_handshake(&mut self, code: u8, arg: &[u8]) {
        if self.mode() != CommunicationMode::Undefined {
            self.protocol_error("handshake code received after the session already started");
            return;
        }

        let plugin_name = match std::str::from_utf8(arg) {
            Ok(name) => name.to_owned(),
            Err(_) => {
                self.protocol_error("plugin name is not valid utf-8");
                return;
            }
        };

        if code == inbound::COMM_START_REQUEST_BASED {
            self.plugin_name = Some(plugin_name.clone());
            if self.registry.lookup_request_based(&plugin_name).is_some() {
                self.set_mode(CommunicationMode::RequestBased);
                self.send(&[outbound::COMM_ACCEPTED]);
            } else {
                let err = CcpError::Absence { plugin_name: plugin_name.clone() };
                warn!(parent: &self.span, error = %err, "handshake rejected");
                self.set_mode(CommunicationMode::EndRequestSent);
                self.send(&[outbound::NOBODY_HOME]);
            }
            return;
        }

        self.plugin_name = Some(plugin_name.clone());
        match self.registry.lookup_raw_factory(&plugin_name) {
            Some(factory) => {
                let handle = SessionHandle(self.shared.clone());
                let peer = self.shared.peer_addr;
                let outcome = catch_unwind(AssertUnwindSafe(|| factory(peer, handle))).unwrap_or_else(|_| {
                    Err("raw handler constructor panicked".to_owned())
                });
                match outcome {
                    Ok(handler) => {
                        self.raw_handler = Some(handler);
                        self.set_mode(CommunicationMode::Raw);
                        self.send(&[outbound::COMM_ACCEPTED]);
                    }
                    Err(reason) => {
                        let err = CcpError::Application {
                            plugin_name: plugin_name.clone(),
                            reason,
                        };
                        error!(parent: &self.span, error = %err, "raw handler constructor failed");
                        self.set_mode(CommunicationMode::EndRequestSent);
                        self.send(&[outbound::COMM_ERROR]);
                    }
                }
            }
            None => {
                let err = CcpError::Absence { plugin_name: plugin_name.clone() };
                warn!(parent: &self.span, error = %err, "handshake rejected");
                self.set_mode(CommunicationMode::EndRequestSent);
                self.send(&[outbound::NOBODY_HOME]);
            }
        }
    }

    fn handle_data(&mut self, mode: CommunicationMode, arg: &[u8]) {
        match mode {
            CommunicationMode::RequestBased => self.handle_request_based_data(arg),
            CommunicationMode::Raw => self.handle_raw_data(arg),
            _ => self.protocol_error("DATA received outside REQUEST_BASED or RAW mode"),
        }
    }

    fn handle_request_based_data(&mut self, arg: &[u8]) {
        let plugin_name = self
            .plugin_name
            .clone()
            .expect("plugin_name is set before entering REQUEST_BASED mode");

        let handler = match self.registry.lookup_request_based(&plugin_name) {
            Some(handler) => handler,
            None => {
                // Handler unregistered after the handshake accepted it.
                let err = CcpError::Absence {
                    plugin_name: plugin_name.clone(),
                };
                warn!(parent: &self.span, error = %err, "request handler vanished mid-session");
                self.set_mode(CommunicationMode::EndRequestSent);
                self.send(&[outbound::NOBODY_HOME]);
                return;
            }
        };

        let peer = self.shared.peer_addr;
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(peer, arg)))
            .unwrap_or_else(|_| Err("request handler panicked".to_owned()));
        match outcome {
            Ok(response) => {
                let mut payload = Vec::with_capacity(1 + response.len());
                payload.push(outbound::DATA);
                payload.extend_from_slice(&response);
                self.send(&payload);
            }
            Err(reason) => {
                let err = CcpError::Application {
                    plugin_name: plugin_name.clone(),
                    reason,
                };
                error!(parent: &self.span, error = %err, "request handler failed");
                self.set_mode(CommunicationMode::EndRequestSent);
                self.send(&[outbound::COMM_ERROR]);
            }
        }
    }

    fn handle_raw_data(&mut self, arg: &[u8]) {
        if let Some(handler) = self.raw_handler.as_mut() {
            let result = catch_unwind(AssertUnwindSafe(|| handler.on_data_received(arg)));
            if result.is_err() {
                let err = CcpError::Application {
                    plugin_name: self.plugin_name.clone().unwrap_or_default(),
                    reason: "on_data_received panicked".to_owned(),
                };
                error!(parent: &self.span, error = %err, "raw handler failed");
            }
        }
    }

    /// Shared by the close and abort transport events: the original source
    /// this protocol is modeled on wires both to the same upward callback,
    /// and so do we.
    fn on_disconnect(&mut self) {
        if self.mode() == CommunicationMode::Raw {
            if let Some(mut handler) = self.raw_handler.take() {
                if !self.shared.abort_delivered.swap(true, Ordering::SeqCst) {
                    let result = catch_unwind(AssertUnwindSafe(|| handler.on_connection_abort()));
                    if result.is_err() {
                        let err = CcpError::Application {
                            plugin_name: self.plugin_name.clone().unwrap_or_default(),
                            reason: "on_connection_abort panicked".to_owned(),
                        };
                        error!(parent: &self.span, error = %err, "raw handler failed");
                    }
                }
            }
        }
        self.set_mode(CommunicationMode::Ended);
    }
}

impl FrameSink for HostConnection {
    fn on_frame(&mut self, payload: Vec<u8>) {
        let _enter = self.span.enter();

        let (code, arg) = match payload.split_first() {
            Some((code, arg)) => (*code, arg),
            None => {
                self.protocol_error("empty frame");
                return;
            }
        };

        if code == inbound::COMM_END {
            if let Some(mut handler) = self.raw_handler.take() {
                // Ordinary end: the handler is simply dropped, no abort callback.
                drop(handler);
            }
            self.set_mode(CommunicationMode::Ended);
            debug!(parent: &self.span, "session ended normally");
            self.shared.close();
            return;
        }

        if self.mode() == CommunicationMode::EndRequestSent {
            self.protocol_error("frame received after an end-request was already sent");
            return;
        }

        match code {
            inbound::COMM_START_REQUEST_BASED | inbound::COMM_START_RAW => self.handle_handshake(code, arg),
            inbound::DATA => {
                let mode = self.mode();
                self.handle_data(mode, arg);
            }
            _ => self.protocol_error("unrecognized protocol code"),
        }
    }

    fn on_connection_close(&mut self) {
        let _enter = self.span.enter();
        debug!(parent: &self.span, "peer closed the connection");
        self.on_disconnect();
    }

    fn on_connection_abort(&mut self) {
        let _enter = self.span.enter();
        warn!(parent: &self.span, "connection aborted");
        self.on_disconnect();
    }
}
