//! The client side of a session: connects to a host, announces a plugin and
//! a mode, and dispatches whatever the host sends back to a set of
//! caller-supplied callbacks.

use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::codes::{inbound, outbound, AnnouncedMode, TransmitterMode};
use crate::error::CcpError;
use crate::frame;
use crate::worker::{ConnectionWorker, FrameSink};

/// Events a [`GenericTransmitter`] delivers to the embedding client. Default
/// implementations are no-ops, so callers only override what they use.
pub trait TransmitterCallbacks: Send {
    fn on_connection_error(&mut self, _error: &CcpError) {}
    fn on_connected(&mut self) {}
    fn on_comm_accepted(&mut self) {}
    fn on_nobody_home(&mut self) {}
    fn on_comm_end(&mut self) {}
    fn on_protocol_error(&mut self) {}
    fn on_comm_error(&mut self) {}
    fn on_data_received(&mut self, _data: &[u8]) {}
    fn on_connection_abort(&mut self) {}
}

struct SharedState {
    mode: Mutex<TransmitterMode>,
    write_stream: Mutex<Option<TcpStream>>,
    send_lock: Mutex<()>,
    teardown_during_connect: AtomicBool,
    /// Set once the session has already been ended by a terminal dispatch
    /// (`end_session`) or an explicit `stop`/`teardown` on this side, so the
    /// socket-shutdown-triggered `on_connection_close` that inevitably
    /// follows doesn't deliver a second, spurious `on_connection_abort`.
    ended_locally: AtomicBool,
}

impl SharedState {
    fn write(&self, payload: &[u8]) -> Result<(), CcpError> {
        let guard = self.write_stream.lock().unwrap();
        let stream = guard.as_ref().ok_or_else(|| CcpError::Usage("not connected"))?;
        let _send_guard = self.send_lock.lock().unwrap();
        frame::write_frame(stream, payload)
    }

    fn close(&self) {
        if let Some(stream) = self.write_stream.lock().unwrap().as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

struct TransmitterSink<C: TransmitterCallbacks> {
    shared: Arc<SharedState>,
    callbacks: C,
}

impl<C: TransmitterCallbacks> TransmitterSink<C> {
    fn end_session(&mut self, reply_with_end: bool) {
        *self.shared.mode.lock().unwrap() = TransmitterMode::Ended;
        self.shared.ended_locally.store(true, Ordering::SeqCst);
        if reply_with_end {
            let _ = self.shared.write(&[inbound::COMM_END]);
        }
        self.shared.close();
    }
}

impl<C: TransmitterCallbacks> FrameSink for TransmitterSink<C> {
    fn on_frame(&mut self, payload: Vec<u8>) {
        let (code, data) = match payload.split_first() {
            Some((code, data)) => (*code, data),
            None => {
                *self.shared.mode.lock().unwrap() = TransmitterMode::Error;
                self.shared.close();
                self.callbacks.on_protocol_error();
                return;
            }
        };

        match code {
            outbound::COMM_END => {
                self.end_session(true);
                self.callbacks.on_comm_end();
            }
            outbound::PROTOCOL_ERROR => {
                *self.shared.mode.lock().unwrap() = TransmitterMode::Error;
                self.shared.close();
                self.callbacks.on_protocol_error();
            }
            outbound::NOBODY_HOME => {
                self.end_session(true);
                self.callbacks.on_nobody_home();
            }
            outbound::COMM_ERROR => {
                self.end_session(true);
                self.callbacks.on_comm_error();
            }
            outbound::COMM_ACCEPTED => {
                let result = catch_unwind(AssertUnwindSafe(|| self.callbacks.on_comm_accepted()));
                if result.is_err() {
                    self.end_session(true);
                }
            }
            outbound::DATA => {
                let result = catch_unwind(AssertUnwindSafe(|| self.callbacks.on_data_received(data)));
                if result.is_err() {
                    self.end_session(true);
                }
            }
            _ => {
                *self.shared.mode.lock().unwrap() = TransmitterMode::Error;
                self.shared.close();
                self.callbacks.on_protocol_error();
            }
        }
    }

    fn on_connection_close(&mut self) {
        if !self.shared.ended_locally.swap(true, Ordering::SeqCst) {
            self.callbacks.on_connection_abort();
        }
    }

    fn on_connection_abort(&mut self) {
        if !self.shared.ended_locally.swap(true, Ordering::SeqCst) {
            self.callbacks.on_connection_abort();
        }
    }
}

/// The client-side counterpart of [`crate::receiver::HostConnection`].
/// Created once per session attempt; `start` connects and hands callback
/// delivery off to a reader thread.
pub struct GenericTransmitter {
    shared: Arc<SharedState>,
    plugin_name: String,
    worker: Mutex<Option<Arc<ConnectionWorker>>>,
}

impl GenericTransmitter {
    pub fn new(plugin_name: impl Into<String>) -> GenericTransmitter {
        GenericTransmitter {
            shared: Arc::new(SharedState {
                mode: Mutex::new(TransmitterMode::Undefined),
                write_stream: Mutex::new(None),
                send_lock: Mutex::new(()),
                teardown_during_connect: AtomicBool::new(false),
                ended_locally: AtomicBool::new(false),
            }),
            plugin_name: plugin_name.into(),
            worker: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> TransmitterMode {
        *self.shared.mode.lock().unwrap()
    }

    /// Connects to `addr`, starts the reader thread, and invokes
    /// `callbacks.on_connected()` before handing callback delivery over to
    /// that thread. Blocks for the duration of the TCP handshake.
    ///
    /// If [`GenericTransmitter::teardown`] is called by another thread while
    /// this is blocked in `connect`, the connection is closed immediately
    /// once it completes and no callback beyond `on_connection_error` fires.
    pub fn start<C>(&self, addr: impl ToSocketAddrs, mut callbacks: C) -> Result<(), CcpError>
    where
        C: TransmitterCallbacks + 'static,
    {
        {
            let mut mode = self.shared.mode.lock().unwrap();
            if *mode != TransmitterMode::Undefined {
                return Err(CcpError::Usage("start called more than once"));
            }
            *mode = TransmitterMode::Connecting;
        }

        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                *self.shared.mode.lock().unwrap() = TransmitterMode::Ended;
                let error = CcpError::Transport(e);
                callbacks.on_connection_error(&error);
                return Err(error);
            }
        };

        if self.shared.teardown_during_connect.load(Ordering::Acquire) {
            let _ = stream.shutdown(Shutdown::Both);
            *self.shared.mode.lock().unwrap() = TransmitterMode::Ended;
            return Ok(());
        }

        let write_stream = stream.try_clone().map_err(CcpError::Transport)?;
        *self.shared.write_stream.lock().unwrap() = Some(write_stream);
        *self.shared.mode.lock().unwrap() = TransmitterMode::Connected;

        callbacks.on_connected();

        let sink = TransmitterSink {
            shared: self.shared.clone(),
            callbacks,
        };
        let worker = ConnectionWorker::spawn(stream, sink)?;
        *self.worker.lock().unwrap() = Some(worker);
        Ok(())
    }

    /// Announces the session's mode to the host. Valid exactly once, right
    /// after a successful connect.
    pub fn announce(&self, mode: AnnouncedMode) -> Result<(), CcpError> {
        let mut current = self.shared.mode.lock().unwrap();
        if *current != TransmitterMode::Connected {
            return Err(CcpError::Usage("mode can only be announced once, right after connecting"));
        }
        let (code, next) = match mode {
            AnnouncedMode::RequestBased => (inbound::COMM_START_REQUEST_BASED, TransmitterMode::RequestBased),
            AnnouncedMode::Raw => (inbound::COMM_START_RAW, TransmitterMode::Raw),
        };
        *current = next;
        drop(current);

        let mut payload = vec![code];
        payload.extend_from_slice(self.plugin_name.as_bytes());
        self.shared.write(&payload)
    }

    /// Sends one `DATA` frame. Valid once the session is in request-based or
    /// raw mode.
    pub fn send_data(&self, data: impl Into<Vec<u8>>) -> Result<(), CcpError> {
        let mode = *self.shared.mode.lock().unwrap();
        if !matches!(mode, TransmitterMode::RequestBased | TransmitterMode::Raw) {
            return Err(CcpError::Usage("send_data before a mode was announced"));
        }
        let data = data.into();
        let mut payload = Vec::with_capacity(1 + data.len());
        payload.push(inbound::DATA);
        payload.extend_from_slice(&data);
        self.shared.write(&payload)
    }

    /// Ends the session: sends `COMM_END` and closes the socket.
    pub fn stop(&self) -> Result<(), CcpError> {
        let mut mode = self.shared.mode.lock().unwrap();
        if !matches!(*mode, TransmitterMode::RequestBased | TransmitterMode::Raw) {
            return Err(CcpError::Usage("stop before a mode was announced"));
        }
        *mode = TransmitterMode::Ended;
        drop(mode);
        let result = self.shared.write(&[inbound::COMM_END]);
        self.close_and_stop_worker();
        result
    }

    /// Mirrors the embedding plugin being torn down while this transmitter
    /// is in some unknown state: ends an active session, marks a pending
    /// connect attempt to back out, or is a no-op if already terminal.
    pub fn teardown(&self) {
        let mut mode = self.shared.mode.lock().unwrap();
        match *mode {
            TransmitterMode::Ended | TransmitterMode::Error => {}
            TransmitterMode::RequestBased | TransmitterMode::Raw => {
                *mode = TransmitterMode::Ended;
                drop(mode);
                if let Err(e) = self.shared.write(&[inbound::COMM_END]) {
                    warn!(error = %e, "failed to send COMM_END during teardown");
                }
                self.close_and_stop_worker();
            }
            TransmitterMode::Undefined | TransmitterMode::Connected => {
                *mode = TransmitterMode::Ended;
            }
            TransmitterMode::Connecting => {
                self.shared.teardown_during_connect.store(true, Ordering::Release);
            }
        }
    }

    fn close_and_stop_worker(&self) {
        self.shared.ended_locally.store(true, Ordering::SeqCst);
        self.shared.close();
        if let Some(worker) = self.worker.lock().unwrap().as_ref() {
            worker.stop();
        }
    }
}
