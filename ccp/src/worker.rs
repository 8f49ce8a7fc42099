//! Owns one TCP connection: a dedicated reader thread that decodes frames
//! and dispatches them upward, plus a `stop()` any thread can call.

use std::net::{Shutdown, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{error, trace};

use crate::error::CcpError;
use crate::frame;

/// Upward callback interface driven by a worker's read loop. `on_frame` may
/// fire many times; exactly one of `on_connection_close` /
/// `on_connection_abort` fires last, whichever the transport reports.
pub trait FrameSink: Send {
    fn on_frame(&mut self, payload: Vec<u8>);
    fn on_connection_close(&mut self);
    fn on_connection_abort(&mut self);
}

/// Owns one TCP connection's lifetime. Spawned by [`crate::server::Server`]
/// on the host side and by [`crate::transmitter::GenericTransmitter`] on the
/// client side.
pub struct ConnectionWorker {
    running: AtomicBool,
    stream_for_stop: TcpStream,
    on_stop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ConnectionWorker {
    /// Spawns the reader thread and returns immediately; `sink` starts
    /// receiving callbacks on that thread right away.
    pub fn spawn(stream: TcpStream, mut sink: impl FrameSink + 'static) -> Result<Arc<ConnectionWorker>, CcpError> {
        let stream_for_stop = stream.try_clone().map_err(CcpError::Transport)?;
        let worker = Arc::new(ConnectionWorker {
            running: AtomicBool::new(true),
            stream_for_stop,
            on_stop: Mutex::new(None),
        });
        let worker_clone = worker.clone();
        thread::spawn(move || worker_clone.run(stream, &mut sink));
        Ok(worker)
    }

    fn run(&self, stream: TcpStream, sink: &mut dyn FrameSink) {
        while self.running.load(Ordering::Acquire) {
            match frame::read_frame(&stream) {
                Ok(Some(payload)) => {
                    trace!(bytes = payload.len(), "frame received");
                    let result = catch_unwind(AssertUnwindSafe(|| sink.on_frame(payload)));
                    if result.is_err() {
                        error!("frame sink panicked handling an inbound frame");
                        break;
                    }
                }
                Ok(None) => {
                    let result = catch_unwind(AssertUnwindSafe(|| sink.on_connection_close()));
                    if result.is_err() {
                        error!("frame sink panicked handling connection close");
                    }
                    break;
                }
                Err(e) => {
                    trace!(error = %e, "connection aborted");
                    let result = catch_unwind(AssertUnwindSafe(|| sink.on_connection_abort()));
                    if result.is_err() {
                        error!("frame sink panicked handling connection abort");
                    }
                    break;
                }
            }
        }
        self.stop();
    }

    /// Registers a callback that runs exactly once, the first time this
    /// worker stops. Used by the accept loop to remove itself from the
    /// client list without polling.
    pub fn on_stop(&self, callback: impl FnOnce() + Send + 'static) {
        *self.on_stop.lock().unwrap() = Some(Box::new(callback));
    }

    /// Idempotent. Closes the socket, unblocking a concurrently blocked
    /// reader; the resulting close is indistinguishable from the peer
    /// hanging up and is handled the same way.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let _ = self.stream_for_stop.shutdown(Shutdown::Both);
            if let Some(cb) = self.on_stop.lock().unwrap().take() {
                cb();
            }
        }
    }
}
