//! The accept loop: listens on one socket, rejects connections from
//! unlisted source addresses, and spawns one [`ConnectionWorker`] per
//! accepted client.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::error::CcpError;
use crate::worker::{ConnectionWorker, FrameSink};

type ClientMap = Arc<Mutex<HashMap<u64, Arc<ConnectionWorker>>>>;

/// Listens for inbound connections, filters by source IP, and hands each
/// accepted connection off to a per-connection [`FrameSink`] produced by the
/// caller.
pub struct Server {
    listener: TcpListener,
    running: AtomicBool,
    whitelist: Vec<Ipv4Addr>,
    clients: ClientMap,
    next_client_id: AtomicU64,
}

impl Server {
    /// Binds the listen socket. Does not start accepting; call
    /// [`Server::serve`] on the thread that should run the accept loop.
    pub fn bind(addr: (&str, u16), whitelist: Vec<Ipv4Addr>) -> Result<Server, CcpError> {
        let listener = TcpListener::bind(addr).map_err(CcpError::Transport)?;
        Ok(Server {
            listener,
            running: AtomicBool::new(false),
            whitelist,
            clients: Arc::new(Mutex::new(HashMap::new())),
            next_client_id: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CcpError> {
        self.listener.local_addr().map_err(CcpError::Transport)
    }

    fn is_whitelisted(&self, addr: SocketAddr) -> bool {
        match addr {
            SocketAddr::V4(v4) => self.whitelist.contains(v4.ip()),
            SocketAddr::V6(_) => false,
        }
    }

    /// Runs the accept loop on the calling thread until [`Server::stop`] is
    /// called from elsewhere. For each accepted, whitelisted connection,
    /// `make_sink(addr, write_stream)` builds the [`FrameSink`] that will
    /// drive it; `write_stream` is a clone of the connection's socket, for
    /// the sink to write outbound frames through.
    pub fn serve<F, S>(&self, mut make_sink: F) -> Result<(), CcpError>
    where
        F: FnMut(SocketAddr, TcpStream) -> S,
        S: FrameSink + 'static,
    {
        self.running.store(true, Ordering::Release);
        info!(local_addr = ?self.local_addr().ok(), "accept loop starting");

        while self.running.load(Ordering::Acquire) {
            let (stream, addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) => {
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                    warn!(error = %e, "accept() failed");
                    continue;
                }
            };

            if !self.running.load(Ordering::Acquire) {
                let _ = stream.shutdown(Shutdown::Both);
                break;
            }

            if !self.is_whitelisted(addr) {
                warn!(%addr, "rejecting connection: source address not in whitelist");
                let _ = stream.shutdown(Shutdown::Both);
                continue;
            }

            debug!(%addr, "accepted connection");
            let write_stream = match stream.try_clone() {
                Ok(s) => s,
                Err(e) => {
                    warn!(%addr, error = %e, "failed to clone accepted socket, dropping connection");
                    continue;
                }
            };
            let sink = make_sink(addr, write_stream);

            let worker = match ConnectionWorker::spawn(stream, sink) {
                Ok(worker) => worker,
                Err(e) => {
                    warn!(%addr, error = %e, "failed to spawn connection worker");
                    continue;
                }
            };

            let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
            self.clients.lock().unwrap().insert(id, worker.clone());

            let clients = self.clients.clone();
            worker.on_stop(move || {
                clients.lock().unwrap().remove(&id);
            });
        }

        // Tear down any clients still connected when the loop exits.
        let snapshot: Vec<_> = self.clients.lock().unwrap().values().cloned().collect();
        for worker in snapshot {
            worker.stop();
        }
        Ok(())
    }

    /// Idempotent. Stops the accept loop and every live worker, and nudges
    /// a blocked `accept()` call so `serve` returns promptly.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let snapshot: Vec<_> = self.clients.lock().unwrap().values().cloned().collect();
        for worker in snapshot {
            worker.stop();
        }
        if let Ok(local_addr) = self.local_addr() {
            let _ = TcpStream::connect(local_addr);
        }
    }
}
