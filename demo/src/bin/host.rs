//! A minimal CCP host: loads `ccp.toml` (or the path given as the first
//! argument), registers one request-based echo handler and one raw echo
//! handler, and runs the accept loop on the main thread.

use ccp::registry::RawHandler;
use ccp::{HostConnection, Registry, Server, SessionHandle};

struct RawEcho {
    session: SessionHandle,
}

impl RawHandler for RawEcho {
    fn on_data_received(&mut self, data: &[u8]) {
        if let Err(e) = self.session.send_data(data.to_vec()) {
            tracing::warn!(error = %e, "raw echo failed to reply");
        }
    }

    fn on_connection_abort(&mut self) {
        tracing::debug!(peer = %self.session.peer_addr(), "raw echo session aborted");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "ccp.toml".to_owned());
    let config = ccp::config::HostConfig::load(&config_path)?;

    let registry = Registry::new();
    registry.register_request_based("echo", |_addr, data| Ok(data.to_vec()))?;
    registry.register_raw("echo-raw", |_addr, session| Ok(Box::new(RawEcho { session }) as Box<dyn RawHandler>))?;

    let server = Server::bind((config.host.as_str(), config.port), config.whitelist)?;
    tracing::info!(addr = ?server.local_addr()?, "ccp host listening");

    server.serve(move |addr, write_stream| {
        let (connection, _handle) = HostConnection::new(addr, write_stream, registry.clone());
        connection
    })?;

    Ok(())
}
