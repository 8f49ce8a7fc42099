//! A minimal CCP client: connects to a host, announces request-based mode
//! under a given plugin name, sends one line of stdin as a request, and
//! prints the reply.
//!
//! Usage: `client <host:port> <plugin-name> <message>`

use std::sync::mpsc;
use std::time::Duration;

use ccp::codes::AnnouncedMode;
use ccp::{CcpError, GenericTransmitter, TransmitterCallbacks};

struct PrintReply {
    done: mpsc::Sender<()>,
}

impl TransmitterCallbacks for PrintReply {
    fn on_connection_error(&mut self, error: &CcpError) {
        eprintln!("connection failed: {error}");
        let _ = self.done.send(());
    }

    fn on_comm_accepted(&mut self) {
        tracing::debug!("host accepted the session");
    }

    fn on_nobody_home(&mut self) {
        eprintln!("no handler is registered for that plugin name");
        let _ = self.done.send(());
    }

    fn on_data_received(&mut self, data: &[u8]) {
        println!("{}", String::from_utf8_lossy(data));
        let _ = self.done.send(());
    }

    fn on_comm_error(&mut self) {
        eprintln!("host reported a handler error");
        let _ = self.done.send(());
    }

    fn on_protocol_error(&mut self) {
        eprintln!("protocol error");
        let _ = self.done.send(());
    }

    fn on_connection_abort(&mut self) {
        let _ = self.done.send(());
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().ok_or("usage: client <host:port> <plugin-name> <message>")?;
    let plugin_name = args.next().ok_or("usage: client <host:port> <plugin-name> <message>")?;
    let message = args.next().ok_or("usage: client <host:port> <plugin-name> <message>")?;

    let transmitter = GenericTransmitter::new(plugin_name);
    let (done_tx, done_rx) = mpsc::channel();
    transmitter.start(addr, PrintReply { done: done_tx })?;
    transmitter.announce(AnnouncedMode::RequestBased)?;
    transmitter.send_data(message.into_bytes())?;

    let _ = done_rx.recv_timeout(Duration::from_secs(5));
    transmitter.teardown();
    Ok(())
}
