use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// The error type shared by every module in this crate.
#[derive(Error, Debug)]
pub enum CcpError {
    /// A frame payload exceeded the 3-byte length prefix's range.
    #[error("frame payload of {0} bytes exceeds the maximum of {}", crate::frame::MAX_PAYLOAD_LEN)]
    FrameTooLarge(usize),

    /// A socket-level failure: reset, a short write, an OS error mid-frame.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer violated the protocol (unknown code, frame after end-request,
    /// non-UTF-8 plugin name, and so on).
    #[error("protocol violation from {peer}: {reason}")]
    Protocol {
        peer: SocketAddr,
        reason: &'static str,
    },

    /// A registered handler returned an error or panicked while running.
    #[error("handler for plugin '{plugin_name}' failed: {reason}")]
    Application { plugin_name: String, reason: String },

    /// No handler is registered under the requested plugin name.
    #[error("no handler registered for plugin '{plugin_name}'")]
    Absence { plugin_name: String },

    /// A second handler tried to register under a name already taken.
    #[error("duplicate handler registration for plugin '{plugin_name}'")]
    DuplicateHandler { plugin_name: String },

    /// Host bootstrap (config loading, bind) failed before any session ran.
    #[error("bootstrap failure: {0}")]
    Bootstrap(String),

    /// The caller used a session API out of turn (e.g. `send_data` before a
    /// mode was announced). Not a wire-level event; nothing was sent.
    #[error("usage error: {0}")]
    Usage(&'static str),
}

pub type CcpResult<T> = Result<T, CcpError>;
