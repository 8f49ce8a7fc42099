//! CCP — a framed TCP channel between an external process and a set of
//! named handlers registered inside a host process.
//!
//! An external client addresses a handler by a plugin-name string; the host
//! routes an accepted connection to the matching handler and mediates either
//! a one-shot request/response exchange or a free-running bidirectional byte
//! stream. The handler set is mutable at runtime: plugins register and
//! unregister handlers as they load and unload.
//!
//! Modules, roughly leaves-first:
//!
//! - [`frame`] — the length-prefixed wire codec.
//! - [`codes`] — protocol code bytes and the per-session mode enums.
//! - [`worker`] — owns one TCP connection and its reader thread.
//! - [`server`] — the accept loop: listens, filters by source IP, spawns workers.
//! - [`registry`] — the process-wide table of plugin_name -> handler.
//! - [`receiver`] — the host-side per-session state machine.
//! - [`transmitter`] — the client-side mirror of [`receiver`].
//! - [`config`] — loads a host's listen address and whitelist from TOML.
//!
//! ## Wire format
//!
//! Every frame is a 3-byte big-endian length prefix followed by that many
//! bytes of payload. The first payload byte, when present, is a protocol
//! code (see [`codes`]); the remaining bytes are that code's argument.

pub mod codes;
pub mod config;
pub mod error;
pub mod frame;
pub mod receiver;
pub mod registry;
pub mod server;
pub mod transmitter;
pub mod worker;

pub use error::{CcpError, CcpResult};
pub use receiver::{HostConnection, SessionHandle};
pub use registry::{RawHandler, Registry};
pub use server::Server;
pub use transmitter::{GenericTransmitter, TransmitterCallbacks};
