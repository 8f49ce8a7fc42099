//! The process-wide table mapping a plugin name to the handler that should
//! service sessions opened under that name.
//!
//! A handler is one of two shapes: a plain request/response function, or a
//! factory that builds a stateful [`RawHandler`] per accepted raw-mode
//! session. Both live behind `Arc` so a session can hold its own reference
//! without contending on the registry lock for the lifetime of the call.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use crate::error::CcpError;
use crate::receiver::SessionHandle;

/// A request-based handler: takes the peer address and the request bytes,
/// returns the response bytes or a failure reason.
pub type RequestHandlerFn = dyn Fn(SocketAddr, &[u8]) -> Result<Vec<u8>, String> + Send + Sync;

/// A raw-mode session's behavior. Constructed once per accepted session by
/// the plugin's [`RawHandlerFactory`] and driven by the receiver thread for
/// the rest of the session's life.
pub trait RawHandler: Send {
    fn on_data_received(&mut self, data: &[u8]);
    fn on_connection_abort(&mut self);
}

/// Builds a [`RawHandler`] for one accepted raw-mode session. Receives a
/// [`SessionHandle`] so the handler it returns can send data, stop, or
/// unload the session without owning it.
pub type RawHandlerFactory =
    dyn Fn(SocketAddr, SessionHandle) -> Result<Box<dyn RawHandler>, String> + Send + Sync;

enum Handler {
    RequestBased(Arc<RequestHandlerFn>),
    RawFactory(Arc<RawHandlerFactory>),
}

/// Shared by every session the host accepts. Registration and lookup both
/// take the same lock; lookups clone an `Arc` out so the call itself never
/// runs under the lock.
#[derive(Default)]
pub struct Registry {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry::default())
    }

    pub fn register_request_based<F>(&self, plugin_name: &str, handler: F) -> Result<(), CcpError>
    where
        F: Fn(SocketAddr, &[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap();
        if handlers.contains_key(plugin_name) {
            return Err(CcpError::DuplicateHandler {
                plugin_name: plugin_name.to_owned(),
            });
        }
        handlers.insert(plugin_name.to_owned(), Handler::RequestBased(Arc::new(handler)));
        Ok(())
    }

    /// Idempotent: unregistering a name that isn't a live request-based
    /// handler (absent, or currently a raw factory) is a no-op.
    pub fn unregister_request_based(&self, plugin_name: &str) {
        let mut handlers = self.handlers.write().unwrap();
        if matches!(handlers.get(plugin_name), Some(Handler::RequestBased(_))) {
            handlers.remove(plugin_name);
        }
    }

    pub fn register_raw<F>(&self, plugin_name: &str, factory: F) -> Result<(), CcpError>
    where
        F: Fn(SocketAddr, SessionHandle) -> Result<Box<dyn RawHandler>, String> + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap();
        if handlers.contains_key(plugin_name) {
            return Err(CcpError::DuplicateHandler {
                plugin_name: plugin_name.to_owned(),
            });
        }
        handlers.insert(plugin_name.to_owned(), Handler::RawFactory(Arc::new(factory)));
        Ok(())
    }

    /// A plugin unload notification: drops the raw factory registered under
    /// `plugin_name`, if any. Leaves a request-based handler of the same
    /// name untouched; that table is managed only through
    /// [`Registry::unregister_request_based`].
    pub fn notify_plugin_unloaded(&self, plugin_name: &str) {
        let mut handlers = self.handlers.write().unwrap();
        if matches!(handlers.get(plugin_name), Some(Handler::RawFactory(_))) {
            handlers.remove(plugin_name);
        }
    }

    pub(crate) fn lookup_request_based(&self, plugin_name: &str) -> Option<Arc<RequestHandlerFn>> {
        match self.handlers.read().unwrap().get(plugin_name) {
            Some(Handler::RequestBased(f)) => Some(f.clone()),
            _ => None,
        }
    }

    pub(crate) fn lookup_raw_factory(&self, plugin_name: &str) -> Option<Arc<RawHandlerFactory>> {
        match self.handlers.read().unwrap().get(plugin_name) {
            Some(Handler::RawFactory(f)) => Some(f.clone()),
            _ => None,
        }
    }
}
