use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use super::error::{HandlerError, RpcError};
use crate::bencode::Dict;
use crate::config::{ERROR_METHOD_UNKNOWN, ERROR_PROTOCOL_PREFIX, ERROR_SERVER_PREFIX};

pub type HandlerResult = Result<Dict, HandlerError>;

/// Serves one inbound KRPC method.
///
/// Handlers run synchronously on the receive path and must answer from
/// local state only. Any closure of the right shape is a handler.
pub trait RpcHandler: Send + Sync {
    fn handle(&self, args: &Dict, sender: SocketAddr) -> HandlerResult;
}

impl<F> RpcHandler for F
where
    F: Fn(&Dict, SocketAddr) -> HandlerResult + Send + Sync,
{
    fn handle(&self, args: &Dict, sender: SocketAddr) -> HandlerResult {
        self(args, sender)
    }
}

/// What to send back for an inbound query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Response(Dict),
    Error(String),
    Silent,
}

/// Maps method names to handlers. Built once at startup and shared by all
/// connections of a broker.
#[derive(Default, Clone)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, method: &str, handler: H) -> Result<&mut Self, RpcError>
    where
        H: RpcHandler + 'static,
    {
        if self.handlers.contains_key(method) {
            return Err(RpcError::DuplicateMethod(method.to_string()));
        }
        self.handlers.insert(method.to_string(), Arc::new(handler));
        Ok(self)
    }

    /// Runs the handler for `method` and turns its outcome into a reply.
    ///
    /// A panicking handler is caught and answered like an internal fault.
    pub fn dispatch(&self, method: &str, args: &Dict, sender: SocketAddr) -> Reply {
        let Some(handler) = self.handlers.get(method) else {
            debug!("{} called unknown method {}", sender, method);
            return Reply::Error(ERROR_METHOD_UNKNOWN.to_string());
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(args, sender)))
            .unwrap_or_else(|_| Err(HandlerError::Internal("handler panicked".into())));

        match outcome {
            Ok(payload) => Reply::Response(payload),
            Err(HandlerError::FailSilently) => Reply::Silent,
            Err(HandlerError::Protocol(msg)) => {
                Reply::Error(format!("{}: {}", ERROR_PROTOCOL_PREFIX, msg))
            }
            Err(HandlerError::Server(msg)) => {
                Reply::Error(format!("{}: {}", ERROR_SERVER_PREFIX, msg))
            }
            Err(HandlerError::Internal(msg)) => {
                warn!("{} handler failed for {}: {}", method, sender, msg);
                Reply::Error(ERROR_SERVER_PREFIX.to_string())
            }
        }
    }
}
