//! Remote calls from client code to server functions.
//!
//! `REMOTE_CALL` queues a [`RemoteRequest`] in the VM's outbox and continues. The
//! host delivers the request over whatever channel it likes and hands the outcome
//! back to [`Vm::resolve_remote`](super::Vm::resolve_remote); the result is then
//! written into the target signal. A response whose originating scope was torn
//! down in the meantime is discarded.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::scope::ScopeId;
use crate::reactive::SignalId;

/// Identifies one in-flight call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum RemoteErrorKind {
    /// The request never got a response.
    Network,
    /// The server function failed.
    Server,
    /// The response could not be decoded.
    Decode,
}

/// A failed remote call, delivered to the program as an `Error` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// A call waiting in the outbox, in its wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
    pub id: CallId,
    /// Stable name, `module.function`.
    pub function: String,
    pub args: Vec<serde_json::Value>,
}

/// Bookkeeping for a request whose response has not arrived.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingCall {
    /// Scope that issued the call; the response is dropped once it is gone.
    pub owner: ScopeId,
    /// Signal written with the result, if the call was a signal write.
    pub target: Option<SignalId>,
}

/// What happened to a response handed to the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The result was stored (or the call had no target).
    Delivered,
    /// The issuing scope is gone, or the id is unknown.
    Discarded,
}

/// Carries requests to the server. Implemented by the host.
pub trait RemoteTransport {
    fn call(&mut self, request: &RemoteRequest) -> Result<serde_json::Value, RemoteError>;
}

impl<F> RemoteTransport for F
where
    F: FnMut(&RemoteRequest) -> Result<serde_json::Value, RemoteError>,
{
    fn call(&mut self, request: &RemoteRequest) -> Result<serde_json::Value, RemoteError> {
        self(request)
    }
}
