//! HTTP transport abstraction consumed by the sync engine.
//!
//! The engine never blocks on the network. It starts GET requests through
//! an [`HttpClient`] and later drains [`TransportEvent`]s from
//! [`HttpClient::poll_events`] inside `process()`. Implementations may do
//! their I/O on background threads, but events are only ever observed from
//! the caller's thread.
//!
//! - [`ReqwestClient`] - real transport over `reqwest::blocking`
//! - [`MemoryTransport`] - in-memory server for tests, with failure injection

mod memory;
mod reqwest_client;

pub use memory::{MemoryTransport, TransportStats};
pub use reqwest_client::{ReqwestClient, DEFAULT_USER_AGENT};

use std::fmt;

use bytes::Bytes;
use url::Url;

/// Identifies one GET issued through an [`HttpClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a transfer failed below the HTTP status level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection, DNS or read failure.
    Socket,
    /// The request timed out.
    Timeout,
    /// The request was cancelled.
    Cancelled,
}

/// Progress of an in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Response headers arrived.
    Started {
        id: RequestId,
        status: u16,
        content_length: Option<u64>,
    },
    /// A chunk of the response body.
    Data { id: RequestId, chunk: Bytes },
    /// Body fully received.
    Completed { id: RequestId },
    /// The transfer failed.
    Failed {
        id: RequestId,
        kind: TransportErrorKind,
        message: String,
    },
}

impl TransportEvent {
    /// Request this event belongs to.
    pub fn id(&self) -> RequestId {
        match self {
            TransportEvent::Started { id, .. }
            | TransportEvent::Data { id, .. }
            | TransportEvent::Completed { id }
            | TransportEvent::Failed { id, .. } => *id,
        }
    }
}

/// Non-blocking GET issuer.
///
/// Every started request eventually yields exactly one terminal event
/// (`Completed` or `Failed`) unless it is cancelled first; events for a
/// cancelled request may still be delivered and must be ignored by the
/// caller.
pub trait HttpClient {
    /// Begin fetching `url`. Must not block.
    fn start_get(&mut self, id: RequestId, url: &Url);

    /// Abandon a request. Safe to call for unknown or finished ids.
    fn cancel(&mut self, id: RequestId);

    /// Return all events that became ready since the last call.
    fn poll_events(&mut self) -> Vec<TransportEvent>;
}
