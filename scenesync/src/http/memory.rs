//! In-memory HTTP transport.
//!
//! Serves content from a path → bytes map. Each call to `poll_events`
//! advances every in-flight transfer by one step (headers, one body chunk,
//! or completion), so requests stay active across several `process()`
//! ticks the way real transfers do. Faults can be injected per path.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use url::Url;

use super::{HttpClient, RequestId, TransportErrorKind, TransportEvent};

/// Default body chunk size.
const DEFAULT_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy)]
enum Fault {
    Status(u16),
    Socket,
    Corrupt,
}

#[derive(Debug, Clone, Copy)]
struct FaultRule {
    fault: Fault,
    remaining: u32,
}

#[derive(Debug)]
struct Transfer {
    id: RequestId,
    status: u16,
    body: Bytes,
    offset: usize,
    started: bool,
    socket_failure: bool,
}

/// Counters describing what the transport was asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Paths requested, in start order.
    pub requests: Vec<String>,
    /// Requests started but not yet finished or cancelled.
    pub active: usize,
    /// Highest value `active` reached.
    pub max_active: usize,
    /// Requests cancelled while in flight.
    pub cancelled: usize,
}

impl TransportStats {
    /// How many times `path` was requested.
    pub fn request_count(&self, path: &str) -> usize {
        self.requests.iter().filter(|p| p.as_str() == path).count()
    }
}

#[derive(Debug)]
struct Shared {
    files: HashMap<String, Bytes>,
    faults: HashMap<String, FaultRule>,
    chunk_size: usize,
    transfers: Vec<Transfer>,
    stats: TransportStats,
}

/// Cloneable handle to an in-memory server; clones share state.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create an empty server.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                files: HashMap::new(),
                faults: HashMap::new(),
                chunk_size: DEFAULT_CHUNK_SIZE,
                transfers: Vec::new(),
                stats: TransportStats::default(),
            })),
        }
    }

    /// Serve `content` at URL path `path` (e.g. `/sub/a.txt`).
    pub fn insert(&self, path: impl Into<String>, content: impl Into<Bytes>) {
        self.shared.lock().files.insert(path.into(), content.into());
    }

    /// Stop serving `path`; later requests get 404.
    pub fn remove(&self, path: &str) {
        self.shared.lock().files.remove(path);
    }

    /// Answer requests for `path` with `status` the next `times` times.
    pub fn fail_with_status(&self, path: impl Into<String>, status: u16, times: u32) {
        self.add_fault(path.into(), Fault::Status(status), times);
    }

    /// Drop the connection mid-body for `path` the next `times` times.
    pub fn fail_with_socket_error(&self, path: impl Into<String>, times: u32) {
        self.add_fault(path.into(), Fault::Socket, times);
    }

    /// Serve altered bytes for `path` the next `times` times.
    pub fn corrupt(&self, path: impl Into<String>, times: u32) {
        self.add_fault(path.into(), Fault::Corrupt, times);
    }

    /// Set the body chunk size used when streaming.
    pub fn set_chunk_size(&self, chunk_size: usize) {
        self.shared.lock().chunk_size = chunk_size.max(1);
    }

    /// Snapshot of the request counters.
    pub fn stats(&self) -> TransportStats {
        self.shared.lock().stats.clone()
    }

    /// Clear request history (active tracking is kept).
    pub fn reset_stats(&self) {
        let mut shared = self.shared.lock();
        shared.stats.requests.clear();
        shared.stats.max_active = shared.stats.active;
        shared.stats.cancelled = 0;
    }

    fn add_fault(&self, path: String, fault: Fault, times: u32) {
        self.shared.lock().faults.insert(
            path,
            FaultRule {
                fault,
                remaining: times,
            },
        );
    }
}

impl Shared {
    fn take_fault(&mut self, path: &str) -> Option<Fault> {
        let rule = self.faults.get_mut(path)?;
        if rule.remaining == 0 {
            return None;
        }
        rule.remaining -= 1;
        Some(rule.fault)
    }
}

impl HttpClient for MemoryTransport {
    fn start_get(&mut self, id: RequestId, url: &Url) {
        let mut shared = self.shared.lock();
        let path = url.path().to_string();

        shared.stats.requests.push(path.clone());
        shared.stats.active += 1;
        shared.stats.max_active = shared.stats.max_active.max(shared.stats.active);

        let fault = shared.take_fault(&path);
        let (status, body) = match (fault, shared.files.get(&path)) {
            (Some(Fault::Status(status)), _) => (status, Bytes::from_static(b"error")),
            (_, None) => (404, Bytes::from_static(b"not found")),
            (Some(Fault::Corrupt), Some(body)) => {
                let mut altered = body.to_vec();
                altered.push(b'!');
                (200, Bytes::from(altered))
            }
            (_, Some(body)) => (200, body.clone()),
        };

        shared.transfers.push(Transfer {
            id,
            status,
            body,
            offset: 0,
            started: false,
            socket_failure: matches!(fault, Some(Fault::Socket)),
        });
    }

    fn cancel(&mut self, id: RequestId) {
        let mut shared = self.shared.lock();
        let before = shared.transfers.len();
        shared.transfers.retain(|t| t.id != id);
        if shared.transfers.len() < before {
            shared.stats.active -= 1;
            shared.stats.cancelled += 1;
        }
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        let mut shared = self.shared.lock();
        let chunk_size = shared.chunk_size;
        let mut events = Vec::new();
        let mut finished = Vec::new();

        for transfer in shared.transfers.iter_mut() {
            if !transfer.started {
                transfer.started = true;
                events.push(TransportEvent::Started {
                    id: transfer.id,
                    status: transfer.status,
                    content_length: Some(transfer.body.len() as u64),
                });
            } else if transfer.socket_failure && transfer.offset > 0 {
                events.push(TransportEvent::Failed {
                    id: transfer.id,
                    kind: TransportErrorKind::Socket,
                    message: "connection reset".to_string(),
                });
                finished.push(transfer.id);
            } else if transfer.offset < transfer.body.len() {
                let end = (transfer.offset + chunk_size).min(transfer.body.len());
                events.push(TransportEvent::Data {
                    id: transfer.id,
                    chunk: transfer.body.slice(transfer.offset..end),
                });
                transfer.offset = end;
            } else if transfer.socket_failure {
                // Empty body: fail right after the headers
                events.push(TransportEvent::Failed {
                    id: transfer.id,
                    kind: TransportErrorKind::Socket,
                    message: "connection reset".to_string(),
                });
                finished.push(transfer.id);
            } else {
                events.push(TransportEvent::Completed { id: transfer.id });
                finished.push(transfer.id);
            }
        }

        shared.transfers.retain(|t| !finished.contains(&t.id));
        shared.stats.active -= finished.len();
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse("http://repo.invalid").unwrap().join(path).unwrap()
    }

    fn drain(transport: &mut MemoryTransport) -> Vec<TransportEvent> {
        let mut all = Vec::new();
        for _ in 0..100 {
            let events = transport.poll_events();
            if events.is_empty() {
                break;
            }
            all.extend(events);
        }
        all
    }

    #[test]
    fn test_serves_content_in_chunks() {
        let mut transport = MemoryTransport::new();
        transport.set_chunk_size(2);
        transport.insert("/a.txt", &b"hello"[..]);

        transport.start_get(RequestId(1), &url("/a.txt"));
        let events = drain(&mut transport);

        assert!(matches!(
            events[0],
            TransportEvent::Started { status: 200, .. }
        ));
        let body: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Data { chunk, .. } => Some(chunk.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, b"hello");
        assert!(matches!(events.last(), Some(TransportEvent::Completed { .. })));
        assert_eq!(transport.stats().active, 0);
    }

    #[test]
    fn test_missing_path_is_404() {
        let mut transport = MemoryTransport::new();
        transport.start_get(RequestId(1), &url("/missing"));

        let events = drain(&mut transport);
        assert!(matches!(
            events[0],
            TransportEvent::Started { status: 404, .. }
        ));
    }

    #[test]
    fn test_fault_injection_expires() {
        let mut transport = MemoryTransport::new();
        transport.insert("/a.txt", &b"hello"[..]);
        transport.fail_with_status("/a.txt", 503, 1);

        transport.start_get(RequestId(1), &url("/a.txt"));
        let first = drain(&mut transport);
        assert!(matches!(first[0], TransportEvent::Started { status: 503, .. }));

        transport.start_get(RequestId(2), &url("/a.txt"));
        let second = drain(&mut transport);
        assert!(matches!(second[0], TransportEvent::Started { status: 200, .. }));
        assert_eq!(transport.stats().request_count("/a.txt"), 2);
    }

    #[test]
    fn test_socket_failure_after_first_chunk() {
        let mut transport = MemoryTransport::new();
        transport.insert("/a.txt", &b"hello"[..]);
        transport.fail_with_socket_error("/a.txt", 1);

        transport.start_get(RequestId(1), &url("/a.txt"));
        let events = drain(&mut transport);
        assert!(matches!(
            events.last(),
            Some(TransportEvent::Failed {
                kind: TransportErrorKind::Socket,
                ..
            })
        ));
    }

    #[test]
    fn test_cancel_tracks_active() {
        let mut transport = MemoryTransport::new();
        transport.insert("/a.txt", &b"hello"[..]);
        transport.start_get(RequestId(1), &url("/a.txt"));
        transport.start_get(RequestId(2), &url("/a.txt"));
        assert_eq!(transport.stats().max_active, 2);

        transport.cancel(RequestId(1));
        let stats = transport.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.cancelled, 1);
    }
}
