//! Blocking `reqwest` transport driven from background threads.
//!
//! Each GET runs on its own thread and streams its body back over a channel
//! in 64KB chunks. The sync engine's admission control bounds how many of
//! these threads exist at once.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use reqwest::blocking::Client;
use tracing::{debug, warn};
use url::Url;

use super::{HttpClient, RequestId, TransportErrorKind, TransportEvent};

/// Default timeout for HTTP requests in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Buffer size for reading response bodies (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Default `User-Agent` header.
pub const DEFAULT_USER_AGENT: &str = concat!("scenesync/", env!("CARGO_PKG_VERSION"));

/// Threaded HTTP transport over `reqwest::blocking`.
#[derive(Debug)]
pub struct ReqwestClient {
    client: Client,
    timeout: Duration,
    sender: Sender<TransportEvent>,
    receiver: Receiver<TransportEvent>,
    cancel_flags: HashMap<RequestId, Arc<AtomicBool>>,
}

impl ReqwestClient {
    /// Create a transport with default timeout and user agent.
    ///
    /// # Errors
    ///
    /// Fails if the TLS backend cannot be initialised.
    pub fn new() -> reqwest::Result<Self> {
        Self::with_options(Duration::from_secs(DEFAULT_TIMEOUT_SECS), DEFAULT_USER_AGENT)
    }

    /// Create a transport with a custom timeout and user agent.
    pub fn with_options(timeout: Duration, user_agent: &str) -> reqwest::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        let (sender, receiver) = mpsc::channel();

        Ok(Self {
            client,
            timeout,
            sender,
            receiver,
            cancel_flags: HashMap::new(),
        })
    }

    /// Configured request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl HttpClient for ReqwestClient {
    fn start_get(&mut self, id: RequestId, url: &Url) {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.cancel_flags.insert(id, Arc::clone(&cancelled));

        let client = self.client.clone();
        let sender = self.sender.clone();
        let url = url.clone();

        debug!(%id, %url, "Starting GET");
        thread::spawn(move || {
            let terminal = stream_response(&client, id, &url, &cancelled, &sender);
            // The receiver is gone only when the client was dropped.
            let _ = sender.send(terminal);
        });
    }

    fn cancel(&mut self, id: RequestId) {
        if let Some(flag) = self.cancel_flags.remove(&id) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        let events: Vec<TransportEvent> = self.receiver.try_iter().collect();
        for event in &events {
            if matches!(
                event,
                TransportEvent::Completed { .. } | TransportEvent::Failed { .. }
            ) {
                self.cancel_flags.remove(&event.id());
            }
        }
        events
    }
}

impl Drop for ReqwestClient {
    fn drop(&mut self) {
        for flag in self.cancel_flags.values() {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Run one GET to completion, sending `Started` and `Data` events.
///
/// Returns the terminal event for the caller to send.
fn stream_response(
    client: &Client,
    id: RequestId,
    url: &Url,
    cancelled: &AtomicBool,
    sender: &Sender<TransportEvent>,
) -> TransportEvent {
    let failed = |kind, message: String| TransportEvent::Failed { id, kind, message };

    let mut response = match client.get(url.clone()).send() {
        Ok(response) => response,
        Err(e) if e.is_timeout() => return failed(TransportErrorKind::Timeout, e.to_string()),
        Err(e) => return failed(TransportErrorKind::Socket, e.to_string()),
    };

    let started = TransportEvent::Started {
        id,
        status: response.status().as_u16(),
        content_length: response.content_length(),
    };
    if sender.send(started).is_err() {
        return failed(TransportErrorKind::Cancelled, "client dropped".to_string());
    }

    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        if cancelled.load(Ordering::SeqCst) {
            return failed(TransportErrorKind::Cancelled, "cancelled".to_string());
        }

        let bytes_read = match response.read(&mut buffer) {
            Ok(n) => n,
            Err(e) => {
                warn!(%id, %url, error = %e, "Read error");
                return failed(TransportErrorKind::Socket, format!("read error: {}", e));
            }
        };
        if bytes_read == 0 {
            return TransportEvent::Completed { id };
        }

        let chunk = Bytes::copy_from_slice(&buffer[..bytes_read]);
        if sender.send(TransportEvent::Data { id, chunk }).is_err() {
            return failed(TransportErrorKind::Cancelled, "client dropped".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reqwest_client_default_timeout() {
        let client = ReqwestClient::new().unwrap();
        assert_eq!(client.timeout().as_secs(), DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_reqwest_client_with_options() {
        let client = ReqwestClient::with_options(Duration::from_secs(60), "test-agent").unwrap();
        assert_eq!(client.timeout().as_secs(), 60);
    }

    #[test]
    fn test_cancel_unknown_request_is_noop() {
        let mut client = ReqwestClient::new().unwrap();
        client.cancel(RequestId(42));
        assert!(client.poll_events().is_empty());
    }
}
