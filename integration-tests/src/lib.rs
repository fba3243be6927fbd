//! Shared fixtures for the end-to-end scenarios.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;

pub use relay_client::prelude::*;
pub use relay_core::prelude::*;
pub use relay_server::prelude::*;

/// Poll a condition until it holds or a generous deadline passes.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Bind a server on an ephemeral localhost port.
pub async fn bind_server(config: ServerConfig, handler: Arc<dyn WsHandler>) -> Server {
    Server::bind(
        config,
        Arc::new(NotFoundHandler),
        Some(WsRoute::Service(handler)),
        Arc::new(LogErrorSink),
    )
    .await
    .expect("server bind")
}

pub fn localhost_config() -> ServerConfig {
    ServerConfig::new("127.0.0.1".parse().unwrap(), 0)
}

pub fn test_client(handler: Arc<dyn WsHandler>) -> WsClient {
    WsClient::new(ClientConfig::default(), handler, Arc::new(LogErrorSink))
}

/// Handler that records every callback, for assertions on order and counts.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
    opens: AtomicU64,
    closes: AtomicU64,
    texts: AtomicU64,
    binaries: AtomicU64,
    frozen: AtomicBool,
    violated: AtomicBool,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn texts(&self) -> u64 {
        self.texts.load(Ordering::SeqCst)
    }

    pub fn binaries(&self) -> u64 {
        self.binaries.load(Ordering::SeqCst)
    }

    /// After this call, any further callback marks a violation.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn violated(&self) -> bool {
        self.violated.load(Ordering::SeqCst)
    }

    fn record(&self, event: String) {
        if self.frozen.load(Ordering::SeqCst) {
            self.violated.store(true, Ordering::SeqCst);
        }
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl WsHandler for Recorder {
    async fn on_open(&self, id: SessionId, _resource: &str) {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.record(format!("open:{}", id));
    }

    async fn on_close(&self, id: SessionId, _resource: &str) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.record(format!("close:{}", id));
    }

    async fn on_text(&self, id: SessionId, _resource: &str, text: Utf8Bytes) {
        self.texts.fetch_add(1, Ordering::SeqCst);
        self.record(format!("text:{}:{}", id, text));
    }

    async fn on_binary(&self, id: SessionId, _resource: &str, data: Bytes) {
        self.binaries.fetch_add(1, Ordering::SeqCst);
        self.record(format!("binary:{}:{}", id, data.len()));
    }

    async fn on_error(&self, id: SessionId, _resource: &str, location: WsLocation, error: &SessionError) {
        self.record(format!("error:{}:{}:{}", id, location, error));
    }
}

/// Echoes every text and binary frame back to its sender.
#[derive(Default)]
pub struct EchoService {
    sessions: OnceLock<Arc<SessionRegistry>>,
    pub recorder: Recorder,
}

#[async_trait]
impl WsHandler for EchoService {
    fn attach(&self, registry: Arc<SessionRegistry>) {
        let _ = self.sessions.set(registry);
    }

    async fn on_open(&self, id: SessionId, resource: &str) {
        self.recorder.on_open(id, resource).await;
    }

    async fn on_close(&self, id: SessionId, resource: &str) {
        self.recorder.on_close(id, resource).await;
    }

    async fn on_text(&self, id: SessionId, resource: &str, text: Utf8Bytes) {
        self.recorder.on_text(id, resource, text.clone()).await;
        let _ = self.sessions.get().unwrap().send_text_to(id, text);
    }

    async fn on_binary(&self, id: SessionId, resource: &str, data: Bytes) {
        self.recorder.on_binary(id, resource, data.clone()).await;
        let _ = self.sessions.get().unwrap().send_binary_to(id, data);
    }

    async fn on_error(&self, id: SessionId, resource: &str, location: WsLocation, error: &SessionError) {
        self.recorder.on_error(id, resource, location, error).await;
    }
}

/// Server side of the counting ping-pong: greets with "0", answers each
/// number with its successor, closes after sending `limit`.
pub struct CountingService {
    limit: u64,
    received: AtomicU64,
    sessions: OnceLock<Arc<SessionRegistry>>,
}

impl CountingService {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            received: AtomicU64::new(0),
            sessions: OnceLock::new(),
        }
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WsHandler for CountingService {
    fn attach(&self, registry: Arc<SessionRegistry>) {
        let _ = self.sessions.set(registry);
    }

    async fn on_open(&self, id: SessionId, _resource: &str) {
        let _ = self.sessions.get().unwrap().send_text_to(id, "0");
    }

    async fn on_text(&self, id: SessionId, _resource: &str, text: Utf8Bytes) {
        self.received.fetch_add(1, Ordering::SeqCst);
        let value: u64 = text.as_str().parse().expect("numeric payload");
        let sessions = self.sessions.get().unwrap();

        let next = value + 1;
        if next >= self.limit {
            let _ = sessions.send_text_to(id, next.to_string());
            sessions.close(id.into(), "finished");
        } else {
            let _ = sessions.send_text_to(id, next.to_string());
        }
    }
}

/// Client side of the counting ping-pong: answers each number below the
/// limit with its successor and records what it saw.
pub struct CountingClient {
    limit: u64,
    received: AtomicU64,
    last: AtomicU64,
    closed: AtomicBool,
    sessions: OnceLock<Arc<SessionRegistry>>,
}

impl CountingClient {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            received: AtomicU64::new(0),
            last: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            sessions: OnceLock::new(),
        }
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WsHandler for CountingClient {
    fn attach(&self, registry: Arc<SessionRegistry>) {
        let _ = self.sessions.set(registry);
    }

    async fn on_text(&self, id: SessionId, _resource: &str, text: Utf8Bytes) {
        self.received.fetch_add(1, Ordering::SeqCst);
        let value: u64 = text.as_str().parse().expect("numeric payload");
        self.last.store(value, Ordering::SeqCst);
        if value < self.limit {
            let _ = self.sessions.get().unwrap().send_text_to(id, (value + 1).to_string());
        }
    }

    async fn on_close(&self, _id: SessionId, _resource: &str) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
