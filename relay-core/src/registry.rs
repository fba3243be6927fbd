use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

use crate::errors::{RegistryError, SendError, SessionError};
use crate::handler::{ErrorSink, WsHandler};
use crate::identifier::SessionId;
use crate::session::{Role, SessionContext, SessionHandle, SessionOptions, build_session};

/// Recipients of a registry-level send or close.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    All,
    One(SessionId),
    Set(&'a BTreeSet<SessionId>),
}

impl From<SessionId> for Target<'static> {
    fn from(id: SessionId) -> Self {
        Target::One(id)
    }
}

/// Thread-safe set of live WebSocket sessions.
///
/// Each session's entry is inserted before its tasks start and erased exactly
/// once by its I/O task's single exit path. Broadcast iterates under shared
/// access; a broadcast payload is one refcounted buffer no matter how many
/// recipients it reaches.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionHandle>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    closing: AtomicBool,
    idle: Notify,
}

impl SessionRegistry {
    pub fn new(tracker: TaskTracker, shutdown: CancellationToken) -> Self {
        Self {
            sessions: DashMap::new(),
            tracker,
            shutdown,
            closing: AtomicBool::new(false),
            idle: Notify::new(),
        }
    }

    /// Register a handshaken stream as a new session and start its tasks.
    pub fn spawn<S>(
        self: &Arc<Self>,
        stream: WebSocketStream<S>,
        role: Role,
        resource: impl Into<Arc<str>>,
        handler: Arc<dyn WsHandler>,
        error_sink: Arc<dyn ErrorSink>,
        options: SessionOptions,
    ) -> Result<SessionId, RegistryError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.closing.load(Ordering::SeqCst) || self.shutdown.is_cancelled() {
            return Err(RegistryError::ShuttingDown);
        }

        let id = SessionId::next();
        let ctx = SessionContext {
            id,
            role,
            resource: resource.into(),
            handler,
            error_sink,
            registry: self.clone(),
            options,
            shutdown: self.shutdown.child_token(),
        };
        let (handle, io_task, handler_task) = build_session(ctx, stream);

        self.sessions.insert(id, handle);
        self.tracker.spawn(handler_task);
        self.tracker.spawn(io_task);

        debug!(target: "registry", %id, sessions = self.sessions.len(), "session registered");
        Ok(id)
    }

    /// Remove a finished session. Called exactly once per session by its I/O
    /// task; erasing an unknown identifier is a logic error.
    pub(crate) fn erase(&self, id: SessionId) {
        if self.sessions.remove(&id).is_none() {
            warn!(target: "registry", %id, "erase of unknown session");
            debug_assert!(false, "session doesn't exist");
        }
        debug!(target: "registry", %id, sessions = self.sessions.len(), "session erased");
        if self.sessions.is_empty() {
            self.idle.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || self.shutdown.is_cancelled()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Identifiers of all live sessions, in identity order.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn get(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Send a text frame to the targeted sessions. A full write list is
    /// reported through that session's `on_error`; absent sessions receive
    /// nothing.
    pub fn send_text(&self, target: Target<'_>, text: impl Into<Utf8Bytes>) {
        let text = text.into();
        self.for_each(target, |handle| {
            if let Err(SendError::BufferFull) = handle.send_text(text.clone()) {
                handle.report_send_error(SessionError::WriteBufferFull);
            }
        });
    }

    /// Send a binary frame to the targeted sessions; see [`Self::send_text`].
    pub fn send_binary(&self, target: Target<'_>, data: impl Into<Bytes>) {
        let data = data.into();
        self.for_each(target, |handle| {
            if let Err(SendError::BufferFull) = handle.send_binary(data.clone()) {
                handle.report_send_error(SessionError::WriteBufferFull);
            }
        });
    }

    /// Schedule an orderly close on the targeted sessions.
    pub fn close(&self, target: Target<'_>, reason: impl Into<Utf8Bytes>) {
        let reason = reason.into();
        self.for_each(target, |handle| handle.close(reason.clone()));
    }

    /// Send to one session, surfacing the failure to the caller.
    pub fn send_text_to(&self, id: SessionId, text: impl Into<Utf8Bytes>) -> Result<(), SendError> {
        self.get(id).ok_or(SendError::Closed)?.send_text(text)
    }

    /// Send to one session, surfacing the failure to the caller.
    pub fn send_binary_to(&self, id: SessionId, data: impl Into<Bytes>) -> Result<(), SendError> {
        self.get(id).ok_or(SendError::Closed)?.send_binary(data)
    }

    fn for_each(&self, target: Target<'_>, mut f: impl FnMut(&SessionHandle)) {
        match target {
            Target::All => {
                for entry in self.sessions.iter() {
                    f(entry.value());
                }
            }
            Target::One(id) => {
                if let Some(entry) = self.sessions.get(&id) {
                    f(entry.value());
                }
            }
            Target::Set(ids) => {
                for id in ids {
                    if let Some(entry) = self.sessions.get(id) {
                        f(entry.value());
                    }
                }
            }
        }
    }

    /// Close sessions selected by a predicate (service teardown).
    pub fn close_where(&self, reason: &str, predicate: impl Fn(&SessionHandle) -> bool) {
        for entry in self.sessions.iter() {
            if predicate(entry.value()) {
                entry.value().close(reason);
            }
        }
    }

    /// Reject new sessions and schedule a close on every live one. Each
    /// session then erases itself from its own I/O task.
    pub fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close(Target::All, "shutdown");
    }

    /// Resolve once the registry holds no sessions.
    pub async fn wait_idle(&self) {
        loop {
            if self.sessions.is_empty() {
                return;
            }
            let notified = self.idle.notified();
            if self.sessions.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{LogErrorSink, WsHandler, WsLocation};
    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use std::sync::Mutex;
    use std::time::Duration;
    use test_log::test;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::protocol::Role as WireRole;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl WsHandler for Recorder {
        async fn on_open(&self, _id: SessionId, _resource: &str) {
            self.push("open".into());
        }

        async fn on_close(&self, _id: SessionId, _resource: &str) {
            self.push("close".into());
        }

        async fn on_text(&self, _id: SessionId, _resource: &str, text: Utf8Bytes) {
            self.push(format!("text:{}", text));
        }

        async fn on_binary(&self, _id: SessionId, _resource: &str, data: Bytes) {
            self.push(format!("binary:{}", data.len()));
        }

        async fn on_error(&self, _id: SessionId, _resource: &str, location: WsLocation, _error: &SessionError) {
            self.push(format!("error:{}", location));
        }
    }

    struct Fixture {
        registry: Arc<SessionRegistry>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            let tracker = TaskTracker::new();
            let shutdown = CancellationToken::new();
            let registry = Arc::new(SessionRegistry::new(tracker.clone(), shutdown.clone()));
            Self {
                registry,
                tracker,
                shutdown,
            }
        }

        async fn session(
            &self,
            handler: Arc<dyn WsHandler>,
            options: SessionOptions,
            buffer: usize,
        ) -> (SessionId, WebSocketStream<DuplexStream>) {
            let (near, far) = tokio::io::duplex(buffer);
            let session_side = WebSocketStream::from_raw_socket(near, WireRole::Server, None).await;
            let peer = WebSocketStream::from_raw_socket(far, WireRole::Client, None).await;
            let id = self
                .registry
                .spawn(
                    session_side,
                    Role::Server,
                    "/",
                    handler,
                    Arc::new(LogErrorSink),
                    options,
                )
                .expect("spawn session");
            (id, peer)
        }

        async fn join(self) {
            self.shutdown.cancel();
            self.tracker.close();
            self.tracker.wait().await;
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test(tokio::test)]
    async fn test_messages_are_delivered_in_order() {
        let fixture = Fixture::new();
        let recorder = Arc::new(Recorder::default());
        let (id, mut peer) = fixture.session(recorder.clone(), SessionOptions::default(), 64 * 1024).await;

        fixture.registry.send_text(Target::One(id), "a");
        fixture.registry.send_text(id.into(), "b");
        fixture.registry.send_binary(id.into(), Bytes::from_static(b"cc"));

        assert_eq!(
            peer.next().await.unwrap().unwrap(),
            Message::Text("a".into())
        );
        assert_eq!(
            peer.next().await.unwrap().unwrap(),
            Message::Text("b".into())
        );
        assert_eq!(
            peer.next().await.unwrap().unwrap(),
            Message::Binary(Bytes::from_static(b"cc"))
        );

        peer.send(Message::Text("1".into())).await.unwrap();
        peer.send(Message::Text("2".into())).await.unwrap();
        peer.close(None).await.unwrap();

        wait_for(|| recorder.events().contains(&"close".to_string())).await;
        assert_eq!(recorder.events(), vec!["open", "text:1", "text:2", "close"]);

        assert!(fixture.registry.is_empty());
        fixture.join().await;
    }

    #[test(tokio::test)]
    async fn test_queued_writes_drain_before_close_frame() {
        let fixture = Fixture::new();
        let recorder = Arc::new(Recorder::default());
        let (id, mut peer) = fixture.session(recorder.clone(), SessionOptions::default(), 64 * 1024).await;

        let handle = fixture.registry.get(id).unwrap();
        handle.send_text("first").unwrap();
        handle.send_text("second").unwrap();
        handle.close("bye");
        handle.close("ignored");

        assert_eq!(
            peer.next().await.unwrap().unwrap(),
            Message::Text("first".into())
        );
        assert_eq!(
            peer.next().await.unwrap().unwrap(),
            Message::Text("second".into())
        );
        match peer.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(frame.reason.as_str(), "bye"),
            other => panic!("expected close frame, got {:?}", other),
        }

        // Sends after a scheduled close are dropped, not errors.
        assert!(handle.send_text("late").is_ok());

        drop(peer);
        wait_for(|| fixture.registry.is_empty()).await;
        let events = recorder.events();
        assert_eq!(events.iter().filter(|e| *e == &"close".to_string()).count(), 1);
        fixture.join().await;
    }

    #[test(tokio::test)]
    async fn test_write_list_full_is_synchronous() {
        let fixture = Fixture::new();
        let recorder = Arc::new(Recorder::default());
        let options = SessionOptions {
            write_list_limit: 4,
            ..SessionOptions::default()
        };
        // Tiny pipe so the in-flight write blocks and the list backs up.
        let (id, peer) = fixture.session(recorder.clone(), options, 256).await;

        let handle = fixture.registry.get(id).unwrap();
        let payload = Bytes::from(vec![0_u8; 64 * 1024]);

        let mut full = None;
        for attempt in 0..8 {
            match handle.send_binary(payload.clone()) {
                Ok(()) => tokio::time::sleep(Duration::from_millis(20)).await,
                Err(error) => {
                    full = Some((attempt, error));
                    break;
                }
            }
        }
        let (attempt, error) = full.expect("send never failed");
        assert!(matches!(error, SendError::BufferFull));
        assert!(attempt >= 4, "list filled before reaching its capacity");

        drop(peer);
        wait_for(|| fixture.registry.is_empty()).await;
        fixture.join().await;
    }

    #[test(tokio::test)]
    async fn test_broadcast_is_zero_copy_and_exact() {
        let fixture = Fixture::new();
        let recorder = Arc::new(Recorder::default());
        let (id_a, mut peer_a) = fixture.session(recorder.clone(), SessionOptions::default(), 64 * 1024).await;
        let (id_b, mut peer_b) = fixture.session(recorder.clone(), SessionOptions::default(), 64 * 1024).await;
        let (_id_c, mut peer_c) = fixture.session(recorder.clone(), SessionOptions::default(), 64 * 1024).await;

        let payload = Bytes::from_static(b"hello");
        let mut set = BTreeSet::new();
        set.insert(id_a);
        set.insert(id_b);
        // A vanished identifier receives nothing and breaks nothing.
        set.insert(SessionId::next());

        fixture.registry.send_binary(Target::Set(&set), payload.clone());

        assert_eq!(
            peer_a.next().await.unwrap().unwrap(),
            Message::Binary(payload.clone())
        );
        assert_eq!(
            peer_b.next().await.unwrap().unwrap(),
            Message::Binary(payload.clone())
        );

        // Only the targeted sessions saw it.
        fixture.registry.send_text(Target::All, "all");
        assert_eq!(
            peer_a.next().await.unwrap().unwrap(),
            Message::Text("all".into())
        );
        assert_eq!(
            peer_b.next().await.unwrap().unwrap(),
            Message::Text("all".into())
        );
        assert_eq!(
            peer_c.next().await.unwrap().unwrap(),
            Message::Text("all".into())
        );

        fixture.registry.shutdown();
        drop(peer_a);
        drop(peer_b);
        drop(peer_c);
        tokio::time::timeout(Duration::from_secs(5), fixture.registry.wait_idle())
            .await
            .expect("sessions did not drain");
        fixture.join().await;
    }

    #[test(tokio::test)]
    async fn test_shutdown_rejects_new_sessions() {
        let fixture = Fixture::new();
        fixture.registry.shutdown();

        let (near, _far) = tokio::io::duplex(1024);
        let stream = WebSocketStream::from_raw_socket(near, WireRole::Server, None).await;
        let result = fixture.registry.spawn(
            stream,
            Role::Server,
            "/",
            Arc::new(Recorder::default()),
            Arc::new(LogErrorSink),
            SessionOptions::default(),
        );
        assert!(matches!(result, Err(RegistryError::ShuttingDown)));
        fixture.join().await;
    }

    #[test(tokio::test)]
    async fn test_liveness_closes_unresponsive_peer() {
        let fixture = Fixture::new();
        let recorder = Arc::new(Recorder::default());
        let options = SessionOptions {
            ping_interval: Duration::from_millis(100),
            ..SessionOptions::default()
        };
        // The peer never polls its stream, so it never answers pings.
        let (_id, _peer) = fixture.session(recorder.clone(), options, 64 * 1024).await;

        tokio::time::sleep(Duration::from_millis(350)).await;
        wait_for(|| fixture.registry.is_empty()).await;
        assert!(recorder.events().contains(&"close".to_string()));
        fixture.join().await;
    }

    #[test(tokio::test)]
    async fn test_panicking_handler_does_not_tear_down_session() {
        struct Panicky {
            recorder: Recorder,
        }

        #[async_trait]
        impl WsHandler for Panicky {
            async fn on_text(&self, _id: SessionId, _resource: &str, text: Utf8Bytes) {
                panic!("boom on {}", text);
            }

            async fn on_close(&self, _id: SessionId, _resource: &str) {
                self.recorder.push("close".into());
            }

            fn on_panic(&self, _id: SessionId, _resource: &str, message: &str) {
                self.recorder.push(format!("panic:{}", message));
            }
        }

        let fixture = Fixture::new();
        let handler = Arc::new(Panicky {
            recorder: Recorder::default(),
        });
        let (_id, mut peer) = fixture
            .session(handler.clone(), SessionOptions::default(), 64 * 1024)
            .await;

        peer.send(Message::Text("x".into())).await.unwrap();
        wait_for(|| !handler.recorder.events().is_empty()).await;
        assert_eq!(handler.recorder.events(), vec!["panic:boom on x"]);

        peer.close(None).await.unwrap();
        wait_for(|| handler.recorder.events().contains(&"close".to_string())).await;
        fixture.join().await;
    }
}
