use std::sync::Arc;

use integration_tests::*;
use test_log::test;

/// Upgrade requests are dispatched to services by exact resource match; a
/// miss fails the connecting client's handshake.
#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_router_dispatch_and_miss() {
    let echo = Arc::new(EchoService::default());
    let mirror = Arc::new(Recorder::default());

    let router = Arc::new(ServiceRouter::new());
    router.add_service("/echo", echo.clone()).unwrap();
    router.add_service("/mirror", mirror.clone()).unwrap();

    let server = Server::bind(
        localhost_config(),
        Arc::new(NotFoundHandler),
        Some(WsRoute::Router(router.clone())),
        Arc::new(LogErrorSink),
    )
    .await
    .unwrap();
    let port = server.local_addr().port();

    // Known resource: served by the echo service.
    let recorder = Arc::new(Recorder::default());
    let client = test_client(recorder.clone());
    client.connect("127.0.0.1", port, "/echo").await.unwrap();
    client.send_text("ping").unwrap();
    wait_for(|| recorder.texts() == 1).await;
    assert_eq!(echo.recorder.texts(), 1);
    assert_eq!(mirror.texts(), 0);

    // Unknown resource: the handshake fails, nothing is registered.
    let other = test_client(Arc::new(Recorder::default()));
    let result = other.connect("127.0.0.1", port, "/nope").await;
    assert!(matches!(result, Err(ConnectError::Handshake(_))));
    assert!(!other.is_connected());

    // Erasing a service closes its remaining sessions.
    router.erase_service("/echo").unwrap();
    wait_for(|| recorder.closes() == 1).await;
    wait_for(|| server.sessions().is_empty()).await;

    client.shutdown();
    client.join().await;
    other.shutdown();
    other.join().await;
    server.stop();
    server.join().await;
}
