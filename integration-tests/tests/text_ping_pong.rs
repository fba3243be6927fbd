use std::sync::Arc;

use integration_tests::*;
use test_log::test;

const LIMIT: u64 = 1_000;

/// Both sides increment the number they receive and send it back; the
/// server closes after sending the limit. Every message arrives exactly
/// once and in order, and the client observes the close.
#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_text_ping_pong() {
    let service = Arc::new(CountingService::new(LIMIT));
    let server = bind_server(localhost_config(), service.clone()).await;

    let handler = Arc::new(CountingClient::new(LIMIT));
    let client = test_client(handler.clone());
    client
        .connect("127.0.0.1", server.local_addr().port(), "/")
        .await
        .unwrap();

    wait_for(|| handler.is_closed()).await;

    // Server sends 0, 2, 4, .., LIMIT; the client answers the odd numbers.
    assert_eq!(handler.last(), LIMIT);
    assert_eq!(handler.received(), LIMIT / 2 + 1);
    assert_eq!(service.received(), LIMIT / 2);

    client.shutdown();
    client.join().await;
    server.stop();
    server.join().await;
}
