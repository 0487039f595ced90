//! Webhook delivery end to end: signed POSTs against a mock receiver,
//! per-target ordering under mixed priorities, dead-lettering after
//! exhausted retries, and queue overflow accounting.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use webharvest::config::WebhookConfig;
use webharvest::metrics::Metrics;
use webharvest::webhook::{EventPriority, WebhookDispatcher, sign, verify};

/// Minimal HTTP receiver that records the `X-Event-Id` of every POST
/// in arrival order. mockito cannot assert ordering across requests,
/// so the ordering tests read ids off this channel instead.
async fn order_capture_server() -> (
    String,
    tokio::sync::mpsc::UnboundedReceiver<u64>,
) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut reader = tokio::io::BufReader::new(stream);
                let mut line = String::new();
                let mut event_id: Option<u64> = None;
                let mut content_length = 0usize;
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        break;
                    }
                    if let Some((name, value)) = trimmed.split_once(':') {
                        match name.trim().to_ascii_lowercase().as_str() {
                            "x-event-id" => event_id = value.trim().parse().ok(),
                            "content-length" => {
                                content_length = value.trim().parse().unwrap_or(0);
                            }
                            _ => {}
                        }
                    }
                }
                let mut body = vec![0u8; content_length];
                let _ = reader.read_exact(&mut body).await;
                if let Some(id) = event_id {
                    let _ = tx.send(id);
                }
                let mut stream = reader.into_inner();
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    )
                    .await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (format!("http://{addr}/hook"), rx)
}

fn dispatcher(
    data_dir: &std::path::Path,
    config: WebhookConfig,
) -> (Arc<WebhookDispatcher>, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::new());
    let dispatcher = WebhookDispatcher::new(
        config,
        data_dir,
        reqwest::Client::new(),
        Arc::clone(&metrics),
    )
    .expect("dispatcher");
    (dispatcher, metrics)
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn delivery_carries_a_verifiable_signature() {
    let mut server = mockito::Server::new_async().await;
    let payload = serde_json::json!({"a": 1});
    let body = serde_json::to_vec(&payload).expect("body");
    let expected_signature = sign("s", &body);
    assert!(expected_signature.starts_with("sha256="));

    let mock = server
        .mock("POST", "/hook")
        .match_header("x-signature", expected_signature.as_str())
        .match_header("x-event-id", mockito::Matcher::Any)
        .match_header("x-timestamp", mockito::Matcher::Any)
        .match_body(mockito::Matcher::Exact(String::from_utf8(body.clone()).expect("utf8")))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let config = WebhookConfig {
        signing_secret: Some("s".into()),
        ..WebhookConfig::default()
    };
    let (dispatcher, _metrics) = dispatcher(dir.path(), config);
    let cancel = CancellationToken::new();
    tokio::spawn(Arc::clone(&dispatcher).run(cancel.clone()));

    dispatcher.enqueue(
        "change_detected",
        payload,
        &format!("{}/hook", server.url()),
        EventPriority::Normal,
    );

    wait_until(|| dispatcher.counters().0 == 1).await;
    mock.assert_async().await;
    cancel.cancel();

    // A flipped byte produces a different signature.
    assert_ne!(sign("s", br#"{"a":2}"#), expected_signature);
    // And the verification helper accepts the genuine pair.
    let now = chrono::Utc::now().timestamp().to_string();
    assert!(verify("s", &body, &expected_signature, &now, Duration::from_secs(300)));
}

#[tokio::test]
async fn same_target_mixed_priorities_deliver_in_event_id_order() {
    let (target, mut received) = order_capture_server().await;

    let dir = tempfile::tempdir().expect("tempdir");
    let config = WebhookConfig {
        signing_secret: Some("s".into()),
        ..WebhookConfig::default()
    };
    let (dispatcher, _metrics) = dispatcher(dir.path(), config);

    // Queue both before the delivery loop starts so the high-priority
    // event is pending alongside the earlier low-priority one.
    let low = dispatcher.enqueue(
        "change_detected",
        serde_json::json!({"seq": "first"}),
        &target,
        EventPriority::Low,
    );
    let high = dispatcher.enqueue(
        "alert_triggered",
        serde_json::json!({"seq": "second"}),
        &target,
        EventPriority::High,
    );
    assert!(low < high);

    let cancel = CancellationToken::new();
    tokio::spawn(Arc::clone(&dispatcher).run(cancel.clone()));
    wait_until(|| dispatcher.counters().0 == 2).await;
    cancel.cancel();

    // One subscription, non-decreasing event ids on first delivery:
    // priority must not let the later event overtake.
    let first = received.recv().await.expect("first delivery");
    let second = received.recv().await.expect("second delivery");
    assert_eq!(first, low);
    assert_eq!(second, high);
}

#[tokio::test]
async fn exhausted_retries_land_in_the_dead_letter_log() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/down")
        .with_status(500)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let config = WebhookConfig {
        max_attempts: 1,
        signing_secret: Some("s".into()),
        ..WebhookConfig::default()
    };
    let (dispatcher, _metrics) = dispatcher(dir.path(), config);
    let cancel = CancellationToken::new();
    tokio::spawn(Arc::clone(&dispatcher).run(cancel.clone()));

    let event_id = dispatcher.enqueue(
        "change_detected",
        serde_json::json!({"x": true}),
        &format!("{}/down", server.url()),
        EventPriority::High,
    );

    wait_until(|| dispatcher.counters().1 == 1).await;
    mock.assert_async().await;
    cancel.cancel();

    let dlq = std::fs::read_to_string(dir.path().join("webhooks").join("dlq.jsonl"))
        .expect("dlq exists");
    let record: serde_json::Value =
        serde_json::from_str(dlq.lines().next().expect("one line")).expect("json");
    assert_eq!(record["event_id"], event_id);
    assert_eq!(record["error_kind"], "HTTPStatus");
    assert_eq!(record["attempts"], 1);
}

#[tokio::test]
async fn overflow_drops_exactly_one_and_counts_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = WebhookConfig {
        queue_size: 3,
        ..WebhookConfig::default()
    };
    let (dispatcher, metrics) = dispatcher(dir.path(), config);
    // No delivery loop: the queue just fills.
    for i in 0..3 {
        dispatcher.enqueue(
            "k",
            serde_json::json!({"i": i}),
            "http://unused.invalid/",
            EventPriority::Low,
        );
    }
    assert_eq!(dispatcher.pending(), 3);
    assert_eq!(metrics.counter("queue_overflow", ""), 0);

    dispatcher.enqueue(
        "k",
        serde_json::json!({"i": 3}),
        "http://unused.invalid/",
        EventPriority::High,
    );
    assert_eq!(dispatcher.pending(), 3, "queue stays at capacity");
    assert_eq!(metrics.counter("queue_overflow", ""), 1);

    // The dropped event id is recorded for recovery.
    let recovery = std::fs::read_to_string(dir.path().join("webhooks").join("dropped.jsonl"))
        .expect("recovery log");
    assert_eq!(recovery.lines().count(), 1);
}
