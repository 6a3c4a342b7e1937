//! End-to-end tests: client -> relay -> SOCKS5 -> upstream

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

mod common;

use common::{chunk, exchange, get, post, send, spawn_relay, spawn_socks5, spawn_upstream, RelayOptions, Step};

const SSE_HEAD: &str =
    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\n";

#[tokio::test]
async fn test_buffered_response_is_mirrored() {
    let upstream = spawn_upstream(|_| {
        vec![send(
            "HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nX-Upstream: yes\r\nContent-Length: 15\r\n\r\n{\"id\":\"obj-1\"}\n",
        )]
    })
    .await;
    let socks = spawn_socks5(None).await;
    let relay = spawn_relay(upstream.addr, socks.addr, RelayOptions::default()).await;

    let body = r#"{"model":"m","input":"hi"}"#;
    let response = exchange(
        relay,
        &post(
            "/v1/embeddings?api-version=1",
            &[
                ("Authorization", "Bearer sk-test"),
                ("Content-Type", "application/json"),
                ("Proxy-Authorization", "Basic abc"),
                ("Keep-Alive", "timeout=5"),
            ],
            body,
        ),
    )
    .await;

    assert_eq!(response.status(), 201);
    assert_eq!(response.text(), "{\"id\":\"obj-1\"}\n");
    assert_eq!(response.header("X-Upstream"), Some("yes"));
    assert_eq!(response.header("Content-Length"), Some("15"));

    let received = upstream.received();
    assert_eq!(received.len(), 1);
    let request = &received[0];
    assert_eq!(request.target(), "/v1/embeddings?api-version=1");
    assert_eq!(request.body, body.as_bytes());
    assert_eq!(request.header("Host"), Some(upstream.addr.to_string().as_str()));
    assert_eq!(request.header("Authorization"), Some("Bearer sk-test"));
    assert_eq!(request.header("Connection"), Some("close"));
    assert!(request.header("Proxy-Authorization").is_none());
    assert!(request.header("Keep-Alive").is_none());
    assert_eq!(socks.connection_count(), 1);
}

#[tokio::test]
async fn test_chunked_upstream_body_is_buffered() {
    let upstream = spawn_upstream(|_| {
        vec![
            send("HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\n"),
            chunk("{\"data\":"),
            chunk("[1,2,3]}"),
            send("0\r\n\r\n"),
        ]
    })
    .await;
    let socks = spawn_socks5(None).await;
    let relay = spawn_relay(upstream.addr, socks.addr, RelayOptions::default()).await;

    let response = exchange(relay, &get("/v1/models")).await;

    assert_eq!(response.status(), 200);
    assert_eq!(response.text(), "{\"data\":[1,2,3]}");
    assert_eq!(response.header("Content-Length"), Some("16"));
    assert!(response.header("Transfer-Encoding").is_none());
}

#[tokio::test]
async fn test_upstream_error_status_is_mirrored() {
    let upstream = spawn_upstream(|_| {
        vec![send(
            "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 2\r\nContent-Length: 20\r\n\r\n{\"error\":\"slow down\"",
        )]
    })
    .await;
    let socks = spawn_socks5(None).await;
    let relay = spawn_relay(upstream.addr, socks.addr, RelayOptions::default()).await;

    // Streaming requested, but a non-2xx answer comes back whole
    let response = exchange(relay, &post("/v1/chat/completions", &[], r#"{"stream":true}"#)).await;

    assert_eq!(response.status(), 429);
    assert_eq!(response.header("Retry-After"), Some("2"));
    assert_eq!(response.header("Content-Length"), Some("20"));
    assert_eq!(response.text(), "{\"error\":\"slow down\"");
}

#[tokio::test]
async fn test_streaming_events_arrive_in_order() {
    let events = [
        "data: {\"delta\":\"Hel\"}\n\n",
        "data: {\"delta\":\"lo\"}\n\n",
        "data: [DONE]\n\n",
    ];
    let upstream = spawn_upstream(move |_| {
        vec![
            send(SSE_HEAD),
            // First event split across two transfer chunks
            chunk("data: {\"delta\""),
            Step::Pause(Duration::from_millis(30)),
            chunk(":\"Hel\"}\n\n"),
            // Two events in one transfer chunk
            chunk(&format!("{}{}", events[1], events[2])),
            send("0\r\n\r\n"),
        ]
    })
    .await;
    let socks = spawn_socks5(None).await;
    let relay = spawn_relay(upstream.addr, socks.addr, RelayOptions::default()).await;

    let response = exchange(
        relay,
        &post(
            "/v1/chat/completions",
            &[("Content-Type", "application/json"), ("Authorization", "Bearer sk-test")],
            r#"{"model":"m","stream":true}"#,
        ),
    )
    .await;

    assert_eq!(response.status(), 200);
    assert_eq!(response.header("Content-Type"), Some("text/event-stream"));
    assert_eq!(response.header("Cache-Control"), Some("no-cache"));
    assert_eq!(response.header("Transfer-Encoding"), Some("chunked"));
    assert!(response.header("Content-Length").is_none());
    assert!(response.terminated);

    let chunks: Vec<&[u8]> = response.chunks.iter().map(|c| c.as_ref()).collect();
    let expected: Vec<&[u8]> = events.iter().map(|e| e.as_bytes()).collect();
    assert_eq!(chunks, expected);
}

#[tokio::test]
async fn test_streaming_forces_event_stream_content_type() {
    let upstream = spawn_upstream(|_| {
        vec![send("HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\n\r\n{\"a\":1}\n")]
    })
    .await;
    let socks = spawn_socks5(None).await;
    let relay = spawn_relay(upstream.addr, socks.addr, RelayOptions::default()).await;

    let response = exchange(relay, &post("/v1/responses", &[], r#"{"stream":true}"#)).await;

    assert_eq!(response.status(), 200);
    assert_eq!(response.header("Content-Type"), Some("text/event-stream"));
    assert_eq!(response.text(), "{\"a\":1}\n");
    assert!(response.terminated);
}

#[tokio::test]
async fn test_unreachable_tunnel_gives_502_without_upstream_request() {
    let upstream = spawn_upstream(|_| vec![send("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")]).await;
    let dead_socks = common::closed_port().await;
    let relay = spawn_relay(upstream.addr, dead_socks, RelayOptions::default()).await;

    let response = exchange(relay, &get("/v1/models")).await;

    assert_eq!(response.status(), 502);
    assert_eq!(response.header("Content-Type"), Some("application/json"));
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert!(body["error"].is_string());
    assert!(upstream.received().is_empty());
}

#[tokio::test]
async fn test_tunnel_connect_refused_gives_502() {
    let socks = spawn_socks5(None).await;
    let dead_upstream = common::closed_port().await;
    let relay = spawn_relay(dead_upstream, socks.addr, RelayOptions::default()).await;

    let response = exchange(relay, &get("/v1/models")).await;

    assert_eq!(response.status(), 502);
    assert_eq!(socks.connection_count(), 1);
}

#[tokio::test]
async fn test_tunnel_credentials() {
    let upstream = spawn_upstream(|_| vec![send("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")]).await;
    let socks = spawn_socks5(Some(("relay", "hunter2"))).await;

    let good = spawn_relay(
        upstream.addr,
        socks.addr,
        RelayOptions {
            credentials: Some(("relay", "hunter2")),
            ..RelayOptions::default()
        },
    )
    .await;
    let response = exchange(good, &get("/v1/models")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text(), "ok");

    let bad = spawn_relay(
        upstream.addr,
        socks.addr,
        RelayOptions {
            credentials: Some(("relay", "wrong")),
            ..RelayOptions::default()
        },
    )
    .await;
    let response = exchange(bad, &get("/v1/models")).await;
    assert_eq!(response.status(), 502);
    assert_eq!(upstream.received().len(), 1);
}

#[tokio::test]
async fn test_buffered_read_timeout_gives_504() {
    let upstream = spawn_upstream(|_| vec![Step::Pause(Duration::from_secs(5))]).await;
    let socks = spawn_socks5(None).await;
    let relay = spawn_relay(
        upstream.addr,
        socks.addr,
        RelayOptions {
            read_timeout_secs: 1,
            ..RelayOptions::default()
        },
    )
    .await;

    let started = Instant::now();
    let response = exchange(relay, &get("/v1/models")).await;

    assert_eq!(response.status(), 504);
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_stream_timeout_keeps_delivered_chunks() {
    let upstream = spawn_upstream(|_| {
        vec![
            send(SSE_HEAD),
            chunk("data: first\n\n"),
            Step::Pause(Duration::from_secs(5)),
            chunk("data: never\n\n"),
            send("0\r\n\r\n"),
        ]
    })
    .await;
    let socks = spawn_socks5(None).await;
    let relay = spawn_relay(
        upstream.addr,
        socks.addr,
        RelayOptions {
            read_timeout_secs: 1,
            ..RelayOptions::default()
        },
    )
    .await;

    let started = Instant::now();
    let response = exchange(relay, &post("/v1/chat/completions", &[], r#"{"stream":true}"#)).await;

    // Head and the first event went out; then the connection was cut
    assert_eq!(response.status(), 200);
    assert_eq!(response.chunks.len(), 1);
    assert_eq!(response.chunks[0].as_ref(), b"data: first\n\n");
    assert!(!response.terminated);
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_concurrent_requests_use_separate_tunnels() {
    let upstream = spawn_upstream(|request| {
        let body = request.path.clone();
        vec![
            Step::Pause(Duration::from_millis(100)),
            send(format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body)),
        ]
    })
    .await;
    let socks = spawn_socks5(None).await;
    let relay = spawn_relay(upstream.addr, socks.addr, RelayOptions::default()).await;

    let mut tasks = Vec::new();
    for i in 0..5 {
        tasks.push(tokio::spawn(async move {
            let path = format!("/v1/items/{i}");
            let response = exchange(relay, &get(&path)).await;
            (path, response)
        }));
    }

    for task in tasks {
        let (path, response) = task.await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text(), path);
    }
    assert_eq!(socks.connection_count(), 5);
    assert_eq!(upstream.received().len(), 5);
}

#[tokio::test]
async fn test_path_outside_prefix_is_404() {
    let upstream = spawn_upstream(|_| vec![send("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")]).await;
    let socks = spawn_socks5(None).await;
    let relay = spawn_relay(upstream.addr, socks.addr, RelayOptions::default()).await;

    let response = exchange(relay, &get("/v1beta/models")).await;

    assert_eq!(response.status(), 404);
    assert_eq!(socks.connection_count(), 0);
    assert!(upstream.received().is_empty());
}

#[tokio::test]
async fn test_malformed_request_is_400() {
    let upstream = spawn_upstream(|_| vec![]).await;
    let socks = spawn_socks5(None).await;
    let relay = spawn_relay(upstream.addr, socks.addr, RelayOptions::default()).await;

    let response = exchange(relay, b"BREW /v1/pot HTTP/1.1\r\nHost: x\r\n\r\n").await;

    assert_eq!(response.status(), 400);
    assert_eq!(socks.connection_count(), 0);
}

#[tokio::test]
async fn test_keep_alive_serves_pipelined_requests() {
    let upstream = spawn_upstream(|request| {
        let body = request.path.clone();
        vec![send(format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body))]
    })
    .await;
    let socks = spawn_socks5(None).await;
    let relay = spawn_relay(upstream.addr, socks.addr, RelayOptions::default()).await;

    let mut stream = TcpStream::connect(relay).await.unwrap();
    stream
        .write_all(b"GET /v1/a HTTP/1.1\r\nHost: x\r\n\r\nGET /v1/b HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut wire = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut wire))
        .await
        .unwrap()
        .unwrap();

    let first = common::decode_response(&wire);
    assert_eq!(first.status(), 200);
    let text = String::from_utf8(wire).unwrap();
    assert!(text.contains("\r\n\r\n/v1/a"));
    assert!(text.ends_with("\r\n\r\n/v1/b"));
    assert_eq!(socks.connection_count(), 2);
}

#[tokio::test]
async fn test_head_request_has_no_body() {
    let upstream = spawn_upstream(|_| {
        vec![send("HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 123\r\n\r\n")]
    })
    .await;
    let socks = spawn_socks5(None).await;
    let relay = spawn_relay(upstream.addr, socks.addr, RelayOptions::default()).await;

    let response = exchange(relay, b"HEAD /v1/models HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;

    assert_eq!(response.status(), 200);
    assert_eq!(response.header("Content-Length"), Some("123"));
    assert!(response.body.is_empty());
}

#[tokio::test]
async fn test_bodyless_answer_to_streaming_request_is_not_chunked() {
    let upstream = spawn_upstream(|request| {
        if request.path == "/v1/chat/completions" {
            vec![send("HTTP/1.1 204 No Content\r\n\r\n")]
        } else {
            vec![send("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")]
        }
    })
    .await;
    let socks = spawn_socks5(None).await;
    let relay = spawn_relay(upstream.addr, socks.addr, RelayOptions::default()).await;

    let body = r#"{"stream":true}"#;
    let mut stream = TcpStream::connect(relay).await.unwrap();
    let pipelined = format!(
        "POST /v1/chat/completions HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}\
         GET /v1/models HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        body.len(),
        body
    );
    stream.write_all(pipelined.as_bytes()).await.unwrap();

    let mut wire = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut wire))
        .await
        .unwrap()
        .unwrap();
    let text = String::from_utf8(wire).unwrap();

    let (first_head, rest) = text.split_once("\r\n\r\n").unwrap();
    assert!(first_head.starts_with("HTTP/1.1 204 No Content"));
    assert!(!first_head.contains("Transfer-Encoding"));
    assert!(!first_head.contains("text/event-stream"));
    // Nothing between the 204 head and the next response
    assert!(rest.starts_with("HTTP/1.1 200 OK\r\n"), "got {rest:?}");
    assert!(rest.ends_with("\r\n\r\nok"));
}

#[tokio::test]
async fn test_client_disconnect_mid_stream_releases_tunnel() {
    let upstream = spawn_upstream(|_| {
        let mut steps = vec![send(SSE_HEAD), chunk("data: 0\n\n")];
        for i in 1..60 {
            steps.push(Step::Pause(Duration::from_millis(100)));
            steps.push(chunk(&format!("data: {i}\n\n")));
        }
        steps.push(send("0\r\n\r\n"));
        steps
    })
    .await;
    let socks = spawn_socks5(None).await;
    let relay = spawn_relay(
        upstream.addr,
        socks.addr,
        RelayOptions {
            read_timeout_secs: 10,
            ..RelayOptions::default()
        },
    )
    .await;

    let mut stream = TcpStream::connect(relay).await.unwrap();
    stream
        .write_all(&post("/v1/chat/completions", &[], r#"{"stream":true}"#))
        .await
        .unwrap();

    let mut seen = Vec::new();
    let mut buf = [0u8; 1024];
    while !String::from_utf8_lossy(&seen).contains("data: 0\n\n") {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "relay closed before the first event");
        seen.extend_from_slice(&buf[..n]);
    }
    drop(stream);
    let dropped = Instant::now();

    // The upstream's writes start failing once the tunnel is torn down
    while upstream.broken_count() == 0 {
        assert!(
            dropped.elapsed() < Duration::from_secs(4),
            "upstream kept streaming after the client left"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(socks.connection_count(), 1);
}
