mod common;

use common::mock_server::{HangingServer, MockServer};
use common::RecordingBackend;
use http_body_util::BodyExt;
use hyper::StatusCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use traceview::{
    spawn_trace_worker, BackendError, BatchPoints, ClientOptions, Error, InfluxHttpBackend,
    InfluxOptions, MetricsBackend, Point, TraceInfo, TraceSink, TracedClient, WorkerOptions,
};

fn client_with_queue() -> (TracedClient, mpsc::Receiver<TraceInfo>) {
    let (tx, rx) = mpsc::channel(16);
    let client = TracedClient::with_sink(&ClientOptions::default(), Some(TraceSink::new(tx)))
        .expect("client builds");
    (client, rx)
}

async fn next_trace(rx: &mut mpsc::Receiver<TraceInfo>) -> TraceInfo {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("trace delivered in time")
        .expect("queue open")
}

#[tokio::test]
async fn traced_get_returns_ok_and_delivers_trace() {
    let server = MockServer::start().await;
    let (client, mut rx) = client_with_queue();

    let req = client
        .new_traced_request("GET", &format!("{}/ping", server.url()), "")
        .unwrap();
    let res = client.execute(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], br#"{"ok":true}"#);

    let info = next_trace(&mut rx).await;
    assert_eq!(info.hostname, "127.0.0.1");
    assert!(info.conn_build_time > 0.0);
    assert!(info.dial_time >= info.conn_build_time);
    assert_eq!(info.dial_info, format!("tcp {} connected", server.addr));
    assert!(info.connection_build_time >= info.dial_time);
    assert!(info.headers_written_time > 0.0);
    assert_eq!(info.peer_address, server.addr.to_string());
    assert!(!info.is_reused);
    assert!(!info.is_idle);
    // IP literal, no lookup and no TLS.
    assert_eq!(info.dns_query_start_time, 0.0);
    assert_eq!(info.tls_handshake_start, 0.0);
    assert!(info.finished_at.is_some());

    let requests = server.get_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/ping");
}

#[tokio::test]
async fn kept_alive_connection_is_reported_reused_and_idle() {
    let server = MockServer::start().await;
    let (client, mut rx) = client_with_queue();

    for _ in 0..2 {
        let req = client
            .new_traced_request("GET", &server.url(), "")
            .unwrap();
        let res = client.execute(req).await.unwrap();
        res.into_body().collect().await.unwrap();
        // Give the pool time to take the connection back.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let first = next_trace(&mut rx).await;
    let second = next_trace(&mut rx).await;
    assert!(!first.is_reused);
    assert!(second.is_reused);
    assert!(second.is_idle);
    assert_eq!(second.dial_time, 0.0);
    assert_eq!(second.peer_address, server.addr.to_string());
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn connection_first_used_untraced_is_reported_reused() {
    let server = MockServer::start().await;
    let (client, mut rx) = client_with_queue();

    let res = client
        .execute(client.new_request("GET", &server.url(), "").unwrap())
        .await
        .unwrap();
    res.into_body().collect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let res = client
        .execute(client.new_traced_request("GET", &server.url(), "").unwrap())
        .await
        .unwrap();
    res.into_body().collect().await.unwrap();

    let info = next_trace(&mut rx).await;
    assert_eq!(server.connection_count(), 1);
    assert_eq!(info.dial_time, 0.0);
    assert!(info.is_reused);
    assert!(info.is_idle);
}

#[tokio::test]
async fn deadline_bound_request_answered_in_time() {
    let server = MockServer::start().await;
    let (client, mut rx) = client_with_queue();

    let (req, guard) = client
        .new_traced_request_with_timeout("GET", &server.url(), "", Duration::from_secs(5))
        .unwrap();
    let started = Instant::now();
    let res = client.execute_with_deadline(req).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(res.status(), StatusCode::OK);

    // Releasing the context after the response must not affect it.
    drop(guard);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], br#"{"ok":true}"#);

    let info = next_trace(&mut rx).await;
    assert_eq!(info.peer_address, server.addr.to_string());
    assert!(info.connection_build_time > 0.0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn untraced_request_behaves_like_traced() {
    let server = MockServer::start_with_status(StatusCode::ACCEPTED).await;
    let client = TracedClient::new(&ClientOptions::default()).unwrap();

    let plain = client
        .execute(client.new_request("POST", &server.url(), "data").unwrap())
        .await
        .unwrap();
    let traced = client
        .execute(client.new_traced_request("POST", &server.url(), "data").unwrap())
        .await
        .unwrap();

    assert_eq!(plain.status(), traced.status());
    assert!(plain.extensions().get::<TraceInfo>().is_none());
    // Without a sink the finished trace rides on the response.
    let info = traced.extensions().get::<TraceInfo>().cloned().unwrap();
    assert_eq!(info.hostname, "127.0.0.1");

    let plain_body = plain.into_body().collect().await.unwrap().to_bytes();
    let traced_body = traced.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(plain_body, traced_body);

    let requests = server.get_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].body, requests[1].body);
    assert_eq!(requests[0].method, "POST");
}

#[tokio::test]
async fn transport_errors_are_identical_with_or_without_trace() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let (client, mut rx) = client_with_queue();
    let plain = client
        .execute(client.new_request("GET", &url, "").unwrap())
        .await;
    let traced = client
        .execute(client.new_traced_request("GET", &url, "").unwrap())
        .await;
    assert!(matches!(plain, Err(Error::Transport(_))));
    assert!(matches!(traced, Err(Error::Transport(_))));

    let info = next_trace(&mut rx).await;
    assert!(info.dial_info.contains("failed"));
    assert!(info.peer_address.is_empty());
}

#[tokio::test]
async fn deadline_expires_against_silent_server() {
    let server = HangingServer::start().await;
    let (client, mut rx) = client_with_queue();

    let (req, _guard) = client
        .new_traced_request_with_timeout("GET", &server.url(), "", Duration::from_secs(5))
        .unwrap();
    let started = Instant::now();
    let res = client.execute_with_deadline(req).await;
    let elapsed = started.elapsed();

    let err = res.unwrap_err();
    assert!(err.is_deadline_exceeded(), "unexpected error: {err}");
    assert!(elapsed >= Duration::from_secs(5), "returned early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(5200), "returned late: {elapsed:?}");

    // The abandoned request still reports what it got through.
    let info = next_trace(&mut rx).await;
    assert!(info.dial_time > 0.0);
    assert_eq!(info.peer_address, server.addr.to_string());
}

#[tokio::test]
async fn guard_cancel_stops_request() {
    let server = HangingServer::start().await;
    let client = TracedClient::new(&ClientOptions::default()).unwrap();

    let (req, guard) = client
        .new_traced_request_with_timeout("GET", &server.url(), "", Duration::from_secs(30))
        .unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        guard.cancel();
    });

    let started = Instant::now();
    let res = client.execute_with_deadline(req).await;
    assert!(matches!(res, Err(Error::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn worker_writes_points_in_enqueue_order() {
    let backend = Arc::new(RecordingBackend::default());
    let (sink, handle) = spawn_trace_worker(backend.clone(), WorkerOptions::default());

    for host in ["A", "B", "C"] {
        assert!(sink.deliver(TraceInfo::new(host)));
    }
    handle.shutdown().await;

    let batches = backend.batches.lock().unwrap();
    assert_eq!(batches.len(), 3);
    assert!(batches.iter().all(|batch| batch.points.len() == 1));
    drop(batches);
    assert_eq!(backend.hostnames(), vec!["A", "B", "C"]);
}

#[tokio::test]
async fn traced_requests_flow_into_backend() {
    let server = MockServer::start().await;
    let backend = Arc::new(RecordingBackend::default());
    let (sink, handle) = spawn_trace_worker(backend.clone(), WorkerOptions::default());
    let client = TracedClient::builder().sink(sink).build().unwrap();

    let req = client.new_traced_request("GET", &server.url(), "").unwrap();
    let res = client.execute(req).await.unwrap();
    res.into_body().collect().await.unwrap();
    handle.shutdown().await;

    let batches = backend.batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    let point = &batches[0].points[0];
    assert_eq!(point.measurement, "traceview");
    assert_eq!(point.tags["hostname"], "127.0.0.1");
    assert_eq!(point.tags["remoteaddress"], server.addr.to_string());
    assert_eq!(point.fields.len(), 12);
}

#[tokio::test]
async fn influx_backend_posts_line_protocol() {
    let influx = MockServer::start_with_status(StatusCode::NO_CONTENT).await;
    let backend = InfluxHttpBackend::new(&InfluxOptions {
        url: influx.url(),
        username: None,
        password: None,
    })
    .unwrap();

    let mut info = TraceInfo::new("example.com");
    info.peer_address = "10.0.0.1:443".into();
    info.dial_info = "tcp 10.0.0.1:443 connected".into();
    let mut batch = BatchPoints::new("traceview");
    batch.add_point(Point::from_trace("traceview", &info, chrono::Utc::now()));
    backend.write(batch).await.unwrap();

    let requests = influx.get_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].path, "/write");
    assert_eq!(requests[0].query.as_deref(), Some("db=traceview&precision=ms"));
    let line = String::from_utf8(requests[0].body.clone()).unwrap();
    assert!(line.starts_with("traceview,hostname=example.com,remoteaddress=10.0.0.1:443 "));
    assert!(line.contains(r#"dail.info="tcp 10.0.0.1:443 connected""#));
}

#[tokio::test]
async fn influx_error_status_is_reported() {
    let influx = MockServer::start_with_status(StatusCode::INTERNAL_SERVER_ERROR).await;
    let backend = InfluxHttpBackend::new(&InfluxOptions {
        url: influx.url(),
        username: None,
        password: None,
    })
    .unwrap();

    let mut batch = BatchPoints::new("traceview");
    batch.add_point(Point::from_trace(
        "traceview",
        &TraceInfo::new("h"),
        chrono::Utc::now(),
    ));
    match backend.write(batch).await {
        Err(BackendError::Status { status, .. }) => {
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR)
        }
        other => panic!("unexpected result: {other:?}"),
    }
}
