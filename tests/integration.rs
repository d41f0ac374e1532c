//! Integration tests driving the fixture worker end to end

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Once;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use rackgate::client::MetaVariables;
use rackgate::error::WorkerError;
use rackgate::pool::{Pool, PoolEvent, PoolOptions};
use rackgate::worker::{Worker, WorkerEvent, WorkerOptions, WorkerState, WORKER_PROGRAM_ENV};
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

static WORKER_ENV: Once = Once::new();

/// Point worker discovery at the fixture binary cargo built for us.
fn ensure_worker_env() {
    WORKER_ENV.call_once(|| {
        std::env::set_var(
            WORKER_PROGRAM_ENV,
            env!("CARGO_BIN_EXE_rackgate-worker"),
        );
    });
}

fn write_fixture(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "rackgate-test-{}-{}.toml",
        name,
        std::process::id()
    ));
    std::fs::write(&path, contents).expect("write fixture config");
    path
}

async fn wait_for_pool_event<F>(events: &mut broadcast::Receiver<PoolEvent>, mut pred: F)
where
    F: FnMut(&PoolEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("pool event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for pool event");
}

async fn wait_for_worker_event<F>(events: &mut broadcast::Receiver<WorkerEvent>, mut pred: F)
where
    F: FnMut(&WorkerEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("worker event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for worker event");
}

fn empty_request(method: &str, uri: &str) -> hyper::Request<Full<Bytes>> {
    hyper::Request::builder()
        .method(method)
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .expect("build request")
}

#[tokio::test]
async fn pool_of_two_reports_ready_and_exit_once() {
    ensure_worker_env();
    let config = write_fixture("ready", "body = \"ok\"\n");
    let pool = Pool::new(
        &config,
        PoolOptions {
            size: 2,
            ..Default::default()
        },
    );
    assert_eq!(pool.len(), 2);
    assert_eq!(pool.ready_count(), 0);
    assert_eq!(pool.alive_count(), 0);

    let mut events = pool.subscribe();
    pool.spawn().await.expect("spawn");

    let mut pool_ready_edges = 0;
    let mut workers_ready = 0;
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(PoolEvent::Ready) => pool_ready_edges += 1,
                Ok(PoolEvent::Worker(_, WorkerEvent::Ready)) => {
                    workers_ready += 1;
                    if workers_ready == 2 {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("pool event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("workers never became ready");

    assert_eq!(pool_ready_edges, 1);
    assert_eq!(pool.ready_count(), 2);
    assert_eq!(pool.alive_count(), 2);

    pool.quit();
    wait_for_pool_event(&mut events, |e| matches!(e, PoolEvent::Exit)).await;
    assert_eq!(pool.alive_count(), 0);
    assert_eq!(pool.ready_count(), 0);

    let _ = std::fs::remove_file(&config);
}

#[tokio::test]
async fn proxy_round_trip() {
    ensure_worker_env();
    let config = write_fixture("hello", "body = \"hello\"\n");
    let pool = Pool::new(&config, PoolOptions::default());

    // Workers spawn lazily on the first proxied request.
    let response = pool
        .proxy(empty_request("GET", "http://localhost/hi"), &MetaVariables::new())
        .await
        .expect("proxy");
    assert_eq!(response.status(), 200);

    let body = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    assert_eq!(&body[..], b"hello");

    // The worker is re-selectable: a second request goes through too.
    let response = pool
        .proxy(empty_request("GET", "http://localhost/again"), &MetaVariables::new())
        .await
        .expect("second proxy");
    assert_eq!(response.status(), 200);

    pool.quit();
    let _ = std::fs::remove_file(&config);
}

#[tokio::test]
async fn environment_reaches_the_worker() {
    ensure_worker_env();
    let config = write_fixture("echo", "echo_env = true\n");
    let pool = Pool::new(&config, PoolOptions::default());

    let req = hyper::Request::builder()
        .method("POST")
        .uri("http://ignored/a?b=1")
        .header("Host", "x:81")
        .header("Content-Type", "t")
        .header("X-Foo", "y")
        .body(Full::new(Bytes::from_static(b"payload")))
        .expect("build request");
    let mut meta = MetaVariables::new();
    meta.insert("REMOTE_ADDR".to_string(), "1.2.3.4".to_string());

    let response = pool.proxy(req, &meta).await.expect("proxy");
    assert_eq!(response.status(), 200);

    let body = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    let env: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(&body).expect("env json");

    assert_eq!(env["REQUEST_METHOD"], "POST");
    assert_eq!(env["PATH_INFO"], "/a");
    assert_eq!(env["QUERY_STRING"], "b=1");
    assert_eq!(env["SCRIPT_NAME"], "");
    assert_eq!(env["SERVER_NAME"], "x");
    assert_eq!(env["SERVER_PORT"], "81");
    assert_eq!(env["CONTENT_TYPE"], "t");
    assert_eq!(env["HTTP_X_FOO"], "y");
    assert_eq!(env["REMOTE_ADDR"], "1.2.3.4");

    pool.quit();
    let _ = std::fs::remove_file(&config);
}

#[tokio::test]
async fn boot_failure_surfaces_the_message_then_exit() {
    ensure_worker_env();
    let config = write_fixture("boom", "boot_error = \"b00m\"\n");
    let pool = Pool::new(&config, PoolOptions::default());

    let mut events = pool.subscribe();
    pool.spawn().await.expect("spawn itself succeeds");

    let mut message = None;
    wait_for_pool_event(&mut events, |event| {
        if let PoolEvent::Worker(_, WorkerEvent::Error(WorkerError::SpawnFailed(msg))) = event {
            message = Some(msg.clone());
            true
        } else {
            false
        }
    })
    .await;
    assert_eq!(message.as_deref(), Some("b00m"));

    wait_for_pool_event(&mut events, |e| matches!(e, PoolEvent::Exit)).await;
    assert_eq!(pool.alive_count(), 0);

    let _ = std::fs::remove_file(&config);
}

#[tokio::test]
async fn pool_with_missing_config_reports_error_and_exit() {
    ensure_worker_env();
    let pool = Pool::new("/nonexistent/rackgate-app.toml", PoolOptions::default());

    let mut events = pool.subscribe();
    let err = pool.spawn().await.expect_err("spawn must fail");
    assert!(matches!(err, WorkerError::ConfigMissing(_)));

    wait_for_pool_event(&mut events, |event| {
        matches!(
            event,
            PoolEvent::Worker(_, WorkerEvent::Error(WorkerError::ConfigMissing(_)))
        )
    })
    .await;

    // No child ever existed, but the pool still winds down to zero.
    wait_for_pool_event(&mut events, |e| matches!(e, PoolEvent::Exit)).await;
    assert_eq!(pool.alive_count(), 0);
    assert_eq!(pool.ready_count(), 0);
}

#[tokio::test]
async fn proxying_to_a_broken_config_returns_the_boot_error() {
    ensure_worker_env();
    let config = write_fixture("boom-proxy", "boot_error = \"kaput\"\n");
    let pool = Pool::new(&config, PoolOptions::default());

    let err = pool
        .proxy(empty_request("GET", "http://localhost/"), &MetaVariables::new())
        .await
        .expect_err("proxy must fail");
    match err {
        WorkerError::SpawnFailed(message) => assert_eq!(message, "kaput"),
        other => panic!("unexpected error: {:?}", other),
    }

    let _ = std::fs::remove_file(&config);
}

#[tokio::test]
async fn restart_cycles_workers_and_quits_cleanly() {
    ensure_worker_env();
    let config = write_fixture("restart", "body = \"ok\"\n");
    let pool = Pool::new(
        &config,
        PoolOptions {
            size: 2,
            ..Default::default()
        },
    );

    let mut events = pool.subscribe();
    pool.spawn().await.expect("spawn");
    let mut workers_ready = 0;
    wait_for_pool_event(&mut events, |event| {
        if matches!(event, PoolEvent::Worker(_, WorkerEvent::Ready)) {
            workers_ready += 1;
        }
        workers_ready == 2
    })
    .await;
    assert_eq!(pool.ready_count(), 2);

    let mut restart_events = pool.subscribe();
    pool.restart().await;

    // Both workers cycled through exit and back to ready.
    let mut exits = 0;
    let mut readies = 0;
    timeout(WAIT, async {
        loop {
            match restart_events.recv().await {
                Ok(PoolEvent::Worker(_, WorkerEvent::Exit(_))) => exits += 1,
                Ok(PoolEvent::Worker(_, WorkerEvent::Ready)) => readies += 1,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("pool event stream closed: {}", e),
            }
            if exits >= 2 && readies >= 2 {
                break;
            }
        }
    })
    .await
    .expect("restart never completed");
    assert_eq!(pool.alive_count(), 2);

    // A restarted pool still terminates cleanly.
    let mut quit_events = pool.subscribe();
    pool.quit();
    wait_for_pool_event(&mut quit_events, |e| matches!(e, PoolEvent::Exit)).await;
    assert_eq!(pool.alive_count(), 0);

    let _ = std::fs::remove_file(&config);
}

#[tokio::test]
async fn worker_exchange_api_round_trip() {
    ensure_worker_env();
    let config = write_fixture(
        "exchange",
        "status = 201\nbody = \"pong\"\n[headers]\nX-Test = \"1\"\n",
    );
    let worker = Worker::new(&config, WorkerOptions::default());

    let connection = worker.create_connection().await.expect("connection");
    assert_eq!(worker.state(), WorkerState::Busy);

    let mut exchange = connection
        .request("GET", "/ping", &[], &HashMap::new())
        .await
        .expect("request");
    exchange.end(None).await.expect("end");
    assert!(matches!(
        exchange.write("late").await,
        Err(WorkerError::WriteAfterEnd)
    ));

    let head = exchange.response_head().await.expect("head");
    assert_eq!(head.status, 201);
    assert!(head
        .headers
        .iter()
        .any(|(name, value)| name == "X-Test" && value == "1"));

    let mut body = Vec::new();
    while let Some(chunk) = exchange.next_chunk().await.expect("chunk") {
        body.extend_from_slice(&chunk);
    }
    assert_eq!(body, b"pong");

    // Dropping the exchange returns the worker to ready.
    let mut events = worker.subscribe();
    drop(exchange);
    wait_for_worker_event(&mut events, |e| matches!(e, WorkerEvent::Ready)).await;
    assert_eq!(worker.state(), WorkerState::Ready);

    worker.quit();
    wait_for_worker_event(&mut events, |e| matches!(e, WorkerEvent::Exit(_))).await;
    assert_eq!(worker.state(), WorkerState::Absent);

    let _ = std::fs::remove_file(&config);
}

#[tokio::test]
async fn terminate_kills_a_ready_worker() {
    ensure_worker_env();
    let config = write_fixture("terminate", "body = \"ok\"\n");
    let worker = Worker::new(&config, WorkerOptions::default());

    let mut events = worker.subscribe();
    worker.spawn().await.expect("spawn");
    wait_for_worker_event(&mut events, |e| matches!(e, WorkerEvent::Ready)).await;
    let socket = worker.socket_path().expect("socket path");

    worker.terminate();
    wait_for_worker_event(&mut events, |e| matches!(e, WorkerEvent::Quitting)).await;
    wait_for_worker_event(&mut events, |e| matches!(e, WorkerEvent::Exit(_))).await;
    assert_eq!(worker.state(), WorkerState::Absent);
    assert!(worker.socket_path().is_none());

    // Temp paths are unlinked best-effort on exit.
    assert!(!socket.exists());

    let _ = std::fs::remove_file(&config);
}

#[tokio::test]
async fn idle_worker_quits_itself() {
    ensure_worker_env();
    let config = write_fixture("idle", "body = \"ok\"\n");
    let worker = Worker::new(
        &config,
        WorkerOptions {
            idle: Some(Duration::from_millis(300)),
            ..Default::default()
        },
    );

    let mut events = worker.subscribe();
    let connection = worker.create_connection().await.expect("connection");
    let mut exchange = connection
        .request("GET", "/", &[], &HashMap::new())
        .await
        .expect("request");
    exchange.end(None).await.expect("end");
    let head = exchange.response_head().await.expect("head");
    assert_eq!(head.status, 200);
    while exchange.next_chunk().await.expect("chunk").is_some() {}
    drop(exchange);

    wait_for_worker_event(&mut events, |e| matches!(e, WorkerEvent::Idle)).await;
    wait_for_worker_event(&mut events, |e| matches!(e, WorkerEvent::Exit(_))).await;
    assert_eq!(worker.state(), WorkerState::Absent);

    let _ = std::fs::remove_file(&config);
}

#[tokio::test]
async fn spawn_is_refused_while_live() {
    ensure_worker_env();
    let config = write_fixture("respawn", "body = \"ok\"\n");
    let worker = Worker::new(&config, WorkerOptions::default());

    let mut events = worker.subscribe();
    worker.spawn().await.expect("spawn");
    wait_for_worker_event(&mut events, |e| matches!(e, WorkerEvent::Ready)).await;

    let err = worker.spawn().await.expect_err("second spawn must fail");
    assert!(matches!(err, WorkerError::InvalidState(_)));
    assert_eq!(worker.state(), WorkerState::Ready);

    worker.quit();
    wait_for_worker_event(&mut events, |e| matches!(e, WorkerEvent::Exit(_))).await;

    let _ = std::fs::remove_file(&config);
}

#[tokio::test]
async fn aggregate_streams_carry_tagged_worker_output() {
    ensure_worker_env();
    let config = write_fixture("banner", "body = \"ok\"\nstdout_banner = \"worker booted\"\n");
    let pool = Pool::new(&config, PoolOptions::default());

    let mut events = pool.subscribe();
    pool.spawn().await.expect("spawn");
    wait_for_pool_event(&mut events, |e| matches!(e, PoolEvent::Ready)).await;

    let chunk = timeout(WAIT, pool.stdout().recv())
        .await
        .expect("stdout chunk in time")
        .expect("stdout chunk");
    assert!(chunk.tag.starts_with("worker."));
    assert!(String::from_utf8_lossy(&chunk.data).contains("worker booted"));

    pool.quit();
    wait_for_pool_event(&mut events, |e| matches!(e, PoolEvent::Exit)).await;

    let _ = std::fs::remove_file(&config);
}
