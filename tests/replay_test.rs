//! End-to-end replay tests: worker pool dispatch, failure policy, pacing,
//! and id filtering against a live test target.

mod common;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::Router;
use common::*;
use sinkhole::archive::ArchiveOptions;
use sinkhole::record::RequestFrame;
use sinkhole::replay::{replay_file, ReplaySettings};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::tempdir;

#[derive(Debug, Clone)]
struct Hit {
    id: String,
    uri: String,
}

#[derive(Clone)]
struct TargetState {
    hits: Arc<Mutex<Vec<Hit>>>,
    counter: Arc<AtomicU64>,
    responder: Arc<dyn Fn(u64) -> StatusCode + Send + Sync>,
}

async fn target_handler(
    State(state): State<TargetState>,
    _method: Method,
    uri: Uri,
    headers: HeaderMap,
    _body: Bytes,
) -> StatusCode {
    let n = state.counter.fetch_add(1, Ordering::SeqCst);
    state.hits.lock().unwrap().push(Hit {
        id: headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        uri: uri.to_string(),
    });
    (state.responder)(n)
}

/// Spawn a target server; `responder` maps the 0-based request index to a
/// status code.
async fn spawn_target(
    responder: impl Fn(u64) -> StatusCode + Send + Sync + 'static,
) -> (SocketAddr, Arc<Mutex<Vec<Hit>>>) {
    let state = TargetState {
        hits: Arc::new(Mutex::new(Vec::new())),
        counter: Arc::new(AtomicU64::new(0)),
        responder: Arc::new(responder),
    };
    let hits = state.hits.clone();
    let app = Router::new().fallback(target_handler).with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, hits)
}

fn replay_frames(count: usize) -> Vec<RequestFrame> {
    (0..count)
        .map(|i| {
            frame(
                &format!("req-{i}"),
                "POST",
                &format!("/replayed/{i}"),
                format!("X-Request-ID: req-{i}\r\nContent-Type: text/plain\r\n").as_bytes(),
                format!("body-{i}").as_bytes(),
            )
        })
        .collect()
}

fn settings_for(target: SocketAddr, threads: usize) -> ReplaySettings {
    ReplaySettings {
        target_host: target.to_string(),
        num_requests: 0,
        num_threads: threads,
        min_delay_ms: 0,
        dry_run: false,
        extract_to_file: false,
        req_id: String::new(),
        quiet: true,
        exit_on_first_error: false,
        output_directory: ".".to_string(),
        test_integrity: false,
    }
}

/// Without exit-on-error, every request is attempted even when the target
/// fails one of them.
#[tokio::test(flavor = "multi_thread")]
async fn test_all_requests_attempted_without_exit_on_error() {
    let dir = tempdir().unwrap();
    let finalized = write_archive(
        dir.path().to_str().unwrap(),
        &replay_frames(10),
        ArchiveOptions::default(),
    )
    .await;
    let archive_path = staged_dir(dir.path()).join(&finalized[0]);

    let (addr, hits) = spawn_target(|n| {
        if n == 3 {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        }
    })
    .await;

    let client = reqwest::Client::new();
    let settings = settings_for(addr, 2);
    let dispatched = replay_file(archive_path.to_str().unwrap(), &settings, &client)
        .await
        .unwrap();

    assert_eq!(dispatched, 10);
    assert_eq!(hits.lock().unwrap().len(), 10);
}

/// With exit-on-error, a single failure stops the driver and every worker
/// terminates within a bounded time.
#[tokio::test(flavor = "multi_thread")]
async fn test_exit_on_error_cascade_terminates() {
    let dir = tempdir().unwrap();
    let finalized = write_archive(
        dir.path().to_str().unwrap(),
        &replay_frames(50),
        ArchiveOptions::default(),
    )
    .await;
    let archive_path = staged_dir(dir.path()).join(&finalized[0]);

    let (addr, hits) = spawn_target(|n| {
        if n == 3 {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        }
    })
    .await;

    let client = reqwest::Client::new();
    let mut settings = settings_for(addr, 4);
    settings.exit_on_first_error = true;

    let result = tokio::time::timeout(
        Duration::from_secs(30),
        replay_file(archive_path.to_str().unwrap(), &settings, &client),
    )
    .await
    .expect("replay deadlocked after a worker failure");

    assert!(result.is_err());
    // dispatch stopped well short of the full archive
    assert!(hits.lock().unwrap().len() < 50);
}

/// With an id filter, exactly one outbound request is issued, and it is
/// the matching one.
#[tokio::test(flavor = "multi_thread")]
async fn test_id_filter_replays_exactly_one() {
    let dir = tempdir().unwrap();
    let finalized = write_archive(
        dir.path().to_str().unwrap(),
        &replay_frames(10),
        ArchiveOptions::default(),
    )
    .await;
    let archive_path = staged_dir(dir.path()).join(&finalized[0]);

    let (addr, hits) = spawn_target(|_| StatusCode::OK).await;

    let client = reqwest::Client::new();
    let mut settings = settings_for(addr, 3);
    settings.req_id = "req-5".to_string();

    let result = tokio::time::timeout(
        Duration::from_secs(30),
        replay_file(archive_path.to_str().unwrap(), &settings, &client),
    )
    .await
    .expect("filtered replay deadlocked");
    // finding the match is a clean shutdown, not a failure
    assert!(result.is_ok());

    let hits = hits.lock().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "req-5");
    assert_eq!(hits[0].uri, "/replayed/5");
}

/// Even when a later frame carries the same id, only the first match is
/// replayed: dispatch stops at the match.
#[tokio::test(flavor = "multi_thread")]
async fn test_id_filter_ignores_duplicate_matches() {
    let dir = tempdir().unwrap();
    let mut frames = replay_frames(10);
    frames[2] = frame(
        "dup",
        "POST",
        "/replayed/2",
        b"X-Request-ID: dup\r\n",
        b"first",
    );
    frames[7] = frame(
        "dup",
        "POST",
        "/replayed/7",
        b"X-Request-ID: dup\r\n",
        b"second",
    );
    let finalized = write_archive(
        dir.path().to_str().unwrap(),
        &frames,
        ArchiveOptions::default(),
    )
    .await;
    let archive_path = staged_dir(dir.path()).join(&finalized[0]);

    let (addr, hits) = spawn_target(|_| StatusCode::OK).await;

    let client = reqwest::Client::new();
    let mut settings = settings_for(addr, 4);
    settings.req_id = "dup".to_string();

    let result = tokio::time::timeout(
        Duration::from_secs(30),
        replay_file(archive_path.to_str().unwrap(), &settings, &client),
    )
    .await
    .expect("filtered replay deadlocked");
    assert!(result.is_ok());

    let hits = hits.lock().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "dup");
    assert_eq!(hits[0].uri, "/replayed/2");
}

/// Min-delay pacing: with one worker and 5 fast responses, the run takes
/// at least (5 - 1) * min_delay.
#[tokio::test(flavor = "multi_thread")]
async fn test_min_delay_paces_requests() {
    let dir = tempdir().unwrap();
    let finalized = write_archive(
        dir.path().to_str().unwrap(),
        &replay_frames(5),
        ArchiveOptions::default(),
    )
    .await;
    let archive_path = staged_dir(dir.path()).join(&finalized[0]);

    let (addr, hits) = spawn_target(|_| StatusCode::OK).await;

    let client = reqwest::Client::new();
    let mut settings = settings_for(addr, 1);
    settings.min_delay_ms = 50;

    let started = Instant::now();
    let dispatched = replay_file(archive_path.to_str().unwrap(), &settings, &client)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(dispatched, 5);
    assert_eq!(hits.lock().unwrap().len(), 5);
    assert!(
        elapsed >= Duration::from_millis(200),
        "pacing too fast: {elapsed:?}"
    );
}

/// The request cap stops dispatch at exactly N requests.
#[tokio::test(flavor = "multi_thread")]
async fn test_request_cap() {
    let dir = tempdir().unwrap();
    let finalized = write_archive(
        dir.path().to_str().unwrap(),
        &replay_frames(20),
        ArchiveOptions::default(),
    )
    .await;
    let archive_path = staged_dir(dir.path()).join(&finalized[0]);

    let (addr, hits) = spawn_target(|_| StatusCode::OK).await;

    let client = reqwest::Client::new();
    let mut settings = settings_for(addr, 2);
    settings.num_requests = 7;

    let dispatched = replay_file(archive_path.to_str().unwrap(), &settings, &client)
        .await
        .unwrap();

    assert_eq!(dispatched, 7);
    assert_eq!(hits.lock().unwrap().len(), 7);
}

/// Replayed requests carry the recorded method, URI, and body verbatim.
#[tokio::test(flavor = "multi_thread")]
async fn test_replayed_requests_preserve_uri() {
    let dir = tempdir().unwrap();
    let recorded = vec![frame(
        "solo",
        "POST",
        "/path/with?query=string&x=1",
        b"X-Request-ID: solo\r\n",
        b"the body",
    )];
    let finalized = write_archive(
        dir.path().to_str().unwrap(),
        &recorded,
        ArchiveOptions::default(),
    )
    .await;
    let archive_path = staged_dir(dir.path()).join(&finalized[0]);

    let (addr, hits) = spawn_target(|_| StatusCode::OK).await;

    let client = reqwest::Client::new();
    let settings = settings_for(addr, 1);
    replay_file(archive_path.to_str().unwrap(), &settings, &client)
        .await
        .unwrap();

    let hits = hits.lock().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].uri, "/path/with?query=string&x=1");
    assert_eq!(hits[0].id, "solo");
}

/// Dry-run with extract writes one header file and one body file per
/// request and issues nothing.
#[tokio::test(flavor = "multi_thread")]
async fn test_extract_to_file() {
    let dir = tempdir().unwrap();
    let out_dir = tempdir().unwrap();
    let finalized = write_archive(
        dir.path().to_str().unwrap(),
        &replay_frames(3),
        ArchiveOptions::default(),
    )
    .await;
    let archive_path = staged_dir(dir.path()).join(&finalized[0]);

    let (addr, hits) = spawn_target(|_| StatusCode::OK).await;

    let client = reqwest::Client::new();
    let mut settings = settings_for(addr, 1);
    settings.dry_run = true;
    settings.extract_to_file = true;
    settings.num_requests = 3;
    settings.output_directory = out_dir.path().to_string_lossy().into_owned();

    replay_file(archive_path.to_str().unwrap(), &settings, &client)
        .await
        .unwrap();

    assert!(hits.lock().unwrap().is_empty());

    let names: Vec<String> = std::fs::read_dir(out_dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    let headers = names.iter().filter(|n| n.contains("_header_")).count();
    let bodies = names.iter().filter(|n| n.contains("_body_")).count();
    assert_eq!(headers, 3);
    assert_eq!(bodies, 3);
}
