//! End-to-end ingest tests: HTTP handler, bounded record channel, writer
//! pool, graceful shutdown, and no-loss accounting.

mod common;

use common::*;
use sinkhole::archive;
use sinkhole::server::{
    build_router, run_listener, ListenerSpec, RecorderConfig, RecorderPool, ShutdownCoordinator,
    SinkState,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn pool_config(dir: &std::path::Path, workers: usize) -> RecorderConfig {
    RecorderConfig {
        output_url: dir.to_string_lossy().into_owned(),
        compress: false,
        buffer_size: 0,
        workers,
        counter_only: false,
        skip_stats: true,
    }
}

/// Record 1000 requests over HTTP across 5 consumers, shut down, and
/// verify every id appears exactly once across all finalized archives.
#[tokio::test(flavor = "multi_thread")]
async fn test_no_loss_under_graceful_shutdown() {
    let dir = tempdir().unwrap();
    let pool = RecorderPool::start(&pool_config(dir.path(), 5)).await.unwrap();

    let state = SinkState::new(Some(pool.sender()));
    let router = build_router(state);
    let shutdown = Arc::new(ShutdownCoordinator::new());

    let port = find_available_port();
    let spec = ListenerSpec {
        url: format!("http://127.0.0.1:{port}"),
        port,
        tls: false,
    };
    let listener = tokio::spawn(run_listener(spec, router.clone(), None, shutdown.clone()));
    drop(router);
    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{port}");

    let mut senders = Vec::new();
    for task in 0..10 {
        let client = client.clone();
        let base = base.clone();
        senders.push(tokio::spawn(async move {
            for i in 0..100 {
                let id = format!("id-{task}-{i}");
                let response = client
                    .post(format!("{base}/ingest/{task}/{i}"))
                    .header("X-Request-ID", &id)
                    .body("payload")
                    .send()
                    .await
                    .unwrap();
                assert_eq!(response.status(), 200);
            }
        }));
    }
    for sender in senders {
        sender.await.unwrap();
    }

    shutdown.initiate();
    listener.await.unwrap().unwrap();

    let total = pool.shutdown().await.unwrap();
    assert_eq!(total, 1000);

    let mut seen = HashSet::new();
    let staged = staged_dir(dir.path());
    for name in archive::list(staged.to_str().unwrap()).await.unwrap() {
        let path = staged.join(&name);
        for frame in read_archive(path.to_str().unwrap()).await {
            assert!(
                seen.insert(frame.id.clone()),
                "id recorded twice: {:?}",
                frame.id
            );
            assert_eq!(frame.method.as_ref(), b"POST");
            assert_eq!(frame.body.as_ref(), b"payload");
        }
    }
    assert_eq!(seen.len(), 1000);
}

/// The handler answers 200 with an empty body for every method and path,
/// including in no-save mode.
#[tokio::test(flavor = "multi_thread")]
async fn test_handler_answers_200_to_everything() {
    let state = SinkState::new(None);
    let router = build_router(state);
    let shutdown = Arc::new(ShutdownCoordinator::new());

    let port = find_available_port();
    let spec = ListenerSpec {
        url: format!("http://127.0.0.1:{port}"),
        port,
        tls: false,
    };
    let listener = tokio::spawn(run_listener(spec, router.clone(), None, shutdown.clone()));
    drop(router);
    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{port}");

    for (method, path) in [
        (reqwest::Method::GET, "/"),
        (reqwest::Method::POST, "/deep/nested/path?with=query"),
        (reqwest::Method::PUT, "/put"),
        (reqwest::Method::DELETE, "/anything"),
    ] {
        let response = client
            .request(method, format!("{base}{path}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.bytes().await.unwrap().is_empty());
    }

    shutdown.initiate();
    listener.await.unwrap().unwrap();
}

/// The recorded URI honors X-Original-URI over the request target.
#[tokio::test(flavor = "multi_thread")]
async fn test_original_uri_header_overrides_target() {
    let dir = tempdir().unwrap();
    let pool = RecorderPool::start(&pool_config(dir.path(), 1)).await.unwrap();

    let state = SinkState::new(Some(pool.sender()));
    let router = build_router(state);
    let shutdown = Arc::new(ShutdownCoordinator::new());

    let port = find_available_port();
    let spec = ListenerSpec {
        url: format!("http://127.0.0.1:{port}"),
        port,
        tls: false,
    };
    let listener = tokio::spawn(run_listener(spec, router.clone(), None, shutdown.clone()));
    drop(router);
    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    let client = reqwest::Client::new();
    client
        .get(format!("http://127.0.0.1:{port}/proxied/location"))
        .header("X-Original-URI", "/the/real/target?page=2")
        .send()
        .await
        .unwrap();

    shutdown.initiate();
    listener.await.unwrap().unwrap();
    pool.shutdown().await.unwrap();

    let staged = staged_dir(dir.path());
    let names = archive::list(staged.to_str().unwrap()).await.unwrap();
    assert_eq!(names.len(), 1);
    let frames = read_archive(staged.join(&names[0]).to_str().unwrap()).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].uri.as_ref(), b"/the/real/target?page=2");
    assert!(frames[0].id.starts_with(b"FH-"));
}
