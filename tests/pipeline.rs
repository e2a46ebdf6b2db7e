//! End-to-end tests: the real router on an ephemeral port, driven by
//! the real client.

use bytes::Bytes;
use std::{sync::Arc, time::Duration};

use chunk_relay::{
    auth::StaticTokenVerifier,
    client::{
        ClientError, FallbackOptions, PollOptions, RelayClient, SendOptions, UploadOutcome,
        fallback, poller,
    },
    routes::routes::routes,
    services::{RelayService, store::DiskStore, task_store::TaskUpdate},
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::net::TcpListener;

const TOKEN: &str = "integration-token";

struct TestServer {
    base_url: String,
    service: RelayService,
    _tmp: tempfile::TempDir,
}

async fn spawn_server(sync_merge_threshold: u64, defer_merge: bool) -> TestServer {
    let tmp = tempfile::tempdir().unwrap();

    let options = SqliteConnectOptions::new()
        .filename(tmp.path().join("meta.db"))
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .unwrap(),
    );
    let sql = include_str!("../migrations/0001_init.sql");
    for stmt in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(stmt).execute(&*db).await.unwrap();
    }

    let store = Arc::new(DiskStore::new(tmp.path().join("objects")));
    let verifier = Arc::new(StaticTokenVerifier::new([TOKEN]));
    let service = RelayService::new(db, store, verifier, sync_merge_threshold, defer_merge);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let app = routes(service.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base_url,
        service,
        _tmp: tmp,
    }
}

/// Deterministic pseudo-random payload.
fn payload(len: usize) -> Bytes {
    let mut data = Vec::with_capacity(len);
    let mut state: u32 = 0x2545_f491;
    for _ in 0..len {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        data.push((state >> 24) as u8);
    }
    Bytes::from(data)
}

fn quick_send_options(chunk_size: usize) -> SendOptions {
    SendOptions {
        chunk_size,
        concurrency: 4,
        max_attempts: 2,
        retry_base_delay: Duration::from_millis(10),
    }
}

#[tokio::test]
async fn five_mib_file_merges_synchronously_below_threshold() {
    let server = spawn_server(16 * 1024 * 1024, false).await;
    let client = RelayClient::new(&server.base_url, TOKEN).unwrap();

    let source = payload(5 * 1024 * 1024);
    let outcome = client
        .upload_bytes(
            source.clone(),
            "installers",
            Some("app.apk"),
            &quick_send_options(2 * 1024 * 1024),
        )
        .await
        .unwrap();

    let UploadOutcome::Merged(artifact) = outcome else {
        panic!("expected a synchronous merge below the threshold");
    };
    assert_eq!(artifact.file_size, 5 * 1024 * 1024);
    assert_eq!(artifact.file_path, "installers/app.apk");
    assert!(!artifact.file_id.is_empty());

    let merged = client.download(&artifact.file_url).await.unwrap();
    assert_eq!(md5::compute(&merged), md5::compute(&source));
}

#[tokio::test]
async fn large_upload_goes_async_and_round_trips() {
    // 1-byte threshold forces the background merge path
    let server = spawn_server(1, false).await;
    let client = RelayClient::new(&server.base_url, TOKEN).unwrap();

    let source = payload(768 * 1024);
    let outcome = client
        .upload_bytes(
            source.clone(),
            "bundles",
            Some("ota.tar"),
            &quick_send_options(256 * 1024),
        )
        .await
        .unwrap();

    let UploadOutcome::Pending(handle) = outcome else {
        panic!("expected a merge task above the threshold");
    };
    assert!(handle.status_url.contains("taskId="));

    let artifact = poller::wait_for_merge(
        &client,
        &handle.task_id,
        &PollOptions {
            interval: Duration::from_millis(25),
            max_attempts: Some(400),
        },
    )
    .await
    .unwrap();

    assert_eq!(artifact.file_size, 768 * 1024);
    let merged = client.download(&artifact.file_url).await.unwrap();
    assert_eq!(md5::compute(&merged), md5::compute(&source));
}

#[tokio::test]
async fn exhausted_poll_budget_is_a_distinct_timeout() {
    let server = spawn_server(u64::MAX, false).await;
    let client = RelayClient::new(&server.base_url, TOKEN).unwrap();

    // a task nothing will ever run stays pending forever
    let task = server.service.create_task("up-stuck").await.unwrap();

    let err = poller::wait_for_merge(
        &client,
        &task.task_id,
        &PollOptions {
            interval: Duration::from_millis(5),
            max_attempts: Some(1),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ClientError::MergeTimedOut { attempts: 1 }));
}

#[tokio::test]
async fn failed_merge_surfaces_the_server_error_verbatim() {
    let server = spawn_server(u64::MAX, false).await;
    let client = RelayClient::new(&server.base_url, TOKEN).unwrap();

    let task = server.service.create_task("up-doomed").await.unwrap();
    server
        .service
        .update_task(&task.task_id, TaskUpdate::failed("boom"))
        .await
        .unwrap();

    let err = poller::wait_for_merge(&client, &task.task_id, &PollOptions::default())
        .await
        .unwrap_err();
    match err {
        ClientError::MergeFailed(message) => assert_eq!(message, "boom"),
        other => panic!("expected a merge failure, got {other}"),
    }
}

#[tokio::test]
async fn deferred_mode_merges_locally_through_chunk_urls() {
    let server = spawn_server(u64::MAX, true).await;
    let client = RelayClient::new(&server.base_url, TOKEN).unwrap();

    let source = payload(300 * 1024);
    let outcome = client
        .upload_bytes(
            source.clone(),
            "attachments",
            Some("audio.ogg"),
            &quick_send_options(128 * 1024),
        )
        .await
        .unwrap();

    let UploadOutcome::Deferred(chunk_urls) = outcome else {
        panic!("expected deferred chunk URLs");
    };
    assert_eq!(chunk_urls.len(), 3);

    let out_dir = tempfile::tempdir().unwrap();
    let output = out_dir.path().join("audio.ogg");
    let written = fallback::merge_chunk_urls(
        &client,
        &chunk_urls,
        &output,
        &FallbackOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(written, 300 * 1024);
    let merged = tokio::fs::read(&output).await.unwrap();
    assert_eq!(md5::compute(&merged), md5::compute(&source));
    // no stray part dirs left behind
    let mut entries = tokio::fs::read_dir(out_dir.path()).await.unwrap();
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name());
    }
    assert_eq!(names, vec![std::ffi::OsString::from("audio.ogg")]);
}

#[tokio::test]
async fn unknown_task_returns_not_found_envelope() {
    let server = spawn_server(u64::MAX, false).await;

    let resp = reqwest::Client::new()
        .get(format!("{}/v1/tasks/status", server.base_url))
        .query(&[("taskId", "does-not-exist")])
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 404);
    assert!(
        body["message"].as_str().unwrap().contains("not found"),
        "unexpected message: {}",
        body["message"]
    );
}

#[tokio::test]
async fn missing_bearer_token_is_rejected_with_envelope() {
    let server = spawn_server(u64::MAX, false).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chunks", server.base_url))
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .header("x-chunk-envelope", "json")
        .body(r#"{"u":"x","i":0,"t":1,"p":"out","d":""}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 401);
}

#[tokio::test]
async fn text_content_type_is_rejected() {
    let server = spawn_server(u64::MAX, false).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chunks", server.base_url))
        .bearer_auth(TOKEN)
        .header(reqwest::header::CONTENT_TYPE, "text/plain")
        .header("x-chunk-envelope", "json")
        .body(r#"{"u":"x","i":0,"t":1,"p":"out","d":""}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 400);
    assert!(
        body["message"]
            .as_str()
            .unwrap()
            .contains("binary content-type")
    );
}

#[tokio::test]
async fn health_probes_respond() {
    let server = spawn_server(u64::MAX, false).await;
    let http = reqwest::Client::new();

    let healthz = http
        .get(format!("{}/healthz", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(healthz.status(), 200);

    let readyz = http
        .get(format!("{}/readyz", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(readyz.status(), 200);
    let body: serde_json::Value = readyz.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}
