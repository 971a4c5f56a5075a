use super::*;
use diskcaddy_core::read_entries;
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(device_url: &str) -> DaemonConfig {
    DaemonConfig {
        device_url: device_url.to_string(),
        poll_interval: Duration::from_millis(20),
        hello_timeout: Duration::from_millis(200),
        status_interval: Duration::from_millis(20),
        reconnect_grace: Duration::from_millis(5000),
        log_verbosity: 2,
    }
}

fn offline_engine() -> SyncEngine {
    let client = DeviceClient::new("http://127.0.0.1:9").unwrap();
    SyncEngine::new(client, EngineConfig::default())
}

#[test]
fn reads_intervals_from_env_or_default() {
    assert_eq!(read_u64_env("NO_SUCH_ENV_FOR_TEST", 42), 42);
    assert_eq!(read_u8_env("NO_SUCH_U8_ENV_FOR_TEST", 2), 2);
}

#[test]
fn rejects_zero_and_garbage_intervals() {
    assert_eq!(parse_positive_u64(Some("0"), 1000), 1000);
    assert_eq!(parse_positive_u64(Some("soon"), 1000), 1000);
    assert_eq!(parse_positive_u64(Some(" 250 "), 1000), 250);
    assert_eq!(parse_positive_u64(None, 1000), 1000);
}

#[test]
fn engine_config_carries_grace_window() {
    let mut config = test_config("http://device.test");
    config.reconnect_grace = Duration::from_millis(1234);
    assert_eq!(
        config.engine_config().reconnect_grace,
        Duration::from_millis(1234)
    );
}

#[tokio::test]
async fn collects_folders_recursively_in_sorted_order() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("b")).unwrap();
    std::fs::create_dir_all(root.join("c/sub")).unwrap();
    std::fs::write(root.join("b/2.d64"), b"2").unwrap();
    std::fs::write(root.join("a.d64"), b"a").unwrap();
    std::fs::write(root.join("b/1.d64"), b"1").unwrap();
    std::fs::write(root.join("c/sub/x.prg"), b"x").unwrap();
    let missing = root.join("missing.d64");

    let files = collect_inputs(&[root.to_path_buf(), missing.clone()])
        .await
        .unwrap();
    assert_eq!(
        files,
        vec![
            root.join("a.d64"),
            root.join("b/1.d64"),
            root.join("b/2.d64"),
            root.join("c/sub/x.prg"),
            missing,
        ]
    );
}

#[tokio::test]
async fn unreadable_file_is_reported_without_aborting_batch() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("A.D64"), b"a").unwrap();
    std::fs::write(dir.path().join("B.D64"), b"b").unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"n").unwrap();
    let files = vec![
        dir.path().join("A.D64"),
        dir.path().join("GONE.D64"),
        dir.path().join("notes.txt"),
        dir.path().join("B.D64"),
    ];

    let engine = offline_engine();
    assert_eq!(import_paths(&engine, &files).await, 2);

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.queue, vec!["A.D64", "B.D64"]);
    assert_eq!(snapshot.label, "FILE ERROR");
}

#[tokio::test]
async fn export_target_uses_default_name_for_directories() {
    let dir = tempdir().unwrap();
    assert_eq!(
        export_target(dir.path(), ACTIVE_SET_FILE_NAME).await,
        dir.path().join("pi1541_active_set.zip")
    );
    let explicit = dir.path().join("mine.zip");
    assert_eq!(export_target(&explicit, ACTIVE_SET_FILE_NAME).await, explicit);
}

#[tokio::test]
async fn export_queue_writes_optimized_archive() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("in");
    std::fs::create_dir_all(&input).unwrap();
    std::fs::write(input.join("X.D64"), b"x").unwrap();
    std::fs::write(input.join("Y.D64"), b"y").unwrap();
    let out = dir.path().join("out");
    std::fs::create_dir_all(&out).unwrap();

    let runtime = DaemonRuntime::bootstrap(test_config("http://127.0.0.1:9")).unwrap();
    let written = runtime.export_queue(&out, &[input], true).await.unwrap();
    assert_eq!(written, out.join(ACTIVE_SET_FILE_NAME));

    let entries = read_entries(&std::fs::read(&written).unwrap()).unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["01_X.D64", "02_Y.D64"]);
}

#[tokio::test]
async fn export_queue_without_images_fails() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"n").unwrap();
    let runtime = DaemonRuntime::bootstrap(test_config("http://127.0.0.1:9")).unwrap();

    let result = runtime
        .export_queue(&dir.path().join("out.zip"), &[dir.path().join("notes.txt")], false)
        .await;
    assert!(result.is_err());
    assert!(!dir.path().join("out.zip").exists());
}

#[tokio::test]
async fn mount_uploads_inputs_in_one_transaction() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hello"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "nonce": 12 })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/active/add"))
        .and(header("x-nonce", "12"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/upload/active/commit"))
        .and(header("x-nonce", "12"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("A.D64"), b"a").unwrap();
    std::fs::write(dir.path().join("B.PRG"), b"b").unwrap();

    let runtime = DaemonRuntime::bootstrap(test_config(&server.uri())).unwrap();
    let items = runtime.mount(&[dir.path().to_path_buf()]).await.unwrap();
    assert_eq!(items, 2);
    assert_eq!(runtime.engine().snapshot().await.label, "SUCCESS");
}

#[tokio::test]
async fn mount_with_nothing_importable_sends_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hello"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "nonce": 1 })))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("readme.txt"), b"r").unwrap();

    let runtime = DaemonRuntime::bootstrap(test_config(&server.uri())).unwrap();
    assert!(runtime.mount(&[dir.path().to_path_buf()]).await.is_err());
}

#[tokio::test]
async fn wait_until_ready_gives_up_after_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hello"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let runtime = DaemonRuntime::bootstrap(test_config(&server.uri())).unwrap();
    let result = wait_until_ready(
        runtime.engine(),
        Duration::from_millis(20),
        Duration::from_millis(150),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn export_session_writes_default_file_name() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/active/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [{ "i": 0, "name": "01_GAME.D64" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/active/download/0"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"game"))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let runtime = DaemonRuntime::bootstrap(test_config(&server.uri())).unwrap();
    let written = runtime.export_session(dir.path()).await.unwrap().unwrap();
    assert_eq!(written, dir.path().join(SESSION_FILE_NAME));

    let entries = read_entries(&std::fs::read(&written).unwrap()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "01_GAME.D64");
    assert_eq!(entries[0].data, b"game");
}

#[tokio::test]
async fn status_observer_survives_engine_updates() {
    let engine = Arc::new(offline_engine());
    let handle = tokio::spawn(log_status_changes(engine.subscribe()));
    engine.add_file("A.D64", b"a".to_vec()).await.unwrap();
    engine.clear().await;
    tokio::task::yield_now().await;
    assert!(!handle.is_finished());
    handle.abort();
}

#[test]
fn downloaded_names_cannot_leave_the_target_directory() {
    assert_eq!(download_file_name("SAVE.D64").as_deref(), Some("SAVE.D64"));
    assert_eq!(
        download_file_name("../etc/SAVE.D64").as_deref(),
        Some(".._etc_SAVE.D64")
    );
    assert_eq!(download_file_name(" .. "), None);
    assert_eq!(download_file_name(""), None);
}

#[tokio::test]
async fn download_modified_writes_each_disk_under_its_name() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/modified/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [
                { "i": 0, "name": "SAVE.D64" },
                { "i": 3, "name": "BOOT.PRG" }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/modified/download/0/SAVE.D64"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"save"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/modified/download/3/BOOT.PRG"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"boot"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let out = dir.path().join("saves");
    let runtime = DaemonRuntime::bootstrap(test_config(&server.uri())).unwrap();
    let written = runtime.download_modified(&out).await.unwrap();

    assert_eq!(
        written,
        vec![out.join("SAVE.D64"), out.join("BOOT.PRG")]
    );
    assert_eq!(std::fs::read(out.join("SAVE.D64")).unwrap(), b"save");
    assert_eq!(std::fs::read(out.join("BOOT.PRG")).unwrap(), b"boot");
}

#[tokio::test]
async fn download_modified_fails_without_partial_files() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/modified/list"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let out = dir.path().join("saves");
    let runtime = DaemonRuntime::bootstrap(test_config(&server.uri())).unwrap();
    assert!(runtime.download_modified(&out).await.is_err());
    assert!(!out.exists());
}
