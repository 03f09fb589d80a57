//! Wire-level tests: a real daemon on an ephemeral port, a real client,
//! and a mock engine behind the build service. Verifies the per-job event
//! contract (one acknowledgement, ordered events, exactly one terminal
//! status, nothing after it) and request correlation for secrets.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use kiln_core::engine::{ContainerEngine, EngineStream, ImageBuildOptions, ImageInspect};
use kiln_core::error::Result as KilnResult;
use kiln_core::protocol::{BuildStatusPayload, EventType, LogChunkPayload};
use kiln_core::secrets::StaticSecretProvider;
use kiln_core::store::FsObjectStore;
use kiln_core::{BuildService, Config};
use kiln_daemon::server;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MOCK_IMAGE_ID: &str = "fedcba9876543210";

struct MockEngine;

fn stream_of(chunks: Vec<Bytes>) -> EngineStream {
    futures::stream::iter(chunks.into_iter().map(Ok)).boxed()
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn image_build(
        &self,
        _context_tar: Bytes,
        _options: &ImageBuildOptions,
    ) -> KilnResult<EngineStream> {
        Ok(stream_of(vec![
            Bytes::from_static(b"{\"stream\":\"Step 1/2 : FROM alpine\\n\"}\n"),
            Bytes::from(format!(
                "{{\"stream\":\"Successfully built {}\\n\"}}\n",
                MOCK_IMAGE_ID
            )),
        ]))
    }

    async fn image_save(&self, _image: &str) -> KilnResult<EngineStream> {
        Ok(stream_of(vec![Bytes::from_static(b"mock-layers")]))
    }

    async fn image_tag(&self, _image: &str, _tag: &str) -> KilnResult<()> {
        Ok(())
    }

    async fn image_pull(&self, _reference: &str) -> KilnResult<EngineStream> {
        Ok(stream_of(vec![]))
    }

    async fn image_inspect(&self, _reference: &str) -> KilnResult<ImageInspect> {
        Ok(ImageInspect { id: MOCK_IMAGE_ID.to_string(), size: 7 })
    }

    async fn container_create(&self, _image: &str) -> KilnResult<String> {
        Ok("c".to_string())
    }

    async fn container_copy_from(
        &self,
        _container: &str,
        _path: &str,
    ) -> KilnResult<EngineStream> {
        Ok(stream_of(vec![]))
    }

    async fn container_remove(&self, _container: &str) -> KilnResult<()> {
        Ok(())
    }
}

struct Daemon {
    addr: SocketAddr,
    shutdown: CancellationToken,
    _work: tempfile::TempDir,
    _objects: tempfile::TempDir,
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_daemon() -> Daemon {
    let work = tempfile::tempdir().unwrap();
    let objects = tempfile::tempdir().unwrap();
    let config = Config {
        work_dir: work.path().to_string_lossy().to_string(),
        object_store_dir: objects.path().to_string_lossy().to_string(),
        job_timeout_secs: 30,
        ..Config::default()
    };

    let secrets = Arc::new(StaticSecretProvider::new(
        [("valid/k".to_string(), "s3same".to_string())].into(),
    ));
    let store = Arc::new(FsObjectStore::new(objects.path()));
    let service = Arc::new(
        BuildService::new(config.clone(), Arc::new(MockEngine), Some(store), secrets).unwrap(),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        server::serve_on(listener, config, service, server_shutdown).await.unwrap();
    });

    Daemon { addr, shutdown, _work: work, _objects: objects }
}

fn demo_spec(app_dir: &std::path::Path) -> String {
    format!(
        r#"
name: demo
version: "1"
codebases:
  - name: app
    source_kind: local
    source: {}
build_config:
  dockerfile: app/Dockerfile
  tags: ["demo:1"]
  output_target: engine
"#,
        app_dir.display()
    )
}

#[tokio::test]
async fn build_request_streams_ordered_events() {
    let daemon = start_daemon().await;
    let client = kiln_client::Client::connect(&format!("ws://{}/ws", daemon.addr))
        .await
        .unwrap();

    let app = tempfile::tempdir().unwrap();
    std::fs::write(app.path().join("Dockerfile"), "FROM alpine\nCMD echo hi\n").unwrap();

    let ack = client
        .submit_build(&demo_spec(app.path()), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(ack.build_id.starts_with("build-"));

    let mut log_chunks = 0;
    let mut statuses: Vec<String> = Vec::new();
    loop {
        let event = client.next_event_timeout(Duration::from_secs(10)).await.unwrap();
        match event.event {
            EventType::LogChunk => {
                let payload: LogChunkPayload = event.decode_payload().unwrap();
                assert_eq!(payload.build_id, ack.build_id);
                log_chunks += 1;
            }
            EventType::BuildStatus => {
                let payload: BuildStatusPayload = event.decode_payload().unwrap();
                assert_eq!(payload.build_id, ack.build_id);
                let terminal = payload.status == "success" || payload.status == "failure";
                statuses.push(payload.status);
                if terminal {
                    assert_eq!(statuses.last().map(String::as_str), Some("success"));
                    assert_eq!(payload.artifact_ref.as_deref(), Some("demo:1"));
                    assert!(payload.duration_sec.is_some());
                    break;
                }
            }
            other => panic!("unexpected event type {:?}", other),
        }
    }

    assert!(log_chunks > 0, "expected log chunks before the terminal status");
    // Transitions arrive in machine order.
    let prep = statuses.iter().position(|s| s == "preparing").unwrap();
    let building = statuses.iter().position(|s| s == "building").unwrap();
    let success = statuses.iter().position(|s| s == "success").unwrap();
    assert!(prep < building && building < success);

    // Nothing follows the terminal status for this build.
    let after = client.next_event_timeout(Duration::from_millis(400)).await;
    assert!(matches!(after, Err(kiln_client::ClientError::Timeout(_))));
}

#[tokio::test]
async fn failed_build_yields_single_failure_status() {
    let daemon = start_daemon().await;
    let client = kiln_client::Client::connect(&format!("ws://{}/ws", daemon.addr))
        .await
        .unwrap();

    // Invalid spec: missing version.
    let ack = client
        .submit_build("name: broken\n", Duration::from_secs(5))
        .await
        .unwrap();

    let event = client.next_event_timeout(Duration::from_secs(10)).await.unwrap();
    assert_eq!(event.event, EventType::BuildStatus);
    let payload: BuildStatusPayload = event.decode_payload().unwrap();
    assert_eq!(payload.build_id, ack.build_id);
    assert_eq!(payload.status, "failure");
    assert!(payload.message.unwrap_or_default().contains("[invalid_spec]"));

    let after = client.next_event_timeout(Duration::from_millis(400)).await;
    assert!(matches!(after, Err(kiln_client::ClientError::Timeout(_))));
}

#[tokio::test]
async fn secret_request_roundtrip_and_error_correlation() {
    let daemon = start_daemon().await;
    let client = kiln_client::Client::connect(&format!("ws://{}/ws", daemon.addr))
        .await
        .unwrap();

    let response = client.request_secret("valid/k", Duration::from_secs(5)).await.unwrap();
    assert_eq!(response.source, "valid/k");
    assert_eq!(response.value, "s3same");

    let err = client.request_secret("missing", Duration::from_secs(5)).await.unwrap_err();
    match err {
        kiln_client::ClientError::Server { message, details } => {
            assert_eq!(message, "Failed to fetch secret");
            assert!(details.contains("'missing' not found"), "got: {details}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unknown_message_type_gets_error_reply() {
    let daemon = start_daemon().await;
    let client = kiln_client::Client::connect(&format!("ws://{}/ws", daemon.addr))
        .await
        .unwrap();

    let err = client
        .request(EventType::BuildStatus, &serde_json::json!({}), Duration::from_secs(5))
        .await
        .unwrap_err();
    match err {
        kiln_client::ClientError::Server { message, .. } => {
            assert_eq!(message, "Unhandled message type");
        }
        other => panic!("unexpected error: {other}"),
    }
}
