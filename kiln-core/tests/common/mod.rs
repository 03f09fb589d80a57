//! Shared test doubles: a scriptable container engine and a recording
//! notifier.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use kiln_core::engine::{ContainerEngine, EngineStream, ImageBuildOptions, ImageInspect};
use kiln_core::error::Result;
use kiln_core::notify::{BuildNotifier, BuildPhase, LogStream};
use std::sync::Mutex;

pub const MOCK_IMAGE_ID: &str = "0123456789abcdef";

/// Engine double that answers every call in-memory and records what the
/// orchestrator asked of it.
#[derive(Default)]
pub struct MockEngine {
    pub builds: Mutex<Vec<ImageBuildOptions>>,
    pub tags: Mutex<Vec<(String, String)>>,
    pub pulls: Mutex<Vec<String>>,
    pub saves: Mutex<Vec<String>>,
}

fn stream_of(chunks: Vec<Bytes>) -> EngineStream {
    futures::stream::iter(chunks.into_iter().map(Ok)).boxed()
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn image_build(
        &self,
        _context_tar: Bytes,
        options: &ImageBuildOptions,
    ) -> Result<EngineStream> {
        self.builds.lock().unwrap().push(options.clone());
        Ok(stream_of(vec![
            Bytes::from_static(b"{\"stream\":\"Step 1/2 : FROM alpine\\n\"}\n"),
            Bytes::from(format!(
                "{{\"stream\":\"Successfully built {}\\n\"}}\n",
                MOCK_IMAGE_ID
            )),
            Bytes::from(format!("{{\"aux\":{{\"ID\":\"sha256:{}\"}}}}\n", MOCK_IMAGE_ID)),
        ]))
    }

    async fn image_save(&self, image: &str) -> Result<EngineStream> {
        self.saves.lock().unwrap().push(image.to_string());
        Ok(stream_of(vec![
            Bytes::from_static(b"mock-image-layer-"),
            Bytes::from(image.to_string()),
        ]))
    }

    async fn image_tag(&self, image: &str, tag: &str) -> Result<()> {
        self.tags.lock().unwrap().push((image.to_string(), tag.to_string()));
        Ok(())
    }

    async fn image_pull(&self, reference: &str) -> Result<EngineStream> {
        self.pulls.lock().unwrap().push(reference.to_string());
        Ok(stream_of(vec![Bytes::from_static(
            b"{\"status\":\"Pull complete\",\"id\":\"layer\"}\n",
        )]))
    }

    async fn image_inspect(&self, _reference: &str) -> Result<ImageInspect> {
        Ok(ImageInspect { id: MOCK_IMAGE_ID.to_string(), size: 4242 })
    }

    async fn container_create(&self, _image: &str) -> Result<String> {
        Ok("mock-container".to_string())
    }

    async fn container_copy_from(&self, _container: &str, path: &str) -> Result<EngineStream> {
        let mut builder = tar::Builder::new(Vec::new());
        let name = std::path::Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "out".to_string());
        let data = b"\x7fELF-mock-binary";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, &data[..]).unwrap();
        Ok(stream_of(vec![Bytes::from(builder.into_inner().unwrap())]))
    }

    async fn container_remove(&self, _container: &str) -> Result<()> {
        Ok(())
    }
}

/// One observed notification.
#[derive(Debug, Clone)]
pub enum Observed {
    Log { stream: String, content: String },
    Status { status: String, message: Option<String>, artifact_ref: Option<String> },
}

/// Notifier double recording every event in arrival order.
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<Observed>>,
}

impl RecordingNotifier {
    pub fn statuses(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Observed::Status { status, .. } => Some(status.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn terminal(&self) -> Vec<Observed> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                matches!(e, Observed::Status { status, .. } if status == "success" || status == "failure")
            })
            .cloned()
            .collect()
    }

    pub fn log_text(&self) -> String {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Observed::Log { content, .. } => Some(content.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl BuildNotifier for RecordingNotifier {
    fn notify_log(&self, _build_id: &str, stream: LogStream, content: &str) {
        self.events.lock().unwrap().push(Observed::Log {
            stream: stream.as_str().to_string(),
            content: content.to_string(),
        });
    }

    fn notify_status(
        &self,
        _build_id: &str,
        phase: BuildPhase,
        message: Option<&str>,
        artifact_ref: Option<&str>,
        _duration_sec: Option<f64>,
    ) {
        self.events.lock().unwrap().push(Observed::Status {
            status: phase.as_str().to_string(),
            message: message.map(str::to_string),
            artifact_ref: artifact_ref.map(str::to_string),
        });
    }
}
