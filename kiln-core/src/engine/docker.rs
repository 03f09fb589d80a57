//! Docker Engine API adapter.
//!
//! Speaks the Docker Engine HTTP API over TCP. The endpoint comes from
//! `DOCKER_HOST` (or the service config); `tcp://` and `http://` schemes are
//! accepted. Unix-socket endpoints are not supported by this adapter — point
//! the daemon at a TCP-exposed engine or inject another [`ContainerEngine`]
//! implementation.

use super::{BuilderKind, ContainerEngine, EngineStream, ImageBuildOptions, ImageInspect};
use crate::error::{KilnError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

const API_VERSION: &str = "v1.43";

/// Docker Engine API client.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    http: reqwest::Client,
    base_url: String,
    /// Timeout for non-streaming calls. Streamed builds, pulls and exports
    /// are bounded by the job ceiling instead.
    api_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct InspectResponse {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Size")]
    size: i64,
}

#[derive(Debug, Deserialize)]
struct CreateContainerResponse {
    #[serde(rename = "Id")]
    id: String,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST`, falling back to the given default.
    pub fn from_env(default_host: &str) -> Result<Self> {
        let host = std::env::var("DOCKER_HOST").unwrap_or_else(|_| default_host.to_string());
        Self::new(&host, Duration::from_secs(60))
    }

    /// Create a client for an explicit endpoint.
    pub fn new(host: &str, api_timeout: Duration) -> Result<Self> {
        let base_url = if let Some(rest) = host.strip_prefix("tcp://") {
            format!("http://{}", rest)
        } else if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else if host.starts_with("unix://") {
            return Err(KilnError::EngineFailed {
                reason: format!(
                    "unix-socket engine endpoints are not supported: {} (expose the engine over tcp)",
                    host
                ),
            });
        } else {
            format!("http://{}", host)
        };

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| KilnError::EngineFailed {
                reason: format!("failed to construct engine HTTP client: {}", e),
            })?;

        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string(), api_timeout })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}{}", self.base_url, API_VERSION, path)
    }

    async fn fail_from_response(context: &str, response: reqwest::Response) -> KilnError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or(body);
        KilnError::EngineFailed { reason: format!("{}: {} ({})", context, detail, status) }
    }

    fn stream_body(response: reqwest::Response) -> EngineStream {
        response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| KilnError::EngineFailed {
                    reason: format!("engine stream error: {}", e),
                })
            })
            .boxed()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    #[instrument(skip(self, context_tar), fields(bytes = context_tar.len()))]
    async fn image_build(
        &self,
        context_tar: Bytes,
        options: &ImageBuildOptions,
    ) -> Result<EngineStream> {
        let mut query: Vec<(String, String)> = vec![
            ("dockerfile".into(), options.dockerfile.clone()),
            ("nocache".into(), options.no_cache.to_string()),
            ("pull".into(), options.pull.to_string()),
            ("rm".into(), "true".into()),
            ("forcerm".into(), "true".into()),
        ];
        for tag in &options.tags {
            query.push(("t".into(), tag.clone()));
        }
        if let Some(target) = &options.target {
            query.push(("target".into(), target.clone()));
        }
        if !options.build_args.is_empty() {
            let args = serde_json::to_string(&options.build_args)
                .map_err(|e| KilnError::internal(e))?;
            query.push(("buildargs".into(), args));
        }
        if !options.platforms.is_empty() {
            query.push(("platform".into(), options.platforms.join(",")));
        }
        query.push((
            "version".into(),
            match options.builder {
                BuilderKind::Modern => "2".into(),
                BuilderKind::Legacy => "1".into(),
            },
        ));

        debug!(tags = ?options.tags, "Requesting engine build");
        let response = self
            .http
            .post(self.url("/build"))
            .query(&query)
            .header(reqwest::header::CONTENT_TYPE, "application/x-tar")
            .body(context_tar)
            .send()
            .await
            .map_err(|e| KilnError::EngineFailed {
                reason: format!("build request failed: {}", e),
            })?;

        if !response.status().is_success() {
            return Err(Self::fail_from_response("image build rejected", response).await);
        }
        Ok(Self::stream_body(response))
    }

    async fn image_save(&self, image: &str) -> Result<EngineStream> {
        let response = self
            .http
            .get(self.url(&format!("/images/{}/get", image)))
            .send()
            .await
            .map_err(|e| KilnError::EngineFailed {
                reason: format!("image save request failed: {}", e),
            })?;
        if !response.status().is_success() {
            return Err(Self::fail_from_response("image save rejected", response).await);
        }
        Ok(Self::stream_body(response))
    }

    async fn image_tag(&self, image: &str, tag: &str) -> Result<()> {
        // "repo:tag" — the tag part never contains '/', so split on the
        // last ':' only when the remainder is slash-free.
        let (repo, tag_name) = match tag.rsplit_once(':') {
            Some((repo, tag_name)) if !tag_name.contains('/') => (repo, tag_name),
            _ => (tag, "latest"),
        };

        let response = self
            .http
            .post(self.url(&format!("/images/{}/tag", image)))
            .query(&[("repo", repo), ("tag", tag_name)])
            .timeout(self.api_timeout)
            .send()
            .await
            .map_err(|e| KilnError::EngineFailed {
                reason: format!("image tag request failed: {}", e),
            })?;
        if !response.status().is_success() {
            return Err(Self::fail_from_response("image tag rejected", response).await);
        }
        Ok(())
    }

    async fn image_pull(&self, reference: &str) -> Result<EngineStream> {
        let (image, tag) = match reference.rsplit_once(':') {
            Some((image, tag)) if !tag.contains('/') => (image, tag),
            _ => (reference, "latest"),
        };
        let response = self
            .http
            .post(self.url("/images/create"))
            .query(&[("fromImage", image), ("tag", tag)])
            .send()
            .await
            .map_err(|e| KilnError::EngineFailed {
                reason: format!("image pull request failed: {}", e),
            })?;
        if !response.status().is_success() {
            return Err(Self::fail_from_response("image pull rejected", response).await);
        }
        Ok(Self::stream_body(response))
    }

    async fn image_inspect(&self, reference: &str) -> Result<ImageInspect> {
        let response = self
            .http
            .get(self.url(&format!("/images/{}/json", reference)))
            .timeout(self.api_timeout)
            .send()
            .await
            .map_err(|e| KilnError::EngineFailed {
                reason: format!("image inspect request failed: {}", e),
            })?;
        if !response.status().is_success() {
            return Err(Self::fail_from_response("image inspect rejected", response).await);
        }
        let inspect: InspectResponse =
            response.json().await.map_err(|e| KilnError::EngineFailed {
                reason: format!("invalid inspect response: {}", e),
            })?;
        Ok(ImageInspect {
            id: inspect.id.trim_start_matches("sha256:").to_string(),
            size: inspect.size,
        })
    }

    async fn container_create(&self, image: &str) -> Result<String> {
        let response = self
            .http
            .post(self.url("/containers/create"))
            .json(&serde_json::json!({ "Image": image }))
            .timeout(self.api_timeout)
            .send()
            .await
            .map_err(|e| KilnError::EngineFailed {
                reason: format!("container create request failed: {}", e),
            })?;
        if !response.status().is_success() {
            return Err(Self::fail_from_response("container create rejected", response).await);
        }
        let created: CreateContainerResponse =
            response.json().await.map_err(|e| KilnError::EngineFailed {
                reason: format!("invalid container create response: {}", e),
            })?;
        Ok(created.id)
    }

    async fn container_copy_from(&self, container: &str, path: &str) -> Result<EngineStream> {
        let response = self
            .http
            .get(self.url(&format!("/containers/{}/archive", container)))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| KilnError::EngineFailed {
                reason: format!("container copy request failed: {}", e),
            })?;
        if !response.status().is_success() {
            return Err(Self::fail_from_response("container copy rejected", response).await);
        }
        Ok(Self::stream_body(response))
    }

    async fn container_remove(&self, container: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/containers/{}", container)))
            .query(&[("force", "true")])
            .timeout(self.api_timeout)
            .send()
            .await
            .map_err(|e| KilnError::EngineFailed {
                reason: format!("container remove request failed: {}", e),
            })?;
        if !response.status().is_success() {
            return Err(Self::fail_from_response("container remove rejected", response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalization() {
        let engine = DockerEngine::new("tcp://127.0.0.1:2375", Duration::from_secs(5)).unwrap();
        assert_eq!(engine.url("/build"), "http://127.0.0.1:2375/v1.43/build");

        let engine = DockerEngine::new("http://docker:2375/", Duration::from_secs(5)).unwrap();
        assert_eq!(engine.url("/images/x/json"), "http://docker:2375/v1.43/images/x/json");

        assert!(DockerEngine::new("unix:///var/run/docker.sock", Duration::from_secs(5)).is_err());
    }
}
