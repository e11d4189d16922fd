//! Module byte transport

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

/// Bytes plus the content type they were served with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSource {
    pub content_type: String,
    pub bytes: Bytes,
}

impl FetchedSource {
    pub fn new(content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    /// JavaScript source with the default content type
    pub fn javascript(bytes: impl Into<Bytes>) -> Self {
        Self::new("application/javascript", bytes)
    }
}

/// Network transport
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, url: &Url) -> EngineResult<FetchedSource>;
}

/// `file://` from disk, `http(s)://` through reqwest
#[derive(Debug, Clone, Default)]
pub struct DefaultTransport {
    client: reqwest::Client,
}

impl DefaultTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch_file(&self, url: &Url) -> EngineResult<FetchedSource> {
        let path = url
            .to_file_path()
            .map_err(|_| EngineError::fetch(url.as_str(), "not a local path"))?;

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| EngineError::fetch(url.as_str(), e))?;

        let content_type = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(content_type_for_extension)
            .unwrap_or("application/octet-stream");

        Ok(FetchedSource::new(content_type, bytes))
    }

    async fn fetch_remote(&self, url: &Url) -> EngineResult<FetchedSource> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| EngineError::fetch(url.as_str(), e))?;

        if !response.status().is_success() {
            return Err(EngineError::fetch(
                url.as_str(),
                format!("HTTP {}", response.status()),
            ));
        }

        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::fetch(url.as_str(), e))?;

        Ok(FetchedSource {
            content_type,
            bytes,
        })
    }
}

#[async_trait]
impl Transport for DefaultTransport {
    async fn fetch(&self, url: &Url) -> EngineResult<FetchedSource> {
        tracing::trace!(url = %url, "fetching module");
        match url.scheme() {
            "file" => self.fetch_file(url).await,
            "http" | "https" => self.fetch_remote(url).await,
            other => Err(EngineError::fetch(
                url.as_str(),
                format!("unsupported scheme '{}'", other),
            )),
        }
    }
}

fn content_type_for_extension(ext: &str) -> &'static str {
    match ext {
        "js" | "mjs" | "cjs" => "application/javascript",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "wasm" => "application/wasm",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}
