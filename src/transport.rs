use crate::config::GatewayConfig;
use crate::types::{PatchflowError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::HeaderMap;
use serde_json::Value;

pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// A fully built upstream call: always a JSON POST.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drains the body for error reporting. Read failures are folded into the text.
    pub async fn text(self) -> String {
        let mut body = self.body;
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => buf.extend_from_slice(&bytes),
                Err(e) => {
                    buf.extend_from_slice(format!(" [body read failed: {}]", e).as_bytes());
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Resolves once response headers are in; the body is streamed lazily.
    async fn send(&self, request: ProviderRequest) -> Result<UpstreamResponse>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

/// Shared client settings for every outbound API (LLM, hosting, GitHub).
pub fn build_http_client(config: &GatewayConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout)
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(std::time::Duration::from_secs(60)))
        .user_agent(concat!("patchflow/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(PatchflowError::Network)?;
    Ok(client)
}

impl ReqwestTransport {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(config)?,
        })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UpstreamTransport for ReqwestTransport {
    async fn send(&self, request: ProviderRequest) -> Result<UpstreamResponse> {
        tracing::debug!(
            "[⚙️  -> ☁️ ] POST {}",
            crate::redaction::redact_text(&request.url)
        );
        if tracing::enabled!(tracing::Level::TRACE) {
            let mut logged = request.body.clone();
            crate::redaction::redact_value(&mut logged);
            tracing::trace!("[⚙️  -> ☁️ ] Request body: {}", logged);
        }

        let mut builder = self.client.post(&request.url).json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder.send().await.map_err(PatchflowError::Network)?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other))
            .boxed();

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}
