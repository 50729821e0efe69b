// HTTP transport for the artifact fetcher
//
// `HttpTransport` is the seam between the fetch flow and the network so the flow can be
// exercised without a registry. Production code uses `ReqwestTransport`.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};

use crate::error::InstallError;

/// Streamed response body.
pub struct ByteStream {
    /// Body length announced by the server, if any.
    pub content_length: Option<u64>,
    pub chunks: BoxStream<'static, Result<Vec<u8>, InstallError>>,
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Fetch a small document fully into memory (release metadata, checksum asset).
    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, InstallError>;

    /// Open a streaming download.
    async fn get_stream(&self, url: &str) -> Result<ByteStream, InstallError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    metadata_timeout: Duration,
    download_timeout: Duration,
}

impl ReqwestTransport {
    /// `metadata_timeout` bounds `get_bytes`; `download_timeout` bounds `get_stream`.
    pub fn new(metadata_timeout: Duration, download_timeout: Duration) -> Result<Self, InstallError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("boot-installer/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| InstallError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            metadata_timeout,
            download_timeout,
        })
    }

    async fn send(&self, url: &str, limit: Duration) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .get(url)
            .timeout(limit)
            .send()
            .await?
            .error_for_status()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, InstallError> {
        log::debug!(
            "[PHASE: download] [STEP: http] get_bytes entered (url={})",
            url
        );
        let resp = self
            .send(url, self.metadata_timeout)
            .await
            .map_err(|e| InstallError::Registry(format!("GET {} failed: {}", url, e)))?;
        let body = resp
            .bytes()
            .await
            .map_err(|e| InstallError::Registry(format!("reading {} failed: {}", url, e)))?;
        Ok(body.to_vec())
    }

    async fn get_stream(&self, url: &str) -> Result<ByteStream, InstallError> {
        log::debug!(
            "[PHASE: download] [STEP: http] get_stream entered (url={})",
            url
        );
        let resp = self
            .send(url, self.download_timeout)
            .await
            .map_err(|e| InstallError::Download(format!("GET {} failed: {}", url, e)))?;
        let content_length = resp.content_length();
        let chunks = resp
            .bytes_stream()
            .map_ok(|b| b.to_vec())
            .map_err(|e| InstallError::Download(format!("connection interrupted: {}", e)))
            .boxed();
        Ok(ByteStream {
            content_length,
            chunks,
        })
    }
}
