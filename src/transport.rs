//! HTTP access used by the engine.
//!
//! The engine only talks to [`HttpTransport`]; [`ReqwestTransport`] is the
//! production implementation and tests plug in an in-memory one.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use crate::config::HttpConfig;
use crate::error::TransportError;

pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Inclusive byte range, as written in a `Range: bytes=start-end` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResponse {
    pub content_length: Option<u64>,
    pub accepts_ranges: bool,
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// HEAD-equivalent request.
    async fn probe(&self, url: &str) -> Result<ProbeResponse, TransportError>;

    /// GET, optionally restricted to `range`. A ranged request must be
    /// answered with partial content.
    async fn get(&self, url: &str, range: Option<ByteRange>) -> Result<BodyStream, TransportError>;
}

pub struct ReqwestTransport {
    client: Client,
    config: HttpConfig,
}

impl ReqwestTransport {
    pub fn new(config: HttpConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { client, config })
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<Response, TransportError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.config.max_retries && is_transient(&e) => {
                    attempt += 1;
                    let delay = self.config.retry_delay(attempt);
                    warn!("Request failed ({}), retry {} in {:?}", e, attempt, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request()
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn probe(&self, url: &str) -> Result<ProbeResponse, TransportError> {
        let response = self.send_with_retry(|| self.client.head(url)).await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        // Read the header directly: the body of a HEAD response is empty.
        let headers = response.headers();
        let content_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let accepts_ranges = headers
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v.contains("bytes"));

        debug!(
            "Probed {}: content_length={:?}, accepts_ranges={}",
            url, content_length, accepts_ranges
        );
        Ok(ProbeResponse {
            content_length,
            accepts_ranges,
        })
    }

    async fn get(&self, url: &str, range: Option<ByteRange>) -> Result<BodyStream, TransportError> {
        let response = self
            .send_with_retry(|| {
                let request = self.client.get(url);
                match range {
                    Some(r) => request.header(header::RANGE, r.header_value()),
                    None => request,
                }
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        if range.is_some() && status != StatusCode::PARTIAL_CONTENT {
            return Err(TransportError::RangeIgnored);
        }

        Ok(response.bytes_stream().map_err(TransportError::from).boxed())
    }
}
