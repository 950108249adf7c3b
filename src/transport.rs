//! Fetch transport used for artifacts, patches and reachability probes

use crate::error::{DeliveryError, DeliveryResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::time::Duration;

const FILE_SCHEME: &str = "file://";

/// Raw response from a transport
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// HTTP-style status code
    pub status: u16,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Trait for fetching bytes from a source locator
#[async_trait]
pub trait FetchTransport: Send + Sync {
    /// Fetch the full body behind `locator`
    async fn fetch(&self, locator: &str) -> DeliveryResult<FetchResponse>;

    /// Lightweight reachability check. Returns the status code
    async fn probe(&self, locator: &str) -> DeliveryResult<u16>;
}

/// Fetch and treat any non-success status as a network failure
pub async fn fetch_body(transport: &dyn FetchTransport, locator: &str) -> DeliveryResult<Bytes> {
    let response = transport.fetch(locator).await?;
    if !response.is_success() {
        return Err(DeliveryError::NetworkFailure(format!(
            "fetch of {} returned status {}",
            locator, response.status
        )));
    }
    Ok(response.body)
}

// ============================================================================
// Production Implementation
// ============================================================================

/// HTTP transport backed by reqwest
///
/// `file://` locators are served from the local filesystem, which keeps the
/// CLI usable against artifacts on disk.
pub struct HttpTransport {
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl HttpTransport {
    pub fn new(fetch_timeout: Duration, probe_timeout: Duration) -> DeliveryResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("model-delivery/", env!("CARGO_PKG_VERSION")))
            .timeout(fetch_timeout)
            .connect_timeout(probe_timeout)
            .build()
            .map_err(|e| {
                DeliveryError::InternalFailure(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            probe_timeout,
        })
    }

    async fn fetch_file(&self, path: &str) -> DeliveryResult<FetchResponse> {
        match tokio::fs::read(path).await {
            Ok(body) => Ok(FetchResponse::ok(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FetchResponse {
                status: 404,
                body: Bytes::new(),
            }),
            Err(e) => Err(DeliveryError::NetworkFailure(format!(
                "failed to read {}: {}",
                path, e
            ))),
        }
    }
}

fn network_error(locator: &str, err: reqwest::Error) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::NetworkFailure(format!("request to {} timed out", locator))
    } else {
        DeliveryError::NetworkFailure(format!("request to {} failed: {}", locator, err))
    }
}

#[async_trait]
impl FetchTransport for HttpTransport {
    async fn fetch(&self, locator: &str) -> DeliveryResult<FetchResponse> {
        if let Some(path) = locator.strip_prefix(FILE_SCHEME) {
            return self.fetch_file(path).await;
        }

        let response = self
            .client
            .get(locator)
            .send()
            .await
            .map_err(|e| network_error(locator, e))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Ok(FetchResponse {
                status,
                body: Bytes::new(),
            });
        }

        let expected = response.content_length();
        let mut body = BytesMut::with_capacity(expected.unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| network_error(locator, e))?;
            body.extend_from_slice(&chunk);
            tracing::trace!(
                locator = %locator,
                received = body.len(),
                expected = ?expected,
                "Received chunk"
            );
        }

        tracing::debug!(locator = %locator, bytes = body.len(), "Fetch complete");

        Ok(FetchResponse {
            status,
            body: body.freeze(),
        })
    }

    async fn probe(&self, locator: &str) -> DeliveryResult<u16> {
        if let Some(path) = locator.strip_prefix(FILE_SCHEME) {
            return Ok(if std::path::Path::new(path).exists() {
                200
            } else {
                404
            });
        }

        let response = self
            .client
            .head(locator)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| network_error(locator, e))?;

        Ok(response.status().as_u16())
    }
}
