//! HTTP helpers for source adapters.
//!
//! Status handling is uniform across adapters: 401 and 403 become
//! [`FetchError::Auth`] built from the resolved credentials, 404 is mapped
//! by the caller (usually to `RevisionNotFound`), and every other failure is
//! a [`FetchError::Network`] carrying the status so the retry executor can
//! classify it.

use crate::config::NetworkConfig;
use crate::credentials::ResolvedCredentials;
use crate::error::{AuthFailure, FetchError, Result};
use crate::sources::{FetchContext, SourceKind};
use crate::spec::NetworkSpec;
use futures::StreamExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Bytes per rate-limiter cell.
const THROTTLE_CELL: u64 = 1024;

/// Clients for one fetch, configured from its network spec.
#[derive(Debug, Clone)]
pub struct HttpClients {
    /// Metadata requests: bounded total time.
    pub api: Client,
    /// File transfers: only connect and idle-read bounds.
    pub download: Client,
}

impl HttpClients {
    pub fn new(network: &NetworkSpec) -> Result<Self> {
        let proxy = match &network.proxy {
            Some(url) => Some(
                reqwest::Proxy::all(url)
                    .map_err(|e| FetchError::config(format!("network.proxy: {}", e)))?,
            ),
            None => None,
        };

        let mut api = Client::builder()
            .user_agent(NetworkConfig::USER_AGENT)
            .connect_timeout(network.timeout.connect())
            .timeout(
                network
                    .timeout
                    .read()
                    .unwrap_or(NetworkConfig::API_REQUEST_TIMEOUT),
            );
        let mut download = Client::builder()
            .user_agent(NetworkConfig::USER_AGENT)
            .connect_timeout(network.timeout.connect());
        if let Some(read) = network.timeout.read() {
            download = download.read_timeout(read);
        }
        if let Some(proxy) = proxy {
            api = api.proxy(proxy.clone());
            download = download.proxy(proxy);
        }

        Ok(Self {
            api: api.build().map_err(|e| {
                FetchError::Other(format!("Failed to create HTTP client: {}", e))
            })?,
            download: download.build().map_err(|e| {
                FetchError::Other(format!("Failed to create download HTTP client: {}", e))
            })?,
        })
    }
}

/// Send a request and turn non-success statuses into typed errors.
pub async fn send_checked(
    request: RequestBuilder,
    kind: SourceKind,
    credentials: &ResolvedCredentials,
    not_found: impl FnOnce() -> FetchError,
) -> Result<Response> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    Err(match status {
        StatusCode::UNAUTHORIZED => credentials.auth_error(
            kind,
            credentials.unauthorized(),
            format!("HTTP 401 from {}", url),
        ),
        StatusCode::FORBIDDEN => credentials.auth_error(
            kind,
            AuthFailure::Insufficient,
            format!("HTTP 403 from {}", url),
        ),
        StatusCode::NOT_FOUND => not_found(),
        _ => {
            let body = response.text().await.unwrap_or_default();
            FetchError::Network {
                message: format!("HTTP {} from {}", status, url),
                status: Some(status.as_u16()),
                cause: (!body.is_empty()).then(|| body.chars().take(200).collect()),
            }
        }
    })
}

/// [`send_checked`] followed by JSON decoding of the body.
///
/// Decoding failures are `Json` errors, which are not retried.
pub async fn fetch_json<T: DeserializeOwned>(
    request: RequestBuilder,
    kind: SourceKind,
    credentials: &ResolvedCredentials,
    not_found: impl FnOnce() -> FetchError,
) -> Result<T> {
    let response = send_checked(request, kind, credentials, not_found).await?;
    let url = response.url().to_string();
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| FetchError::Json {
        message: format!("Unexpected response from {}: {}", url, e),
        source: Some(e),
    })
}

/// Stream `url` into `destination`, resuming from its current length.
///
/// Each call is one attempt; the caller retries. Bytes already on disk are
/// kept when the server honors the Range request (206), otherwise the file
/// is rewritten from the start.
pub async fn stream_download(
    ctx: &FetchContext,
    kind: SourceKind,
    url: &str,
    destination: &Path,
    expected_size: Option<u64>,
) -> Result<u64> {
    ctx.cancel.check()?;

    let mut resume_from = tokio::fs::metadata(destination)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    if let Some(size) = expected_size {
        if resume_from == size && size > 0 {
            debug!("{} already complete ({} bytes)", destination.display(), size);
            return Ok(size);
        }
        if resume_from > size {
            resume_from = 0;
        }
    }

    let mut request = ctx.credentials.apply(ctx.clients.download.get(url));
    if resume_from > 0 {
        debug!("Resuming {} from byte {}", url, resume_from);
        request = request.header(header::RANGE, format!("bytes={}-", resume_from));
    }

    let response = ctx
        .cancel
        .run_until_cancelled(send_checked(request, kind, &ctx.credentials, || {
            FetchError::Network {
                message: format!("{} not found (HTTP 404)", url),
                status: Some(404),
                cause: None,
            }
        }))
        .await??;

    let resumed = resume_from > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
    let mut file = if resumed {
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(destination)
            .await
    } else {
        tokio::fs::File::create(destination).await
    }
    .map_err(|e| FetchError::io_with_path(e, destination))?;

    let mut written = if resumed { resume_from } else { 0 };
    let mut stream = response.bytes_stream();
    while let Some(chunk) = ctx.cancel.run_until_cancelled(stream.next()).await? {
        let chunk = chunk?;
        if let Some(throttle) = &ctx.throttle {
            ctx.cancel
                .run_until_cancelled(throttle.consume(chunk.len()))
                .await?;
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| FetchError::io_with_path(e, destination))?;
        written += chunk.len() as u64;
        ctx.progress.record(chunk.len() as u64);
    }
    file.flush()
        .await
        .map_err(|e| FetchError::io_with_path(e, destination))?;

    if let Some(size) = expected_size {
        if written != size {
            return Err(FetchError::Network {
                message: format!(
                    "incomplete download of {}: {} of {} bytes",
                    url, written, size
                ),
                status: None,
                cause: None,
            });
        }
    }

    Ok(written)
}

/// Bandwidth limit shared by every download of a fetch.
pub struct Throttle {
    limiter: DefaultDirectRateLimiter,
    burst: NonZeroU32,
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle").field("burst", &self.burst).finish()
    }
}

impl Throttle {
    /// Limit to roughly `bytes_per_second`, at KiB granularity.
    pub fn new(bytes_per_second: u64) -> Self {
        let cells = (bytes_per_second / THROTTLE_CELL).clamp(1, u32::MAX as u64) as u32;
        let burst = NonZeroU32::new(cells).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_second(burst)),
            burst,
        }
    }

    /// Wait until `bytes` may be written.
    pub async fn consume(&self, bytes: usize) {
        let mut cells = (bytes as u64).div_ceil(THROTTLE_CELL);
        while cells > 0 {
            let take = cells.min(self.burst.get() as u64) as u32;
            if let Some(n) = NonZeroU32::new(take) {
                // Never exceeds the burst size, so capacity is always sufficient.
                let _ = self.limiter.until_n_ready(n).await;
            }
            cells -= take as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_clients_build_with_defaults() {
        assert!(HttpClients::new(&NetworkSpec::default()).is_ok());
    }

    #[test]
    fn test_invalid_proxy_is_config_error() {
        let network = NetworkSpec {
            proxy: Some("not a url with spaces".into()),
            ..Default::default()
        };
        assert!(matches!(
            HttpClients::new(&network),
            Err(FetchError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_throttle_delays_beyond_burst() {
        // 4 KiB/s: the first 4 KiB pass immediately, the next 2 KiB wait.
        let throttle = Throttle::new(4 * 1024);
        let started = Instant::now();
        throttle.consume(4 * 1024).await;
        assert!(started.elapsed() < Duration::from_millis(200));
        throttle.consume(2 * 1024).await;
        assert!(started.elapsed() >= Duration::from_millis(400));
    }
}
