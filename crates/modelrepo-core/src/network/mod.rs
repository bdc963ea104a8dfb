//! Network plumbing shared by the HTTP-based source adapters.
//!
//! - `retry` - exponential backoff around fallible fetch steps
//! - `http` - client construction, status classification, resumable
//!   streaming downloads, bandwidth throttling

pub mod http;
pub mod retry;

pub use http::{fetch_json, send_checked, stream_download, HttpClients, Throttle};
pub use retry::{retry_async, with_retry, RetryConfig, RetryStats};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Byte counter shared by every download of one fetch.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounter {
    bytes: Arc<AtomicU64>,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}
