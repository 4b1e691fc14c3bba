//! Opaque recording sinks. The core calls these; what (if anything) exports
//! them is someone else's problem.

use latency::RollingWindow;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Duration;
use tracing::trace;

#[derive(Debug, Default, Serialize)]
pub struct ProxyMetrics {
    pub rpc_forwards: AtomicU64,
    pub rpc_errors: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_errors: AtomicU64,
    pub rate_limit_takes: AtomicU64,
    pub rate_limit_errors: AtomicU64,
    pub unserviceable_requests: AtomicU64,
    pub ws_client_messages: AtomicU64,
    pub ws_backend_messages: AtomicU64,
    pub group_fallbacks: AtomicU64,
    pub multicalls: AtomicU64,
    pub backend_network_errors: AtomicU64,
    pub http_responses: AtomicU64,
}

impl ProxyMetrics {
    pub fn rpc_forward(&self, backend: &str, method: &str) {
        trace!(%backend, %method, "forward");
        self.rpc_forwards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rpc_error(&self, backend: &str, code: i64) {
        trace!(%backend, code, "rpc error");
        self.rpc_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backend_latency(&self, backend: &str, duration: Duration) {
        trace!(%backend, ?duration, "backend latency");
    }

    pub fn backend_network_error(&self, backend: &str) {
        trace!(%backend, "network error");
        self.backend_network_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_error(&self) {
        self.cache_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limit_take(&self, ok: bool) {
        self.rate_limit_takes.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.rate_limit_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn unserviceable_request(&self) {
        self.unserviceable_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ws_message(&self, from_client: bool) {
        if from_client {
            self.ws_client_messages.fetch_add(1, Ordering::Relaxed);
        } else {
            self.ws_backend_messages.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn group_fallback(&self, group: &str, backend: &str) {
        trace!(%group, %backend, "fell back");
        self.group_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn multicall_complete(&self, backend: &str, ok: bool) {
        trace!(%backend, ok, "multicall completion");
        self.multicalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn http_response(&self, status: u16) {
        trace!(status, "http response");
        self.http_responses.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-backend health signals.
#[derive(Debug)]
pub struct BackendWindows {
    pub latency: latency::EwmaLatency,
    pub requests: RollingWindow,
    pub errors: RollingWindow,
}

impl Default for BackendWindows {
    fn default() -> Self {
        Self {
            latency: Default::default(),
            requests: RollingWindow::with_span(Duration::from_secs(60)),
            errors: RollingWindow::with_span(Duration::from_secs(60)),
        }
    }
}

impl BackendWindows {
    /// ratio of errors to requests over the window. needs a minimum of
    /// traffic before it means anything
    pub fn error_rate(&self) -> f64 {
        let requests = self.requests.count();

        if requests < 10 {
            return 0.0;
        }

        self.errors.sum() / self.requests.sum().max(1.0)
    }
}
