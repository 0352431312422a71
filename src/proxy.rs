//! Sidecar interception pipeline.
//!
//! Stamps standing headers and the proxy id onto traffic, runs ordered
//! request/response interceptors, and keeps an access log. A failing
//! interceptor is logged and skipped; it never aborts the pipeline.

use crate::clock::{self, SharedClock};
use crate::error::{MeshError, Result};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Header carrying the id of the proxy that handled the traffic.
pub const PROXY_ID_HEADER: &str = "x-proxy-id";

const ACCESS_LOG_CAPACITY: usize = 1000;

/// Error type interceptors may return.
pub type InterceptorError = Box<dyn std::error::Error + Send + Sync>;

pub type RequestInterceptor =
    Arc<dyn Fn(&mut ProxyRequest) -> std::result::Result<(), InterceptorError> + Send + Sync>;

pub type ResponseInterceptor =
    Arc<dyn Fn(&mut ProxyResponse) -> std::result::Result<(), InterceptorError> + Send + Sync>;

/// Outbound request as seen by the sidecar.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    /// Set when the request leaves over mutual TLS.
    pub mtls: bool,
}

impl ProxyRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            mtls: false,
        }
    }
}

/// Response flowing back through the sidecar.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ProxyResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Request,
    Response,
}

/// One access log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessLogEntry {
    pub direction: Direction,
    pub method: Option<String>,
    pub path: Option<String>,
    pub status: Option<u16>,
    /// Milliseconds since the proxy was created.
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
struct MtlsConfig {
    cert_path: String,
    key_path: String,
}

/// Proxy counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyStats {
    pub proxy_id: String,
    pub total_requests: u64,
    pub total_responses: u64,
    pub errors: u64,
    pub interceptor_errors: u64,
    pub mtls_enabled: bool,
    pub request_interceptors: usize,
    pub response_interceptors: usize,
    pub standing_headers: usize,
}

/// Per-instance sidecar proxy.
pub struct EdgeProxy {
    proxy_id: String,
    proxy_id_value: HeaderValue,
    headers: RwLock<HeaderMap>,
    mtls: RwLock<Option<MtlsConfig>>,
    request_interceptors: RwLock<Vec<(String, RequestInterceptor)>>,
    response_interceptors: RwLock<Vec<(String, ResponseInterceptor)>>,
    access_log: Mutex<VecDeque<AccessLogEntry>>,
    total_requests: AtomicU64,
    total_responses: AtomicU64,
    errors: AtomicU64,
    interceptor_errors: AtomicU64,
    started_at: Instant,
    clock: SharedClock,
}

impl EdgeProxy {
    /// Creates a proxy. The id must be usable as a header value.
    pub fn new(proxy_id: &str) -> Result<Self> {
        Self::with_clock(proxy_id, clock::system())
    }

    pub fn with_clock(proxy_id: &str, clock: SharedClock) -> Result<Self> {
        let proxy_id_value = HeaderValue::from_str(proxy_id)
            .map_err(|e| MeshError::invalid(format!("invalid proxy id '{proxy_id}': {e}")))?;
        Ok(Self {
            proxy_id: proxy_id.to_string(),
            proxy_id_value,
            headers: RwLock::new(HeaderMap::new()),
            mtls: RwLock::new(None),
            request_interceptors: RwLock::new(Vec::new()),
            response_interceptors: RwLock::new(Vec::new()),
            access_log: Mutex::new(VecDeque::new()),
            total_requests: AtomicU64::new(0),
            total_responses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            interceptor_errors: AtomicU64::new(0),
            started_at: clock.now(),
            clock,
        })
    }

    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    /// Adds a header stamped onto every request.
    pub fn set_header(&self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| MeshError::invalid(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| MeshError::invalid(format!("invalid header value for {name}: {e}")))?;
        self.headers.write().insert(name, value);
        Ok(())
    }

    /// Removes a standing header. Returns false if it was not set.
    pub fn remove_header(&self, name: &str) -> bool {
        self.headers.write().remove(name).is_some()
    }

    pub fn enable_mtls(&self, cert_path: &str, key_path: &str) -> Result<()> {
        if cert_path.is_empty() || key_path.is_empty() {
            return Err(MeshError::invalid("mTLS needs both a certificate and a key path"));
        }
        info!(proxy = %self.proxy_id, cert = %cert_path, "mTLS enabled");
        *self.mtls.write() = Some(MtlsConfig {
            cert_path: cert_path.to_string(),
            key_path: key_path.to_string(),
        });
        Ok(())
    }

    pub fn disable_mtls(&self) {
        if self.mtls.write().take().is_some() {
            info!(proxy = %self.proxy_id, "mTLS disabled");
        }
    }

    pub fn mtls_enabled(&self) -> bool {
        self.mtls.read().is_some()
    }

    /// Returns the configured certificate and key paths.
    pub fn mtls_paths(&self) -> Option<(String, String)> {
        self.mtls
            .read()
            .as_ref()
            .map(|m| (m.cert_path.clone(), m.key_path.clone()))
    }

    /// Appends a request interceptor. Interceptors run in insertion order.
    pub fn add_request_interceptor<F>(&self, name: &str, interceptor: F)
    where
        F: Fn(&mut ProxyRequest) -> std::result::Result<(), InterceptorError> + Send + Sync + 'static,
    {
        self.request_interceptors
            .write()
            .push((name.to_string(), Arc::new(interceptor)));
    }

    /// Appends a response interceptor. Interceptors run in insertion order.
    pub fn add_response_interceptor<F>(&self, name: &str, interceptor: F)
    where
        F: Fn(&mut ProxyResponse) -> std::result::Result<(), InterceptorError> + Send + Sync + 'static,
    {
        self.response_interceptors
            .write()
            .push((name.to_string(), Arc::new(interceptor)));
    }

    /// Removes every interceptor registered under `name`.
    pub fn remove_interceptor(&self, name: &str) -> bool {
        let mut removed = false;
        {
            let mut list = self.request_interceptors.write();
            let before = list.len();
            list.retain(|(n, _)| n != name);
            removed |= list.len() != before;
        }
        {
            let mut list = self.response_interceptors.write();
            let before = list.len();
            list.retain(|(n, _)| n != name);
            removed |= list.len() != before;
        }
        removed
    }

    /// Runs an outbound request through the pipeline.
    pub fn intercept_request(&self, mut request: ProxyRequest) -> ProxyRequest {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        for (name, value) in self.headers.read().iter() {
            request.headers.insert(name.clone(), value.clone());
        }
        request
            .headers
            .insert(PROXY_ID_HEADER, self.proxy_id_value.clone());
        if self.mtls_enabled() {
            request.mtls = true;
        }

        // Snapshot so interceptors run without holding the lock.
        let interceptors = self.request_interceptors.read().clone();
        for (name, interceptor) in &interceptors {
            if let Err(e) = interceptor(&mut request) {
                self.interceptor_errors.fetch_add(1, Ordering::Relaxed);
                warn!(proxy = %self.proxy_id, interceptor = %name, error = %e, "request interceptor failed");
            }
        }

        debug!(proxy = %self.proxy_id, method = %request.method, path = %request.path, "request intercepted");
        self.log(AccessLogEntry {
            direction: Direction::Request,
            method: Some(request.method.to_string()),
            path: Some(request.path.clone()),
            status: None,
            elapsed_ms: self.elapsed_ms(),
        });
        request
    }

    /// Runs an inbound response through the pipeline.
    pub fn intercept_response(&self, mut response: ProxyResponse) -> ProxyResponse {
        self.total_responses.fetch_add(1, Ordering::Relaxed);
        response
            .headers
            .insert(PROXY_ID_HEADER, self.proxy_id_value.clone());

        let interceptors = self.response_interceptors.read().clone();
        for (name, interceptor) in &interceptors {
            if let Err(e) = interceptor(&mut response) {
                self.interceptor_errors.fetch_add(1, Ordering::Relaxed);
                warn!(proxy = %self.proxy_id, interceptor = %name, error = %e, "response interceptor failed");
            }
        }

        if response.status.is_server_error() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }

        self.log(AccessLogEntry {
            direction: Direction::Response,
            method: None,
            path: None,
            status: Some(response.status.as_u16()),
            elapsed_ms: self.elapsed_ms(),
        });
        response
    }

    fn elapsed_ms(&self) -> u64 {
        self.clock
            .now()
            .saturating_duration_since(self.started_at)
            .as_millis() as u64
    }

    fn log(&self, entry: AccessLogEntry) {
        let mut log = self.access_log.lock();
        if log.len() == ACCESS_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(entry);
    }

    /// Returns up to `limit` of the most recent access log entries, oldest first.
    pub fn access_log(&self, limit: Option<usize>) -> Vec<AccessLogEntry> {
        let log = self.access_log.lock();
        let skip = limit.map_or(0, |l| log.len().saturating_sub(l));
        log.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> ProxyStats {
        ProxyStats {
            proxy_id: self.proxy_id.clone(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_responses: self.total_responses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            interceptor_errors: self.interceptor_errors.load(Ordering::Relaxed),
            mtls_enabled: self.mtls_enabled(),
            request_interceptors: self.request_interceptors.read().len(),
            response_interceptors: self.response_interceptors.read().len(),
            standing_headers: self.headers.read().len(),
        }
    }
}
