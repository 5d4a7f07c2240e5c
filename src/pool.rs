//! Pooled HTTP client for upstream services
//!
//! Proxied requests and readiness probes both go through keep-alive pools so
//! that a busy service does not pay a TCP handshake per request.

use async_trait::async_trait;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HOST;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::orchestrator::HealthProbe;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("cannot build upstream request: {0}")]
    RequestBuild(String),
}

impl PoolError {
    /// True when no connection to the upstream could be established
    pub fn is_connect(&self) -> bool {
        matches!(self, PoolError::Client(e) if e.is_connect())
    }
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub health_checks: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_check(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    /// Per-probe timeout for readiness checks
    pub probe_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

pub struct UpstreamPool {
    client: Client<HttpConnector, Incoming>,
    probe_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl UpstreamPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream pool initialized"
        );

        Self {
            client,
            probe_client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to `upstream` (`host:port`), keeping method, path,
    /// query, headers except `Host`, and streaming the body both ways
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        upstream: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://{}{}", upstream, path);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .version(hyper::Version::HTTP_11);
        for (key, value) in parts.headers.iter() {
            if key != HOST {
                builder = builder.header(key, value);
            }
        }
        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();
        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[async_trait]
impl HealthProbe for UpstreamPool {
    async fn probe(&self, upstream: &str, path: &str) -> bool {
        let uri = format!("http://{}{}", upstream, path);
        let Ok(req) = Request::builder()
            .method("GET")
            .uri(&uri)
            .body(Empty::<Bytes>::new())
        else {
            return false;
        };

        self.stats.record_health_check();
        match tokio::time::timeout(self.config.probe_timeout, self.probe_client.request(req)).await {
            Ok(Ok(response)) => !response.status().is_server_error(),
            Ok(Err(e)) => {
                debug!(upstream, path, error = %e, "Health probe failed");
                false
            }
            Err(_) => false,
        }
    }
}
