//! Request interceptor
//!
//! Every inbound request ends up in one of three places:
//! - bypass: control-plane hosts/paths and unknown hosts go to the
//!   passthrough upstream (or get a 404)
//! - wake: a known service that is not running is woken and the client gets
//!   a 202 loading page right away
//! - proxy: a running service gets the request streamed to its upstream

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{json_error_response, ProxyErrorCode};
use crate::loading::LoadingPage;
use crate::orchestrator::Orchestrator;
use crate::pool::{PoolError, UpstreamPool};
use crate::service::{ServiceDescriptor, ServiceStatus};

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// First labels (`admin`) or full hostnames that always bypass
    pub control_hosts: Vec<String>,
    pub bypass_path_prefixes: Vec<String>,
    /// `host:port` receiving bypassed requests
    pub passthrough_upstream: Option<String>,
    pub request_timeout: Duration,
    /// How long to wait for a freshly initiated wake to fail before
    /// answering with the loading page
    pub wake_fast_fail: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            control_hosts: vec!["admin".to_string()],
            bypass_path_prefixes: vec!["/api/".to_string()],
            passthrough_upstream: None,
            request_timeout: Duration::from_secs(30),
            wake_fast_fail: Duration::from_millis(200),
        }
    }
}

impl ProxySettings {
    fn is_control_plane(&self, hostname: &str, path: &str) -> bool {
        let first_label = hostname.split('.').next().unwrap_or(hostname);
        self.control_hosts.iter().any(|h| {
            if h.contains('.') {
                h.eq_ignore_ascii_case(hostname)
            } else {
                h.eq_ignore_ascii_case(first_label)
            }
        }) || self
            .bypass_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

struct ProxyContext {
    orchestrator: Arc<Orchestrator>,
    pool: Arc<UpstreamPool>,
    settings: ProxySettings,
}

pub struct ProxyServer {
    bind_addr: SocketAddr,
    context: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        orchestrator: Arc<Orchestrator>,
        pool: Arc<UpstreamPool>,
        settings: ProxySettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            context: Arc::new(ProxyContext {
                orchestrator,
                pool,
                settings,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, client_addr, context).await {
                                    debug!(addr = %client_addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    context: Arc<ProxyContext>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, client_addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))
}

async fn handle_request(
    mut req: Request<Incoming>,
    context: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<ProxyResponse, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let Some(hostname) = extract_hostname(&req) else {
        return Ok(json_error_response(
            ProxyErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        ));
    };

    // Overwrite rather than append: this proxy is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(hostname = %hostname, method = %req.method(), uri = %req.uri(), request_id = %request_id, "Incoming request");

    let settings = &context.settings;
    if settings.is_control_plane(&hostname, req.uri().path()) {
        return Ok(passthrough(req, &context, &request_id).await);
    }

    let service = subdomain_of(&hostname)
        .and_then(|sub| context.orchestrator.registry().get_by_subdomain(sub).ok());
    let Some(service) = service else {
        return Ok(passthrough(req, &context, &request_id).await);
    };

    let upstream = match service.status {
        ServiceStatus::Running => context.orchestrator.get_service_url(&service.id),
        _ => None,
    };
    let Some(upstream) = upstream else {
        return Ok(wake_response(&req, &service, &context).await);
    };

    if is_upgrade_request(&req) {
        return Ok(handle_upgrade(req, context.clone(), service.id, upstream, request_id).await);
    }

    match forward(req, &context, &upstream, &service.id).await {
        Ok(response) => {
            if let Err(e) = context.orchestrator.touch(&service.id) {
                debug!(service = %service.id, error = %e, "Could not record activity");
            }
            Ok(response)
        }
        Err(error_response) => Ok(error_response),
    }
}

/// Start waking `service` and answer with the loading page. A wake that
/// fails within `wake_fast_fail` is reported as 503 instead.
async fn wake_response(
    req: &Request<Incoming>,
    service: &ServiceDescriptor,
    context: &Arc<ProxyContext>,
) -> ProxyResponse {
    let orchestrator = Arc::clone(&context.orchestrator);
    let id = service.id.clone();
    let mut wake = tokio::spawn(async move { orchestrator.wake(&id).await });

    match tokio::time::timeout(context.settings.wake_fast_fail, &mut wake).await {
        Ok(Ok(Err(e))) => {
            warn!(service = %service.id, error = %e, "Wake failed");
            return json_error_response(
                ProxyErrorCode::ServiceUnavailable,
                format!("Service '{}' could not be started", service.name),
            );
        }
        Ok(Err(e)) => {
            error!(service = %service.id, error = %e, "Wake task aborted");
            return json_error_response(ProxyErrorCode::InternalError, "Internal proxy error");
        }
        // Finished, or still booting in the background
        Ok(Ok(Ok(()))) | Err(_) => {}
    }

    let current = context
        .orchestrator
        .registry()
        .get(&service.id)
        .unwrap_or_else(|_| service.clone());
    LoadingPage::for_service(&current).response(req.headers())
}

async fn passthrough(
    req: Request<Incoming>,
    context: &Arc<ProxyContext>,
    request_id: &str,
) -> ProxyResponse {
    match context.settings.passthrough_upstream.as_deref() {
        Some(upstream) => {
            debug!(request_id, upstream, "Passing request through to control plane");
            forward(req, context, upstream, "passthrough")
                .await
                .unwrap_or_else(|error_response| error_response)
        }
        None => json_error_response(ProxyErrorCode::UnknownHost, "Unknown or unconfigured host"),
    }
}

/// Stream to `upstream`. `Err` carries the 502/504 answer when the
/// upstream never responded.
async fn forward(
    req: Request<Incoming>,
    context: &Arc<ProxyContext>,
    upstream: &str,
    service: &str,
) -> Result<ProxyResponse, ProxyResponse> {
    let timeout = context.settings.request_timeout;
    match tokio::time::timeout(timeout, context.pool.send_request(req, upstream)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            let (code, message) = upstream_failure(&e);
            error!(service, upstream, error = %e, connect = e.is_connect(), "Failed to forward request");
            Err(json_error_response(code, message))
        }
        Err(_) => {
            warn!(service, upstream, timeout_secs = timeout.as_secs(), "Upstream request timed out");
            Err(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", timeout.as_secs()),
            ))
        }
    }
}

/// Answer for a request the pool could not complete
fn upstream_failure(err: &PoolError) -> (ProxyErrorCode, &'static str) {
    match err {
        PoolError::RequestBuild(_) => (ProxyErrorCode::InternalError, "Internal proxy error"),
        PoolError::Client(_) if err.is_connect() => {
            (ProxyErrorCode::ConnectionFailed, "Failed to connect to upstream")
        }
        PoolError::Client(_) => (
            ProxyErrorCode::ConnectionFailed,
            "Upstream connection failed before a response",
        ),
    }
}

fn extract_hostname(req: &Request<Incoming>) -> Option<String> {
    let host = req.headers().get(HOST)?.to_str().ok()?;
    let hostname = host.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    // Alphanumeric, hyphen and dot only, which also keeps logs clean
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }
    Some(hostname.to_lowercase())
}

/// First DNS label, when the host has at least two
fn subdomain_of(hostname: &str) -> Option<&str> {
    let mut labels = hostname.split('.');
    let first = labels.next()?;
    labels.next()?;
    (!first.is_empty()).then_some(first)
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    connection_upgrade && req.headers().contains_key(UPGRADE)
}

/// Relay an HTTP upgrade (WebSocket) to the upstream over a raw connection
async fn handle_upgrade(
    req: Request<Incoming>,
    context: Arc<ProxyContext>,
    service_id: String,
    upstream: String,
    request_id: String,
) -> ProxyResponse {
    let mut head = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\n",
        req.method(),
        req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/"),
        upstream
    );
    for (name, value) in req.headers() {
        if name == HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            head.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    head.push_str("\r\n");

    let mut upstream_stream = match TcpStream::connect(&upstream).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(service = %service_id, upstream = %upstream, error = %e, "Upgrade connect failed");
            return json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to upstream",
            );
        }
    };

    let mut buf = vec![0u8; 4096];
    let read = match upstream_stream.write_all(head.as_bytes()).await {
        Ok(()) => upstream_stream.read(&mut buf).await,
        Err(e) => Err(e),
    };
    let parsed = match read {
        Ok(n) if n > 0 => parse_response_head(&buf[..n]),
        _ => None,
    };
    let Some((status, response_headers)) = parsed else {
        error!(service = %service_id, "Upstream gave no valid upgrade response");
        return json_error_response(
            ProxyErrorCode::ConnectionFailed,
            "Invalid upgrade response from upstream",
        );
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in &response_headers {
        let lower = name.to_ascii_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(v) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), v);
        }
    }
    let response = builder
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with parsed status and checked headers");

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(service = %service_id, status = %status, "Upstream rejected upgrade");
        return response;
    }

    if let Err(e) = context.orchestrator.touch(&service_id) {
        debug!(service = %service_id, error = %e, "Could not record activity");
    }
    info!(service = %service_id, request_id = %request_id, "Upgrade established");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => relay(upgraded, upstream_stream, &service_id).await,
            Err(e) => error!(service = %service_id, error = %e, "Client upgrade failed"),
        }
        // A long-lived connection counts as activity until it closes
        let _ = context.orchestrator.touch(&service_id);
    });

    response
}

async fn relay(client: Upgraded, mut upstream: TcpStream, service_id: &str) {
    let mut client = TokioIo::new(client);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => {
            debug!(service = %service_id, sent, received, "Upgraded connection closed")
        }
        Err(e) => debug!(service = %service_id, error = %e, "Upgraded connection closed with error"),
    }
}

fn parse_response_head(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.lines();
    let code = lines.next()?.split(' ').nth(1)?.parse::<u16>().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();
    Some((status, headers))
}
