use crate::error::Error;
use crate::orchestrator::Orchestrator;
use crate::service::ServiceDescriptor;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const DEFAULT_LOG_TAIL: usize = 100;
const MAX_LOG_TAIL: usize = 10_000;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn error_response(err: &Error) -> Response<Full<Bytes>> {
    let status = error_status(err);
    let body = serde_json::json!({
        "error": err.to_string(),
        "status": status.as_u16(),
    });
    json_response(status, body.to_string())
}

fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::ServiceNotFound(_) => StatusCode::NOT_FOUND,
        Error::AlreadyExists(_) | Error::InvalidState(_) | Error::ContainerGone(_) => {
            StatusCode::CONFLICT
        }
        Error::InvalidSpec(_) => StatusCode::BAD_REQUEST,
        Error::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::ProxySyncError(_) => StatusCode::BAD_GATEWAY,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::ServiceStartError { .. }
        | Error::ServiceStopError { .. }
        | Error::RuntimeFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

struct AdminContext {
    orchestrator: Arc<Orchestrator>,
    auth_token: String,
}

/// Token-protected control API for managed services
pub struct AdminServer {
    bind_addr: SocketAddr,
    context: Arc<AdminContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        orchestrator: Arc<Orchestrator>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            context: Arc::new(AdminContext {
                orchestrator,
                auth_token,
            }),
            shutdown_rx,
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.context.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, context).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, context: Arc<AdminContext>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let context = Arc::clone(&context);
        async move { handle_admin_request(req, context).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

fn service_json(orchestrator: &Orchestrator, desc: &ServiceDescriptor) -> serde_json::Value {
    let mut value = serde_json::to_value(desc).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(map) = value.as_object_mut() {
        map.insert(
            "url".to_string(),
            serde_json::json!(orchestrator.get_service_url(&desc.id)),
        );
        map.insert(
            "degraded".to_string(),
            serde_json::json!(orchestrator.is_degraded(&desc.id)),
        );
    }
    value
}

fn log_tail(query: Option<&str>) -> usize {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "tail")
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(DEFAULT_LOG_TAIL)
        .min(MAX_LOG_TAIL)
}

async fn handle_admin_request<B>(
    req: Request<B>,
    context: Arc<AdminContext>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    let response = match (&method, path.as_str()) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        _ if !check_auth(&req, &context.auth_token) => {
            warn!(path = %path, "Unauthorized admin API request");
            response(StatusCode::UNAUTHORIZED, "unauthorized")
        }

        (&Method::GET, "/services") => {
            let orchestrator = &context.orchestrator;
            let services: Vec<serde_json::Value> = orchestrator
                .registry()
                .list()
                .iter()
                .map(|d| service_json(orchestrator, d))
                .collect();
            let body = serde_json::json!({
                "services": services,
                "count": services.len(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::GET, "/routes/degraded") => {
            let degraded: Vec<serde_json::Value> = context
                .orchestrator
                .degraded()
                .into_iter()
                .map(|(service, reason)| serde_json::json!({ "service": service, "reason": reason }))
                .collect();
            let body = serde_json::json!({ "degraded": degraded });
            json_response(StatusCode::OK, body.to_string())
        }

        (_, path) if path.starts_with("/services/") => {
            let rest = path.trim_start_matches("/services/");
            let (id, action) = match rest.split_once('/') {
                Some((id, action)) => (id, Some(action)),
                None => (rest, None),
            };
            if id.is_empty() {
                response(StatusCode::BAD_REQUEST, "missing service id")
            } else {
                service_request(&context.orchestrator, &method, id, action, req.uri().query()).await
            }
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn service_request(
    orchestrator: &Arc<Orchestrator>,
    method: &Method,
    id: &str,
    action: Option<&str>,
    query: Option<&str>,
) -> Response<Full<Bytes>> {
    let result = match (method, action) {
        (&Method::GET, None) => orchestrator.registry().get(id).map(|d| service_json(orchestrator, &d)),
        (&Method::DELETE, None) => orchestrator.delete(id).await.map(|d| {
            info!(service = %id, "Service deleted via admin API");
            serde_json::json!({ "deleted": d.id })
        }),
        (&Method::POST, Some(action @ ("wake" | "sleep" | "restart"))) => {
            info!(service = %id, action, "Lifecycle request via admin API");
            let outcome = match action {
                "wake" => orchestrator.wake(id).await,
                "sleep" => orchestrator.sleep(id).await,
                _ => orchestrator.restart(id).await,
            };
            outcome.and_then(|_| orchestrator.registry().get(id)).map(|d| service_json(orchestrator, &d))
        }
        (&Method::GET, Some("stats")) => orchestrator
            .get_stats(id)
            .await
            .map(|sample| serde_json::to_value(sample).unwrap_or_else(|_| serde_json::json!({}))),
        (&Method::GET, Some("logs")) => {
            return match orchestrator.logs(id, log_tail(query)).await {
                Ok(logs) => response(StatusCode::OK, logs),
                Err(e) => error_response(&e),
            };
        }
        _ => return response(StatusCode::NOT_FOUND, "not found"),
    };

    match result {
        Ok(body) => json_response(StatusCode::OK, body.to_string()),
        Err(e) => {
            debug!(service = %id, error = %e, "Admin request failed");
            error_response(&e)
        }
    }
}
