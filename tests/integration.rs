//! Integration tests for Wakegate
//!
//! The real `ProxyServer` runs on an ephemeral port in front of a small hyper
//! upstream, with the container engine and the edge proxy replaced by stubs.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use wakegate::admin::AdminServer;
use wakegate::error::Error;
use wakegate::orchestrator::{Orchestrator, OrchestratorConfig};
use wakegate::pool::{PoolConfig, UpstreamPool};
use wakegate::proxy::{ProxyServer, ProxySettings};
use wakegate::registry::ServiceRegistry;
use wakegate::runtime::RuntimeError;
use wakegate::service::{NewService, PortMapping, RuntimeRef, ServiceStatus};
use wakegate::testing::{StubProxy, StubRuntime};

/// Start an upstream that describes the request it received.
///
/// `/slow` answers after two seconds; every other path answers right away
/// with the request line, the headers and the body echoed back.
async fn start_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    if req.uri().path() == "/slow" {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                    let mut text = format!(
                        "{} {}\n",
                        req.method(),
                        req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
                    );
                    for (name, value) in req.headers() {
                        text.push_str(&format!("{}: {}\n", name, value.to_str().unwrap_or("")));
                    }
                    let body = req.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default();
                    text.push('\n');
                    text.push_str(&String::from_utf8_lossy(&body));
                    Ok::<_, Infallible>(
                        Response::builder()
                            .header("x-upstream", "yes")
                            .body(Full::new(Bytes::from(text)))
                            .unwrap(),
                    )
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    port
}

/// A port nothing listens on
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

struct Gateway {
    port: u16,
    orchestrator: Arc<Orchestrator>,
    runtime: Arc<StubRuntime>,
    edge: Arc<StubProxy>,
    _shutdown_tx: watch::Sender<bool>,
}

impl Gateway {
    fn registry(&self) -> &Arc<ServiceRegistry> {
        self.orchestrator.registry()
    }

    fn status(&self, id: &str) -> ServiceStatus {
        self.registry().get(id).unwrap().status
    }

    async fn wait_for_status(&self, id: &str, status: ServiceStatus) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if self.status(id) == status {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

fn web_service(upstream_port: u16) -> NewService {
    NewService::new(
        "web",
        "web",
        RuntimeRef::image("nginx:alpine"),
        vec![PortMapping::new(80, upstream_port)],
    )
    .with_domain("web.example.com")
}

async fn start_gateway(services: Vec<NewService>, settings: ProxySettings) -> Gateway {
    let registry = Arc::new(ServiceRegistry::new());
    for service in services {
        registry.create(service).unwrap();
    }
    let runtime = Arc::new(StubRuntime::new());
    let edge = Arc::new(StubProxy::new());
    let config = OrchestratorConfig {
        ready_poll_interval: Duration::from_millis(20),
        stats_sample_gap: Duration::from_millis(20),
        ..OrchestratorConfig::default()
    };
    let orchestrator = Arc::new(Orchestrator::new(registry, runtime.clone(), edge.clone(), config));
    let pool = Arc::new(UpstreamPool::new(PoolConfig::default()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let addr = listener.local_addr().unwrap();
    let server = ProxyServer::new(addr, Arc::clone(&orchestrator), pool, settings, shutdown_rx);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    Gateway {
        port,
        orchestrator,
        runtime,
        edge,
        _shutdown_tx: shutdown_tx,
    }
}

/// Send a raw HTTP/1.1 request and read the whole response
async fn http_request(port: u16, raw: String) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;
    stream.write_all(raw.as_bytes()).await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Send HTTP request with custom Host header (for proxy testing)
async fn http_get_with_host(port: u16, path: &str, host: &str) -> std::io::Result<String> {
    http_request(
        port,
        format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", path, host),
    )
    .await
}

fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

fn has_header(response: &str, name: &str, value: &str) -> bool {
    let head = response.split_once("\r\n\r\n").map(|(head, _)| head).unwrap_or(response);
    head.lines().any(|line| {
        line.split_once(':').is_some_and(|(n, v)| {
            n.trim().eq_ignore_ascii_case(name) && v.trim() == value
        })
    })
}

// ============================================================================
// Wake on request
// ============================================================================

#[tokio::test]
async fn test_first_request_wakes_and_serves_loading_page() {
    let upstream = start_upstream().await;
    let gateway = start_gateway(vec![web_service(upstream)], ProxySettings::default()).await;

    let response = http_get_with_host(gateway.port, "/", "web.example.com").await.unwrap();
    assert_eq!(status_of(&response), 202, "{}", response);
    assert!(has_header(&response, "retry-after", "5"));
    assert!(body_of(&response).contains("Starting web..."));

    assert!(gateway.wait_for_status("web", ServiceStatus::Running).await);
    assert_eq!(gateway.runtime.start_count(), 1);
    assert_eq!(gateway.edge.route_count(), 1);

    let response = http_get_with_host(gateway.port, "/hello?x=1", "web.example.com").await.unwrap();
    assert_eq!(status_of(&response), 200, "{}", response);
    assert!(has_header(&response, "x-upstream", "yes"));
    assert!(body_of(&response).starts_with("GET /hello?x=1\n"));
}

#[tokio::test]
async fn test_loading_page_as_json() {
    let upstream = start_upstream().await;
    let gateway = start_gateway(vec![web_service(upstream)], ProxySettings::default()).await;
    gateway.runtime.set_start_delay(Duration::from_secs(1));

    let response = http_request(
        gateway.port,
        "GET / HTTP/1.1\r\nHost: web.example.com\r\nAccept: application/json\r\nConnection: close\r\n\r\n"
            .to_string(),
    )
    .await
    .unwrap();
    assert_eq!(status_of(&response), 202);
    let json: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
    assert_eq!(json["service"], "web");
    assert_eq!(json["status"], "starting");
}

#[tokio::test]
async fn test_concurrent_requests_start_once() {
    let upstream = start_upstream().await;
    let gateway = start_gateway(vec![web_service(upstream)], ProxySettings::default()).await;
    gateway.runtime.set_start_delay(Duration::from_millis(300));

    let requests: Vec<_> = (0..20)
        .map(|_| {
            let port = gateway.port;
            tokio::spawn(async move { http_get_with_host(port, "/", "web.example.com").await.unwrap() })
        })
        .collect();

    for request in requests {
        let response = request.await.unwrap();
        assert_eq!(status_of(&response), 202, "{}", response);
    }

    assert!(gateway.wait_for_status("web", ServiceStatus::Running).await);
    assert_eq!(gateway.runtime.start_count(), 1);
    assert_eq!(gateway.runtime.max_concurrent_starts(), 1);
}

#[tokio::test]
async fn test_failed_wake_answers_503() {
    let upstream = start_upstream().await;
    let gateway = start_gateway(vec![web_service(upstream)], ProxySettings::default()).await;
    gateway
        .runtime
        .fail_starts(Some(RuntimeError::Failed("image not found".into())));

    let response = http_get_with_host(gateway.port, "/", "web.example.com").await.unwrap();
    assert_eq!(status_of(&response), 503, "{}", response);
    assert!(has_header(&response, "x-proxy-error", "SERVICE_UNAVAILABLE"));
    assert_eq!(gateway.status("web"), ServiceStatus::Error);

    // The next request retries from ERROR
    gateway.runtime.fail_starts(None);
    let response = http_get_with_host(gateway.port, "/", "web.example.com").await.unwrap();
    assert_eq!(status_of(&response), 202);
    assert!(gateway.wait_for_status("web", ServiceStatus::Running).await);
    assert_eq!(gateway.runtime.start_count(), 2);
}

// ============================================================================
// Transparent proxying
// ============================================================================

#[tokio::test]
async fn test_headers_forwarded_without_host_and_activity_recorded() {
    let upstream = start_upstream().await;
    let gateway = start_gateway(vec![web_service(upstream)], ProxySettings::default()).await;
    gateway.orchestrator.wake("web").await.unwrap();
    let before = gateway.registry().get("web").unwrap().last_accessed_at;

    tokio::time::sleep(Duration::from_millis(20)).await;
    let response = http_request(
        gateway.port,
        "GET /headers HTTP/1.1\r\nHost: web.example.com\r\nX-Custom: abc\r\nX-Request-ID: req-42\r\nConnection: close\r\n\r\n"
            .to_string(),
    )
    .await
    .unwrap();
    assert_eq!(status_of(&response), 200, "{}", response);

    let body = body_of(&response);
    let echoed: HashMap<&str, &str> = body
        .lines()
        .skip(1)
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(": "))
        .collect();
    assert_eq!(echoed.get("x-custom"), Some(&"abc"));
    assert_eq!(echoed.get("x-request-id"), Some(&"req-42"));
    assert_eq!(echoed.get("x-forwarded-host"), Some(&"web.example.com"));
    assert_eq!(echoed.get("x-forwarded-proto"), Some(&"http"));
    assert_eq!(echoed.get("x-forwarded-for"), Some(&"127.0.0.1"));
    assert_ne!(echoed.get("host"), Some(&"web.example.com"));

    let after = gateway.registry().get("web").unwrap().last_accessed_at;
    assert!(after > before);
}

#[tokio::test]
async fn test_request_body_round_trip() {
    let upstream = start_upstream().await;
    let gateway = start_gateway(vec![web_service(upstream)], ProxySettings::default()).await;
    gateway.orchestrator.wake("web").await.unwrap();

    let payload = r#"{"title":"hello"}"#;
    let response = http_request(
        gateway.port,
        format!(
            "POST /posts HTTP/1.1\r\nHost: web.example.com\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            payload.len(),
            payload
        ),
    )
    .await
    .unwrap();

    assert_eq!(status_of(&response), 200, "{}", response);
    let body = body_of(&response);
    assert!(body.starts_with("POST /posts\n"));
    assert!(body.ends_with(payload));
}

#[tokio::test]
async fn test_upstream_connection_failure_is_502() {
    let port = closed_port().await;
    let gateway = start_gateway(vec![web_service(port)], ProxySettings::default()).await;
    gateway.orchestrator.wake("web").await.unwrap();
    let before = gateway.registry().get("web").unwrap().last_accessed_at;

    let response = http_get_with_host(gateway.port, "/", "web.example.com").await.unwrap();
    assert_eq!(status_of(&response), 502, "{}", response);
    assert!(has_header(&response, "x-proxy-error", "CONNECTION_FAILED"));
    assert_eq!(gateway.registry().get("web").unwrap().last_accessed_at, before);
}

#[tokio::test]
async fn test_upstream_timeout_is_504() {
    let upstream = start_upstream().await;
    let settings = ProxySettings {
        request_timeout: Duration::from_millis(300),
        ..ProxySettings::default()
    };
    let gateway = start_gateway(vec![web_service(upstream)], settings).await;
    gateway.orchestrator.wake("web").await.unwrap();

    let response = http_get_with_host(gateway.port, "/slow", "web.example.com").await.unwrap();
    assert_eq!(status_of(&response), 504, "{}", response);
    assert!(has_header(&response, "x-proxy-error", "REQUEST_TIMEOUT"));
}

#[tokio::test]
async fn test_delete_refused_while_running_keeps_serving() {
    let upstream = start_upstream().await;
    let gateway = start_gateway(vec![web_service(upstream)], ProxySettings::default()).await;
    gateway.orchestrator.wake("web").await.unwrap();

    let err = gateway.orchestrator.delete("web").await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)), "{:?}", err);

    let response = http_get_with_host(gateway.port, "/", "web.example.com").await.unwrap();
    assert_eq!(status_of(&response), 200);
    assert_eq!(gateway.status("web"), ServiceStatus::Running);
}

// ============================================================================
// Bypass and host handling
// ============================================================================

#[tokio::test]
async fn test_unknown_host_without_passthrough_is_404() {
    let gateway = start_gateway(vec![], ProxySettings::default()).await;
    let response = http_get_with_host(gateway.port, "/", "nothing.example.com").await.unwrap();
    assert_eq!(status_of(&response), 404);
    assert!(has_header(&response, "x-proxy-error", "UNKNOWN_HOST"));
}

#[tokio::test]
async fn test_missing_host_is_400() {
    let gateway = start_gateway(vec![], ProxySettings::default()).await;
    let response = http_request(
        gateway.port,
        "GET / HTTP/1.1\r\nHost: \r\nConnection: close\r\n\r\n".to_string(),
    )
    .await
    .unwrap();
    assert_eq!(status_of(&response), 400, "{}", response);
    assert!(has_header(&response, "x-proxy-error", "MISSING_HOST_HEADER"));
}

#[tokio::test]
async fn test_control_plane_requests_bypass_services() {
    let control = start_upstream().await;
    let upstream = start_upstream().await;
    let settings = ProxySettings {
        passthrough_upstream: Some(format!("127.0.0.1:{}", control)),
        ..ProxySettings::default()
    };
    let gateway = start_gateway(vec![web_service(upstream)], settings).await;

    let response = http_get_with_host(gateway.port, "/dashboard", "admin.example.com").await.unwrap();
    assert_eq!(status_of(&response), 200);
    assert!(body_of(&response).starts_with("GET /dashboard\n"));

    // API paths never wake a service, even on a service's own subdomain
    let response = http_get_with_host(gateway.port, "/api/status", "web.example.com").await.unwrap();
    assert_eq!(status_of(&response), 200);
    assert!(body_of(&response).starts_with("GET /api/status\n"));

    assert_eq!(gateway.runtime.start_count(), 0);
    assert_eq!(gateway.status("web"), ServiceStatus::Stopped);
}

// ============================================================================
// Admin API
// ============================================================================

#[tokio::test]
async fn test_admin_api_over_tcp() {
    let upstream = start_upstream().await;
    let gateway = start_gateway(vec![web_service(upstream)], ProxySettings::default()).await;

    let (_tx, rx) = watch::channel(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let admin = AdminServer::new(addr, Arc::clone(&gateway.orchestrator), rx, "test-token".to_string());
    tokio::spawn(async move {
        let _ = admin.serve(listener).await;
    });

    let request = |method: &str, path: &str, token: Option<&str>| {
        let auth = token
            .map(|t| format!("Authorization: Bearer {}\r\n", t))
            .unwrap_or_default();
        format!(
            "{} {} HTTP/1.1\r\nHost: 127.0.0.1\r\n{}Content-Length: 0\r\nConnection: close\r\n\r\n",
            method, path, auth
        )
    };

    let response = http_request(addr.port(), request("GET", "/health", None)).await.unwrap();
    assert_eq!(status_of(&response), 200);

    let response = http_request(addr.port(), request("GET", "/services", None)).await.unwrap();
    assert_eq!(status_of(&response), 401);

    let response = http_request(addr.port(), request("POST", "/services/web/wake", Some("test-token")))
        .await
        .unwrap();
    assert_eq!(status_of(&response), 200, "{}", response);
    assert_eq!(gateway.status("web"), ServiceStatus::Running);

    let response = http_request(addr.port(), request("DELETE", "/services/web", Some("test-token")))
        .await
        .unwrap();
    assert_eq!(status_of(&response), 409);

    let response = http_request(addr.port(), request("POST", "/services/web/sleep", Some("test-token")))
        .await
        .unwrap();
    assert_eq!(status_of(&response), 200);
    assert_eq!(gateway.status("web"), ServiceStatus::Stopped);
    assert_eq!(gateway.edge.route_count(), 0);
}

// ============================================================================
// Randomized lifecycle interleavings
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_interleavings_follow_state_machine() {
    let first = start_upstream().await;
    let second = start_upstream().await;
    let other = NewService::new(
        "blog",
        "blog",
        RuntimeRef::image("ghost:5"),
        vec![PortMapping::new(2368, second)],
    )
    .with_domain("blog.example.com");
    let gateway = start_gateway(vec![web_service(first), other], ProxySettings::default()).await;
    gateway.runtime.set_start_delay(Duration::from_millis(5));
    gateway.runtime.set_stop_delay(Duration::from_millis(5));

    let mut events = gateway.registry().subscribe();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let orchestrator = Arc::clone(&gateway.orchestrator);
        let port = gateway.port;
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                let (id, op) = {
                    let mut rng = rand::thread_rng();
                    let id = if rng.gen_bool(0.5) { "web" } else { "blog" };
                    (id, rng.gen_range(0..5))
                };
                match op {
                    0 => {
                        let _ = orchestrator.wake(id).await;
                    }
                    1 => {
                        let _ = orchestrator.sleep(id).await;
                    }
                    2 => {
                        let _ = orchestrator.restart(id).await;
                    }
                    3 => {
                        let _ = http_get_with_host(port, "/", &format!("{}.example.com", id)).await;
                    }
                    _ => tokio::time::sleep(Duration::from_millis(3)).await,
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    // Let wakes spawned by proxied requests settle
    tokio::time::sleep(Duration::from_millis(500)).await;
    for id in ["web", "blog"] {
        let start = std::time::Instant::now();
        while matches!(gateway.status(id), ServiceStatus::Starting | ServiceStatus::Stopping)
            && start.elapsed() < Duration::from_secs(5)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    let mut last: HashMap<String, ServiceStatus> = HashMap::new();
    while let Ok(change) = events.try_recv() {
        assert!(
            change.from.can_transition_to(change.to),
            "illegal transition {:?} -> {:?}",
            change.from,
            change.to
        );
        let previous = last.get(&change.id).copied().unwrap_or(ServiceStatus::Stopped);
        assert_eq!(previous, change.from, "transitions for {} are not contiguous", change.id);
        last.insert(change.id.clone(), change.to);
    }

    for id in ["web", "blog"] {
        let desc = gateway.registry().get(id).unwrap();
        let expected = last.get(id).copied().unwrap_or(ServiceStatus::Stopped);
        assert_eq!(desc.status, expected);
        assert_eq!(desc.container_ref.is_some(), desc.status.holds_container());
    }
    assert!(gateway.runtime.max_concurrent_starts() <= 2);
}
