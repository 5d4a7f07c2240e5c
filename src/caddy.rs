//! Edge proxy route synchronization through the Caddy admin API
//!
//! Routes are addressed by `@id`, which makes every call idempotent: applying
//! a route first removes any route with the same id, and removing a route
//! that does not exist succeeds.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// What the edge proxy needs to route a domain to a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub name: String,
    pub domain: String,
    pub upstream_host: String,
    pub upstream_port: u16,
}

impl RouteSpec {
    pub fn upstream(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy control API unreachable: {0}")]
    Unreachable(String),

    #[error("proxy control API rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

/// Narrow contract to the edge proxy
#[async_trait]
pub trait ProxyController: Send + Sync {
    async fn apply_route(&self, route: &RouteSpec) -> ProxyResult<()>;

    async fn remove_route(&self, name: &str) -> ProxyResult<()>;

    async fn reload(&self) -> ProxyResult<()>;
}

#[derive(Debug, Clone)]
pub struct CaddyConfig {
    pub admin_url: String,
    pub server_name: String,
    pub route_id_prefix: String,
    pub timeout: Duration,
}

impl Default for CaddyConfig {
    fn default() -> Self {
        Self {
            admin_url: "http://localhost:2019".to_string(),
            server_name: "srv0".to_string(),
            route_id_prefix: "wakegate-".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct CaddyController {
    client: reqwest::Client,
    config: CaddyConfig,
}

impl CaddyController {
    pub fn new(config: CaddyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn route_id(&self, name: &str) -> String {
        format!("{}{}", self.config.route_id_prefix, name)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.admin_url.trim_end_matches('/'), path)
    }

    async fn delete_id(&self, id: &str) -> ProxyResult<()> {
        let response = self
            .client
            .delete(self.url(&format!("/id/{}", id)))
            .send()
            .await
            .map_err(unreachable)?;

        // Caddy answers 404 (or 500 "unknown object ID" on older versions)
        // when nothing carries this id
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if body.contains("unknown object ID") {
            return Ok(());
        }
        Err(ProxyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// JSON for one reverse_proxy route
pub fn route_config(route: &RouteSpec, id: &str) -> Value {
    json!({
        "@id": id,
        "match": [{ "host": [route.domain] }],
        "handle": [{
            "handler": "reverse_proxy",
            "upstreams": [{ "dial": route.upstream() }]
        }],
        "terminal": true
    })
}

#[async_trait]
impl ProxyController for CaddyController {
    async fn apply_route(&self, route: &RouteSpec) -> ProxyResult<()> {
        let id = self.route_id(&route.name);
        self.delete_id(&id).await?;

        let response = self
            .client
            .post(self.url(&format!(
                "/config/apps/http/servers/{}/routes",
                self.config.server_name
            )))
            .json(&route_config(route, &id))
            .send()
            .await
            .map_err(unreachable)?;
        check(response).await?;

        info!(route = %id, domain = %route.domain, upstream = %route.upstream(), "Route applied");
        Ok(())
    }

    async fn remove_route(&self, name: &str) -> ProxyResult<()> {
        let id = self.route_id(name);
        self.delete_id(&id).await?;
        info!(route = %id, "Route removed");
        Ok(())
    }

    async fn reload(&self) -> ProxyResult<()> {
        let response = self
            .client
            .get(self.url("/config/"))
            .send()
            .await
            .map_err(unreachable)?;
        let current: Value = check(response)
            .await?
            .json()
            .await
            .map_err(|e| ProxyError::Unreachable(e.to_string()))?;

        let response = self
            .client
            .post(self.url("/load"))
            .header("Cache-Control", "must-revalidate")
            .json(&current)
            .send()
            .await
            .map_err(unreachable)?;
        check(response).await?;

        debug!("Proxy configuration reloaded");
        Ok(())
    }
}

/// Used when route synchronization is disabled
pub struct NoopController;

#[async_trait]
impl ProxyController for NoopController {
    async fn apply_route(&self, route: &RouteSpec) -> ProxyResult<()> {
        debug!(route = %route.name, "Route sync disabled, skipping apply");
        Ok(())
    }

    async fn remove_route(&self, name: &str) -> ProxyResult<()> {
        debug!(route = %name, "Route sync disabled, skipping remove");
        Ok(())
    }

    async fn reload(&self) -> ProxyResult<()> {
        Ok(())
    }
}

fn unreachable(err: reqwest::Error) -> ProxyError {
    ProxyError::Unreachable(err.to_string())
}

async fn check(response: reqwest::Response) -> ProxyResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProxyError::Rejected {
        status: status.as_u16(),
        body,
    })
}
