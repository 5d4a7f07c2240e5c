//! Docker engine implementation of [`ContainerRuntime`]
//!
//! Single-image services go through the Docker API (bollard). Compose
//! projects are driven through the compose CLI and observed through the
//! API by their `com.docker.compose.project` label.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, Stats, StatsOptions,
    StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::runtime::{
    ContainerInspect, ContainerRuntime, RawStats, RuntimeError, RuntimeResult, StartSpec,
    StartTarget,
};
use crate::service::ContainerRef;

const CONNECT_TIMEOUT_SECS: u64 = 120;
const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
const SERVICE_LABEL: &str = "wakegate.service";

pub struct DockerRuntime {
    client: Docker,
    /// Program and leading args, e.g. `["docker", "compose"]`
    compose_command: Vec<String>,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths
    pub async fn connect(docker_host: Option<&str>, compose_command: &str) -> anyhow::Result<Self> {
        let client = match docker_host {
            Some(host) => Self::connect_to_host(host)?,
            None => match std::env::var("DOCKER_HOST") {
                Ok(host) => Self::connect_to_host(&host)?,
                Err(_) => Self::connect_with_defaults().await?,
            },
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd, Docker Desktop or Colima is running.",
                e
            )
        })?;

        let compose_command: Vec<String> =
            compose_command.split_whitespace().map(String::from).collect();
        if compose_command.is_empty() {
            anyhow::bail!("compose_command must not be empty");
        }

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            compose_command,
        })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let candidates = [
            "/var/run/docker.sock".to_string(),
            format!("{}/.docker/run/docker.sock", home),
            format!("{}/.colima/default/docker.sock", home),
        ];

        for path in candidates.iter().filter(|p| Path::new(p.as_str()).exists()) {
            match Docker::connect_with_socket(path, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION) {
                Ok(client) if client.ping().await.is_ok() => {
                    debug!(path = %path, "Using Docker socket");
                    return Ok(client);
                }
                Ok(_) => debug!(path = %path, "Docker socket exists but daemon not responding"),
                Err(e) => debug!(path = %path, error = %e, "Docker socket connection failed"),
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon ({}). Start dockerd or set DOCKER_HOST / runtime.docker_host.",
                e
            )
        })
    }

    async fn pull_if_missing(&self, image: &str) -> RuntimeResult<()> {
        if self.client.inspect_image(image).await.is_ok() {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(map_docker_error)?;
            if let Some(error) = progress.error {
                return Err(RuntimeError::Failed(format!(
                    "failed to pull image '{}': {}",
                    image, error
                )));
            }
        }
        info!(image, "Image pulled");
        Ok(())
    }

    async fn start_image(
        &self,
        spec: &StartSpec,
        image: &str,
        environment: &std::collections::BTreeMap<String, String>,
        volumes: &[String],
    ) -> RuntimeResult<ContainerRef> {
        self.pull_if_missing(image).await?;

        // A stopped container from the previous wake keeps the name
        let remove = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(&spec.container_name, Some(remove)).await {
            Ok(_) | Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => {}
            Err(e) => return Err(map_docker_error(e)),
        }

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/tcp", port.container_port);
            port_bindings.insert(
                key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(port.host_port.to_string()),
                }]),
            );
            exposed_ports.insert(key, HashMap::new());
        }

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: (!volumes.is_empty()).then(|| volumes.to_vec()),
            network_mode: spec.network.clone(),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.to_string()),
            env: Some(
                environment
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
            exposed_ports: Some(exposed_ports),
            labels: Some(HashMap::from([(
                SERVICE_LABEL.to_string(),
                spec.service_name.clone(),
            )])),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.container_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(map_docker_error)?;

        self.client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_docker_error)?;

        info!(
            service = %spec.service_name,
            container_id = %created.id,
            image,
            "Started Docker container"
        );
        Ok(ContainerRef::Container { id: created.id })
    }

    async fn compose(&self, file: &Path, project: &str, args: &[&str]) -> RuntimeResult<String> {
        let (program, leading) = self
            .compose_command
            .split_first()
            .ok_or_else(|| RuntimeError::Failed("compose_command is empty".into()))?;

        let output = Command::new(program)
            .args(leading)
            .arg("-f")
            .arg(file)
            .arg("-p")
            .arg(project)
            .args(args)
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("cannot run {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::Failed(format!(
                "compose {} failed for project '{}': {}",
                args.join(" "),
                project,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn project_containers(&self, project: &str) -> RuntimeResult<Vec<String>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", COMPOSE_PROJECT_LABEL, project)],
        )]);
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(map_docker_error)?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn container_stats(&self, id: &str) -> RuntimeResult<RawStats> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.client.stats(id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => Ok(raw_stats(&stats)),
            Some(Err(e)) => Err(map_docker_error(e)),
            None => Err(RuntimeError::Failed(format!("no stats returned for {}", id))),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, spec: &StartSpec) -> RuntimeResult<ContainerRef> {
        match &spec.target {
            StartTarget::Image {
                image,
                environment,
                volumes,
            } => self.start_image(spec, image, environment, volumes).await,
            StartTarget::Compose { file, project } => {
                self.compose(file, project, &["up", "-d"]).await?;
                info!(service = %spec.service_name, project = %project, "Started compose project");
                Ok(ContainerRef::Compose {
                    project: project.clone(),
                    file: file.clone(),
                })
            }
        }
    }

    async fn stop(&self, container: &ContainerRef, grace: Duration) -> RuntimeResult<()> {
        match container {
            ContainerRef::Container { id } => {
                let options = StopContainerOptions {
                    t: grace.as_secs() as i64,
                };
                match self.client.stop_container(id, Some(options)).await {
                    Ok(_) => {
                        info!(container_id = %id, "Stopped Docker container");
                        Ok(())
                    }
                    Err(DockerError::DockerResponseServerError { status_code: 304, .. }) => {
                        debug!(container_id = %id, "Container was already stopped");
                        Ok(())
                    }
                    Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => {
                        debug!(container_id = %id, "Container not found");
                        Ok(())
                    }
                    Err(e) => Err(map_docker_error(e)),
                }
            }
            ContainerRef::Compose { project, file } => {
                let timeout = grace.as_secs().to_string();
                self.compose(file, project, &["down", "--timeout", &timeout]).await?;
                info!(project = %project, "Stopped compose project");
                Ok(())
            }
        }
    }

    async fn inspect(&self, container: &ContainerRef) -> RuntimeResult<ContainerInspect> {
        match container {
            ContainerRef::Container { id } => {
                let info = self
                    .client
                    .inspect_container(id, None::<InspectContainerOptions>)
                    .await
                    .map_err(map_docker_error)?;
                let state = info.state.unwrap_or_default();
                Ok(ContainerInspect {
                    running: state.running.unwrap_or(false),
                    status: state
                        .status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    started_at: state.started_at.as_deref().and_then(parse_timestamp),
                })
            }
            ContainerRef::Compose { project, .. } => {
                let running = !self.project_containers(project).await?.is_empty();
                Ok(ContainerInspect {
                    running,
                    status: if running { "running" } else { "exited" }.to_string(),
                    started_at: None,
                })
            }
        }
    }

    async fn stats(&self, container: &ContainerRef) -> RuntimeResult<RawStats> {
        match container {
            ContainerRef::Container { id } => self.container_stats(id).await,
            ContainerRef::Compose { project, .. } => {
                let ids = self.project_containers(project).await?;
                if ids.is_empty() {
                    return Err(RuntimeError::NotFound(format!(
                        "compose project '{}' has no running containers",
                        project
                    )));
                }
                let mut total = RawStats::default();
                for id in &ids {
                    total.accumulate(&self.container_stats(id).await?);
                }
                Ok(total)
            }
        }
    }

    async fn logs(&self, container: &ContainerRef, tail: usize) -> RuntimeResult<String> {
        match container {
            ContainerRef::Container { id } => {
                let options = LogsOptions::<String> {
                    stdout: true,
                    stderr: true,
                    tail: tail.to_string(),
                    ..Default::default()
                };
                let mut stream = self.client.logs(id, Some(options));
                let mut text = String::new();
                while let Some(chunk) = stream.next().await {
                    match chunk.map_err(map_docker_error)? {
                        LogOutput::StdOut { message }
                        | LogOutput::StdErr { message }
                        | LogOutput::Console { message } => {
                            text.push_str(&String::from_utf8_lossy(&message));
                        }
                        LogOutput::StdIn { .. } => {}
                    }
                }
                Ok(text)
            }
            ContainerRef::Compose { project, file } => {
                let tail = tail.to_string();
                self.compose(file, project, &["logs", "--no-color", "--tail", &tail])
                    .await
            }
        }
    }

    async fn ping(&self) -> RuntimeResult<()> {
        self.client.ping().await.map(|_| ()).map_err(|e| {
            warn!(error = %e, "Docker ping failed");
            RuntimeError::Unavailable(e.to_string())
        })
    }
}

/// Missing containers are `NotFound`, other API answers are `Failed`, and
/// anything that never reached the daemon is `Unavailable`
fn map_docker_error(err: DockerError) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Failed(format!("docker returned {}: {}", status_code, message)),
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

fn raw_stats(stats: &Stats) -> RawStats {
    let (network_rx, network_tx) = stats
        .networks
        .as_ref()
        .map(|nets| {
            nets.values()
                .fold((0, 0), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
        })
        .unwrap_or((0, 0));

    RawStats {
        cpu_total_usage: stats.cpu_stats.cpu_usage.total_usage,
        system_cpu_usage: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
        online_cpus: stats.cpu_stats.online_cpus.unwrap_or(1) as u32,
        memory_usage: stats.memory_stats.usage.unwrap_or(0),
        memory_limit: stats.memory_stats.limit.unwrap_or(0),
        network_rx,
        network_tx,
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
        // Docker reports never-started containers with the zero time
        .filter(|t| t.timestamp() > 0)
}
