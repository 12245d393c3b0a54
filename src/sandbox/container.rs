//! Docker image lifecycle for containerized providers.
//!
//! # Image build
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  pack context (tar) ─▶ build <prefix>/<alias>:staging-<uuid>     │
//! │                               │                                  │
//! │                      ok ──────┴────── failed                     │
//! │                       │                  │                       │
//! │        tag as <prefix>/<alias>:latest    remove staging tag      │
//! │        remove staging tag                registry untouched      │
//! │                       │                                          │
//! │              registry rewrite                                    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Container launch
//!
//! Providers run with `docker run -i --rm`, all capabilities dropped,
//! no privilege escalation, a memory cap and, unless they declared a need
//! for it, no network. Environment values are passed by name (`-e KEY`),
//! so they never appear in the registry's argument list.

use async_trait::async_trait;
use bollard::Docker;
use bollard::image::{BuildImageOptions, RemoveImageOptions, TagImageOptions};
use bytes::Bytes;
use futures::StreamExt;

use crate::sandbox::config::{NetworkPolicy, SandboxConfig};
use crate::sandbox::error::{Result, SandboxError};

/// Build log kept on failure (tail).
const MAX_BUILD_LOG: usize = 4 * 1024;

/// Image operations the build engine needs.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Build an image from a tar context. Returns the build log.
    async fn build_image(&self, tag: &str, context: Bytes) -> Result<String>;

    /// Point `target` (`repo:tag`) at the image `source`.
    async fn tag_image(&self, source: &str, target: &str) -> Result<()>;

    async fn remove_image(&self, image: &str) -> Result<()>;
}

/// [`ContainerEngine`] backed by the local Docker daemon.
pub struct DockerEngine {
    docker: Docker,
    config: SandboxConfig,
}

impl DockerEngine {
    pub fn new(docker: Docker, config: SandboxConfig) -> Self {
        Self { docker, config }
    }

    /// Connect to the daemon.
    pub async fn connect(config: SandboxConfig) -> Result<Self> {
        Ok(Self::new(connect_docker().await?, config))
    }

    /// Check if the Docker daemon is available.
    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn build_image(&self, tag: &str, context: Bytes) -> Result<String> {
        tracing::info!("Building image {}", tag);

        let options = BuildImageOptions {
            t: tag.to_string(),
            dockerfile: "Dockerfile".to_string(),
            rm: true,
            forcerm: true,
            cpushares: Some(self.config.cpu_shares as u64),
            ..Default::default()
        };

        let build = async {
            let mut log = String::new();
            let mut stream = self.docker.build_image(options, None, Some(context));

            while let Some(result) = stream.next().await {
                match result {
                    Ok(info) => {
                        if let Some(line) = info.stream {
                            tracing::debug!("Build: {}", line.trim_end());
                            push_log(&mut log, &line);
                        }
                        if let Some(error) = info.error {
                            return Err(SandboxError::ImageBuildFailed {
                                reason: error,
                                output: log,
                            });
                        }
                    }
                    Err(e) => {
                        return Err(SandboxError::ImageBuildFailed {
                            reason: e.to_string(),
                            output: log,
                        });
                    }
                }
            }
            Ok(log)
        };

        match tokio::time::timeout(self.config.build_timeout, build).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::Timeout(self.config.build_timeout)),
        }
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        let (repo, tag) = split_tag(target);
        self.docker
            .tag_image(
                source,
                Some(TagImageOptions {
                    repo: repo.to_string(),
                    tag: tag.to_string(),
                }),
            )
            .await?;
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.docker
            .remove_image(
                image,
                Some(RemoveImageOptions {
                    force: false,
                    noprune: false,
                }),
                None,
            )
            .await?;
        Ok(())
    }
}

fn push_log(log: &mut String, line: &str) {
    log.push_str(line);
    if log.len() > 2 * MAX_BUILD_LOG {
        *log = crate::safety::truncate_tail(log, MAX_BUILD_LOG).to_string();
    }
}

/// Split `repo:tag`; a missing tag means `latest`.
fn split_tag(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

/// Command and arguments that run a provider image over stdio.
pub fn run_command(
    config: &SandboxConfig,
    image: &str,
    env_keys: impl IntoIterator<Item = impl AsRef<str>>,
    network: NetworkPolicy,
) -> (String, Vec<String>) {
    let mut args: Vec<String> = [
        "run",
        "-i",
        "--rm",
        "--network",
        network.docker_mode(),
        "--cap-drop",
        "ALL",
        "--security-opt",
        "no-new-privileges",
        "--memory",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("{}m", config.memory_limit_mb));

    for key in env_keys {
        args.push("-e".to_string());
        args.push(key.as_ref().to_string());
    }
    args.push(image.to_string());

    (config.docker_command.clone(), args)
}

/// Connect to the Docker daemon.
///
/// Tries these locations in order:
/// 1. `DOCKER_HOST` env var (bollard default)
/// 2. `/var/run/docker.sock` (Linux default)
/// 3. `~/.docker/run/docker.sock` (Docker Desktop on macOS)
pub async fn connect_docker() -> Result<Docker> {
    if let Ok(docker) = Docker::connect_with_local_defaults()
        && docker.ping().await.is_ok()
    {
        return Ok(docker);
    }

    if let Some(home) = dirs::home_dir() {
        let desktop_sock = home.join(".docker/run/docker.sock");
        if desktop_sock.exists() {
            let sock_str = desktop_sock.to_string_lossy();
            if let Ok(docker) =
                Docker::connect_with_socket(&sock_str, 120, bollard::API_DEFAULT_VERSION)
                && docker.ping().await.is_ok()
            {
                return Ok(docker);
            }
        }
    }

    Err(SandboxError::DockerNotAvailable {
        reason: "no reachable daemon (DOCKER_HOST, /var/run/docker.sock)".to_string(),
    })
}
