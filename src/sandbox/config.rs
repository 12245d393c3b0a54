//! Configuration for containerized providers.

use std::time::Duration;

/// Configuration for image builds and container launches.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Repository prefix for provider images (`<prefix>/<alias>:latest`).
    pub image_prefix: String,
    /// Command used in rewritten launch specs.
    pub docker_command: String,
    /// Memory limit passed to `docker run --memory`, in megabytes.
    pub memory_limit_mb: u64,
    /// CPU shares for image builds (relative weight, default 1024).
    pub cpu_shares: u32,
    /// Upper bound on one image build.
    pub build_timeout: Duration,
    /// Network for providers that did not ask for outbound access.
    pub default_network: NetworkPolicy,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image_prefix: "mcp-forge".to_string(),
            docker_command: "docker".to_string(),
            memory_limit_mb: 512,
            cpu_shares: 1024,
            build_timeout: Duration::from_secs(600),
            default_network: NetworkPolicy::Isolated,
        }
    }
}

impl SandboxConfig {
    /// Repository name for an alias, without tag.
    pub fn image_repository(&self, alias: &str) -> String {
        format!("{}/{}", self.image_prefix, alias)
    }

    /// The tag a provider runs from once built.
    pub fn image_tag(&self, alias: &str) -> String {
        format!("{}:latest", self.image_repository(alias))
    }

    /// A unique tag for an in-flight build.
    pub fn staging_tag(&self, alias: &str) -> String {
        format!(
            "{}:staging-{}",
            self.image_repository(alias),
            uuid::Uuid::new_v4().simple()
        )
    }

    /// Network a provider runs with.
    pub fn network_for(&self, wants_network: bool) -> NetworkPolicy {
        if wants_network {
            NetworkPolicy::Bridge
        } else {
            self.default_network
        }
    }
}

/// Container network mode.
///
/// ```text
/// ┌────────────┬──────────────┬─────────────────────────────────┐
/// │ Policy     │ docker flag  │ Reachable                       │
/// ├────────────┼──────────────┼─────────────────────────────────┤
/// │ Isolated   │ none         │ nothing (stdio only)            │
/// │ Bridge     │ bridge       │ outbound network (declared use) │
/// └────────────┴──────────────┴─────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkPolicy {
    #[default]
    Isolated,
    Bridge,
}

impl NetworkPolicy {
    /// Value for `docker run --network`.
    pub fn docker_mode(&self) -> &'static str {
        match self {
            NetworkPolicy::Isolated => "none",
            NetworkPolicy::Bridge => "bridge",
        }
    }
}

impl std::str::FromStr for NetworkPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "isolated" => Ok(NetworkPolicy::Isolated),
            "bridge" | "outbound" => Ok(NetworkPolicy::Bridge),
            _ => Err(format!(
                "invalid network policy '{}', expected 'none' or 'bridge'",
                s
            )),
        }
    }
}
