//! Broker configuration.
//!
//! Everything lives under a single home directory, chosen by
//! `MCP_FORGE_HOME` or defaulting to `~/.mcp-forge`:
//!
//! ```text
//! ~/.mcp-forge/
//! ├── registry.json     alias → provider descriptor
//! ├── registry.lock     cross-process writer lock
//! ├── audit.log         one JSON record per line, append-only
//! └── servers/<alias>/  managed provider source trees
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sandbox::SandboxConfig;

/// Environment variable that designates the broker's home directory.
pub const HOME_ENV_VAR: &str = "MCP_FORGE_HOME";

/// Timeouts applied to every provider session.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long to wait for the `initialize` response.
    pub handshake_timeout: Duration,
    /// How long to wait for a `tools/list` or `tools/call` response.
    pub request_timeout: Duration,
    /// Grace period between asking a child to stop and killing it.
    pub shutdown_grace: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// External commands the scaffold and build engines shell out to.
#[derive(Debug, Clone)]
pub struct ToolchainConfig {
    pub python_command: String,
    pub node_command: String,
    pub npm_command: String,
    pub git_command: String,
    /// Upper bound on a single dependency-install or clone step.
    pub step_timeout: Duration,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            python_command: "python3".to_string(),
            node_command: "node".to_string(),
            npm_command: "npm".to_string(),
            git_command: "git".to_string(),
            step_timeout: Duration::from_secs(300),
        }
    }
}

/// Top-level broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Root of all broker state.
    pub home: PathBuf,
    pub transport: TransportConfig,
    pub toolchain: ToolchainConfig,
    pub sandbox: SandboxConfig,
}

impl BrokerConfig {
    /// Configuration rooted at an explicit home directory.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            transport: TransportConfig::default(),
            toolchain: ToolchainConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }

    /// Configuration from `MCP_FORGE_HOME`, falling back to `~/.mcp-forge`.
    pub fn from_env() -> Self {
        let home = std::env::var_os(HOME_ENV_VAR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_home);
        Self::with_home(home)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.home.join("registry.json")
    }

    pub fn registry_lock_path(&self) -> PathBuf {
        self.home.join("registry.lock")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.home.join("audit.log")
    }

    /// Directory holding one subdirectory per managed provider.
    pub fn servers_dir(&self) -> PathBuf {
        self.home.join("servers")
    }

    /// Source directory for a managed alias.
    pub fn server_dir(&self, alias: &str) -> PathBuf {
        self.servers_dir().join(alias)
    }

    /// Create the home and servers directories if they are missing.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.home)?;
        std::fs::create_dir_all(self.servers_dir())?;
        Ok(())
    }

    /// Whether `path` is inside the managed-servers area once symlinks and
    /// `..` are resolved. The area itself does not count.
    pub fn is_managed_path(&self, path: &Path) -> bool {
        let Ok(root) = self.servers_dir().canonicalize() else {
            return false;
        };
        resolve(path).is_some_and(|resolved| resolved != root && resolved.starts_with(&root))
    }
}

/// Canonical form of `path`. A tail that does not exist yet is appended as
/// plain names; a `..` in that tail makes the path unresolvable.
fn resolve(path: &Path) -> Option<PathBuf> {
    let mut existing = path;
    let mut missing = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(base) => return Some(missing.iter().rev().fold(base, |acc, name| acc.join(name))),
            Err(_) => {
                missing.push(existing.file_name()?);
                existing = existing.parent()?;
            }
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Default home directory (`~/.mcp-forge`).
pub fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-forge")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_rooted_at_home() {
        let config = BrokerConfig::with_home("/tmp/forge-home");

        assert_eq!(config.registry_path(), PathBuf::from("/tmp/forge-home/registry.json"));
        assert_eq!(config.audit_path(), PathBuf::from("/tmp/forge-home/audit.log"));
        assert_eq!(
            config.server_dir("weather"),
            PathBuf::from("/tmp/forge-home/servers/weather")
        );
    }

    #[test]
    fn test_managed_path_resolves_links_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig::with_home(dir.path().join("home"));
        config.ensure_dirs().unwrap();
        let server = config.server_dir("weather");
        std::fs::create_dir_all(&server).unwrap();

        assert!(config.is_managed_path(&server.join("server.py")));
        assert!(config.is_managed_path(&server.join("src").join("new.py")));
        assert!(!config.is_managed_path(&config.servers_dir()));
        assert!(!config.is_managed_path(Path::new("/opt/elsewhere")));
        assert!(!config.is_managed_path(&server.join("..").join("..").join("registry.json")));
        assert!(!config.is_managed_path(&server.join("missing").join("..").join("..").join("..")));

        #[cfg(unix)]
        {
            let outside = dir.path().join("outside");
            std::fs::create_dir_all(&outside).unwrap();
            let link = config.server_dir("escape");
            std::os::unix::fs::symlink(&outside, &link).unwrap();
            assert!(!config.is_managed_path(&link.join("server.py")));
        }
    }

    #[test]
    fn test_ensure_dirs_creates_servers_area() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig::with_home(dir.path().join("home"));

        config.ensure_dirs().unwrap();

        assert!(config.servers_dir().is_dir());
    }

    #[test]
    fn test_default_timeouts() {
        let transport = TransportConfig::default();
        assert_eq!(transport.handshake_timeout, Duration::from_secs(10));
        assert_eq!(transport.request_timeout, Duration::from_secs(30));
        assert!(transport.shutdown_grace < transport.request_timeout);
    }
}
