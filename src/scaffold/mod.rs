//! Scaffold engine: creates managed provider source trees.
//!
//! ```text
//!   create / create_from_repository
//!         │
//!         ▼
//!   servers/.staging-<alias>-<uuid>/   (render template or clone)
//!         │ ok                    │ error
//!         ▼                       ▼
//!   rename to servers/<alias>/    remove staging dir
//!         │
//!         ▼
//!   register managed, unbuilt descriptor
//! ```
//!
//! A provider directory exists only once it is complete, and it is never
//! removed by the broker after registration.

mod detect;
mod fetch;
mod templates;

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::config::BrokerConfig;
use crate::error::{RegistryError, ScaffoldError};
use crate::registry::{
    Language, LaunchSpec, ManagedSource, ProviderDescriptor, ProviderView, RegistryStore,
    validate_alias,
};

pub use detect::{Detection, detect};
pub use fetch::{GitFetcher, SourceFetcher};
pub use templates::{Template, TemplateEngine, TemplateFile};

static TOOL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Tool created when none are requested.
const DEFAULT_TOOL: &str = "hello";

/// Input for [`ScaffoldEngine::create`].
#[derive(Debug, Clone)]
pub struct ScaffoldRequest {
    pub alias: String,
    pub template: String,
    pub tools: Vec<String>,
    pub description: String,
    /// Whether the provider needs outbound network access when containerized.
    pub network_access: bool,
}

/// Input for [`ScaffoldEngine::create_from_repository`].
#[derive(Debug, Clone)]
pub struct RepositoryRequest {
    pub alias: String,
    pub repository: String,
    pub description: String,
    pub network_access: bool,
}

pub struct ScaffoldEngine {
    config: Arc<BrokerConfig>,
    registry: Arc<RegistryStore>,
    fetcher: Arc<dyn SourceFetcher>,
}

impl ScaffoldEngine {
    pub fn new(
        config: Arc<BrokerConfig>,
        registry: Arc<RegistryStore>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        Self {
            config,
            registry,
            fetcher,
        }
    }

    /// Materialize a template and register it.
    pub async fn create(&self, request: ScaffoldRequest) -> Result<ProviderView, ScaffoldError> {
        validate_alias(&request.alias)?;
        let template = Template::get(&request.template)?;
        let tools = normalize_tools(&request.tools)?;
        let target = self.claim_target(&request.alias).await?;

        let description = if request.description.trim().is_empty() {
            format!("Custom provider {}", request.alias)
        } else {
            request.description.clone()
        };
        let files = template.render(&request.alias, &description, &tools);

        let staging = self.staging_dir(&request.alias);
        let written = write_files(&staging, &files).await;
        if let Err(e) = written {
            remove_dir(&staging).await;
            return Err(e);
        }
        self.promote(&staging, &target).await?;

        let source = ManagedSource {
            path: target.clone(),
            language: template.language,
            entry_point: template.entry_point.to_string(),
            repository: None,
            network_access: request.network_access,
        };
        let view = self.register(&request.alias, source, description, &target).await?;

        tracing::info!(
            "Scaffolded '{}' from {} template with tools [{}]",
            request.alias,
            template.name,
            tools.join(", ")
        );
        Ok(view)
    }

    /// Fetch an external tree, detect how to run it, and register it.
    pub async fn create_from_repository(
        &self,
        request: RepositoryRequest,
    ) -> Result<ProviderView, ScaffoldError> {
        validate_alias(&request.alias)?;
        let target = self.claim_target(&request.alias).await?;
        let staging = self.staging_dir(&request.alias);

        if let Err(e) = self.fetcher.fetch(&request.repository, &staging).await {
            remove_dir(&staging).await;
            return Err(e);
        }

        let detection = match detect(&staging) {
            Ok(found) => found,
            Err(e) => {
                // Leave nothing behind so the alias can be retried.
                remove_dir(&staging).await;
                return Err(match e {
                    ScaffoldError::Detection { reason, .. } => ScaffoldError::Detection {
                        path: PathBuf::from(&request.repository),
                        reason,
                    },
                    other => other,
                });
            }
        };

        self.promote(&staging, &target).await?;

        let description = if request.description.trim().is_empty() {
            format!("Cloned from {}", request.repository)
        } else {
            request.description.clone()
        };
        let source = ManagedSource {
            path: target.clone(),
            language: detection.language,
            entry_point: detection.entry_point.clone(),
            repository: Some(request.repository.clone()),
            network_access: request.network_access,
        };
        let view = self.register(&request.alias, source, description, &target).await?;

        tracing::info!(
            "Imported '{}' from {} ({} entry {})",
            request.alias,
            request.repository,
            detection.language,
            detection.entry_point
        );
        Ok(view)
    }

    /// Replace the entry file of a managed provider.
    pub async fn edit(&self, alias: &str, code: &str) -> Result<ProviderView, ScaffoldError> {
        let descriptor = self.registry.get(alias).await.map_err(|e| match e {
            RegistryError::NotFound(a) => ScaffoldError::NotFound(a),
            other => other.into(),
        })?;
        let source = match (&descriptor.source, descriptor.managed) {
            (Some(source), true) => source.clone(),
            _ => return Err(ScaffoldError::ExternalProvider(alias.to_string())),
        };

        let entry = source.entry_path();
        if !self.config.is_managed_path(&entry) || !source.path.is_dir() {
            return Err(ScaffoldError::ExternalProvider(alias.to_string()));
        }

        let tmp = entry.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        if let Some(parent) = entry.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, code).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &entry).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        // Touch updated_at.
        let view = self.registry.update(alias, |_| {}).await?;
        tracing::info!("Replaced {} for '{}'", entry.display(), alias);
        Ok(view)
    }

    /// Fail early if the alias is taken or its directory exists.
    async fn claim_target(&self, alias: &str) -> Result<PathBuf, ScaffoldError> {
        if self.registry.contains(alias).await {
            return Err(ScaffoldError::DuplicateAlias(alias.to_string()));
        }
        let target = self.config.server_dir(alias);
        if tokio::fs::try_exists(&target).await? {
            return Err(ScaffoldError::DuplicateAlias(alias.to_string()));
        }
        tokio::fs::create_dir_all(self.config.servers_dir()).await?;
        Ok(target)
    }

    fn staging_dir(&self, alias: &str) -> PathBuf {
        self.config.servers_dir().join(format!(
            ".staging-{}-{}",
            alias,
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// Move a complete staging tree into place.
    async fn promote(&self, staging: &Path, target: &Path) -> Result<(), ScaffoldError> {
        if tokio::fs::try_exists(target).await.unwrap_or(false) {
            remove_dir(staging).await;
            return Err(ScaffoldError::DuplicateAlias(
                target
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            ));
        }
        if let Err(e) = tokio::fs::rename(staging, target).await {
            remove_dir(staging).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn register(
        &self,
        alias: &str,
        source: ManagedSource,
        description: String,
        target: &Path,
    ) -> Result<ProviderView, ScaffoldError> {
        let launch = interpreter_launch(&self.config, source.language, &source.entry_path());
        let registered = match ProviderDescriptor::managed(alias, launch, source, description) {
            Ok(descriptor) => self.registry.add(descriptor).await,
            Err(e) => Err(e),
        };

        match registered {
            Ok(view) => Ok(view),
            Err(e) => {
                // The tree was created by this call, so it can go.
                remove_dir(target).await;
                Err(match e {
                    RegistryError::DuplicateAlias(a) => ScaffoldError::DuplicateAlias(a),
                    other => other.into(),
                })
            }
        }
    }
}

/// Launch spec running `entry` with the language's plain interpreter.
pub fn interpreter_launch(config: &BrokerConfig, language: Language, entry: &Path) -> LaunchSpec {
    let command = match language {
        Language::Python => config.toolchain.python_command.clone(),
        Language::Node => config.toolchain.node_command.clone(),
    };
    LaunchSpec::Process {
        command,
        args: vec![entry.to_string_lossy().into_owned()],
    }
}

/// Trim, validate and dedup requested tool names.
fn normalize_tools(tools: &[String]) -> Result<Vec<String>, ScaffoldError> {
    let mut names: Vec<String> = Vec::new();
    for tool in tools.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        if !TOOL_NAME.is_match(tool) {
            return Err(ScaffoldError::InvalidToolName(tool.to_string()));
        }
        if !names.iter().any(|n| n == tool) {
            names.push(tool.to_string());
        }
    }
    if names.is_empty() {
        names.push(DEFAULT_TOOL.to_string());
    }
    Ok(names)
}

async fn write_files(root: &Path, files: &[(String, String)]) -> Result<(), ScaffoldError> {
    tokio::fs::create_dir_all(root).await?;
    for (rel, content) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
    }
    Ok(())
}

async fn remove_dir(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!("Failed to clean up {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BuildState, Registration, TransportKind};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    /// Writes a canned tree instead of cloning.
    struct FakeFetcher {
        files: Vec<(&'static str, &'static str)>,
    }

    #[async_trait]
    impl SourceFetcher for FakeFetcher {
        async fn fetch(&self, _url: &str, dest: &Path) -> Result<(), ScaffoldError> {
            for (rel, content) in &self.files {
                let path = dest.join(rel);
                tokio::fs::create_dir_all(path.parent().unwrap()).await?;
                tokio::fs::write(path, content).await?;
            }
            Ok(())
        }
    }

    async fn engine_with(
        home: &Path,
        files: Vec<(&'static str, &'static str)>,
    ) -> (ScaffoldEngine, Arc<RegistryStore>, Arc<BrokerConfig>) {
        let config = Arc::new(BrokerConfig::with_home(home));
        config.ensure_dirs().unwrap();
        let registry = Arc::new(
            RegistryStore::open(config.registry_path(), config.registry_lock_path())
                .await
                .unwrap(),
        );
        let engine = ScaffoldEngine::new(
            config.clone(),
            registry.clone(),
            Arc::new(FakeFetcher { files }),
        );
        (engine, registry, config)
    }

    fn request(alias: &str, template: &str, tools: &[&str]) -> ScaffoldRequest {
        ScaffoldRequest {
            alias: alias.to_string(),
            template: template.to_string(),
            tools: tools.iter().map(|t| t.to_string()).collect(),
            description: "Stock prices".to_string(),
            network_access: false,
        }
    }

    #[tokio::test]
    async fn test_create_python_provider() {
        let home = tempfile::tempdir().unwrap();
        let (engine, registry, config) = engine_with(home.path(), vec![]).await;

        let view = engine
            .create(request("stock-data", "python", &["get_price", "get_history"]))
            .await
            .unwrap();

        assert!(view.managed);
        assert_eq!(view.build_state, BuildState::Unbuilt);
        assert_eq!(view.transport, TransportKind::Process);

        let dir = config.server_dir("stock-data");
        let server = std::fs::read_to_string(dir.join("server.py")).unwrap();
        assert!(server.contains("def get_price("));
        assert!(server.contains("def get_history("));
        assert!(dir.join("requirements.txt").is_file());
        assert!(dir.join("Dockerfile").is_file());

        let stored = registry.get("stock-data").await.unwrap();
        assert_eq!(
            stored.launch,
            LaunchSpec::Process {
                command: "python3".to_string(),
                args: vec![dir.join("server.py").to_string_lossy().into_owned()],
            }
        );

        // No staging leftovers.
        let leftovers: Vec<_> = std::fs::read_dir(config.servers_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_create_defaults_to_hello_tool() {
        let home = tempfile::tempdir().unwrap();
        let (engine, _, config) = engine_with(home.path(), vec![]).await;

        engine.create(request("greeter", "node", &[])).await.unwrap();

        let index = std::fs::read_to_string(config.server_dir("greeter").join("index.js")).unwrap();
        assert!(index.contains(r#""hello","#));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_bad_input() {
        let home = tempfile::tempdir().unwrap();
        let (engine, registry, config) = engine_with(home.path(), vec![]).await;

        registry
            .add(
                ProviderDescriptor::external(Registration {
                    alias: "weather".to_string(),
                    transport: TransportKind::Process,
                    command: Some("python3".to_string()),
                    args: vec![],
                    url: None,
                    environment: BTreeMap::new(),
                    description: String::new(),
                })
                .unwrap(),
            )
            .await
            .unwrap();
        let err = engine.create(request("weather", "python", &[])).await.unwrap_err();
        assert!(matches!(err, ScaffoldError::DuplicateAlias(_)));

        std::fs::create_dir_all(config.server_dir("orphan")).unwrap();
        let err = engine.create(request("orphan", "python", &[])).await.unwrap_err();
        assert!(matches!(err, ScaffoldError::DuplicateAlias(_)));

        let err = engine.create(request("fresh", "cobol", &[])).await.unwrap_err();
        assert!(matches!(err, ScaffoldError::UnknownTemplate { .. }));

        let err = engine.create(request("fresh", "python", &["get-price"])).await.unwrap_err();
        assert!(matches!(err, ScaffoldError::InvalidToolName(_)));
        assert!(!config.server_dir("fresh").exists());
    }

    #[tokio::test]
    async fn test_from_repository_detects_node() {
        let home = tempfile::tempdir().unwrap();
        let (engine, registry, _) = engine_with(
            home.path(),
            vec![("package.json", "{}"), ("dist/index.js", "")],
        )
        .await;

        let view = engine
            .create_from_repository(RepositoryRequest {
                alias: "gh-tools".to_string(),
                repository: "https://github.com/example/gh-tools".to_string(),
                description: String::new(),
                network_access: true,
            })
            .await
            .unwrap();

        let source = view.source.unwrap();
        assert_eq!(source.language, Language::Node);
        assert_eq!(source.entry_point, "dist/index.js");
        assert_eq!(source.repository.as_deref(), Some("https://github.com/example/gh-tools"));
        assert!(source.network_access);
        assert_eq!(view.description, "Cloned from https://github.com/example/gh-tools");
        assert!(registry.contains("gh-tools").await);
    }

    #[tokio::test]
    async fn test_from_repository_detection_failure_cleans_up() {
        let home = tempfile::tempdir().unwrap();
        let (engine, registry, config) =
            engine_with(home.path(), vec![("README.md", "# nothing here")]).await;

        let err = engine
            .create_from_repository(RepositoryRequest {
                alias: "mystery".to_string(),
                repository: "https://github.com/example/mystery".to_string(),
                description: String::new(),
                network_access: false,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ScaffoldError::Detection { .. }));
        assert!(!registry.contains("mystery").await);
        assert_eq!(std::fs::read_dir(config.servers_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_edit_replaces_entry_file() {
        let home = tempfile::tempdir().unwrap();
        let (engine, registry, config) = engine_with(home.path(), vec![]).await;
        engine.create(request("stock-data", "python", &[])).await.unwrap();

        let code = "from fastmcp import FastMCP\nmcp = FastMCP('stock-data')\n";
        engine.edit("stock-data", code).await.unwrap();

        let written =
            std::fs::read_to_string(config.server_dir("stock-data").join("server.py")).unwrap();
        assert_eq!(written, code);

        registry
            .add(
                ProviderDescriptor::external(Registration {
                    alias: "remote".to_string(),
                    transport: TransportKind::Network,
                    command: None,
                    args: vec![],
                    url: Some("https://example.com/mcp".to_string()),
                    environment: BTreeMap::new(),
                    description: String::new(),
                })
                .unwrap(),
            )
            .await
            .unwrap();
        assert!(matches!(
            engine.edit("remote", code).await,
            Err(ScaffoldError::ExternalProvider(_))
        ));
        assert!(matches!(
            engine.edit("missing", code).await,
            Err(ScaffoldError::NotFound(_))
        ));
    }

    #[test]
    fn test_normalize_tools() {
        assert_eq!(normalize_tools(&[]).unwrap(), vec!["hello"]);
        assert_eq!(
            normalize_tools(&[" a ".to_string(), "a".to_string(), "_b2".to_string()]).unwrap(),
            vec!["a", "_b2"]
        );
        assert!(normalize_tools(&["2fast".to_string()]).is_err());
    }
}
