//! Broker core: the fixed set of operations the agent can perform.
//!
//! Every operation validates its input, delegates to one subsystem and,
//! when it touches a provider, appends exactly one audit record. Results
//! and errors leave through [`Broker::scrub_value`] and
//! [`Broker::error_payload`] so no registered secret reaches the agent.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use crate::audit::{AuditLogger, AuditOutcome, AuditRecord, summarize_arguments};
use crate::build::{BuildEngine, BuildMode, BuildReport, ProcessRunner, StepRunner};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, ErrorKind, TransportError, TransportFailure};
use crate::registry::{ProviderDescriptor, ProviderView, Registration, RegistryStore};
use crate::safety::SecretScrubber;
use crate::sandbox::ContainerEngine;
use crate::scaffold::{GitFetcher, RepositoryRequest, ScaffoldEngine, ScaffoldRequest, SourceFetcher};
use crate::transport::{CallOutcome, ProviderTransport, ToolInfo, TransportClient};

/// Structured failure returned to the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_kind: Option<TransportFailure>,
}

/// Snapshot of one provider for `server_status`.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    #[serde(flatten)]
    pub provider: ProviderView,
    /// A build for this alias is running.
    pub building: bool,
    /// Managed providers only: whether the source tree is on disk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_present: Option<bool>,
}

/// External collaborators, replaceable in tests.
pub struct Collaborators {
    pub transport: Arc<dyn ProviderTransport>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub runner: Arc<dyn StepRunner>,
    /// Connected lazily to the local Docker daemon when `None`.
    pub containers: Option<Arc<dyn ContainerEngine>>,
}

impl Collaborators {
    /// Real process, HTTP, git and Docker collaborators.
    pub fn for_config(config: &BrokerConfig) -> Self {
        Self {
            transport: Arc::new(TransportClient::new(config.transport.clone())),
            fetcher: Arc::new(GitFetcher::new(
                config.toolchain.git_command.clone(),
                config.toolchain.step_timeout,
            )),
            runner: Arc::new(ProcessRunner),
            containers: None,
        }
    }
}

pub struct Broker {
    config: Arc<BrokerConfig>,
    registry: Arc<RegistryStore>,
    transport: Arc<dyn ProviderTransport>,
    scaffold: ScaffoldEngine,
    builds: Arc<BuildEngine>,
    audit: AuditLogger,
}

impl Broker {
    /// Open the broker's home directory and registry.
    ///
    /// Fails only on unusable local state (unwritable home, unreadable
    /// registry document).
    pub async fn open(config: BrokerConfig) -> Result<Self, BrokerError> {
        let collaborators = Collaborators::for_config(&config);
        Self::open_with(config, collaborators).await
    }

    pub async fn open_with(
        config: BrokerConfig,
        collaborators: Collaborators,
    ) -> Result<Self, BrokerError> {
        config.ensure_dirs().map_err(|e| {
            BrokerError::Internal(format!(
                "cannot prepare home directory {}: {}",
                config.home.display(),
                e
            ))
        })?;

        let config = Arc::new(config);
        let registry = Arc::new(
            RegistryStore::open(config.registry_path(), config.registry_lock_path()).await?,
        );

        let scaffold = ScaffoldEngine::new(config.clone(), registry.clone(), collaborators.fetcher);
        let mut builds = BuildEngine::new(config.clone(), registry.clone(), collaborators.runner);
        if let Some(engine) = collaborators.containers {
            builds = builds.with_container_engine(engine);
        }

        tracing::info!(
            "Broker home {} ({} providers registered)",
            config.home.display(),
            registry.list().await.len()
        );

        Ok(Self {
            audit: AuditLogger::new(config.audit_path()),
            transport: collaborators.transport,
            scaffold,
            builds: Arc::new(builds),
            registry,
            config,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &RegistryStore {
        &self.registry
    }

    // ==================== Registry ====================

    pub async fn register(&self, registration: Registration) -> Result<ProviderView, BrokerError> {
        let start = Instant::now();
        let alias = registration.alias.clone();
        let summary = serde_json::json!({
            "transport": registration.transport.as_str(),
            "command": registration.command,
            "args": registration.args,
            "url": registration.url,
            "environment": registration.environment.keys().collect::<Vec<_>>(),
        });

        let result = match ProviderDescriptor::external(registration) {
            Ok(descriptor) => self.registry.add(descriptor).await.map_err(BrokerError::from),
            Err(e) => Err(e.into()),
        };
        if result.is_ok() {
            tracing::info!("Registered provider '{}'", alias);
        }

        let summary = summarize_arguments(&summary, &self.scrubber().await);
        self.record("register", Some(&alias), None, Some(summary), &result, start)
            .await;
        result
    }

    /// All providers, secrets masked.
    pub async fn list(&self) -> Vec<ProviderView> {
        self.registry.list().await
    }

    /// Drop a registry entry. Managed source trees stay on disk.
    pub async fn remove(&self, alias: &str) -> Result<ProviderView, BrokerError> {
        let start = Instant::now();
        let result = self.registry.remove(alias).await.map_err(BrokerError::from);
        if let Ok(view) = &result {
            if let Some(source) = &view.source {
                tracing::info!(
                    "Removed '{}'; its source at {} was left in place",
                    alias,
                    source.path.display()
                );
            } else {
                tracing::info!("Removed '{}'", alias);
            }
        }
        self.record("remove", Some(alias), None, None, &result, start).await;
        result
    }

    pub async fn status(&self, alias: &str) -> Result<ProviderStatus, BrokerError> {
        let start = Instant::now();
        let result = self.registry.view(alias).await.map_err(BrokerError::from).map(|view| {
            let source_present = view.source.as_ref().map(|s| s.path.is_dir());
            ProviderStatus {
                building: self.builds.is_building(alias),
                source_present,
                provider: view,
            }
        });
        self.record("status", Some(alias), None, None, &result, start).await;
        result
    }

    // ==================== Providers ====================

    pub async fn discover(&self, alias: &str) -> Result<Vec<ToolInfo>, BrokerError> {
        let start = Instant::now();
        let result = match self.lookup(alias).await {
            Ok(descriptor) => self
                .transport
                .discover(&descriptor)
                .await
                .map_err(|e| BrokerError::transport(alias, e)),
            Err(e) => Err(e),
        };
        self.record("discover", Some(alias), None, None, &result, start).await;
        result
    }

    /// Call one tool. A tool that reports failure surfaces as `tool_error`.
    pub async fn invoke(
        &self,
        alias: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<CallOutcome, BrokerError> {
        let start = Instant::now();
        let scrubber = self.scrubber().await;
        let summary = summarize_arguments(&arguments, &scrubber);

        let result = self.invoke_inner(alias, tool, arguments).await;
        self.record("invoke", Some(alias), Some(tool), Some(summary), &result, start)
            .await;
        result
    }

    async fn invoke_inner(
        &self,
        alias: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<CallOutcome, BrokerError> {
        if tool.trim().is_empty() {
            return Err(BrokerError::InvalidArguments("tool name is empty".to_string()));
        }
        if !arguments.is_object() {
            return Err(BrokerError::InvalidArguments(
                "arguments must be a JSON object".to_string(),
            ));
        }

        let descriptor = self.lookup(alias).await?;
        let outcome = self
            .transport
            .invoke(&descriptor, tool, arguments)
            .await
            .map_err(|e| BrokerError::transport(alias, e))?;

        if outcome.is_error {
            let text = outcome.text();
            return Err(BrokerError::transport(
                alias,
                TransportError::Remote {
                    code: None,
                    message: if text.is_empty() {
                        format!("tool '{}' reported an error", tool)
                    } else {
                        text
                    },
                    data: outcome.structured_content,
                },
            ));
        }
        Ok(outcome)
    }

    // ==================== Managed providers ====================

    pub async fn scaffold(&self, request: ScaffoldRequest) -> Result<ProviderView, BrokerError> {
        let start = Instant::now();
        let alias = request.alias.clone();
        let summary = serde_json::json!({
            "template": request.template,
            "tools": request.tools,
        });
        let result = self.scaffold.create(request).await.map_err(BrokerError::from);
        self.record("scaffold", Some(&alias), None, Some(summary.to_string()), &result, start)
            .await;
        result
    }

    pub async fn scaffold_from_repo(
        &self,
        request: RepositoryRequest,
    ) -> Result<ProviderView, BrokerError> {
        let start = Instant::now();
        let alias = request.alias.clone();
        let scrubber = self.scrubber().await;
        let summary = summarize_arguments(
            &serde_json::json!({ "repository": request.repository }),
            &scrubber,
        );
        let result = self
            .scaffold
            .create_from_repository(request)
            .await
            .map_err(BrokerError::from);
        self.record("scaffold", Some(&alias), None, Some(summary), &result, start)
            .await;
        result
    }

    /// Build a managed provider. Runs as a background job; this waits for it.
    pub async fn build(&self, alias: &str, use_container: bool) -> Result<BuildReport, BrokerError> {
        let start = Instant::now();
        let mode = BuildMode::from_flag(use_container);
        let result = self.builds.build(alias, mode).await.map_err(BrokerError::from);
        let summary = serde_json::json!({ "mode": mode.as_str() }).to_string();
        self.record("build", Some(alias), None, Some(summary), &result, start).await;
        result
    }

    pub async fn edit(&self, alias: &str, code: &str) -> Result<ProviderView, BrokerError> {
        let start = Instant::now();
        let result = self.scaffold.edit(alias, code).await.map_err(BrokerError::from);
        let summary = serde_json::json!({ "bytes": code.len() }).to_string();
        self.record("edit", Some(alias), None, Some(summary), &result, start).await;
        result
    }

    // ==================== Redaction ====================

    /// Scrubber over every currently registered secret.
    pub async fn scrubber(&self) -> SecretScrubber {
        self.registry.scrubber().await
    }

    /// Remove registered secrets from an outgoing payload.
    pub async fn scrub_value(&self, value: &mut Value) {
        self.scrubber().await.scrub_value(value);
    }

    /// Agent-facing form of an error, secrets removed.
    pub async fn error_payload(&self, err: &BrokerError) -> ErrorPayload {
        let scrubber = self.scrubber().await;
        ErrorPayload {
            kind: err.kind(),
            message: scrubber.scrub(&err.to_string()),
            transport_kind: err.transport_failure(),
        }
    }

    async fn lookup(&self, alias: &str) -> Result<ProviderDescriptor, BrokerError> {
        Ok(self.registry.get(alias).await?)
    }

    /// Audit an operation refused before it ran, e.g. on malformed parameters.
    pub async fn reject<T>(
        &self,
        operation: &str,
        alias: Option<&str>,
        err: BrokerError,
        start: Instant,
    ) -> Result<T, BrokerError> {
        let result = Err(err);
        self.record(operation, alias, None, None, &result, start).await;
        result
    }

    async fn record<T>(
        &self,
        operation: &str,
        alias: Option<&str>,
        tool: Option<&str>,
        arguments: Option<String>,
        result: &Result<T, BrokerError>,
        start: Instant,
    ) {
        let outcome = match result {
            Ok(_) => AuditOutcome::Success,
            Err(e) => AuditOutcome::Error(e.kind()),
        };
        let mut record = AuditRecord::new(operation, outcome, start.elapsed());
        if let Some(alias) = alias {
            record = record.alias(alias);
        }
        if let Some(tool) = tool {
            record = record.tool(tool);
        }
        if let Some(arguments) = arguments {
            record = record.arguments(arguments);
        }
        self.audit.record(record).await;
    }
}
