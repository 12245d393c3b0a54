//! Build engine: makes a managed provider runnable.
//!
//! ```text
//!   start(alias, container?)
//!     │  NotFound / ExternalProvider checked up front
//!     │  alias claimed in the in-progress set (BuildInProgress if taken)
//!     ▼
//!   spawned job ───────────────────────────────────────────────┐
//!     │ local:      venv + pip / npm install                   │
//!     │ container:  tar context ─▶ staging tag ─▶ :latest      │
//!     ▼                                                        │
//!   artifacts complete? ── no ──▶ BuildFailed, registry as-is  │
//!     │ yes                                                    │
//!     ▼                                                        │
//!   registry.update(launch, build_state)                       │
//!     │                                                        │
//!   guard dropped, alias released ◀────────────────────────────┘
//! ```
//!
//! A caller of [`BuildEngine::build`] that stops waiting (agent disconnect)
//! cancels the job while it is still installing or packaging; its child
//! processes are killed on drop. Once artifacts are complete the registry
//! update always runs to the end.

mod runner;

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::{OnceCell, oneshot};
use tokio::task::JoinHandle;

use crate::config::BrokerConfig;
use crate::error::{BuildError, RegistryError};
use crate::registry::{
    BuildState, Language, LaunchSpec, ManagedSource, ProviderDescriptor, ProviderView,
    RegistryStore,
};
use crate::sandbox::{
    ContainerEngine, DockerEngine, NetworkPolicy, SandboxError, pack_context, run_command,
};

pub use runner::{MAX_STEP_OUTPUT, ProcessRunner, Step, StepOutput, StepRunner};

/// Where a provider is built to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Dependencies installed next to the source, run by the host interpreter.
    Local,
    /// Packaged into an image and run under `docker run`.
    Container,
}

impl BuildMode {
    pub fn from_flag(use_container: bool) -> Self {
        if use_container {
            BuildMode::Container
        } else {
            BuildMode::Local
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildMode::Local => "local",
            BuildMode::Container => "container",
        }
    }
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub view: ProviderView,
    pub mode: BuildMode,
    /// Image tag, for container builds.
    pub image: Option<String>,
    /// Tail of the captured step or image build output.
    pub output: String,
}

/// Aliases with a build in flight.
type InProgress = Arc<Mutex<HashSet<String>>>;

/// Releases an alias from the in-progress set when dropped.
struct BuildGuard {
    alias: String,
    in_progress: InProgress,
}

impl BuildGuard {
    fn claim(in_progress: &InProgress, alias: &str) -> Result<Self, BuildError> {
        let mut set = in_progress.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(alias.to_string()) {
            return Err(BuildError::InProgress(alias.to_string()));
        }
        Ok(Self {
            alias: alias.to_string(),
            in_progress: in_progress.clone(),
        })
    }
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        let mut set = self.in_progress.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.alias);
    }
}

/// Signals cancellation to a build job when the waiting caller goes away.
struct CancelOnDrop(Option<oneshot::Sender<()>>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            // Fails harmlessly once the job has finished.
            let _ = tx.send(());
        }
    }
}

/// Finished artifacts, not yet recorded in the registry.
enum Artifacts {
    Local {
        launch: LaunchSpec,
        output: String,
    },
    Image {
        tag: String,
        network: NetworkPolicy,
        output: String,
    },
}

pub struct BuildEngine {
    config: Arc<BrokerConfig>,
    registry: Arc<RegistryStore>,
    runner: Arc<dyn StepRunner>,
    /// Connected on first container build unless injected.
    containers: OnceCell<Arc<dyn ContainerEngine>>,
    in_progress: InProgress,
}

impl BuildEngine {
    pub fn new(
        config: Arc<BrokerConfig>,
        registry: Arc<RegistryStore>,
        runner: Arc<dyn StepRunner>,
    ) -> Self {
        Self {
            config,
            registry,
            runner,
            containers: OnceCell::new(),
            in_progress: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Use a specific container engine instead of the local Docker daemon.
    pub fn with_container_engine(self, engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            containers: OnceCell::new_with(Some(engine)),
            ..self
        }
    }

    /// Whether a build for `alias` is running.
    pub fn is_building(&self, alias: &str) -> bool {
        self.in_progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(alias)
    }

    /// Validate and launch a detached build job.
    ///
    /// Returns once the job is running; a second build of the same alias is
    /// rejected until the first finishes.
    pub async fn start(
        self: &Arc<Self>,
        alias: &str,
        mode: BuildMode,
    ) -> Result<JoinHandle<Result<BuildReport, BuildError>>, BuildError> {
        self.spawn_job(alias, mode, None).await
    }

    /// Build and wait for the result. Dropping the returned future cancels
    /// the job unless it is already recording its result.
    pub async fn build(self: &Arc<Self>, alias: &str, mode: BuildMode) -> Result<BuildReport, BuildError> {
        let (tx, rx) = oneshot::channel();
        let _cancel = CancelOnDrop(Some(tx));
        let handle = self.spawn_job(alias, mode, Some(rx)).await?;
        handle.await.map_err(|e| BuildError::Failed {
            alias: alias.to_string(),
            reason: format!("build task ended abnormally: {}", e),
            output: String::new(),
        })?
    }

    async fn spawn_job(
        self: &Arc<Self>,
        alias: &str,
        mode: BuildMode,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<JoinHandle<Result<BuildReport, BuildError>>, BuildError> {
        let descriptor = self.managed_descriptor(alias).await?;
        let guard = BuildGuard::claim(&self.in_progress, alias)?;

        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _guard = guard;
            let alias = descriptor.alias.clone();
            let prepare = engine.prepare(descriptor, mode);
            let prepared = match cancel {
                Some(cancel) => tokio::select! {
                    prepared = prepare => prepared,
                    Ok(()) = cancel => {
                        tracing::info!("Build of '{}' cancelled by its caller", alias);
                        Err(BuildError::Cancelled(alias.clone()))
                    }
                },
                None => prepare.await,
            };
            let result = match prepared {
                Ok(artifacts) => engine.commit(&alias, artifacts).await,
                Err(e) => Err(e),
            };
            match &result {
                Ok(report) => tracing::info!(
                    "Built '{}' ({}) -> {:?}",
                    report.view.alias,
                    mode.as_str(),
                    report.view.build_state
                ),
                Err(e) => tracing::warn!("Build failed: {}", e),
            }
            result
        }))
    }

    async fn managed_descriptor(&self, alias: &str) -> Result<ProviderDescriptor, BuildError> {
        let descriptor = self.registry.get(alias).await.map_err(|e| match e {
            RegistryError::NotFound(a) => BuildError::NotFound(a),
            other => other.into(),
        })?;
        if !descriptor.managed || descriptor.source.is_none() {
            return Err(BuildError::ExternalProvider(alias.to_string()));
        }
        Ok(descriptor)
    }

    /// Produce artifacts without touching the registry.
    async fn prepare(
        &self,
        descriptor: ProviderDescriptor,
        mode: BuildMode,
    ) -> Result<Artifacts, BuildError> {
        let alias = descriptor.alias.clone();
        let Some(source) = descriptor.source.clone() else {
            return Err(BuildError::ExternalProvider(alias));
        };
        if !source.path.is_dir() {
            return Err(BuildError::Failed {
                alias,
                reason: format!("source directory {} is missing", source.path.display()),
                output: String::new(),
            });
        }

        match mode {
            BuildMode::Local => self.build_local(&alias, &source).await,
            BuildMode::Container => self.build_container(&alias, &source).await,
        }
    }

    async fn build_local(&self, alias: &str, source: &ManagedSource) -> Result<Artifacts, BuildError> {
        let (steps, launch) = local_plan(&self.config, source).map_err(|reason| BuildError::Failed {
            alias: alias.to_string(),
            reason,
            output: String::new(),
        })?;

        let mut output = String::new();
        for step in &steps {
            let out = self.runner.run(step, self.config.toolchain.step_timeout).await;
            output.push_str(&out.output);
            let tail = crate::safety::truncate_tail(&output, MAX_STEP_OUTPUT).to_string();
            if !out.success {
                return Err(BuildError::Failed {
                    alias: alias.to_string(),
                    reason: format!("`{}` failed: {}", step.display(), out.status),
                    output: tail,
                });
            }
            output = tail;
        }

        Ok(Artifacts::Local { launch, output })
    }

    async fn build_container(
        &self,
        alias: &str,
        source: &ManagedSource,
    ) -> Result<Artifacts, BuildError> {
        let sandbox_err = |source: SandboxError| BuildError::Sandbox {
            alias: alias.to_string(),
            source,
        };

        let engine = self.container_engine().await.map_err(sandbox_err)?;

        let root = source.path.clone();
        let language = source.language;
        let entry_point = source.entry_point.clone();
        let context = tokio::task::spawn_blocking(move || pack_context(&root, language, &entry_point))
            .await
            .map_err(|e| {
                sandbox_err(SandboxError::Context {
                    reason: format!("packing task failed: {}", e),
                })
            })?
            .map_err(sandbox_err)?;

        let sandbox = self.config.sandbox.clone();
        let staging = sandbox.staging_tag(alias);
        let image = sandbox.image_tag(alias);

        // Phase one: a complete image under a throwaway tag.
        let log = match engine.build_image(&staging, context).await {
            Ok(log) => log,
            Err(e) => {
                discard_image(engine.as_ref(), &staging).await;
                return Err(sandbox_err(e));
            }
        };
        if let Err(e) = engine.tag_image(&staging, &image).await {
            discard_image(engine.as_ref(), &staging).await;
            return Err(sandbox_err(e));
        }
        discard_image(engine.as_ref(), &staging).await;

        Ok(Artifacts::Image {
            tag: image,
            network: sandbox.network_for(source.network_access),
            output: crate::safety::truncate_tail(&log, MAX_STEP_OUTPUT).to_string(),
        })
    }

    /// Phase two: point the descriptor at the finished artifacts.
    async fn commit(&self, alias: &str, artifacts: Artifacts) -> Result<BuildReport, BuildError> {
        match artifacts {
            Artifacts::Local { launch, output } => {
                let view = self
                    .registry
                    .update(alias, move |d| {
                        d.launch = launch;
                        d.build_state = BuildState::Local;
                    })
                    .await?;
                Ok(BuildReport {
                    view,
                    mode: BuildMode::Local,
                    image: None,
                    output,
                })
            }
            Artifacts::Image {
                tag,
                network,
                output,
            } => {
                let sandbox = self.config.sandbox.clone();
                let target = tag.clone();
                let view = self
                    .registry
                    .update(alias, move |d| {
                        let (command, args) =
                            run_command(&sandbox, &target, d.environment.keys(), network);
                        d.launch = LaunchSpec::Process { command, args };
                        d.build_state = BuildState::Containerized;
                    })
                    .await?;
                Ok(BuildReport {
                    view,
                    mode: BuildMode::Container,
                    image: Some(tag),
                    output,
                })
            }
        }
    }

    async fn container_engine(&self) -> Result<Arc<dyn ContainerEngine>, SandboxError> {
        let sandbox = self.config.sandbox.clone();
        self.containers
            .get_or_try_init(|| async move {
                let engine = DockerEngine::connect(sandbox).await.map_err(|e| {
                    SandboxError::DockerNotAvailable {
                        reason: e.to_string(),
                    }
                })?;
                Ok::<_, SandboxError>(Arc::new(engine) as Arc<dyn ContainerEngine>)
            })
            .await
            .cloned()
    }
}

async fn discard_image(engine: &dyn ContainerEngine, tag: &str) {
    if let Err(e) = engine.remove_image(tag).await {
        tracing::debug!("Could not remove {}: {}", tag, e);
    }
}

/// Install steps and resulting launch for a local build.
fn local_plan(
    config: &BrokerConfig,
    source: &ManagedSource,
) -> Result<(Vec<Step>, LaunchSpec), String> {
    let dir = source.path.as_path();
    let entry = source.entry_path().to_string_lossy().into_owned();

    match source.language {
        Language::Python => {
            let venv = dir.join(".venv");
            let bin = venv.join("bin");
            let install = if dir.join("requirements.txt").is_file() {
                Step::new(path_str(&bin.join("pip")), dir)
                    .arg("install")
                    .arg("-r")
                    .arg("requirements.txt")
            } else if dir.join("pyproject.toml").is_file() {
                Step::new(path_str(&bin.join("pip")), dir).arg("install").arg(".")
            } else {
                return Err("no requirements.txt or pyproject.toml to install from".to_string());
            };

            let steps = vec![
                Step::new(&config.toolchain.python_command, dir)
                    .arg("-m")
                    .arg("venv")
                    .arg(path_str(&venv)),
                install,
            ];
            let launch = LaunchSpec::Process {
                command: path_str(&bin.join("python")),
                args: vec![entry],
            };
            Ok((steps, launch))
        }
        Language::Node => {
            if !dir.join("package.json").is_file() {
                return Err("no package.json to install from".to_string());
            }
            let steps = vec![Step::new(&config.toolchain.npm_command, dir).arg("install")];
            let launch = LaunchSpec::Process {
                command: config.toolchain.node_command.clone(),
                args: vec![entry],
            };
            Ok((steps, launch))
        }
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
