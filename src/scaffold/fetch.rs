//! Source retrieval for `scaffold_from_repo`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::build::{ProcessRunner, Step, StepRunner};
use crate::error::ScaffoldError;

/// Retrieves an external source tree into a directory that does not exist yet.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), ScaffoldError>;
}

/// Shallow `git clone`.
pub struct GitFetcher {
    git_command: String,
    timeout: Duration,
    runner: Arc<dyn StepRunner>,
}

impl GitFetcher {
    pub fn new(git_command: impl Into<String>, timeout: Duration) -> Self {
        Self::with_runner(git_command, timeout, Arc::new(ProcessRunner))
    }

    pub fn with_runner(
        git_command: impl Into<String>,
        timeout: Duration,
        runner: Arc<dyn StepRunner>,
    ) -> Self {
        Self {
            git_command: git_command.into(),
            timeout,
            runner,
        }
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), ScaffoldError> {
        let fail = |reason: String| ScaffoldError::Fetch {
            url: url.to_string(),
            reason,
        };

        let url = url.trim();
        if url.is_empty() {
            return Err(fail("repository url is empty".to_string()));
        }
        // Refuse anything git would parse as an option.
        if url.starts_with('-') {
            return Err(fail("repository url may not start with '-'".to_string()));
        }

        let Some(parent) = dest.parent() else {
            return Err(fail(format!("invalid destination {}", dest.display())));
        };

        let step = Step::new(&self.git_command, parent)
            .arg("clone")
            .arg("--depth=1")
            .arg("--")
            .arg(url)
            .arg(dest.to_string_lossy());

        let out = self.runner.run(&step, self.timeout).await;
        if out.success {
            Ok(())
        } else {
            Err(fail(if out.output.trim().is_empty() {
                out.status
            } else {
                format!("{}: {}", out.status, out.output.trim())
            }))
        }
    }
}
