//! Docker build contexts for managed provider trees.

use std::fs;
use std::path::Path;

use bytes::Bytes;

use crate::registry::Language;
use crate::sandbox::error::{Result, SandboxError};

/// Directory names never sent to the daemon.
const EXCLUDED_DIRS: &[&str] = &[".venv", "node_modules", ".git", "__pycache__"];

const DOCKERFILE: &str = "Dockerfile";

/// Pack `root` as an uncompressed tar, adding a default Dockerfile if the
/// tree has none.
pub fn pack_context(root: &Path, language: Language, entry_point: &str) -> Result<Bytes> {
    if !root.is_dir() {
        return Err(SandboxError::Context {
            reason: format!("{} is not a directory", root.display()),
        });
    }

    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    append_tree(&mut builder, root, Path::new(""))?;

    if !root.join(DOCKERFILE).is_file() {
        let dockerfile = default_dockerfile(language, entry_point);
        let mut header = tar::Header::new_gnu();
        header.set_size(dockerfile.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, DOCKERFILE, dockerfile.as_bytes())?;
        tracing::debug!("Injected default {} Dockerfile", language);
    }

    let bytes = builder.into_inner().map_err(|e| SandboxError::Context {
        reason: format!("tar finalize failed: {}", e),
    })?;
    Ok(Bytes::from(bytes))
}

fn append_tree(builder: &mut tar::Builder<Vec<u8>>, root: &Path, relative: &Path) -> Result<()> {
    let mut entries = fs::read_dir(root.join(relative))?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let rel = relative.join(&name);
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            if EXCLUDED_DIRS.iter().any(|d| name == *d) {
                continue;
            }
            builder.append_dir(&rel, entry.path())?;
            append_tree(builder, root, &rel)?;
        } else {
            builder.append_path_with_name(entry.path(), &rel)?;
        }
    }
    Ok(())
}

/// Dockerfile for Python providers; `{{entry_point}}` is substituted.
pub const PYTHON_DOCKERFILE: &str = r#"FROM python:3.12-slim
WORKDIR /app
COPY . /app
RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; \
    elif [ -f pyproject.toml ]; then pip install --no-cache-dir .; fi
RUN useradd --create-home --uid 1000 provider
USER provider
ENTRYPOINT ["python", "{{entry_point}}"]
"#;

/// Dockerfile for Node providers; `{{entry_point}}` is substituted.
pub const NODE_DOCKERFILE: &str = r#"FROM node:20-slim
WORKDIR /app
COPY . /app
RUN if [ -f package.json ]; then npm install --omit=dev; fi
USER node
ENTRYPOINT ["node", "{{entry_point}}"]
"#;

/// Dockerfile used when a provider tree does not bring its own.
pub fn default_dockerfile(language: Language, entry_point: &str) -> String {
    let template = match language {
        Language::Python => PYTHON_DOCKERFILE,
        Language::Node => NODE_DOCKERFILE,
    };
    template.replace("{{entry_point}}", entry_point)
}
