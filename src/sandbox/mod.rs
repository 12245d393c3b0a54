//! Container sandbox for managed providers.
//!
//! Builds provider images through the Docker API and produces the locked-down
//! `docker run` invocation that replaces a provider's interpreter launch.

mod config;
mod container;
mod context;
mod error;

pub use config::{NetworkPolicy, SandboxConfig};
pub use container::{ContainerEngine, DockerEngine, connect_docker, run_command};
pub use context::{NODE_DOCKERFILE, PYTHON_DOCKERFILE, default_dockerfile, pack_context};
pub use error::{Result, SandboxError};
