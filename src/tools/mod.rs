//! Agent-facing tools.
//!
//! Each broker operation is exposed as one [`Tool`] with a JSON schema. The
//! set is fixed: registering or removing providers never changes it.

pub mod builtin;

mod registry;
mod tool;

pub use builtin::{broker_tools, register_broker_tools};
pub use registry::ToolRegistry;
pub use tool::{Tool, ToolError, ToolOutput, ToolSchema};
