use std::path::PathBuf;

use thiserror::Error;

/// Error taxonomy for the sandbox core.
///
/// Every variant is recoverable at the boundary where it occurs: callers get
/// a returned error value (plus a tracing diagnostic), never an unhandled
/// fault that takes down the host. A script that fails to compile or crashes
/// at run time costs its caller one `undefined` result, nothing more.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The script text did not parse.
    #[error("compile error in {origin}: {message}")]
    Compile { origin: String, message: String },

    /// The script faulted while executing (unhandled exception, invalid
    /// access, or the engine operation limit tripped).
    #[error("runtime error in {origin}: {message}")]
    Runtime { origin: String, message: String },

    /// `require` resolved to nothing (file-path branch, file absent).
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// `require` was given an empty module id.
    #[error("module id must be a non-empty string")]
    InvalidModuleId,

    /// A script-relative path would resolve outside the confined root.
    #[error("path escapes the confined root: {}", .0.display())]
    PathTraversalRejected(PathBuf),

    /// A component descriptor failed to instantiate, or its namespace path
    /// conflicts with an already-registered leaf.
    #[error("component '{name}' failed to load: {reason}")]
    ComponentLoad { name: String, reason: String },

    /// `set_entity` was handed a value that is not an entity.
    #[error("component type contract violation: {0}")]
    ComponentType(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn component_load(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ComponentLoad {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
