//! Error types returned by this crate.
//!
//! Mirrors the eight error kinds of the orchestrator's error model: manifest
//! parsing, driver registration, driver callbacks, subprocess execution,
//! filesystem I/O, dependency cycles, ambiguous (duplicate) project ids, and
//! dependee-configuration conflicts. Filesystem errors encountered by
//! `locate` are deliberately *not* represented here: those are swallowed and
//! treated as a plain "not found" at the call site.

use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Convenience alias used throughout the crate.
pub type Result<T, E = BakeError> = core::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum BakeError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest at '{path}': {source}")]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid project id '{0}'")]
    InvalidProjectId(String),

    #[error("driver '{driver}' registration error: {message}")]
    DriverRegistration { driver: String, message: String },

    #[error("action for '{node}' failed while building '{project}'{detail}")]
    DriverCallback { project: String, node: String, detail: String },

    #[error("command `{command}` failed for '{project}'{detail}")]
    SubprocessExec { project: String, command: String, detail: String },

    #[error("dependency graph contains a cycle: built {built} of {total} projects; stuck: {}", stuck.join(", "))]
    CycleDetected { built: usize, total: usize, stuck: Vec<String> },

    #[error("project id '{id}' is declared twice: first at '{first}', again at '{second}'")]
    AmbiguousDependency { id: String, first: PathBuf, second: PathBuf },

    #[error("conflicting value for attribute '{key}' contributed by dependee '{dependee}': '{existing}' vs '{incoming}'")]
    ConfigConflict { key: String, dependee: String, existing: String, incoming: String },

    #[error("{context}: {source}")]
    Context { context: String, #[source] source: Box<BakeError> },
}

impl BakeError {
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        BakeError::Io { path: path.into(), source }
    }

    /// Wraps this error with additional context, the way the original
    /// C source chains `ut_throw` frames — but as an explicit, inspectable
    /// wrapper rather than a thread-local error stack.
    pub fn context(self, context: impl fmt::Display) -> Self {
        BakeError::Context { context: context.to_string(), source: Box::new(self) }
    }
}

/// Extension trait mirroring `anyhow`-style `.context()` ergonomics for any
/// `Result<T, BakeError>`.
pub trait ResultExt<T> {
    fn context(self, context: impl fmt::Display) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl fmt::Display) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}

pub(crate) fn io_err(path: impl AsRef<Path>) -> impl FnOnce(std::io::Error) -> BakeError {
    let path = path.as_ref().to_path_buf();
    move |source| BakeError::io(source, path)
}
