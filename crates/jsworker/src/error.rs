//! Error types for workers.

use std::fmt;
use std::path::PathBuf;

/// Where in a script an exception was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// An engine exception attributed to the script that was running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Diagnostic name of the script the worker attributes the error to.
    pub script: String,
    /// Exception class, e.g. `SyntaxError`.
    pub kind: String,
    pub message: String,
    pub location: Option<Location>,
    /// Source text of the offending line, when the worker still has it.
    pub source_line: Option<String>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) if loc.file == self.script => write!(
                f,
                "{}:{}:{}: {}: {}",
                self.script, loc.line, loc.column, self.kind, self.message
            )?,
            Some(loc) => write!(
                f,
                "{}: {}: {} (at {}:{}:{})",
                self.script, self.kind, self.message, loc.file, loc.line, loc.column
            )?,
            None => write!(f, "{}: {}: {}", self.script, self.kind, self.message)?,
        }

        if let Some(line) = &self.source_line {
            write!(f, "\n{}", line)?;
            if let Some(loc) = &self.location {
                let pad = (loc.column.max(1) - 1) as usize;
                if pad <= line.chars().count() {
                    write!(f, "\n{}^", " ".repeat(pad))?;
                }
            }
        }
        Ok(())
    }
}

/// Errors returned by [`Worker`](crate::Worker) operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    /// The source failed to parse.
    #[error("{0}")]
    Compile(Diagnostic),

    /// An uncaught exception during evaluation or inside a recv handler.
    #[error("{0}")]
    Runtime(Diagnostic),

    #[error("{referrer}: cannot resolve module \"{specifier}\": {reason}")]
    Resolution {
        specifier: String,
        referrer: String,
        reason: String,
    },

    #[error("{script}: execution terminated")]
    Terminated { script: String },

    #[error("{script}: nesting depth {depth} exceeds the limit of {limit}")]
    NestingTooDeep {
        script: String,
        depth: usize,
        limit: usize,
    },

    /// Engine failure that is not a guest exception.
    #[error("{script}: {message}")]
    Engine { script: String, message: String },
}

impl ScriptError {
    /// Name of the script the error is attributed to.
    pub fn script(&self) -> &str {
        match self {
            ScriptError::Compile(d) | ScriptError::Runtime(d) => &d.script,
            ScriptError::Resolution { referrer, .. } => referrer,
            ScriptError::Terminated { script }
            | ScriptError::NestingTooDeep { script, .. }
            | ScriptError::Engine { script, .. } => script,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, ScriptError::Terminated { .. })
    }

    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            ScriptError::Compile(d) | ScriptError::Runtime(d) => Some(d),
            _ => None,
        }
    }
}

/// Errors from loading or validating a [`WorkerConfig`](crate::WorkerConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Errors from a [`WorkerHandle`](crate::WorkerHandle).
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("Worker has shut down")]
    ShutDown,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Worker thread panicked")]
    ThreadPanic,

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}
