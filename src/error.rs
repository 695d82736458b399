use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::lifecycle::Stage;

/// Failure of a single external tool invocation.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} failed ({status}){}", diagnostic_suffix(.diagnostic))]
    Exit {
        program: String,
        status: String,
        diagnostic: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

fn diagnostic_suffix(diagnostic: &str) -> String {
    if diagnostic.is_empty() {
        String::new()
    } else {
        format!(": {}", diagnostic)
    }
}

impl ToolError {
    pub fn exit<P, S, D>(program: P, status: S, diagnostic: D) -> Self
    where
        P: Into<String>,
        S: std::fmt::Display,
        D: Into<String>,
    {
        Self::Exit {
            program: program.into(),
            status: status.to_string(),
            diagnostic: diagnostic.into().trim().to_string(),
        }
    }

    pub fn io(context: &'static str, source: io::Error) -> Self {
        Self::Io { context, source }
    }

    /// Captured diagnostic output of the tool, if it ran and failed.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::Exit { diagnostic, .. } if !diagnostic.is_empty() => Some(diagnostic),
            _ => None,
        }
    }
}

pub type ToolResult<T> = Result<T, ToolError>;

/// Settings that could not be loaded or do not hold.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("public key file does not exist: {}", .0.display())]
    MissingPublicKey(PathBuf),

    #[error("cannot locate the tool's own directory: {0}")]
    BaseDir(#[source] io::Error),
}

impl ConfigError {
    pub fn invalid<S: Into<String>>(key: &'static str, reason: S) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Fatal outcome of a provisioner lifecycle run.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to check if provisioner {name} exists: {source}")]
    Query {
        name: String,
        #[source]
        source: ToolError,
    },

    #[error("failed to delete existing provisioner {name}: {source}")]
    Delete {
        name: String,
        #[source]
        source: ToolError,
    },

    #[error("failed to decrypt private key {}: {source}", .path.display())]
    Decrypt {
        path: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("failed to add provisioner {name}: {source}")]
    Add {
        name: String,
        #[source]
        source: ToolError,
    },

    #[error(
        "failed to revoke provisioner {name}; it may still be registered on the CA \
         and must be removed by hand: {source}"
    )]
    Revoke {
        name: String,
        #[source]
        source: ToolError,
    },

    #[error("interrupted during {stage}")]
    Interrupted { stage: Stage },
}

impl LifecycleError {
    /// Step of the run that failed.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Config(_) => Stage::Start,
            Self::Query { .. } => Stage::CheckExisting,
            Self::Delete { .. } => Stage::DeleteExisting,
            Self::Decrypt { .. } | Self::Add { .. } => Stage::Add,
            Self::Revoke { .. } => Stage::DeleteFinal,
            Self::Interrupted { stage } => *stage,
        }
    }

    /// Whether the temporary credential may have been left on the CA.
    pub fn leaves_credential(&self) -> bool {
        match self {
            Self::Revoke { .. } => true,
            // The add may have gone through before the tool was killed.
            Self::Interrupted { stage } => *stage == Stage::Add,
            _ => false,
        }
    }

    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_)
            | Self::Query { .. }
            | Self::Delete { .. }
            | Self::Decrypt { .. }
            | Self::Add { .. }
            | Self::Revoke { .. }
            | Self::Interrupted { .. } => 1,
        }
    }
}

/// Result type alias using LifecycleError
pub type LifecycleResult<T> = Result<T, LifecycleError>;
