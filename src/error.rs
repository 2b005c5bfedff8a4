#![forbid(unsafe_code)]

//! Typed failures for the per-item pipeline. Setup and run-fatal errors stay
//! on `anyhow`; everything that can only sink a single item lives here.

use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Pipeline position of an item. `Persisted` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pending,
    Resolving,
    SkipCheck,
    Extracting,
    Reconciling,
    Persisted,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::SkipCheck => "skip-check",
            Self::Extracting => "extracting",
            Self::Reconciling => "reconciling",
            Self::Persisted => "persisted",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Persisted | Self::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure while driving an external tool process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error while supervising {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("interrupted")]
    Interrupted,
    #[error("{tool} did not finish within {secs}s")]
    TimedOut { tool: String, secs: u64 },
    #[error("{tool} exited with {status}{}", error_suffix(.last_error))]
    Failed {
        tool: String,
        status: ExitStatus,
        last_error: Option<String>,
    },
}

fn error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_deref()
        .map(|line| format!(": {line}"))
        .unwrap_or_default()
}

/// Why a single item ended up `Failed`.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("unrecognized video url {0}")]
    InvalidUrl(String),
    #[error("extraction failed: {0}")]
    Extraction(#[source] SupervisorError),
    #[error("no output file for {0} after a successful extraction")]
    MissingOutput(String),
    #[error("could not read {}: {source}", .path.display())]
    Inspect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not rescan output directory: {0:#}")]
    Rescan(anyhow::Error),
    #[error("platform metadata unavailable: {0:#}")]
    PlatformMetadata(anyhow::Error),
    #[error("could not persist metadata: {0:#}")]
    Persist(anyhow::Error),
    #[error("interrupted")]
    Interrupted,
}

impl ItemError {
    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            Self::Interrupted | Self::Extraction(SupervisorError::Interrupted)
        )
    }
}

impl From<SupervisorError> for ItemError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::Interrupted => Self::Interrupted,
            other => Self::Extraction(other),
        }
    }
}
