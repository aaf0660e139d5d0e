use crate::cache::CacheError;
use crate::covariates::CovariateError;
use crate::linalg::faer_ndarray::FaerLinalgError;
use crate::volume::VolumeError;
use std::path::PathBuf;
use thiserror::Error;

/// Failure class, used by operators to tell bad data apart from bad orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unrecognized tags, malformed payloads, phases invoked out of order.
    Protocol,
    /// Too few usable subjects, disagreeing shapes, non-finite statistics.
    DataInsufficiency,
    /// File system and cache failures.
    Environment,
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Environment => 1,
            ErrorKind::Protocol => 2,
            ErrorKind::DataInsufficiency => 3,
        }
    }
}

/// A comprehensive error type for a single phase invocation.
#[derive(Error)]
pub enum PhaseError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Protocol error: '{phase}' payload does not match its schema: {source}")]
    Schema {
        phase: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Insufficient data: {0}")]
    DataInsufficiency(String),

    #[error(
        "Insufficient data: {statistic} is not finite at row {row}, column {col}; refusing to emit it"
    )]
    NonFiniteStatistic {
        statistic: &'static str,
        row: usize,
        col: usize,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Covariate(#[from] CovariateError),

    #[error("Linear system solve failed: {0}")]
    Linalg(#[from] FaerLinalgError),

    #[error("I/O failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PhaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PhaseError::Protocol(_) | PhaseError::Schema { .. } => ErrorKind::Protocol,
            PhaseError::DataInsufficiency(_) | PhaseError::NonFiniteStatistic { .. } => {
                ErrorKind::DataInsufficiency
            }
            // A missing entry means an earlier phase never ran at this site.
            PhaseError::Cache(CacheError::Missing(_)) => ErrorKind::Protocol,
            PhaseError::Cache(_) => ErrorKind::Environment,
            PhaseError::Covariate(CovariateError::NoSubjects) => ErrorKind::DataInsufficiency,
            PhaseError::Covariate(_) => ErrorKind::Protocol,
            PhaseError::Volume(VolumeError::ShapeMismatch { .. } | VolumeError::Oversized { .. }) => {
                ErrorKind::DataInsufficiency
            }
            PhaseError::Volume(_) => ErrorKind::Environment,
            PhaseError::Linalg(_) => ErrorKind::DataInsufficiency,
            PhaseError::Io { .. } => ErrorKind::Environment,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

// Ensure Debug prints the same readable message as Display, so `main` returning an
// error shows a helpful message instead of a struct dump.
impl core::fmt::Debug for PhaseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self}")
    }
}
