use crate::crm::CrmError;
use crate::import::batch::WritePhase;
use crate::models::EntityKind;
use thiserror::Error;

/// Errors raised by an import run.
///
/// `BulkLookup`, `Flush` and `Cancelled` abort the run. The remaining variants
/// are row-scoped: the scheduler logs them and moves on to the next row.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("bulk {kind} lookup failed: {source}")]
    BulkLookup {
        kind: EntityKind,
        #[source]
        source: CrmError,
    },
    #[error("flush of {phase} failed: {source}")]
    Flush {
        phase: WritePhase,
        #[source]
        source: CrmError,
    },
    #[error("row {row}: {source}")]
    Row {
        row: usize,
        #[source]
        source: CrmError,
    },
    #[error("row {row}: ambiguous {kind} match on {key}")]
    AmbiguousMatch {
        row: usize,
        kind: EntityKind,
        key: String,
    },
    #[error("sheet error: {0}")]
    Sheet(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("import cancelled")]
    Cancelled,
    #[error("{0}")]
    AlreadyRunning(String),
}

impl ImportError {
    /// Whether the error ends the whole run rather than a single row.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ImportError::Row { .. } | ImportError::AmbiguousMatch { .. }
        )
    }
}
