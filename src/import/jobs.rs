//! Progress tracking and cancellation for an import run.

use crate::import::stats::ImportStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImportStatus {
    Idle,
    Preparing,
    Indexing,
    FirstPass,
    SecondPass,
    Dependents,
    Completed,
    Error,
    Cancelled,
}

impl ImportStatus {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ImportStatus::Preparing
                | ImportStatus::Indexing
                | ImportStatus::FirstPass
                | ImportStatus::SecondPass
                | ImportStatus::Dependents
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportProgress {
    pub current_step: String,
    pub phase_details: Option<String>,
    pub processed: usize,
    pub total: Option<usize>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJobState {
    pub id: String,
    pub status: ImportStatus,
    pub progress: ImportProgress,
    pub stats: Option<ImportStats>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Default for ImportJobState {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: ImportStatus::Idle,
            progress: ImportProgress::default(),
            stats: None,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }
}

/// Shared handle to one run's state. Cloning shares the state and the token.
#[derive(Clone)]
pub struct ImportJob {
    pub state: Arc<Mutex<ImportJobState>>,
    pub cancellation_token: CancellationToken,
}

impl ImportJob {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ImportJobState::default())),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub async fn get_state(&self) -> ImportJobState {
        self.state.lock().await.clone()
    }

    pub async fn start_job(&self) -> Result<String, String> {
        let mut state = self.state.lock().await;

        if state.status.is_running() {
            return Err("An import is already running".to_string());
        }

        let job_id = Uuid::new_v4().to_string();
        *state = ImportJobState {
            id: job_id.clone(),
            status: ImportStatus::Preparing,
            progress: ImportProgress {
                current_step: "Starting import...".to_string(),
                ..Default::default()
            },
            stats: Some(ImportStats::default()),
            started_at: Some(Utc::now()),
            completed_at: None,
            error_message: None,
        };

        Ok(job_id)
    }

    pub async fn update_status(&self, status: ImportStatus, step: String) {
        let mut state = self.state.lock().await;
        state.status = status;
        state.progress.current_step = step;
    }

    pub async fn update_phase_details(&self, details: String) {
        let mut state = self.state.lock().await;
        state.progress.phase_details = Some(details);
    }

    pub async fn update_progress(&self, processed: usize, total: Option<usize>) {
        let mut state = self.state.lock().await;
        state.progress.processed = processed;
        state.progress.total = total;
    }

    pub async fn add_error(&self, error: String) {
        let mut state = self.state.lock().await;
        state.progress.errors.push(error);
    }

    pub async fn add_warning(&self, warning: String) {
        let mut state = self.state.lock().await;
        state.progress.warnings.push(warning);
    }

    pub async fn update_stats<F>(&self, updater: F)
    where
        F: FnOnce(&mut ImportStats),
    {
        let mut state = self.state.lock().await;
        if let Some(stats) = &mut state.stats {
            updater(stats);
        }
    }

    pub async fn complete_job(&self) {
        let mut state = self.state.lock().await;
        state.status = ImportStatus::Completed;
        state.completed_at = Some(Utc::now());
    }

    pub async fn fail_job(&self, error: String) {
        let mut state = self.state.lock().await;
        state.status = ImportStatus::Error;
        state.error_message = Some(error);
        state.completed_at = Some(Utc::now());
    }

    pub async fn cancel_job(&self) {
        self.cancellation_token.cancel();
        let mut state = self.state.lock().await;
        state.status = ImportStatus::Cancelled;
        state.completed_at = Some(Utc::now());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

impl Default for ImportJob {
    fn default() -> Self {
        Self::new()
    }
}
