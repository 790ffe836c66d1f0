// ABOUTME: Changeset materialization - applies decoded change records to a target table
// ABOUTME: Staging, geometry conversion and the delete/insert transaction as an explicit state machine

pub mod postgres;
pub mod staging;

pub use postgres::PostgresMaterializer;
pub use staging::{dedupe_latest, StagingPlan};

use async_trait::async_trait;
use std::fmt;

use crate::changeset::ChangeRecord;
use crate::error::SyncError;
use crate::registry::DatasetDescriptor;

/// Where a materialization run stands.
///
/// Runs move forward through `Staged → GeomColumnEnsured → OldRowsDeleted →
/// NewRowsInserted → Committed`; any failure ends in `RolledBack`. Staging
/// cleanup follows either terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeState {
    Pending,
    Staged,
    GeomColumnEnsured,
    OldRowsDeleted,
    NewRowsInserted,
    Committed,
    RolledBack,
}

impl MaterializeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MaterializeState::Committed | MaterializeState::RolledBack)
    }

    /// Whether `next` may follow `self`.
    pub fn can_advance_to(&self, next: MaterializeState) -> bool {
        use MaterializeState::*;
        match (self, next) {
            (Pending, Staged)
            | (Staged, GeomColumnEnsured)
            | (GeomColumnEnsured, OldRowsDeleted)
            | (OldRowsDeleted, NewRowsInserted)
            | (NewRowsInserted, Committed) => true,
            (current, RolledBack) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for MaterializeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MaterializeState::Pending => "PENDING",
            MaterializeState::Staged => "STAGED",
            MaterializeState::GeomColumnEnsured => "GEOM_COLUMN_ENSURED",
            MaterializeState::OldRowsDeleted => "OLD_ROWS_DELETED",
            MaterializeState::NewRowsInserted => "NEW_ROWS_INSERTED",
            MaterializeState::Committed => "COMMITTED",
            MaterializeState::RolledBack => "ROLLED_BACK",
        };
        f.write_str(name)
    }
}

/// Tracks and logs state transitions of one run.
#[derive(Debug)]
pub struct StateTracker {
    dataset_id: i64,
    state: MaterializeState,
}

impl StateTracker {
    pub fn new(dataset_id: i64) -> Self {
        Self {
            dataset_id,
            state: MaterializeState::Pending,
        }
    }

    pub fn state(&self) -> MaterializeState {
        self.state
    }

    pub fn advance(&mut self, next: MaterializeState) {
        if !self.state.can_advance_to(next) {
            tracing::warn!(
                "Dataset {}: unexpected transition {} -> {}",
                self.dataset_id,
                self.state,
                next
            );
        }
        tracing::debug!("Dataset {}: {} -> {}", self.dataset_id, self.state, next);
        self.state = next;
    }
}

/// Counts reported by a successful materialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    /// Rows written to staging (after key deduplication)
    pub staged: u64,
    pub deleted: u64,
    pub inserted: u64,
}

/// Applies a non-empty changeset to the dataset's target table.
#[async_trait]
pub trait ChangesetSink: Send + Sync {
    /// Apply `records` atomically. On error nothing has changed in the target
    /// and no staging state remains.
    async fn apply(
        &self,
        descriptor: &DatasetDescriptor,
        records: &[ChangeRecord],
    ) -> Result<MaterializeReport, SyncError>;
}
