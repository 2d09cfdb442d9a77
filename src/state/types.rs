//! Rollout history types.
//!
//! Records are appended per environment and linked through
//! `previous_record_id`; only the result state of the head record ever
//! changes after it is written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Environment;
use crate::error::StateError;
use crate::manifest::ManifestSet;
use crate::planner::Action;

/// Current version of the history format.
pub const HISTORY_VERSION: &str = "1.0";

/// Outcome of a rollout attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    /// Applying or monitoring; also what a crash leaves behind.
    InProgress,
    /// All workloads became healthy.
    Succeeded,
    /// The rollout and its rollback both failed.
    Failed,
    /// The rollout failed and the rollback settled.
    RolledBack,
}

impl ResultState {
    /// Returns true once the record can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// What a record was created for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordKind {
    /// A regular deploy of a rendered manifest.
    Deploy,
    /// An explicit rollback of an earlier record.
    Rollback {
        /// Record being rolled back.
        of: String,
    },
}

/// A single rollout attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolloutRecord {
    /// Unique record id.
    pub id: String,
    /// Environment.
    pub environment: Environment,
    /// Plan the rollout executed.
    pub plan_id: String,
    /// Deploy or rollback.
    pub kind: RecordKind,
    /// When applying started.
    pub applied_at: DateTime<Utc>,
    /// When the record was finalized.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Current result.
    pub result_state: ResultState,
    /// Record that was head when this one was appended.
    #[serde(default)]
    pub previous_record_id: Option<String>,
    /// Digest of the target manifest.
    pub manifest_digest: String,
    /// Target manifest, with pinned secret references only.
    pub manifest: ManifestSet,
    /// Planned actions, redacted.
    pub actions: Vec<Action>,
    /// Failure description for unsuccessful rollouts.
    #[serde(default)]
    pub error: Option<String>,
}

impl RolloutRecord {
    /// Creates an in-progress record.
    #[must_use]
    pub fn begin(
        environment: Environment,
        plan_id: impl Into<String>,
        kind: RecordKind,
        previous_record_id: Option<String>,
        manifest: ManifestSet,
        actions: Vec<Action>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            environment,
            plan_id: plan_id.into(),
            kind,
            applied_at: Utc::now(),
            completed_at: None,
            result_state: ResultState::InProgress,
            previous_record_id,
            manifest_digest: manifest.digest(),
            manifest,
            actions,
            error: None,
        }
    }

    /// Time of the latest write to this record.
    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.applied_at)
    }

    /// Short id for display.
    #[must_use]
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }
}

/// The append-only history of one environment, oldest record first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryLog {
    /// History format version.
    pub version: String,
    /// Environment.
    pub environment: Environment,
    /// Records in append order.
    pub records: Vec<RolloutRecord>,
    /// When the log was last written.
    pub last_updated: DateTime<Utc>,
}

impl HistoryLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new(environment: Environment) -> Self {
        Self {
            version: HISTORY_VERSION.to_string(),
            environment,
            records: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Checks the format version and environment of a loaded log.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VersionMismatch`] or [`StateError::Corrupted`].
    pub fn check(&self, environment: Environment) -> Result<(), StateError> {
        if self.version != HISTORY_VERSION {
            return Err(StateError::VersionMismatch {
                expected: HISTORY_VERSION.to_string(),
                found: self.version.clone(),
            });
        }
        if self.environment != environment {
            return Err(StateError::Corrupted {
                message: format!("history for {} found where {environment} was expected", self.environment),
            });
        }
        Ok(())
    }

    /// Appends a record.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Corrupted`] if the record belongs to another
    /// environment or its id is already present.
    pub fn append(&mut self, record: RolloutRecord) -> Result<(), StateError> {
        if record.environment != self.environment {
            return Err(StateError::Corrupted {
                message: format!(
                    "record {} for {} appended to {} history",
                    record.id, record.environment, self.environment
                ),
            });
        }
        if self.get(&record.id).is_some() {
            return Err(StateError::Corrupted {
                message: format!("duplicate record id {}", record.id),
            });
        }
        self.records.push(record);
        self.last_updated = Utc::now();
        Ok(())
    }

    /// Moves an in-progress record to a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::RecordNotFound`] for unknown ids and
    /// [`StateError::RecordFinalized`] if the record is already terminal or
    /// `state` is not terminal.
    pub fn finalize(
        &mut self,
        record_id: &str,
        state: ResultState,
        error: Option<String>,
    ) -> Result<RolloutRecord, StateError> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| StateError::RecordNotFound {
                record_id: record_id.to_string(),
            })?;

        if record.result_state.is_terminal() || !state.is_terminal() {
            return Err(StateError::RecordFinalized {
                record_id: record_id.to_string(),
                state: record.result_state.to_string(),
            });
        }

        record.result_state = state;
        record.completed_at = Some(Utc::now());
        record.error = error;
        let finalized = record.clone();
        self.last_updated = Utc::now();
        Ok(finalized)
    }

    /// Most recently appended record.
    #[must_use]
    pub fn head(&self) -> Option<&RolloutRecord> {
        self.records.last()
    }

    /// Record by id.
    #[must_use]
    pub fn get(&self, record_id: &str) -> Option<&RolloutRecord> {
        self.records.iter().find(|r| r.id == record_id)
    }

    /// Up to `limit` records, most recent first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<RolloutRecord> {
        self.records.iter().rev().take(limit).cloned().collect()
    }

    /// Latest `Succeeded` record appended before `before` (or overall when
    /// `before` is `None`). An unknown `before` id yields `None`.
    #[must_use]
    pub fn last_succeeded(&self, before: Option<&str>) -> Option<&RolloutRecord> {
        let end = match before {
            Some(id) => self.records.iter().position(|r| r.id == id)?,
            None => self.records.len(),
        };
        self.records[..end]
            .iter()
            .rev()
            .find(|r| r.result_state == ResultState::Succeeded)
    }
}

impl std::fmt::Display for ResultState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        };
        write!(f, "{state}")
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deploy => write!(f, "deploy"),
            Self::Rollback { of } => write!(f, "rollback of {}", of.get(..8).unwrap_or(of)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(state: ResultState) -> RolloutRecord {
        let mut record = RolloutRecord::begin(
            Environment::Dev,
            "plan",
            RecordKind::Deploy,
            None,
            ManifestSet::empty(Environment::Dev),
            vec![],
        );
        record.result_state = state;
        record
    }

    #[test]
    fn test_finalize_exactly_once() {
        let mut log = HistoryLog::new(Environment::Dev);
        let r = record(ResultState::InProgress);
        let id = r.id.clone();
        log.append(r).unwrap();

        let done = log.finalize(&id, ResultState::Succeeded, None).unwrap();
        assert_eq!(done.result_state, ResultState::Succeeded);
        assert!(done.completed_at.is_some());

        let err = log.finalize(&id, ResultState::Failed, None).unwrap_err();
        assert!(matches!(err, StateError::RecordFinalized { .. }));
        assert!(matches!(
            log.finalize("missing", ResultState::Failed, None),
            Err(StateError::RecordNotFound { .. })
        ));
    }

    #[test]
    fn test_finalize_rejects_non_terminal_target() {
        let mut log = HistoryLog::new(Environment::Dev);
        let r = record(ResultState::InProgress);
        let id = r.id.clone();
        log.append(r).unwrap();
        assert!(log.finalize(&id, ResultState::InProgress, None).is_err());
    }

    #[test]
    fn test_head_recent_and_last_succeeded() {
        let mut log = HistoryLog::new(Environment::Dev);
        let first = record(ResultState::Succeeded);
        let second = record(ResultState::RolledBack);
        let third = record(ResultState::Succeeded);
        let (first_id, third_id) = (first.id.clone(), third.id.clone());
        log.append(first).unwrap();
        log.append(second).unwrap();
        log.append(third).unwrap();

        assert_eq!(log.head().unwrap().id, third_id);
        assert_eq!(log.recent(2).len(), 2);
        assert_eq!(log.recent(2)[0].id, third_id);
        assert_eq!(log.last_succeeded(None).unwrap().id, third_id);
        assert_eq!(log.last_succeeded(Some(&third_id)).unwrap().id, first_id);
        assert!(log.last_succeeded(Some(&first_id)).is_none());
        assert!(log.last_succeeded(Some("no-such-record")).is_none());
    }

    #[test]
    fn test_append_rejects_other_environment_and_duplicates() {
        let mut log = HistoryLog::new(Environment::Prod);
        assert!(log.append(record(ResultState::InProgress)).is_err());

        let mut log = HistoryLog::new(Environment::Dev);
        let r = record(ResultState::Succeeded);
        log.append(r.clone()).unwrap();
        assert!(log.append(r).is_err());
    }

    #[test]
    fn test_round_trip_json() {
        let mut log = HistoryLog::new(Environment::Dev);
        let mut r = record(ResultState::InProgress);
        r.kind = RecordKind::Rollback { of: String::from("abc") };
        log.append(r).unwrap();

        let json = serde_json::to_string(&log).unwrap();
        let parsed: HistoryLog = serde_json::from_str(&json).unwrap();
        parsed.check(Environment::Dev).unwrap();
        assert_eq!(parsed.records, log.records);
        assert!(parsed.check(Environment::Stage).is_err());
    }
}
