//! The idempotency ledger: which (step, lineage id) units are finished.
//!
//! # Overview
//!
//! Every unit of work a step performs is keyed by `(step_name, id)`, where
//! `id` is the step's own derived lineage id (its base, without any fan-out
//! index). The ledger is the single source of truth for whether that unit
//! has been done.
//!
//! # The Contract
//!
//! 1. **Claim before work.** [`Ledger::try_claim`] atomically inspects the
//!    record. Exactly one concurrent caller per key receives
//!    [`ClaimOutcome::Proceed`] within a process lifetime.
//!
//! 2. **Commit is final.** [`Ledger::commit`] stores the step's outputs
//!    (and optionally a history snapshot) and marks the unit `done`.
//!    Committing a unit that is already done is a no-op.
//!
//! 3. **Rollback releases.** [`Ledger::rollback`] drops an in-progress
//!    claim so the unit can be retried.
//!
//! 4. **Crash = retry.** A claim that was never committed or rolled back
//!    (the process died) is released by [`Ledger::release_stale_claims`],
//!    which the coordinator calls before starting any worker.
//!
//! # What This Guarantees
//!
//! - At-least-once execution of step bodies across crashes.
//! - Exactly-once committed effect: a `done` unit is never recomputed, and
//!   its committed outputs are replayed instead.
//!
//! # Backends
//!
//! - [`MemoryLedger`] - in-process, for tests and throwaway runs
//! - [`SqliteLedger`] - durable, file-backed (requires `sqlite` feature)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CascadeError, Result};
use crate::history::History;
use crate::lineage::LineageId;

pub use memory::MemoryLedger;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLedger;

// =============================================================================
// Records
// =============================================================================

/// Lifecycle state of a ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// Claimed by a worker in this process, not yet finished.
    InProgress,
    /// Finished; the outputs are final.
    Done,
}

impl LedgerStatus {
    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::InProgress => "in_progress",
            LedgerStatus::Done => "done",
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerStatus {
    type Err = CascadeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(LedgerStatus::InProgress),
            "done" => Ok(LedgerStatus::Done),
            other => Err(CascadeError::store(format!("unknown ledger status {other:?}"))),
        }
    }
}

/// One unit of work as recorded by the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRecord {
    /// Step that owns the unit.
    pub step_name: String,
    /// The unit's lineage id (base form, no fan-out index).
    pub lineage_id: LineageId,
    /// Whether the unit is finished.
    pub status: LedgerStatus,
    /// Outputs in emission order. Empty when the step produced nothing.
    pub outputs: Vec<Value>,
    /// Ancestor payloads the step saw, for steps that request history.
    pub history: Option<History>,
    /// When the unit was claimed.
    pub claimed_at: DateTime<Utc>,
    /// When the unit was committed.
    pub committed_at: Option<DateTime<Utc>>,
}

impl LedgerRecord {
    /// A fresh in-progress claim.
    pub fn claimed(step_name: &str, lineage_id: &LineageId) -> Self {
        Self {
            step_name: step_name.to_string(),
            lineage_id: lineage_id.clone(),
            status: LedgerStatus::InProgress,
            outputs: Vec::new(),
            history: None,
            claimed_at: Utc::now(),
            committed_at: None,
        }
    }

    /// Whether the unit is finished.
    pub fn is_done(&self) -> bool {
        self.status == LedgerStatus::Done
    }
}

/// Result of [`Ledger::try_claim`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller owns the unit and must commit or roll it back.
    Proceed,
    /// The unit was finished earlier; its record is attached.
    AlreadyDone(LedgerRecord),
    /// Another worker in this process holds the claim.
    InFlight,
}

// =============================================================================
// Ledger
// =============================================================================

/// Persistent idempotency record store keyed by `(step_name, lineage id)`.
///
/// Implementations must make `try_claim`, `commit` and `rollback` atomic
/// with respect to each other for the same key.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Atomically claim a unit for processing.
    async fn try_claim(&self, step_name: &str, id: &LineageId) -> Result<ClaimOutcome>;

    /// Mark a unit done with its outputs. No-op if already done.
    async fn commit(
        &self,
        step_name: &str,
        id: &LineageId,
        outputs: &[Value],
        history: Option<&History>,
    ) -> Result<()>;

    /// Release an in-progress claim. Done records are left untouched.
    async fn rollback(&self, step_name: &str, id: &LineageId) -> Result<()>;

    /// Fetch the record for a unit, if any.
    async fn lookup(&self, step_name: &str, id: &LineageId) -> Result<Option<LedgerRecord>>;

    /// All records owned by `step_name`.
    async fn records(&self, step_name: &str) -> Result<Vec<LedgerRecord>>;

    /// Drop every in-progress claim left behind by an earlier process.
    ///
    /// Returns the number of claims released.
    async fn release_stale_claims(&self) -> Result<u64>;

    /// Number of done records owned by `step_name`.
    async fn count_done(&self, step_name: &str) -> Result<usize> {
        Ok(self
            .records(step_name)
            .await?
            .iter()
            .filter(|r| r.is_done())
            .count())
    }
}
