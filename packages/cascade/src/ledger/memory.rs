//! In-memory ledger for tests and throwaway runs.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::Result;
use crate::history::History;
use crate::ledger::{ClaimOutcome, Ledger, LedgerRecord, LedgerStatus};
use crate::lineage::LineageId;

type Key = (String, String);

fn key(step_name: &str, id: &LineageId) -> Key {
    (step_name.to_string(), id.to_string())
}

/// In-memory idempotency ledger.
///
/// Claims are atomic per key through the map's entry API. Data is lost when
/// the ledger is dropped, but one instance can be shared by several
/// coordinator runs to simulate a restart: the coordinator releases stale
/// in-progress claims before starting.
#[derive(Default)]
pub struct MemoryLedger {
    records: DashMap<Key, LedgerRecord>,
}

impl MemoryLedger {
    /// Create a new empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records, in any state.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the ledger holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Clear all stored data.
    pub fn clear(&self) {
        self.records.clear();
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn try_claim(&self, step_name: &str, id: &LineageId) -> Result<ClaimOutcome> {
        match self.records.entry(key(step_name, id)) {
            Entry::Occupied(entry) => match entry.get().status {
                LedgerStatus::Done => Ok(ClaimOutcome::AlreadyDone(entry.get().clone())),
                LedgerStatus::InProgress => Ok(ClaimOutcome::InFlight),
            },
            Entry::Vacant(entry) => {
                entry.insert(LedgerRecord::claimed(step_name, id));
                Ok(ClaimOutcome::Proceed)
            }
        }
    }

    async fn commit(
        &self,
        step_name: &str,
        id: &LineageId,
        outputs: &[Value],
        history: Option<&History>,
    ) -> Result<()> {
        let mut record = self
            .records
            .entry(key(step_name, id))
            .or_insert_with(|| LedgerRecord::claimed(step_name, id));

        if record.is_done() {
            return Ok(());
        }

        record.status = LedgerStatus::Done;
        record.outputs = outputs.to_vec();
        record.history = history.cloned();
        record.committed_at = Some(Utc::now());
        Ok(())
    }

    async fn rollback(&self, step_name: &str, id: &LineageId) -> Result<()> {
        self.records
            .remove_if(&key(step_name, id), |_, record| !record.is_done());
        Ok(())
    }

    async fn lookup(&self, step_name: &str, id: &LineageId) -> Result<Option<LedgerRecord>> {
        Ok(self
            .records
            .get(&key(step_name, id))
            .map(|entry| entry.value().clone()))
    }

    async fn records(&self, step_name: &str) -> Result<Vec<LedgerRecord>> {
        let mut records: Vec<LedgerRecord> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == step_name)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|r| r.lineage_id.to_string());
        Ok(records)
    }

    async fn release_stale_claims(&self) -> Result<u64> {
        let before = self.records.len();
        self.records.retain(|_, record| record.is_done());
        Ok((before - self.records.len()) as u64)
    }
}
