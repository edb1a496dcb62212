//! Persistence seam for disbursement records and the step log.
//!
//! [`crate::db::SqliteStore`] is the production implementation;
//! [`MemoryStore`] keeps everything in process and is what embedders without
//! a database (and the test suite) use.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::Result;
use crate::types::{DisbursementTransaction, MilestoneId, StepEvent, StepEventRecord};

#[async_trait]
pub trait DisbursementStore: Send + Sync {
    /// Load the record for a milestone, if one was ever created.
    async fn load(&self, milestone_id: MilestoneId) -> Result<Option<DisbursementTransaction>>;

    /// Insert or update a record. Retired records are never overwritten.
    async fn save(&self, record: &DisbursementTransaction) -> Result<()>;

    /// Append events to the step log, preserving their order.
    async fn append_events(&self, events: &[StepEvent]) -> Result<()>;

    /// Step log for a milestone in emission order.
    async fn events(&self, milestone_id: MilestoneId) -> Result<Vec<StepEventRecord>>;
}

#[derive(Default)]
struct MemoryInner {
    records: HashMap<MilestoneId, DisbursementTransaction>,
    events: Vec<StepEventRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DisbursementStore for MemoryStore {
    async fn load(&self, milestone_id: MilestoneId) -> Result<Option<DisbursementTransaction>> {
        Ok(self.inner.lock().await.records.get(&milestone_id).cloned())
    }

    async fn save(&self, record: &DisbursementTransaction) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.records.get(&record.milestone_id) {
            Some(existing) if existing.retired => {}
            _ => {
                inner.records.insert(record.milestone_id, record.clone());
            }
        }
        Ok(())
    }

    async fn append_events(&self, events: &[StepEvent]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let now = chrono::Utc::now().timestamp();
        for event in events {
            let id = inner.events.len() as i64 + 1;
            inner.events.push(StepEventRecord {
                id,
                event: event.clone(),
                created_at: now,
            });
        }
        Ok(())
    }

    async fn events(&self, milestone_id: MilestoneId) -> Result<Vec<StepEventRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .events
            .iter()
            .filter(|r| r.event.milestone_id == milestone_id)
            .cloned()
            .collect())
    }
}
