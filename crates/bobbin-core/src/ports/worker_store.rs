//! WorkerStore port - worker records owned by the registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::StoreError;
use crate::domain::{Capabilities, WorkerId, WorkerRecord};

#[async_trait]
pub trait WorkerStore: Send + Sync {
    /// Create or update a worker; capabilities are replaced and the
    /// heartbeat is set to `now`.
    async fn upsert(
        &self,
        id: &WorkerId,
        capabilities: &Capabilities,
        now: DateTime<Utc>,
    ) -> Result<WorkerRecord, StoreError>;

    /// Record a heartbeat. Returns false for unknown workers.
    async fn touch(&self, id: &WorkerId, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn get(&self, id: &WorkerId) -> Result<Option<WorkerRecord>, StoreError>;

    async fn list(&self) -> Result<Vec<WorkerRecord>, StoreError>;
}
