//! Trait seams between the pipeline and its collaborators.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    ClassificationResult, Job, JobCounts, NewTransaction, TransactionFacts, TransactionPatch,
    TransactionRecord,
};

/// Durable home for categorization jobs; the single source of truth for which
/// job any worker may act on.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `Pending` job. Safe to call repeatedly for the same
    /// transaction; duplicate completions are harmless because apply is
    /// idempotent.
    async fn enqueue(
        &self,
        transaction_id: Uuid,
        payload: TransactionFacts,
        priority: i32,
    ) -> Result<Uuid>;

    /// Atomically claim the most urgent eligible job (priority ascending,
    /// then FIFO): `Pending`/`Failed` past its backoff gate, or `Leased` with
    /// an expired lease. No two concurrent callers may receive the same job.
    /// Returns the job with its lease (and token) set.
    async fn lease(&self, worker_id: &str, lease_for: Duration) -> Result<Option<Job>>;

    /// Transition `Leased` → `Succeeded`. Guarded by the lease token; a stale
    /// holder gets `Error::LeaseLost`.
    async fn complete(&self, job_id: Uuid, lease_token: Uuid) -> Result<()>;

    /// Record a failed try. Increments `attempt`; below the attempt budget
    /// the job returns to the retry pool with an exponential backoff gate,
    /// otherwise it is dead-lettered with `last_error` recorded. Guarded by
    /// the lease token.
    async fn fail(&self, job_id: Uuid, lease_token: Uuid, error: &str) -> Result<()>;

    /// Fetch a job by id.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Job counts by state, for observability.
    async fn counts(&self) -> Result<JobCounts>;

    /// Remove terminal jobs older than `retention`. Returns how many were
    /// removed.
    async fn purge_terminal(&self, retention: Duration) -> Result<u64>;
}

/// Read/update access to transaction records. The pipeline never overwrites a
/// whole record; all writes go through the targeted `update_fields`.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert(&self, new: NewTransaction) -> Result<TransactionRecord>;

    async fn get(&self, id: Uuid) -> Result<Option<TransactionRecord>>;

    /// Apply a targeted partial update. Returns `false` if the transaction no
    /// longer exists (deleted after enqueue) — callers treat that as a no-op.
    async fn update_fields(&self, id: Uuid, patch: TransactionPatch) -> Result<bool>;
}

/// One synchronous request/response call to the external classification
/// service. Implementations absorb business-level failures (unreachable
/// service, missing credential, malformed reply) into a fallback result;
/// only unknown-outcome conditions such as timeouts surface as errors, and
/// retry policy belongs to the worker, never the client.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, facts: &TransactionFacts) -> Result<ClassificationResult>;
}
