//! In-memory store implementations.
//!
//! A single async mutex over a map makes every job state transition atomic
//! with respect to concurrent `lease`/`complete`/`fail` callers, which is the
//! whole correctness story for the lease invariant. Used by tests and by
//! local runs without a database configured.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use tally_core::{
    Error, Job, JobCounts, JobLease, JobState, JobStore, JobStoreConfig, NewTransaction, Result,
    TransactionFacts, TransactionPatch, TransactionRecord, TransactionStore,
};

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}

/// In-memory [`JobStore`].
pub struct MemoryJobStore {
    config: JobStoreConfig,
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new(config: JobStoreConfig) -> Self {
        Self {
            config,
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(JobStoreConfig::default())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(
        &self,
        transaction_id: Uuid,
        payload: TransactionFacts,
        priority: i32,
    ) -> Result<Uuid> {
        let job = Job {
            id: Uuid::now_v7(),
            transaction_id,
            payload,
            priority,
            attempt: 0,
            max_attempts: self.config.max_attempts,
            state: JobState::Pending,
            lease: None,
            not_before: None,
            created_at: Utc::now(),
            finished_at: None,
            last_error: None,
        };
        let id = job.id;
        self.jobs.lock().await.insert(id, job);
        debug!(
            subsystem = "db",
            component = "memory_jobs",
            op = "enqueue",
            job_id = %id,
            transaction_id = %transaction_id,
            priority,
            "Job enqueued"
        );
        Ok(id)
    }

    async fn lease(&self, worker_id: &str, lease_for: Duration) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;

        // Most urgent eligible job: priority ascending, then FIFO. UUIDv7 ids
        // are time-ordered, so the id is a stable FIFO tiebreaker.
        let candidate = jobs
            .values()
            .filter(|j| j.is_eligible(now))
            .min_by_key(|j| (j.priority, j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| Error::Internal("candidate vanished under lock".to_string()))?;
        job.state = JobState::Leased;
        job.not_before = None;
        job.lease = Some(JobLease {
            worker_id: worker_id.to_string(),
            token: Uuid::new_v4(),
            expires_at: now + chrono_duration(lease_for),
        });
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job_id: Uuid, lease_token: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;
        match &job.lease {
            Some(lease) if job.state == JobState::Leased && lease.token == lease_token => {
                job.state = JobState::Succeeded;
                job.lease = None;
                job.finished_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(Error::LeaseLost { job_id }),
        }
    }

    async fn fail(&self, job_id: Uuid, lease_token: Uuid, error: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;
        let holds_lease = matches!(
            &job.lease,
            Some(lease) if job.state == JobState::Leased && lease.token == lease_token
        );
        if !holds_lease {
            return Err(Error::LeaseLost { job_id });
        }

        job.attempt += 1;
        job.lease = None;
        job.last_error = Some(error.to_string());
        if job.attempt < job.max_attempts {
            job.state = JobState::Failed;
            job.not_before = Some(Utc::now() + chrono_duration(self.config.backoff_delay(job.attempt)));
        } else {
            job.state = JobState::DeadLettered;
            job.not_before = None;
            job.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.lock().await.get(&job_id).cloned())
    }

    async fn counts(&self) -> Result<JobCounts> {
        let jobs = self.jobs.lock().await;
        let mut counts = JobCounts::default();
        for job in jobs.values() {
            match job.state {
                JobState::Pending => counts.pending += 1,
                JobState::Leased => counts.leased += 1,
                JobState::Succeeded => counts.succeeded += 1,
                JobState::Failed => counts.failed += 1,
                JobState::DeadLettered => counts.dead_lettered += 1,
            }
        }
        Ok(counts)
    }

    async fn purge_terminal(&self, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono_duration(retention);
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.state.is_terminal() && job.finished_at.map(|t| t <= cutoff).unwrap_or(false))
        });
        Ok((before - jobs.len()) as u64)
    }
}

/// In-memory [`TransactionStore`].
#[derive(Default)]
pub struct MemoryTransactionStore {
    transactions: Mutex<HashMap<Uuid, TransactionRecord>>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a transaction outright. Test hook for the deleted-after-enqueue
    /// path; the HTTP surface has no delete.
    pub async fn remove(&self, id: Uuid) -> bool {
        self.transactions.lock().await.remove(&id).is_some()
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn insert(&self, new: NewTransaction) -> Result<TransactionRecord> {
        let now = Utc::now();
        let record = TransactionRecord {
            id: Uuid::now_v7(),
            org_id: new.org_id,
            description: new.description,
            amount: new.amount,
            merchant: new.merchant,
            occurred_at: new.occurred_at,
            category: new.category,
            metadata: new
                .metadata
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            created_at: now,
            updated_at: now,
        };
        self.transactions
            .lock()
            .await
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<TransactionRecord>> {
        Ok(self.transactions.lock().await.get(&id).cloned())
    }

    async fn update_fields(&self, id: Uuid, patch: TransactionPatch) -> Result<bool> {
        let mut transactions = self.transactions.lock().await;
        let Some(record) = transactions.get_mut(&id) else {
            return Ok(false);
        };
        if let Some(category) = patch.category {
            record.category = Some(category);
        }
        if let Some(overlay) = &patch.metadata_merge {
            record.metadata = tally_core::merge_metadata(&record.metadata, overlay);
        }
        record.updated_at = Utc::now();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn facts(description: &str) -> TransactionFacts {
        TransactionFacts {
            amount: 10.0,
            description: description.to_string(),
            merchant: None,
            date: None,
            metadata: None,
        }
    }

    fn fast_config() -> JobStoreConfig {
        JobStoreConfig {
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(20),
            retry_max_delay: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_lease_orders_by_priority_then_fifo() {
        let store = MemoryJobStore::default();
        let txn = Uuid::now_v7();
        let low = store.enqueue(txn, facts("background"), 9).await.unwrap();
        let first_bulk = store.enqueue(txn, facts("bulk-1"), 5).await.unwrap();
        let second_bulk = store.enqueue(txn, facts("bulk-2"), 5).await.unwrap();
        let manual = store.enqueue(txn, facts("manual"), 1).await.unwrap();

        let order: Vec<Uuid> = {
            let mut leased = Vec::new();
            for _ in 0..4 {
                let job = store
                    .lease("worker-0", Duration::from_secs(30))
                    .await
                    .unwrap()
                    .unwrap();
                leased.push(job.id);
            }
            leased
        };
        assert_eq!(order, vec![manual, first_bulk, second_bulk, low]);
    }

    #[tokio::test]
    async fn test_lease_returns_none_when_empty() {
        let store = MemoryJobStore::default();
        let leased = store.lease("worker-0", Duration::from_secs(30)).await.unwrap();
        assert!(leased.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_lease_never_double_claims() {
        let store = Arc::new(MemoryJobStore::default());
        let txn = Uuid::now_v7();
        for i in 0..4 {
            store
                .enqueue(txn, facts(&format!("job-{i}")), 5)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for worker in 0..12 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .lease(&format!("worker-{worker}"), Duration::from_secs(30))
                    .await
                    .unwrap()
                    .map(|job| job.id)
            }));
        }

        let mut leased = Vec::new();
        for handle in handles {
            if let Some(id) = handle.await.unwrap() {
                leased.push(id);
            }
        }
        let mut unique = leased.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(leased.len(), 4, "exactly the 4 jobs get leased");
        assert_eq!(unique.len(), leased.len(), "no job leased twice");
    }

    #[tokio::test]
    async fn test_complete_transitions_to_succeeded() {
        let store = MemoryJobStore::default();
        store.enqueue(Uuid::now_v7(), facts("x"), 5).await.unwrap();
        let job = store
            .lease("worker-0", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let token = job.lease.as_ref().unwrap().token;
        store.complete(job.id, token).await.unwrap();

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Succeeded);
        assert!(stored.lease.is_none());
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_complete_with_stale_token_is_lease_lost() {
        let store = MemoryJobStore::default();
        store.enqueue(Uuid::now_v7(), facts("x"), 5).await.unwrap();
        let job = store
            .lease("worker-0", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let err = store.complete(job.id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::LeaseLost { .. }));
        // Job remains leased by the real holder.
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Leased);
    }

    #[tokio::test]
    async fn test_fail_schedules_backoff_then_becomes_leasable() {
        let store = MemoryJobStore::new(fast_config());
        store.enqueue(Uuid::now_v7(), facts("x"), 5).await.unwrap();
        let job = store
            .lease("worker-0", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let token = job.lease.as_ref().unwrap().token;
        store.fail(job.id, token, "service hiccup").await.unwrap();

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.attempt, 1);
        assert_eq!(stored.last_error.as_deref(), Some("service hiccup"));
        assert!(stored.not_before.is_some());

        // Not leasable inside the backoff window.
        assert!(store
            .lease("worker-1", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let retried = store
            .lease("worker-1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.id, job.id);
        assert_eq!(retried.attempt, 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_dead_letter() {
        let store = MemoryJobStore::new(JobStoreConfig {
            retry_base_delay: Duration::from_millis(1),
            ..fast_config()
        });
        let id = store.enqueue(Uuid::now_v7(), facts("x"), 5).await.unwrap();

        for attempt in 1..=3u32 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let job = store
                .lease("worker-0", Duration::from_secs(30))
                .await
                .unwrap()
                .expect("job should be leasable");
            let token = job.lease.as_ref().unwrap().token;
            store
                .fail(job.id, token, &format!("failure {attempt}"))
                .await
                .unwrap();
        }

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::DeadLettered);
        assert_eq!(stored.attempt, 3);
        assert_eq!(stored.last_error.as_deref(), Some("failure 3"));

        // Never leased again.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store
            .lease("worker-0", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_and_old_token_rejected() {
        let store = MemoryJobStore::default();
        store.enqueue(Uuid::now_v7(), facts("x"), 5).await.unwrap();

        let crashed = store
            .lease("worker-0", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let stale_token = crashed.lease.as_ref().unwrap().token;

        tokio::time::sleep(Duration::from_millis(20)).await;

        let reclaimed = store
            .lease("worker-1", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("expired lease must be reclaimable");
        assert_eq!(reclaimed.id, crashed.id);
        assert_eq!(reclaimed.lease.as_ref().unwrap().worker_id, "worker-1");

        // The crashed worker's token no longer completes or fails the job.
        assert!(matches!(
            store.complete(crashed.id, stale_token).await.unwrap_err(),
            Error::LeaseLost { .. }
        ));
        assert!(matches!(
            store.fail(crashed.id, stale_token, "late").await.unwrap_err(),
            Error::LeaseLost { .. }
        ));

        let fresh_token = reclaimed.lease.as_ref().unwrap().token;
        store.complete(reclaimed.id, fresh_token).await.unwrap();
    }

    #[tokio::test]
    async fn test_counts_by_state() {
        let store = MemoryJobStore::new(fast_config());
        let txn = Uuid::now_v7();
        store.enqueue(txn, facts("pending"), 5).await.unwrap();
        store.enqueue(txn, facts("leased"), 1).await.unwrap();
        let job = store
            .lease("worker-0", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.payload.description, "leased");

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.leased, 1);
        assert_eq!(counts.total(), 2);
    }

    #[tokio::test]
    async fn test_purge_terminal_respects_retention() {
        let store = MemoryJobStore::default();
        store.enqueue(Uuid::now_v7(), facts("done"), 5).await.unwrap();
        store.enqueue(Uuid::now_v7(), facts("live"), 5).await.unwrap();

        let job = store
            .lease("worker-0", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let token = job.lease.as_ref().unwrap().token;
        store.complete(job.id, token).await.unwrap();

        // Generous retention keeps the fresh terminal job.
        assert_eq!(store.purge_terminal(Duration::from_secs(3600)).await.unwrap(), 0);
        // Zero retention removes it; the live job stays.
        assert_eq!(store.purge_terminal(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(store.counts().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_transaction_update_preserves_unrelated_metadata() {
        let store = MemoryTransactionStore::new();
        let record = store
            .insert(NewTransaction {
                org_id: Uuid::now_v7(),
                description: "Office Depot - Printer Paper".to_string(),
                amount: 24.99,
                merchant: Some("Office Depot".to_string()),
                occurred_at: None,
                category: None,
                metadata: Some(serde_json::json!({"source": "bank-import"})),
            })
            .await
            .unwrap();

        let updated = store
            .update_fields(
                record.id,
                TransactionPatch {
                    category: Some(tally_core::Category::OfficeSupplies),
                    metadata_merge: Some(serde_json::json!({"reviewed": true})),
                },
            )
            .await
            .unwrap();
        assert!(updated);

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.category, Some(tally_core::Category::OfficeSupplies));
        assert_eq!(stored.metadata["source"], "bank-import");
        assert_eq!(stored.metadata["reviewed"], true);
        assert!(stored.updated_at >= record.updated_at);
    }

    #[tokio::test]
    async fn test_transaction_update_missing_is_false() {
        let store = MemoryTransactionStore::new();
        let updated = store
            .update_fields(Uuid::now_v7(), TransactionPatch::default())
            .await
            .unwrap();
        assert!(!updated);
    }
}
