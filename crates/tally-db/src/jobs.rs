//! PostgreSQL job store implementation.
//!
//! The claim path uses `FOR UPDATE SKIP LOCKED` so concurrent workers never
//! block on or double-claim the same row; `complete`/`fail` are guarded by a
//! compare-and-swap on `(state, lease_token)`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use tally_core::{
    Error, Job, JobCounts, JobLease, JobState, JobStore, JobStoreConfig, Result, TransactionFacts,
};

/// PostgreSQL implementation of [`JobStore`].
pub struct PgJobStore {
    pool: PgPool,
    config: JobStoreConfig,
}

const JOB_COLUMNS: &str = "id, transaction_id, payload, priority, attempt, max_attempts, state, \
     lease_worker, lease_token, lease_expires_at, not_before, created_at, finished_at, last_error";

impl PgJobStore {
    pub fn new(pool: PgPool, config: JobStoreConfig) -> Self {
        Self { pool, config }
    }

    /// Create the job table and claim index if they do not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS categorization_jobs (
                 id UUID PRIMARY KEY,
                 transaction_id UUID NOT NULL,
                 payload JSONB NOT NULL,
                 priority INT NOT NULL,
                 attempt INT NOT NULL DEFAULT 0,
                 max_attempts INT NOT NULL,
                 state TEXT NOT NULL,
                 lease_worker TEXT,
                 lease_token UUID,
                 lease_expires_at TIMESTAMPTZ,
                 not_before TIMESTAMPTZ,
                 created_at TIMESTAMPTZ NOT NULL,
                 finished_at TIMESTAMPTZ,
                 last_error TEXT
             )",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_categorization_jobs_claim
             ON categorization_jobs (state, priority, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    fn str_to_state(s: &str) -> JobState {
        match s {
            "pending" => JobState::Pending,
            "leased" => JobState::Leased,
            "succeeded" => JobState::Succeeded,
            "failed" => JobState::Failed,
            "dead_lettered" => JobState::DeadLettered,
            _ => JobState::Pending, // fallback
        }
    }

    fn parse_job_row(row: sqlx::postgres::PgRow) -> Result<Job> {
        let payload: JsonValue = row.get("payload");
        let payload: TransactionFacts = serde_json::from_value(payload)?;
        let state: String = row.get("state");
        let lease_worker: Option<String> = row.get("lease_worker");
        let lease_token: Option<Uuid> = row.get("lease_token");
        let lease_expires_at: Option<DateTime<Utc>> = row.get("lease_expires_at");
        let lease = match (lease_worker, lease_token, lease_expires_at) {
            (Some(worker_id), Some(token), Some(expires_at)) => Some(JobLease {
                worker_id,
                token,
                expires_at,
            }),
            _ => None,
        };
        let attempt: i32 = row.get("attempt");
        let max_attempts: i32 = row.get("max_attempts");

        Ok(Job {
            id: row.get("id"),
            transaction_id: row.get("transaction_id"),
            payload,
            priority: row.get("priority"),
            attempt: attempt.max(0) as u32,
            max_attempts: max_attempts.max(0) as u32,
            state: Self::str_to_state(&state),
            lease,
            not_before: row.get("not_before"),
            created_at: row.get("created_at"),
            finished_at: row.get("finished_at"),
            last_error: row.get("last_error"),
        })
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(
        &self,
        transaction_id: Uuid,
        payload: TransactionFacts,
        priority: i32,
    ) -> Result<Uuid> {
        let job_id = Uuid::now_v7();
        let payload = serde_json::to_value(&payload)?;

        sqlx::query(
            "INSERT INTO categorization_jobs
                 (id, transaction_id, payload, priority, attempt, max_attempts, state, created_at)
             VALUES ($1, $2, $3, $4, 0, $5, 'pending', $6)",
        )
        .bind(job_id)
        .bind(transaction_id)
        .bind(&payload)
        .bind(priority)
        .bind(self.config.max_attempts as i32)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "pg_jobs",
            op = "enqueue",
            job_id = %job_id,
            transaction_id = %transaction_id,
            priority,
            "Job enqueued"
        );
        Ok(job_id)
    }

    async fn lease(&self, worker_id: &str, lease_for: Duration) -> Result<Option<Job>> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::milliseconds(lease_for.as_millis() as i64);
        let token = Uuid::new_v4();

        // Eligibility filter happens before locking; SKIP LOCKED keeps
        // concurrent claimers from blocking on or double-claiming a row.
        let query = format!(
            "UPDATE categorization_jobs
             SET state = 'leased', lease_worker = $1, lease_token = $2,
                 lease_expires_at = $3, not_before = NULL
             WHERE id = (
                 SELECT id FROM categorization_jobs
                 WHERE (state IN ('pending', 'failed')
                            AND (not_before IS NULL OR not_before <= $4))
                    OR (state = 'leased' AND lease_expires_at <= $4)
                 ORDER BY priority ASC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(worker_id)
            .bind(token)
            .bind(expires_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn complete(&self, job_id: Uuid, lease_token: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE categorization_jobs
             SET state = 'succeeded', finished_at = $3,
                 lease_worker = NULL, lease_token = NULL, lease_expires_at = NULL
             WHERE id = $1 AND state = 'leased' AND lease_token = $2",
        )
        .bind(job_id)
        .bind(lease_token)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::LeaseLost { job_id });
        }
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, lease_token: Uuid, error: &str) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(
            "SELECT attempt, max_attempts FROM categorization_jobs
             WHERE id = $1 AND state = 'leased' AND lease_token = $2
             FOR UPDATE",
        )
        .bind(job_id)
        .bind(lease_token)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some(row) = row else {
            return Err(Error::LeaseLost { job_id });
        };
        let attempt: i32 = row.get("attempt");
        let max_attempts: i32 = row.get("max_attempts");
        let attempt = attempt + 1;

        if attempt < max_attempts {
            let not_before =
                now + chrono::Duration::milliseconds(
                    self.config.backoff_delay(attempt.max(0) as u32).as_millis() as i64,
                );
            sqlx::query(
                "UPDATE categorization_jobs
                 SET state = 'failed', attempt = $2, not_before = $3, last_error = $4,
                     lease_worker = NULL, lease_token = NULL, lease_expires_at = NULL
                 WHERE id = $1",
            )
            .bind(job_id)
            .bind(attempt)
            .bind(not_before)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        } else {
            sqlx::query(
                "UPDATE categorization_jobs
                 SET state = 'dead_lettered', attempt = $2, not_before = NULL,
                     last_error = $3, finished_at = $4,
                     lease_worker = NULL, lease_token = NULL, lease_expires_at = NULL
                 WHERE id = $1",
            )
            .bind(job_id)
            .bind(attempt)
            .bind(error)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM categorization_jobs WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.map(Self::parse_job_row).transpose()
    }

    async fn counts(&self) -> Result<JobCounts> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS count FROM categorization_jobs GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut counts = JobCounts::default();
        for row in rows {
            let state: String = row.get("state");
            let count: i64 = row.get("count");
            match Self::str_to_state(&state) {
                JobState::Pending => counts.pending = count,
                JobState::Leased => counts.leased = count,
                JobState::Succeeded => counts.succeeded = count,
                JobState::Failed => counts.failed = count,
                JobState::DeadLettered => counts.dead_lettered = count,
            }
        }
        Ok(counts)
    }

    async fn purge_terminal(&self, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(retention.as_millis() as i64);
        let result = sqlx::query(
            "DELETE FROM categorization_jobs
             WHERE state IN ('succeeded', 'dead_lettered') AND finished_at <= $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The string values must match the literals embedded in the SQL above.
    #[test]
    fn test_state_strings_decode() {
        assert_eq!(PgJobStore::str_to_state("pending"), JobState::Pending);
        assert_eq!(PgJobStore::str_to_state("leased"), JobState::Leased);
        assert_eq!(PgJobStore::str_to_state("succeeded"), JobState::Succeeded);
        assert_eq!(PgJobStore::str_to_state("failed"), JobState::Failed);
        assert_eq!(
            PgJobStore::str_to_state("dead_lettered"),
            JobState::DeadLettered
        );
    }

    #[test]
    fn test_unknown_state_falls_back_to_pending() {
        assert_eq!(PgJobStore::str_to_state("???"), JobState::Pending);
    }

    // Integration tests against a live database. Run with:
    //   TALLY_TEST_DATABASE_URL=postgres://... cargo test -- --ignored
    mod integration {
        use super::*;
        use tally_core::JobStore;

        async fn store() -> Option<PgJobStore> {
            let url = std::env::var("TALLY_TEST_DATABASE_URL").ok()?;
            let pool = crate::pool::create_pool(&url).await.ok()?;
            let store = PgJobStore::new(pool, JobStoreConfig::default());
            store.ensure_schema().await.ok()?;
            Some(store)
        }

        fn facts() -> TransactionFacts {
            TransactionFacts {
                amount: 12.0,
                description: "integration".to_string(),
                merchant: None,
                date: None,
                metadata: None,
            }
        }

        #[tokio::test]
        #[ignore]
        async fn test_enqueue_lease_complete_round_trip() {
            let Some(store) = store().await else { return };
            let txn = Uuid::now_v7();
            let id = store.enqueue(txn, facts(), 1).await.unwrap();

            let job = store
                .lease("it-worker", Duration::from_secs(30))
                .await
                .unwrap()
                .expect("job should be leasable");
            assert_eq!(job.id, id);
            assert_eq!(job.state, JobState::Leased);

            let token = job.lease.as_ref().unwrap().token;
            store.complete(id, token).await.unwrap();
            let stored = store.get(id).await.unwrap().unwrap();
            assert_eq!(stored.state, JobState::Succeeded);

            assert!(matches!(
                store.complete(id, token).await.unwrap_err(),
                Error::LeaseLost { .. }
            ));
            store.purge_terminal(Duration::ZERO).await.unwrap();
        }

        #[tokio::test]
        #[ignore]
        async fn test_fail_until_dead_letter() {
            let Some(store) = store().await else { return };
            let store = PgJobStore::new(
                store.pool.clone(),
                JobStoreConfig {
                    max_attempts: 2,
                    retry_base_delay: Duration::from_millis(1),
                    retry_max_delay: Duration::from_millis(10),
                },
            );
            let id = store.enqueue(Uuid::now_v7(), facts(), 1).await.unwrap();

            for _ in 0..2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let job = store
                    .lease("it-worker", Duration::from_secs(30))
                    .await
                    .unwrap()
                    .expect("job should be leasable");
                let token = job.lease.as_ref().unwrap().token;
                store.fail(job.id, token, "boom").await.unwrap();
            }

            let stored = store.get(id).await.unwrap().unwrap();
            assert_eq!(stored.state, JobState::DeadLettered);
            assert_eq!(stored.attempt, 2);
            store.purge_terminal(Duration::ZERO).await.unwrap();
        }
    }
}
