//! Enqueues categorization jobs on behalf of callers.

use std::sync::Arc;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use tally_core::{
    defaults, Error, FactOverrides, JobHandle, JobStore, QueueStatus, Result, TransactionFacts,
    TransactionRecord, TransactionStore,
};

/// The only component that creates jobs. Validates that the transaction
/// exists and belongs to the calling org before enqueueing, and assigns the
/// priority band for the request shape (manual < bulk < background).
#[derive(Clone)]
pub struct Producer {
    jobs: Arc<dyn JobStore>,
    transactions: Arc<dyn TransactionStore>,
}

impl Producer {
    pub fn new(jobs: Arc<dyn JobStore>, transactions: Arc<dyn TransactionStore>) -> Self {
        Self { jobs, transactions }
    }

    /// Load a transaction scoped to `org_id`. A record owned by another org
    /// is reported as not found rather than as a permission error, so ids
    /// cannot be probed across tenants.
    async fn load_scoped(&self, org_id: Uuid, transaction_id: Uuid) -> Result<TransactionRecord> {
        match self.transactions.get(transaction_id).await? {
            Some(record) if record.org_id == org_id => Ok(record),
            _ => Err(Error::TransactionNotFound(transaction_id)),
        }
    }

    /// Enqueue a single user-requested categorization at the most urgent
    /// priority, optionally overriding stored facts for this run.
    #[instrument(skip(self, overrides), fields(subsystem = "jobs", component = "producer", op = "categorize_one"))]
    pub async fn categorize_one(
        &self,
        org_id: Uuid,
        transaction_id: Uuid,
        overrides: FactOverrides,
    ) -> Result<JobHandle> {
        let record = self.load_scoped(org_id, transaction_id).await?;
        let facts = TransactionFacts::from_record(&record).with_overrides(overrides);
        let job_id = self
            .jobs
            .enqueue(transaction_id, facts, defaults::PRIORITY_MANUAL)
            .await?;
        debug!(%job_id, %transaction_id, "Enqueued manual categorization");
        Ok(JobHandle {
            job_id,
            transaction_id,
        })
    }

    /// Enqueue a batch of categorizations at bulk priority. All-or-nothing:
    /// every transaction is validated before any job is created, so a bad id
    /// in the batch enqueues nothing and rejects the whole request as
    /// invalid input.
    #[instrument(skip(self, transaction_ids), fields(subsystem = "jobs", component = "producer", op = "categorize_many", batch = transaction_ids.len()))]
    pub async fn categorize_many(
        &self,
        org_id: Uuid,
        transaction_ids: &[Uuid],
    ) -> Result<Vec<JobHandle>> {
        if transaction_ids.is_empty() {
            return Err(Error::InvalidInput(
                "at least one transaction id is required".to_string(),
            ));
        }
        if transaction_ids.len() > defaults::BULK_CATEGORIZE_MAX {
            return Err(Error::InvalidInput(format!(
                "batch size {} exceeds the maximum of {}",
                transaction_ids.len(),
                defaults::BULK_CATEGORIZE_MAX
            )));
        }

        // Validation pass first; nothing is enqueued until every id resolves.
        // A bad id in a batch is a malformed request (400), not a 404 on the
        // batch endpoint itself.
        let mut records = Vec::with_capacity(transaction_ids.len());
        for &id in transaction_ids {
            let record = self.load_scoped(org_id, id).await.map_err(|e| match e {
                Error::TransactionNotFound(id) => {
                    Error::InvalidInput(format!("unknown transaction id {id} in batch"))
                }
                other => other,
            })?;
            records.push(record);
        }

        let mut handles = Vec::with_capacity(records.len());
        for record in &records {
            let facts = TransactionFacts::from_record(record);
            let job_id = self
                .jobs
                .enqueue(record.id, facts, defaults::PRIORITY_BULK)
                .await?;
            handles.push(JobHandle {
                job_id,
                transaction_id: record.id,
            });
        }
        debug!(batch = handles.len(), "Enqueued bulk categorization batch");
        Ok(handles)
    }

    /// Auto-enqueue for a freshly created transaction, at background
    /// priority. Fire-and-forget: an enqueue failure is logged and never
    /// propagated, because the transaction itself was created successfully.
    pub async fn on_transaction_created(&self, record: &TransactionRecord) -> Option<JobHandle> {
        let facts = TransactionFacts::from_record(record);
        match self
            .jobs
            .enqueue(record.id, facts, defaults::PRIORITY_BACKGROUND)
            .await
        {
            Ok(job_id) => {
                debug!(%job_id, transaction_id = %record.id, "Auto-enqueued background categorization");
                Some(JobHandle {
                    job_id,
                    transaction_id: record.id,
                })
            }
            Err(e) => {
                warn!(transaction_id = %record.id, error = %e, "Auto-enqueue failed, transaction left uncategorized");
                None
            }
        }
    }

    /// Queue snapshot for the status endpoint. `active` reflects whether a
    /// worker pool is currently running.
    pub async fn queue_status(&self, active: bool) -> Result<QueueStatus> {
        let job_counts = self.jobs.counts().await?;
        Ok(QueueStatus {
            status: if active { "active" } else { "disabled" }.to_string(),
            job_counts,
        })
    }
}
