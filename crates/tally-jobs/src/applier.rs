//! Applies classification results back onto transaction records.

use std::sync::Arc;

use tracing::{debug, instrument};
use uuid::Uuid;

use tally_core::{
    ClassificationResult, Result, TransactionPatch, TransactionStore, AI_CATEGORIZATION_KEY,
};

/// Writes a classification outcome onto its transaction with a targeted
/// partial update: the category field plus one metadata key. Unrelated
/// metadata keys and all other fields are untouched, so re-applying the same
/// result is harmless.
#[derive(Clone)]
pub struct ResultApplier {
    transactions: Arc<dyn TransactionStore>,
}

impl ResultApplier {
    pub fn new(transactions: Arc<dyn TransactionStore>) -> Self {
        Self { transactions }
    }

    /// Apply `result` to the transaction. Returns `false` when the
    /// transaction no longer exists; that is a successful no-op, not an
    /// error, because the record may legitimately be deleted between enqueue
    /// and processing.
    #[instrument(skip(self, result), fields(subsystem = "jobs", component = "applier", op = "apply"))]
    pub async fn apply(
        &self,
        transaction_id: Uuid,
        result: &ClassificationResult,
    ) -> Result<bool> {
        let patch = TransactionPatch {
            category: Some(result.category),
            metadata_merge: Some(serde_json::json!({
                AI_CATEGORIZATION_KEY: result.to_metadata(),
            })),
        };

        let updated = self.transactions.update_fields(transaction_id, patch).await?;
        if updated {
            debug!(
                %transaction_id,
                category = %result.category,
                confidence = result.confidence,
                "Applied classification result"
            );
        } else {
            debug!(%transaction_id, "Transaction gone, skipping result apply");
        }
        Ok(updated)
    }
}
