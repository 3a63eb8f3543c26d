//! PostgreSQL transaction store implementation.
//!
//! Writes are targeted partial updates only: categorization must never
//! clobber fields edited concurrently by the rest of the application.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use tally_core::{
    Category, Error, NewTransaction, Result, TransactionPatch, TransactionRecord, TransactionStore,
};

/// PostgreSQL implementation of [`TransactionStore`].
pub struct PgTransactionStore {
    pool: PgPool,
}

const TXN_COLUMNS: &str =
    "id, org_id, description, amount, merchant, occurred_at, category, metadata, created_at, updated_at";

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the transactions table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transactions (
                 id UUID PRIMARY KEY,
                 org_id UUID NOT NULL,
                 description TEXT NOT NULL,
                 amount DOUBLE PRECISION NOT NULL,
                 merchant TEXT,
                 occurred_at TIMESTAMPTZ,
                 category TEXT,
                 metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                 created_at TIMESTAMPTZ NOT NULL,
                 updated_at TIMESTAMPTZ NOT NULL
             )",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    fn parse_row(row: sqlx::postgres::PgRow) -> TransactionRecord {
        let category: Option<String> = row.get("category");
        TransactionRecord {
            id: row.get("id"),
            org_id: row.get("org_id"),
            description: row.get("description"),
            amount: row.get("amount"),
            merchant: row.get("merchant"),
            occurred_at: row.get("occurred_at"),
            category: category.as_deref().and_then(Category::from_label),
            metadata: row.get("metadata"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn insert(&self, new: NewTransaction) -> Result<TransactionRecord> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        let metadata = new
            .metadata
            .unwrap_or_else(|| JsonValue::Object(Default::default()));

        let query = format!(
            "INSERT INTO transactions
                 (id, org_id, description, amount, merchant, occurred_at, category, metadata,
                  created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
             RETURNING {TXN_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(id)
            .bind(new.org_id)
            .bind(&new.description)
            .bind(new.amount)
            .bind(&new.merchant)
            .bind(new.occurred_at)
            .bind(new.category.map(|c| c.label()))
            .bind(&metadata)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(Self::parse_row(row))
    }

    async fn get(&self, id: Uuid) -> Result<Option<TransactionRecord>> {
        let query = format!("SELECT {TXN_COLUMNS} FROM transactions WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.map(Self::parse_row))
    }

    async fn update_fields(&self, id: Uuid, patch: TransactionPatch) -> Result<bool> {
        // jsonb `||` is a shallow key merge, so metadata keys the pipeline
        // does not own survive the update.
        let result = sqlx::query(
            "UPDATE transactions
             SET category = COALESCE($2, category),
                 metadata = CASE WHEN $3::jsonb IS NULL THEN metadata
                                 ELSE metadata || $3::jsonb END,
                 updated_at = $4
             WHERE id = $1",
        )
        .bind(id)
        .bind(patch.category.map(|c| c.label()))
        .bind(patch.metadata_merge)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Integration tests against a live database. Run with:
    //   TALLY_TEST_DATABASE_URL=postgres://... cargo test -- --ignored
    async fn store() -> Option<PgTransactionStore> {
        let url = std::env::var("TALLY_TEST_DATABASE_URL").ok()?;
        let pool = crate::pool::create_pool(&url).await.ok()?;
        let store = PgTransactionStore::new(pool);
        store.ensure_schema().await.ok()?;
        Some(store)
    }

    #[tokio::test]
    #[ignore]
    async fn test_insert_update_round_trip() {
        let Some(store) = store().await else { return };
        let record = store
            .insert(NewTransaction {
                org_id: Uuid::now_v7(),
                description: "AWS invoice".to_string(),
                amount: 320.0,
                merchant: Some("Amazon Web Services".to_string()),
                occurred_at: None,
                category: None,
                metadata: Some(serde_json::json!({"source": "import"})),
            })
            .await
            .unwrap();
        assert!(record.category.is_none());

        let updated = store
            .update_fields(
                record.id,
                TransactionPatch {
                    category: Some(Category::Software),
                    metadata_merge: Some(serde_json::json!({"reviewed": true})),
                },
            )
            .await
            .unwrap();
        assert!(updated);

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.category, Some(Category::Software));
        assert_eq!(stored.metadata["source"], "import");
        assert_eq!(stored.metadata["reviewed"], true);
    }

    #[tokio::test]
    #[ignore]
    async fn test_update_missing_is_false() {
        let Some(store) = store().await else { return };
        let updated = store
            .update_fields(Uuid::now_v7(), TransactionPatch::default())
            .await
            .unwrap();
        assert!(!updated);
    }
}
