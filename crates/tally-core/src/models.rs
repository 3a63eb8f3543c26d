//! Core data model for the categorization pipeline.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults;

/// Metadata key under which a transaction's AI categorization outcome is
/// merged. Sub-keys: `category`, `confidence`, `reasoning`, `timestamp`.
pub const AI_CATEGORIZATION_KEY: &str = "aiCategorization";

// =============================================================================
// CATEGORY
// =============================================================================

/// Closed enumeration of expense/income categories.
///
/// Every `ClassificationResult` carries a member of this set; anything the
/// external service returns outside it is coerced to [`Category::Other`]
/// before it reaches downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Office Supplies")]
    OfficeSupplies,
    #[serde(rename = "Meals & Entertainment")]
    MealsAndEntertainment,
    #[serde(rename = "Travel")]
    Travel,
    #[serde(rename = "Software & Subscriptions")]
    Software,
    #[serde(rename = "Utilities")]
    Utilities,
    #[serde(rename = "Rent & Lease")]
    RentAndLease,
    #[serde(rename = "Professional Services")]
    ProfessionalServices,
    #[serde(rename = "Marketing & Advertising")]
    Marketing,
    #[serde(rename = "Payroll")]
    Payroll,
    #[serde(rename = "Insurance")]
    Insurance,
    #[serde(rename = "Equipment")]
    Equipment,
    #[serde(rename = "Bank Fees")]
    BankFees,
    #[serde(rename = "Income")]
    Income,
    #[serde(rename = "Other")]
    Other,
}

impl Category {
    /// All members, in display order.
    pub const ALL: [Category; 14] = [
        Category::OfficeSupplies,
        Category::MealsAndEntertainment,
        Category::Travel,
        Category::Software,
        Category::Utilities,
        Category::RentAndLease,
        Category::ProfessionalServices,
        Category::Marketing,
        Category::Payroll,
        Category::Insurance,
        Category::Equipment,
        Category::BankFees,
        Category::Income,
        Category::Other,
    ];

    /// Safe default substituted whenever classification is impossible or the
    /// returned label is outside the enumeration.
    pub const FALLBACK: Category = Category::Other;

    /// Human-readable label, also the wire representation.
    pub fn label(&self) -> &'static str {
        match self {
            Category::OfficeSupplies => "Office Supplies",
            Category::MealsAndEntertainment => "Meals & Entertainment",
            Category::Travel => "Travel",
            Category::Software => "Software & Subscriptions",
            Category::Utilities => "Utilities",
            Category::RentAndLease => "Rent & Lease",
            Category::ProfessionalServices => "Professional Services",
            Category::Marketing => "Marketing & Advertising",
            Category::Payroll => "Payroll",
            Category::Insurance => "Insurance",
            Category::Equipment => "Equipment",
            Category::BankFees => "Bank Fees",
            Category::Income => "Income",
            Category::Other => "Other",
        }
    }

    /// Case-insensitive exact match against the label set.
    pub fn from_label(label: &str) -> Option<Category> {
        let trimmed = label.trim();
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.label().eq_ignore_ascii_case(trimmed))
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// =============================================================================
// CLASSIFICATION
// =============================================================================

/// Transaction facts sent to the classification service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionFacts {
    pub amount: f64,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

impl TransactionFacts {
    /// Facts derived from a stored transaction record.
    pub fn from_record(record: &TransactionRecord) -> Self {
        Self {
            amount: record.amount,
            description: record.description.clone(),
            merchant: record.merchant.clone(),
            date: record.occurred_at,
            metadata: if record.metadata.is_null() {
                None
            } else {
                Some(record.metadata.clone())
            },
        }
    }

    /// Overlay caller-supplied overrides; absent fields keep stored values.
    pub fn with_overrides(mut self, overrides: FactOverrides) -> Self {
        if let Some(amount) = overrides.amount {
            self.amount = amount;
        }
        if let Some(description) = overrides.description {
            self.description = description;
        }
        if overrides.merchant.is_some() {
            self.merchant = overrides.merchant;
        }
        if overrides.date.is_some() {
            self.date = overrides.date;
        }
        if overrides.metadata.is_some() {
            self.metadata = overrides.metadata;
        }
        self
    }
}

/// Caller-supplied overrides for a manual categorize request. Fields default
/// to the stored transaction's values when omitted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FactOverrides {
    pub amount: Option<f64>,
    pub description: Option<String>,
    pub merchant: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub metadata: Option<JsonValue>,
}

/// Outcome of one classification call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: Category,
    pub confidence: f64,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
}

impl ClassificationResult {
    /// A well-formed result with confidence clamped into [0, 1].
    pub fn new(category: Category, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            category,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
            timestamp: Utc::now(),
        }
    }

    /// Fallback result for a failed or impossible classification. This is a
    /// recoverable business outcome, not an error: the pipeline keeps moving.
    pub fn fallback(reason: impl Into<String>) -> Self {
        Self::new(Category::FALLBACK, 0.0, reason)
    }

    /// Result for a well-formed reply whose category label is outside the
    /// enumeration: substitute the fallback category, cap the confidence.
    pub fn substituted(raw_label: &str, confidence: f64) -> Self {
        Self::new(
            Category::FALLBACK,
            confidence.min(defaults::SUBSTITUTION_CONFIDENCE_CAP),
            format!(
                "Model returned unknown category '{}'; substituted '{}'",
                raw_label,
                Category::FALLBACK
            ),
        )
    }

    /// Metadata fragment merged into the owning transaction under
    /// [`AI_CATEGORIZATION_KEY`].
    pub fn to_metadata(&self) -> JsonValue {
        serde_json::json!({
            "category": self.category.label(),
            "confidence": self.confidence,
            "reasoning": self.reasoning,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}

// =============================================================================
// JOBS
// =============================================================================

/// Lifecycle state of a categorization job.
///
/// `Failed` is the resting state of a job that has failed at least once and is
/// waiting out its retry backoff; for lease eligibility it behaves like
/// `Pending` once `not_before` has elapsed. `Succeeded` and `DeadLettered` are
/// terminal and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Leased,
    Succeeded,
    Failed,
    DeadLettered,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::DeadLettered)
    }
}

/// A time-bounded claim by one worker on one job. The token is the CAS guard
/// for `complete`/`fail`: a stale holder's token no longer matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLease {
    pub worker_id: String,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// One unit of categorization work tied to a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub payload: TransactionFacts,
    /// Lower value = more urgent.
    pub priority: i32,
    /// Completed tries so far. Only ever increases.
    pub attempt: u32,
    pub max_attempts: u32,
    pub state: JobState,
    /// Set only while `Leased`.
    pub lease: Option<JobLease>,
    /// Earliest instant the job becomes eligible for lease again (retry
    /// backoff gate).
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Set when the job reaches a terminal state; the retention window for
    /// garbage collection is measured from here.
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Job {
    /// Whether this job's lease has expired as of `now`. A job without a
    /// lease is not "expired", it simply is not leased.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match &self.lease {
            Some(lease) => lease.expires_at <= now,
            None => false,
        }
    }

    /// Whether a worker may lease this job as of `now`: pending or awaiting
    /// retry with the backoff window elapsed, or leased with an expired lease
    /// (crash recovery).
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Pending | JobState::Failed => match self.not_before {
                Some(t) => t <= now,
                None => true,
            },
            JobState::Leased => self.lease_expired(now),
            JobState::Succeeded | JobState::DeadLettered => false,
        }
    }
}

/// Handle returned to a caller that enqueued a job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: Uuid,
    pub transaction_id: Uuid,
}

/// Job counts by state, for the queue status endpoint and monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub pending: i64,
    pub leased: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub dead_lettered: i64,
}

impl JobCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.leased + self.succeeded + self.failed + self.dead_lettered
    }
}

/// Queue health snapshot exposed over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// `"active"` when the worker pool is processing, `"disabled"` otherwise.
    pub status: String,
    pub job_counts: JobCounts,
}

/// Retry/backoff policy shared by job store implementations.
#[derive(Debug, Clone)]
pub struct JobStoreConfig {
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::JOB_MAX_ATTEMPTS,
            retry_base_delay: Duration::from_secs(defaults::RETRY_BASE_DELAY_SECS),
            retry_max_delay: Duration::from_secs(defaults::RETRY_MAX_DELAY_SECS),
        }
    }
}

impl JobStoreConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `TALLY_JOB_MAX_ATTEMPTS` | `3` | Tries before dead-lettering |
    /// | `TALLY_RETRY_BASE_DELAY_SECS` | `2` | Backoff base delay |
    /// | `TALLY_RETRY_MAX_DELAY_SECS` | `60` | Backoff delay cap |
    pub fn from_env() -> Self {
        let max_attempts = std::env::var("TALLY_JOB_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults::JOB_MAX_ATTEMPTS)
            .max(1);
        let retry_base_delay = std::env::var("TALLY_RETRY_BASE_DELAY_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(defaults::RETRY_BASE_DELAY_SECS));
        let retry_max_delay = std::env::var("TALLY_RETRY_MAX_DELAY_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(defaults::RETRY_MAX_DELAY_SECS));

        Self {
            max_attempts,
            retry_base_delay,
            retry_max_delay,
        }
    }

    /// Backoff delay before the `attempt`-th retry (attempt counts completed
    /// failures, so the first retry passes 1): base × 2^(attempt−1), capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.retry_base_delay.saturating_mul(1u32 << exp);
        delay.min(self.retry_max_delay)
    }
}

// =============================================================================
// TRANSACTIONS (referenced entity)
// =============================================================================

/// A stored bookkeeping transaction. The pipeline only ever applies targeted
/// partial updates to it; it is owned by the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: Uuid,
    pub org_id: Uuid,
    pub description: String,
    pub amount: f64,
    pub merchant: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub category: Option<Category>,
    /// Free-form metadata object. Unrelated keys survive categorization.
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTransaction {
    pub org_id: Uuid,
    pub description: String,
    pub amount: f64,
    #[serde(default)]
    pub merchant: Option<String>,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

/// Targeted partial update applied to a transaction. Only the named fields
/// change; `metadata_merge` keys are merged over existing metadata without
/// discarding unrelated keys.
#[derive(Debug, Clone, Default)]
pub struct TransactionPatch {
    pub category: Option<Category>,
    pub metadata_merge: Option<JsonValue>,
}

/// Shallow-merge `overlay`'s keys over `base`, returning the merged object.
/// Non-object bases are replaced by an object holding only the overlay keys.
pub fn merge_metadata(base: &JsonValue, overlay: &JsonValue) -> JsonValue {
    let mut merged: HashMap<String, JsonValue> = match base {
        JsonValue::Object(map) => map.clone().into_iter().collect(),
        _ => HashMap::new(),
    };
    if let JsonValue::Object(overlay_map) = overlay {
        for (k, v) in overlay_map {
            merged.insert(k.clone(), v.clone());
        }
    }
    let mut out = serde_json::Map::new();
    for (k, v) in merged {
        out.insert(k, v);
    }
    JsonValue::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(description: &str) -> TransactionFacts {
        TransactionFacts {
            amount: 42.5,
            description: description.to_string(),
            merchant: None,
            date: None,
            metadata: None,
        }
    }

    #[test]
    fn test_category_label_round_trip() {
        for category in Category::ALL {
            assert_eq!(Category::from_label(category.label()), Some(category));
        }
    }

    #[test]
    fn test_category_from_label_case_insensitive() {
        assert_eq!(
            Category::from_label("office supplies"),
            Some(Category::OfficeSupplies)
        );
        assert_eq!(
            Category::from_label("  TRAVEL  "),
            Some(Category::Travel)
        );
    }

    #[test]
    fn test_category_from_label_unknown() {
        assert_eq!(Category::from_label("Not A Real Category"), None);
    }

    #[test]
    fn test_category_serde_uses_labels() {
        let json = serde_json::to_string(&Category::OfficeSupplies).unwrap();
        assert_eq!(json, "\"Office Supplies\"");
        let back: Category = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Category::OfficeSupplies);
    }

    #[test]
    fn test_classification_result_clamps_confidence() {
        let result = ClassificationResult::new(Category::Travel, 1.7, "sure");
        assert_eq!(result.confidence, 1.0);
        let result = ClassificationResult::new(Category::Travel, -0.2, "unsure");
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_fallback_result() {
        let result = ClassificationResult::fallback("no credential configured");
        assert_eq!(result.category, Category::Other);
        assert_eq!(result.confidence, 0.0);
        assert!(result.reasoning.contains("no credential"));
    }

    #[test]
    fn test_substituted_result_caps_confidence() {
        let result = ClassificationResult::substituted("Not A Real Category", 0.95);
        assert_eq!(result.category, Category::Other);
        assert!(result.confidence <= 0.3);
        assert!(result.reasoning.contains("Not A Real Category"));
    }

    #[test]
    fn test_result_metadata_fragment() {
        let result = ClassificationResult::new(Category::OfficeSupplies, 0.9, "merchant match");
        let fragment = result.to_metadata();
        assert_eq!(fragment["category"], "Office Supplies");
        assert_eq!(fragment["confidence"], 0.9);
        assert_eq!(fragment["reasoning"], "merchant match");
        assert!(fragment["timestamp"].is_string());
    }

    #[test]
    fn test_job_eligibility_pending() {
        let now = Utc::now();
        let job = Job {
            id: Uuid::now_v7(),
            transaction_id: Uuid::now_v7(),
            payload: facts("coffee"),
            priority: 5,
            attempt: 0,
            max_attempts: 3,
            state: JobState::Pending,
            lease: None,
            not_before: None,
            created_at: now,
            finished_at: None,
            last_error: None,
        };
        assert!(job.is_eligible(now));
    }

    #[test]
    fn test_job_eligibility_backoff_gate() {
        let now = Utc::now();
        let mut job = Job {
            id: Uuid::now_v7(),
            transaction_id: Uuid::now_v7(),
            payload: facts("coffee"),
            priority: 5,
            attempt: 1,
            max_attempts: 3,
            state: JobState::Failed,
            lease: None,
            not_before: Some(now + chrono::Duration::seconds(10)),
            created_at: now,
            finished_at: None,
            last_error: Some("boom".to_string()),
        };
        assert!(!job.is_eligible(now));
        job.not_before = Some(now - chrono::Duration::seconds(1));
        assert!(job.is_eligible(now));
    }

    #[test]
    fn test_job_eligibility_expired_lease() {
        let now = Utc::now();
        let mut job = Job {
            id: Uuid::now_v7(),
            transaction_id: Uuid::now_v7(),
            payload: facts("coffee"),
            priority: 5,
            attempt: 0,
            max_attempts: 3,
            state: JobState::Leased,
            lease: Some(JobLease {
                worker_id: "worker-0".to_string(),
                token: Uuid::new_v4(),
                expires_at: now + chrono::Duration::seconds(30),
            }),
            not_before: None,
            created_at: now,
            finished_at: None,
            last_error: None,
        };
        assert!(!job.is_eligible(now));
        job.lease.as_mut().unwrap().expires_at = now - chrono::Duration::seconds(1);
        assert!(job.is_eligible(now));
    }

    #[test]
    fn test_terminal_states_not_eligible() {
        let now = Utc::now();
        for state in [JobState::Succeeded, JobState::DeadLettered] {
            let job = Job {
                id: Uuid::now_v7(),
                transaction_id: Uuid::now_v7(),
                payload: facts("coffee"),
                priority: 5,
                attempt: 3,
                max_attempts: 3,
                state,
                lease: None,
                not_before: None,
                created_at: now,
                finished_at: None,
                last_error: None,
            };
            assert!(state.is_terminal());
            assert!(!job.is_eligible(now));
        }
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let config = JobStoreConfig {
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(60),
        };
        assert_eq!(config.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(config.backoff_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn test_job_counts_serde_camel_case() {
        let counts = JobCounts {
            pending: 1,
            leased: 2,
            succeeded: 3,
            failed: 4,
            dead_lettered: 5,
        };
        let json = serde_json::to_string(&counts).unwrap();
        assert!(json.contains("\"deadLettered\":5"));
        assert_eq!(counts.total(), 15);
    }

    #[test]
    fn test_facts_with_overrides() {
        let stored = facts("Office Depot - Printer Paper").with_overrides(FactOverrides {
            amount: Some(99.0),
            merchant: Some("Office Depot".to_string()),
            ..Default::default()
        });
        assert_eq!(stored.amount, 99.0);
        assert_eq!(stored.description, "Office Depot - Printer Paper");
        assert_eq!(stored.merchant.as_deref(), Some("Office Depot"));
    }

    #[test]
    fn test_merge_metadata_preserves_unrelated_keys() {
        let base = serde_json::json!({"source": "import", "note": "lunch"});
        let overlay = serde_json::json!({AI_CATEGORIZATION_KEY: {"category": "Travel"}});
        let merged = merge_metadata(&base, &overlay);
        assert_eq!(merged["source"], "import");
        assert_eq!(merged["note"], "lunch");
        assert_eq!(merged[AI_CATEGORIZATION_KEY]["category"], "Travel");
    }

    #[test]
    fn test_merge_metadata_non_object_base() {
        let merged = merge_metadata(&JsonValue::Null, &serde_json::json!({"a": 1}));
        assert_eq!(merged, serde_json::json!({"a": 1}));
    }
}
