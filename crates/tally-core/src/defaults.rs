//! Centralized default constants for the tally pipeline.
//!
//! **This module is the single source of truth** for all shared default values.
//! All crates reference these constants instead of defining their own magic
//! numbers. When adding new constants, place them in the appropriate section
//! and document the rationale for the chosen value.

// =============================================================================
// WORKER POOL
// =============================================================================

/// Number of concurrent worker slots. Bounds how many jobs may be in the
/// `Leased` state under one pool at any time.
pub const WORKER_CONCURRENCY: usize = 5;

/// Polling interval when the queue is empty (milliseconds).
pub const JOB_POLL_INTERVAL_MS: u64 = 500;

/// Lease duration granted to a worker per claim (seconds). Long enough to
/// cover a slow classification call plus the apply, short enough that a
/// crashed worker's job is reclaimed promptly.
pub const JOB_LEASE_SECS: u64 = 30;

/// Hard wall-clock bound on a single job's processing (seconds). Fires as a
/// retryable failure, never a silent fallback.
pub const JOB_TIMEOUT_SECS: u64 = 60;

// =============================================================================
// RETRY / BACKOFF
// =============================================================================

/// Maximum tries per job before dead-lettering.
pub const JOB_MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential retry backoff (seconds).
pub const RETRY_BASE_DELAY_SECS: u64 = 2;

/// Cap on the retry backoff delay (seconds).
pub const RETRY_MAX_DELAY_SECS: u64 = 60;

// =============================================================================
// RETENTION
// =============================================================================

/// How long terminal jobs (Succeeded, DeadLettered) are kept before the
/// janitor removes them (seconds).
pub const JOB_RETENTION_SECS: u64 = 3600;

/// Interval between janitor sweeps (seconds).
pub const JANITOR_INTERVAL_SECS: u64 = 60;

// =============================================================================
// PRIORITIES (lower = more urgent)
// =============================================================================

/// Priority for explicit single-transaction categorize requests. Manual
/// requests preempt everything else.
pub const PRIORITY_MANUAL: i32 = 1;

/// Priority for bulk categorize requests.
pub const PRIORITY_BULK: i32 = 5;

/// Priority for background jobs enqueued on transaction creation.
pub const PRIORITY_BACKGROUND: i32 = 9;

// =============================================================================
// PRODUCER
// =============================================================================

/// Maximum transaction ids accepted by one bulk-categorize call.
pub const BULK_CATEGORIZE_MAX: usize = 50;

// =============================================================================
// CLASSIFICATION
// =============================================================================

/// Default classification service base URL (OpenAI-compatible).
pub const CLASSIFY_BASE_URL: &str = "https://api.openai.com/v1";

/// Default classification model.
pub const CLASSIFY_MODEL: &str = "gpt-4o-mini";

/// Timeout for one classification request (seconds).
pub const CLASSIFY_TIMEOUT_SECS: u64 = 30;

/// Confidence ceiling applied when an out-of-enumeration category label is
/// substituted with the fallback category.
pub const SUBSTITUTION_CONFIDENCE_CAP: f64 = 0.3;

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;

// =============================================================================
// EVENTS
// =============================================================================

/// Capacity of the worker event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;
