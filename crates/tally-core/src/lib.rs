//! # tally-core
//!
//! Core types, traits, and abstractions for the tally categorization
//! pipeline: the job/lease data model, the closed category enumeration, the
//! shared error type, and the trait seams (`JobStore`, `TransactionStore`,
//! `Classifier`) the other crates implement.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;

pub use error::{Error, Result};
pub use models::{
    merge_metadata, Category, ClassificationResult, FactOverrides, Job, JobCounts, JobHandle,
    JobLease, JobState, JobStoreConfig, NewTransaction, QueueStatus, TransactionFacts,
    TransactionPatch, TransactionRecord, AI_CATEGORIZATION_KEY,
};
pub use traits::{Classifier, JobStore, TransactionStore};
