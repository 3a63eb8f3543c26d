//! Transaction classification backends.
//!
//! [`OpenAiClassifier`] talks to an OpenAI-compatible chat-completions
//! endpoint. A degraded external service never fails a categorization job:
//! every failure mode except a request timeout resolves to the low-confidence
//! fallback result. Timeouts are surfaced as errors so jobs retry.
//!
//! The `mock` feature adds [`MockClassifier`] for tests.

pub mod client;
pub mod config;
pub mod parse;

#[cfg(feature = "mock")]
pub mod mock;

pub use client::OpenAiClassifier;
pub use config::ClassifyConfig;
pub use parse::parse_reply;

#[cfg(feature = "mock")]
pub use mock::{MockClassifier, MockOutcome};
