//! Asynchronous categorization pipeline: producer, worker pool, and result
//! applier.
//!
//! The [`Producer`] is the only component that creates jobs; the
//! [`WorkerPool`] is the only component that processes them; the
//! [`ResultApplier`] is the only component that writes classification
//! outcomes back onto transactions. The job store is the single point of
//! coordination between them.

pub mod applier;
pub mod producer;
pub mod worker;

pub use applier::ResultApplier;
pub use producer::Producer;
pub use worker::{WorkerConfig, WorkerEvent, WorkerHandle, WorkerPool};
