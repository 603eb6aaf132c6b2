//! # Cascade
//!
//! A resumable pipeline engine. Steps exchange lineage-addressed messages
//! over weighted streams, and every unit of work is recorded in a durable
//! ledger so an interrupted run picks up where it stopped.
//!
//! ## Core Concepts
//!
//! - [`LineageId`] = the address of a message: which source index it came
//!   from and which steps touched it on the way
//! - [`Stream`] = a named channel with weighted, deterministic routing to
//!   its consumers
//! - [`Step`] / [`Source`] = user code; sources emit `count` root messages,
//!   steps turn inputs into zero or more outputs
//! - [`Ledger`] = claim/commit records keyed by `(step, lineage id)`
//!
//! ## Architecture
//!
//! ```text
//! Source ──► stream ──► Step ──► stream ──► Step (fan-in) ──► ...
//!   │                    │                      │
//!   ▼                    ▼                      ▼
//!  Ledger.try_claim → process → publish outputs → Ledger.commit
//!
//! WorkTracker counts every unit from publish to commit; the
//! Coordinator stops the run once it stays at zero for the debounce window.
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Deterministic ids** - the same input always derives the same
//!    lineage id, so reruns find their earlier ledger records
//! 2. **Commit after publish** - a unit is marked done only once its
//!    outputs are on their streams
//! 3. **Replay, not recompute** - a committed unit republishes its stored
//!    outputs without running the step body again
//! 4. **Failures stay retryable** - a failed unit is rolled back and runs
//!    again on the next start
//!
//! ## Example
//!
//! ```ignore
//! use cascade::{source_fn, step_fn, Coordinator, EngineConfig, StepInput, StepSpec};
//! use serde_json::json;
//!
//! let config = EngineConfig::from_env()?;
//! let ledger = config.open_ledger().await?;
//!
//! let report = Coordinator::builder(ledger)
//!     .config(config)
//!     .source(
//!         StepSpec::new("ideas").output("vars"),
//!         source_fn(5, |i| async move { Ok(Some(json!({ "topic": i }))) }),
//!     )
//!     .step(
//!         StepSpec::new("expand").input("vars").output("prompts").parallel(2),
//!         step_fn(|input: StepInput| async move {
//!             let topic = &input.payload().unwrap_or(&json!(null))["topic"];
//!             Ok(vec![json!(format!("Write about {topic}"))])
//!         }),
//!     )
//!     .step(
//!         StepSpec::new("export").input("prompts"),
//!         step_fn(|_input: StepInput| async { Ok(vec![]) }),
//!     )
//!     .build()?
//!     .run()
//!     .await?;
//!
//! assert!(report.is_clean());
//! ```

pub mod config;
pub mod coordinator;
mod error;
pub mod history;
pub mod ledger;
pub mod lineage;
mod message;
pub mod registry;
pub mod runtime;
pub mod step;
pub mod stream;
pub mod topology;
pub mod tracker;

pub use config::EngineConfig;
pub use coordinator::{Coordinator, CoordinatorBuilder, RunReport, StepReport};
pub use error::{CascadeError, Result};
pub use history::{unroll, unroll_all, History, HistoryExport};
#[cfg(feature = "sqlite")]
pub use ledger::SqliteLedger;
pub use ledger::{ClaimOutcome, Ledger, LedgerRecord, LedgerStatus, MemoryLedger};
pub use lineage::LineageId;
pub use message::Message;
pub use registry::StepRegistry;
pub use step::{source_fn, step_fn, Source, Step, StepInput, StepKind, DEFAULT_PORT};
pub use stream::{Stream, StreamBinding};
pub use topology::{StepSpec, StreamSpec, TopologySpec};
pub use tracker::{WorkGuard, WorkTracker};

// Re-export async_trait for implementing Step and Source
pub use async_trait::async_trait;
