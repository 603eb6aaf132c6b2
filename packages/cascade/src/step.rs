//! The contract between the engine and step bodies.
//!
//! A pipeline has two kinds of steps:
//!
//! - [`Source`] - emits up to `count` root items, one per index
//! - [`Step`] - turns one item (or one item per input port, for fan-in
//!   steps) into zero, one or many outputs
//!
//! Bodies return `anyhow::Result`, so they can use `?` on any error type.
//! The runtime rolls the unit back on failure and the item is retried by
//! the next run.
//!
//! # Example
//!
//! ```ignore
//! struct Shout;
//!
//! #[async_trait]
//! impl Step for Shout {
//!     async fn process(&self, input: StepInput) -> anyhow::Result<Vec<Value>> {
//!         let text = input.payload().and_then(Value::as_str).unwrap_or_default();
//!         Ok(vec![json!(text.to_uppercase())])
//!     }
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

use crate::history::History;
use crate::lineage::LineageId;

/// Port name used by single-input steps.
pub const DEFAULT_PORT: &str = "input";

/// Everything a step sees for one unit of work.
#[derive(Debug, Clone)]
pub struct StepInput {
    /// The id the step's outputs derive from (the step's own base id).
    pub id: LineageId,
    /// The ids of the consumed messages, by port.
    pub parents: IndexMap<String, LineageId>,
    /// Input payloads, by port, in port declaration order.
    pub inputs: IndexMap<String, Value>,
    /// Committed ancestor payloads, for steps that request them.
    pub history: Option<History>,
}

impl StepInput {
    /// Payload of the first (for single-input steps, the only) port.
    pub fn payload(&self) -> Option<&Value> {
        self.inputs.values().next()
    }

    /// Payload received on `port`.
    pub fn port(&self, port: &str) -> Option<&Value> {
        self.inputs.get(port)
    }
}

/// A transform, fan-out or fan-in step.
#[async_trait]
pub trait Step: Send + Sync {
    /// Produce zero, one or many outputs for one unit of work.
    ///
    /// Returning an empty list marks the item as consumed without emitting
    /// anything downstream.
    async fn process(&self, input: StepInput) -> anyhow::Result<Vec<Value>>;

    /// Whether [`StepInput::history`] should be filled in.
    ///
    /// Unrolling walks the ledger for every ancestor, so only terminal steps
    /// such as exporters usually ask for it.
    fn needs_history(&self) -> bool {
        false
    }
}

/// A bounded generator of root items.
#[async_trait]
pub trait Source: Send + Sync {
    /// How many items the source emits; indices are `0..count`.
    fn count(&self) -> u64;

    /// Produce the payload for `index`, or `None` to skip it.
    async fn generate(&self, index: u64) -> anyhow::Result<Option<Value>>;
}

/// A step body as held by the runtime.
#[derive(Clone)]
pub enum StepKind {
    /// Emits root items; has no inputs.
    Source(Arc<dyn Source>),
    /// Consumes one message per input port.
    Transform(Arc<dyn Step>),
}

impl StepKind {
    /// Wrap a source.
    pub fn source(source: impl Source + 'static) -> Self {
        StepKind::Source(Arc::new(source))
    }

    /// Wrap a transform.
    pub fn transform(step: impl Step + 'static) -> Self {
        StepKind::Transform(Arc::new(step))
    }

    /// Whether this is a source.
    pub fn is_source(&self) -> bool {
        matches!(self, StepKind::Source(_))
    }
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Source(source) => write!(f, "Source(count={})", source.count()),
            StepKind::Transform(_) => f.write_str("Transform"),
        }
    }
}

// =============================================================================
// Closure adapters
// =============================================================================

/// A [`Step`] backed by an async closure.
pub struct FnStep<F> {
    f: F,
    history: bool,
}

impl<F> FnStep<F> {
    /// Request lineage history for every invocation.
    pub fn with_history(mut self) -> Self {
        self.history = true;
        self
    }
}

/// Build a [`Step`] from an async closure.
pub fn step_fn<F, Fut>(f: F) -> FnStep<F>
where
    F: Fn(StepInput) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vec<Value>>> + Send,
{
    FnStep { f, history: false }
}

#[async_trait]
impl<F, Fut> Step for FnStep<F>
where
    F: Fn(StepInput) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vec<Value>>> + Send,
{
    async fn process(&self, input: StepInput) -> anyhow::Result<Vec<Value>> {
        (self.f)(input).await
    }

    fn needs_history(&self) -> bool {
        self.history
    }
}

/// A [`Source`] backed by an async closure.
pub struct FnSource<F> {
    count: u64,
    f: F,
}

/// Build a [`Source`] of `count` items from an async closure.
pub fn source_fn<F, Fut>(count: u64, f: F) -> FnSource<F>
where
    F: Fn(u64) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send,
{
    FnSource { count, f }
}

#[async_trait]
impl<F, Fut> Source for FnSource<F>
where
    F: Fn(u64) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send,
{
    fn count(&self) -> u64 {
        self.count
    }

    async fn generate(&self, index: u64) -> anyhow::Result<Option<Value>> {
        (self.f)(index).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_step_and_ports() {
        let step = step_fn(|input: StepInput| async move {
            let left = input.port("left").and_then(Value::as_i64).unwrap_or(0);
            let right = input.port("right").and_then(Value::as_i64).unwrap_or(0);
            Ok(vec![json!(left + right)])
        });

        let a = LineageId::root("a", 0).unwrap();
        let b = LineageId::root("b", 0).unwrap();
        let input = StepInput {
            id: LineageId::merge([a.clone(), b.clone()], "sum").unwrap(),
            parents: IndexMap::from([("left".to_string(), a), ("right".to_string(), b)]),
            inputs: IndexMap::from([
                ("left".to_string(), json!(2)),
                ("right".to_string(), json!(3)),
            ]),
            history: None,
        };

        assert_eq!(input.payload(), Some(&json!(2)));
        assert_eq!(step.process(input).await.unwrap(), vec![json!(5)]);
        assert!(!step.needs_history());
    }

    #[tokio::test]
    async fn test_fn_source() {
        let source = source_fn(3, |i| async move {
            Ok(if i == 1 { None } else { Some(json!(i)) })
        });
        assert_eq!(source.count(), 3);
        assert_eq!(source.generate(0).await.unwrap(), Some(json!(0)));
        assert_eq!(source.generate(1).await.unwrap(), None);
        assert!(StepKind::source(source).is_source());
    }
}
