//! Shared pipeline builders and counters for integration tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use cascade::{
    source_fn, step_fn, Coordinator, CoordinatorBuilder, EngineConfig, Ledger, StepInput,
    StepSpec,
};
use serde_json::{json, Value};

static TRACING: Once = Once::new();

/// Initialize tracing once, honouring `RUST_LOG`.
///
/// Run tests with: RUST_LOG=cascade=debug cargo test -- --nocapture
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Config with a short debounce so tests finish quickly.
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_debounce(Duration::from_millis(25))
        .with_progress_interval(Duration::from_millis(200))
}

/// Counts step body invocations across runs.
#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicU64>);

impl Calls {
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// `gen(count) -> xform -> sink`, where xform appends `"!"` to the number
/// and sink records nothing.
pub fn linear(ledger: Arc<dyn Ledger>, count: u64, calls: &Calls) -> CoordinatorBuilder {
    init_tracing();

    let xform_calls = calls.clone();
    Coordinator::builder(ledger)
        .config(test_config())
        .source(
            StepSpec::new("gen").output("vars"),
            source_fn(count, |i| async move { Ok(Some(json!(i))) }),
        )
        .step(
            StepSpec::new("xform").input("vars").output("out").parallel(2),
            step_fn(move |input: StepInput| {
                let calls = xform_calls.clone();
                async move {
                    calls.hit();
                    let n = input.payload().and_then(Value::as_u64).unwrap_or_default();
                    Ok(vec![json!(format!("{n}!"))])
                }
            }),
        )
        .step(
            StepSpec::new("sink").input("out"),
            step_fn(|_input: StepInput| async { Ok(vec![]) }),
        )
}
