//! A small prompt-generation pipeline.
//!
//! ```text
//! topics ──► expand (x3 tones) ──► prompts ──┐
//!                                            ├──► pair ──► export
//! styles ──► vary (x3 meters) ───► variants ─┘
//! ```
//!
//! `pair` matches a prompt with the variant that shares its source index
//! and fan-out index, so topic 2 tone 1 meets style 2 meter 1.
//!
//! Run it twice against the same ledger to see the second run replay:
//!
//! ```sh
//! CASCADE_LEDGER_URL=sqlite://./demo.db RUST_LOG=cascade=info \
//!     cargo run --example simple_pipeline
//! ```

use cascade::{
    source_fn, step_fn, Coordinator, EngineConfig, HistoryExport, StepInput, StepSpec,
    StreamBinding,
};
use serde_json::{json, Value};
use tracing::info;

const TOPICS: [&str; 4] = ["rivers", "bridges", "lighthouses", "orchards"];
const STYLES: [&str; 4] = ["haiku", "limerick", "sonnet", "ballad"];
const TONES: [&str; 3] = ["wistful", "cheerful", "stern"];
const METERS: [&str; 3] = ["strict", "loose", "free"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cascade=info,simple_pipeline=info".into()),
        )
        .init();

    let config = EngineConfig::from_env()?;
    let ledger = config.open_ledger().await?;
    info!(ledger = %config.ledger_url, "Opened ledger");

    let coordinator = Coordinator::builder(ledger)
        .config(config)
        .source(
            StepSpec::new("topics").output("topics"),
            source_fn(TOPICS.len() as u64, |i| async move {
                Ok(TOPICS.get(i as usize).map(|t| json!({ "topic": t })))
            }),
        )
        .source(
            StepSpec::new("styles").output("styles"),
            source_fn(STYLES.len() as u64, |i| async move {
                Ok(STYLES.get(i as usize).map(|s| json!(s)))
            }),
        )
        .step(
            StepSpec::new("expand").input("topics").output("prompts").parallel(2),
            step_fn(|input: StepInput| async move {
                let topic = input
                    .payload()
                    .and_then(|v| v["topic"].as_str())
                    .unwrap_or("nothing")
                    .to_string();
                Ok(TONES
                    .iter()
                    .map(|tone| json!(format!("a {tone} poem about {topic}")))
                    .collect())
            }),
        )
        .step(
            // Same fan-out width as expand so every prompt finds a partner
            StepSpec::new("vary").input("styles").output("variants"),
            step_fn(|input: StepInput| async move {
                let style = input.payload().and_then(Value::as_str).unwrap_or("verse").to_string();
                Ok(METERS.iter().map(|meter| json!(format!("{meter} {style}"))).collect())
            }),
        )
        .step(
            StepSpec::new("pair")
                .port("prompt", StreamBinding::new("prompts"))
                .port("style", StreamBinding::new("variants"))
                .output("poems"),
            step_fn(|input: StepInput| async move {
                let prompt = input.port("prompt").and_then(Value::as_str).unwrap_or_default();
                let style = input.port("style").and_then(Value::as_str).unwrap_or_default();
                Ok(vec![json!(format!("Write {prompt}, as a {style}."))])
            }),
        )
        .step(
            StepSpec::new("export").input("poems"),
            step_fn(|input: StepInput| async move {
                let export = HistoryExport::new(&input.id, input.history.clone().unwrap_or_default());
                let body = serde_json::to_string(&export)?;
                info!(file = %format!("{}.json", export.digest()), %body, "Exported");
                Ok::<Vec<Value>, anyhow::Error>(vec![])
            })
            .with_history(),
        )
        .build()?;

    let report = coordinator.run().await?;
    for step in &report.steps {
        info!(
            step = %step.step,
            done = step.done,
            replayed = step.replayed,
            failed = step.failed,
            unmatched = step.unmatched,
            "Step finished"
        );
    }
    info!(elapsed_ms = report.elapsed.as_millis() as u64, clean = report.is_clean(), "Run finished");
    Ok(())
}
