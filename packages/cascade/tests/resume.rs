//! Restart behaviour: replay of committed work and retry of failed work.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cascade::{
    source_fn, step_fn, Coordinator, Ledger, LineageId, MemoryLedger, StepInput, StepSpec,
    StreamBinding,
};
use common::{init_tracing, linear, test_config, Calls};
use serde_json::{json, Value};

fn id(s: &str) -> LineageId {
    LineageId::parse(s).unwrap()
}

#[tokio::test]
async fn second_run_replays_without_invoking_steps() {
    let ledger = Arc::new(MemoryLedger::new());
    let calls = Calls::default();

    let first = linear(ledger.clone(), 3, &calls).build().unwrap().run().await.unwrap();
    let before = ledger.records("xform").await.unwrap();
    assert_eq!(calls.get(), 3);

    let second = linear(ledger.clone(), 3, &calls).build().unwrap().run().await.unwrap();
    let after = ledger.records("xform").await.unwrap();

    assert_eq!(calls.get(), 3, "xform body ran again on restart");
    assert_eq!(first.step("sink").unwrap().done, 3);
    assert_eq!(second.step("gen").unwrap().done, 0);
    assert_eq!(second.step("gen").unwrap().replayed, 3);
    assert_eq!(second.step("sink").unwrap().replayed, 3);
    assert_eq!(second.step("sink").unwrap().committed, 3);

    let outputs = |records: &[cascade::LedgerRecord]| {
        let mut outputs: Vec<(String, Vec<Value>)> = records
            .iter()
            .map(|r| (r.lineage_id.to_string(), r.outputs.clone()))
            .collect();
        outputs.sort_by_key(|(id, v)| (id.clone(), serde_json::to_string(v).unwrap()));
        outputs
    };
    assert_eq!(outputs(&before), outputs(&after));
}

#[tokio::test]
async fn failed_item_is_retried_on_next_run() {
    init_tracing();
    let ledger = Arc::new(MemoryLedger::new());
    let broken = Arc::new(AtomicBool::new(true));
    let calls = Calls::default();

    let build = |ledger: Arc<MemoryLedger>| {
        let broken = broken.clone();
        let calls = calls.clone();
        Coordinator::builder(ledger)
            .config(test_config())
            .source(
                StepSpec::new("gen").output("vars"),
                source_fn(3, |i| async move { Ok(Some(json!(i))) }),
            )
            .step(
                StepSpec::new("flaky").input("vars"),
                step_fn(move |input: StepInput| {
                    let broken = broken.clone();
                    let calls = calls.clone();
                    async move {
                        calls.hit();
                        let n = input.payload().and_then(Value::as_u64).unwrap_or_default();
                        if n == 1 && broken.load(Ordering::SeqCst) {
                            anyhow::bail!("upstream unavailable");
                        }
                        Ok(vec![])
                    }
                }),
            )
            .build()
            .unwrap()
    };

    let first = build(ledger.clone()).run().await.unwrap();
    assert_eq!(first.step("flaky").unwrap().failed, 1);
    assert_eq!(first.step("flaky").unwrap().failures, ["gen:count=1/flaky"]);
    assert_eq!(calls.get(), 3);

    broken.store(false, Ordering::SeqCst);
    let second = build(ledger.clone()).run().await.unwrap();

    let flaky = second.step("flaky").unwrap();
    assert_eq!(flaky.done, 1);
    assert_eq!(flaky.replayed, 2);
    assert_eq!(flaky.failed, 0);
    assert_eq!(flaky.committed, 3);
    assert_eq!(calls.get(), 4);
    assert!(second.is_clean());
}

#[tokio::test]
async fn stale_claims_are_released_before_start() {
    let ledger = Arc::new(MemoryLedger::new());
    let calls = Calls::default();

    // A claim left behind by a process that died mid-step
    let orphan = id("gen:count=0/xform");
    ledger.try_claim("xform", &orphan).await.unwrap();

    let report = linear(ledger.clone(), 1, &calls).build().unwrap().run().await.unwrap();

    assert_eq!(report.released_claims, 1);
    assert_eq!(report.step("xform").unwrap().done, 1);
    assert_eq!(report.step("xform").unwrap().in_flight, 0);
    assert!(ledger.lookup("xform", &orphan).await.unwrap().unwrap().is_done());
}

/// Two sources joined by `pair`. On the first run `b`'s index 0 is slow,
/// so `b:count=1` reaches the join before `b:count=0`.
fn delayed_join(ledger: Arc<MemoryLedger>, slow: Arc<AtomicBool>, calls: &Calls) -> Coordinator {
    init_tracing();

    let pair_calls = calls.clone();
    Coordinator::builder(ledger)
        .config(test_config())
        .source(
            StepSpec::new("a").output("left"),
            source_fn(2, |i| async move { Ok(Some(json!(i))) }),
        )
        .source(
            StepSpec::new("b").output("right").parallel(2),
            source_fn(2, move |i| {
                let slow = slow.clone();
                async move {
                    if i == 0 && slow.load(Ordering::SeqCst) {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Ok(Some(json!(i * 10)))
                }
            }),
        )
        .step(
            StepSpec::new("pair")
                .port("l", StreamBinding::new("left"))
                .port("r", StreamBinding::new("right")),
            step_fn(move |input: StepInput| {
                let calls = pair_calls.clone();
                async move {
                    calls.hit();
                    let l = input.port("l").and_then(Value::as_u64).unwrap_or_default();
                    let r = input.port("r").and_then(Value::as_u64).unwrap_or_default();
                    Ok(vec![json!(l + r)])
                }
            }),
        )
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn join_pairs_are_stable_across_restarts() {
    let ledger = Arc::new(MemoryLedger::new());
    let slow = Arc::new(AtomicBool::new(true));
    let calls = Calls::default();

    let first = delayed_join(ledger.clone(), slow.clone(), &calls).run().await.unwrap();
    assert_eq!(first.step("pair").unwrap().done, 2);
    assert_eq!(calls.get(), 2);

    slow.store(false, Ordering::SeqCst);
    let second = delayed_join(ledger.clone(), slow.clone(), &calls).run().await.unwrap();

    let pair = second.step("pair").unwrap();
    assert_eq!(calls.get(), 2, "join body ran again on restart");
    assert_eq!(pair.done, 0);
    assert_eq!(pair.replayed, 2);
    assert_eq!(pair.committed, 2);
    assert!(second.is_clean());

    let mut ids: Vec<String> = ledger
        .records("pair")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.lineage_id.to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, ["[a:count=0|b:count=0]/pair", "[a:count=1|b:count=1]/pair"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fan_out_join_replays_on_second_run() {
    let ledger = Arc::new(MemoryLedger::new());
    let calls = Calls::default();

    let build = |ledger: Arc<MemoryLedger>| {
        init_tracing();
        let join_calls = calls.clone();
        let split = |parts: u64| {
            step_fn(move |input: StepInput| async move {
                let n = input.payload().and_then(Value::as_u64).unwrap_or_default();
                Ok((0..parts).map(|k| json!(n * 100 + k)).collect())
            })
        };
        Coordinator::builder(ledger)
            .config(test_config())
            .source(
                StepSpec::new("topics").output("topics"),
                source_fn(3, |i| async move { Ok(Some(json!(i))) }),
            )
            .source(
                StepSpec::new("styles").output("styles"),
                source_fn(3, |i| async move { Ok(Some(json!(i))) }),
            )
            .step(
                StepSpec::new("expand").input("topics").output("prompts").parallel(3),
                split(3),
            )
            .step(
                StepSpec::new("vary").input("styles").output("variants").parallel(2),
                split(3),
            )
            .step(
                StepSpec::new("pair")
                    .port("prompt", StreamBinding::new("prompts"))
                    .port("variant", StreamBinding::new("variants"))
                    .parallel(2),
                step_fn(move |input: StepInput| {
                    let calls = join_calls.clone();
                    async move {
                        calls.hit();
                        assert_eq!(input.port("prompt"), input.port("variant"));
                        Ok(vec![])
                    }
                }),
            )
            .build()
            .unwrap()
    };

    let first = build(ledger.clone()).run().await.unwrap();
    assert_eq!(first.step("pair").unwrap().done, 9);
    assert!(first.is_clean());

    let second = build(ledger.clone()).run().await.unwrap();
    assert_eq!(calls.get(), 9);
    assert_eq!(second.step("pair").unwrap().replayed, 9);
    assert_eq!(second.step("pair").unwrap().committed, 9);
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use cascade::SqliteLedger;

    fn temp_db() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("cascade-resume-{}.db", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn resumes_from_file_after_reopen() {
        let path = temp_db();
        let calls = Calls::default();

        {
            let ledger = Arc::new(SqliteLedger::open_path(&path).await.unwrap());
            let report = linear(ledger.clone(), 4, &calls).build().unwrap().run().await.unwrap();
            assert!(report.is_clean());
            ledger.close().await;
        }
        assert_eq!(calls.get(), 4);

        let ledger = Arc::new(SqliteLedger::open_path(&path).await.unwrap());
        let report = linear(ledger.clone(), 4, &calls).build().unwrap().run().await.unwrap();

        assert_eq!(calls.get(), 4, "committed units must not run twice");
        assert_eq!(report.step("xform").unwrap().replayed, 4);
        assert_eq!(report.step("sink").unwrap().committed, 4);

        let record = ledger
            .lookup("xform", &id("gen:count=2/xform"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.outputs, vec![json!("2!")]);

        ledger.close().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn grows_a_partially_finished_run() {
        let path = temp_db();
        let calls = Calls::default();

        let ledger = Arc::new(SqliteLedger::open_path(&path).await.unwrap());
        linear(ledger.clone(), 2, &calls).build().unwrap().run().await.unwrap();
        assert_eq!(calls.get(), 2);

        // Raising the source count only runs the new indices
        let report = linear(ledger.clone(), 5, &calls).build().unwrap().run().await.unwrap();
        assert_eq!(calls.get(), 5);
        assert_eq!(report.step("gen").unwrap().done, 3);
        assert_eq!(report.step("gen").unwrap().replayed, 2);
        assert_eq!(report.step("sink").unwrap().committed, 5);

        ledger.close().await;
        let _ = std::fs::remove_file(&path);
    }
}
