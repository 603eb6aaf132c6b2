//! Worker pools that execute one step.
//!
//! A [`StepRuntime`] owns a step body, its input ports, its output streams
//! and a handle to the ledger. [`StepRuntime::spawn`] starts `parallel`
//! workers. Every unit of work follows the same protocol:
//!
//! 1. `try_claim` the unit's id in the ledger
//! 2. already done: re-publish the committed outputs unchanged
//! 3. claimed elsewhere in this process: skip
//! 4. otherwise run the body, publish its outputs, then `commit`
//! 5. on failure or panic: `rollback`, so the next run retries it
//!
//! Three worker shapes exist:
//!
//! - **source**: walks its share of `0..count`, one root id per index
//! - **transform**: claims one message, derives `parent/step`
//! - **join**: buffers inputs by their lineage ordinals and pairs inputs
//!   whose ordinals match on every port, deriving `[a|b|...]/step`. The
//!   pairs depend only on the ids, so a restarted run forms the same
//!   pairs and finds them in the ledger
//!
//! Step failures are local and counted. Ledger failures are fatal and
//! end the worker with an error, which stops the run.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use futures::FutureExt;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{CascadeError, Result};
use crate::history::{self, History};
use crate::ledger::{ClaimOutcome, Ledger};
use crate::lineage::LineageId;
use crate::message::Message;
use crate::step::{Source, Step, StepInput, StepKind};
use crate::stream::{ConsumerId, Delivery, Stream};
use crate::tracker::{WorkGuard, WorkTracker};

// =============================================================================
// Stats
// =============================================================================

/// Per-step counters for one run.
#[derive(Debug, Default)]
pub struct StepStats {
    done: AtomicU64,
    replayed: AtomicU64,
    in_flight: AtomicU64,
    failed: AtomicU64,
    emitted: AtomicU64,
    unmatched: AtomicU64,
    failures: Mutex<Vec<String>>,
}

impl StepStats {
    /// Units executed and committed in this run.
    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    /// Units found already done and re-published from the ledger.
    pub fn replayed(&self) -> u64 {
        self.replayed.load(Ordering::Relaxed)
    }

    /// Units skipped because another worker held their claim.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Units whose body failed; they stay retryable.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Messages published, counting replays.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Join inputs still waiting for a partner at shutdown.
    pub fn unmatched(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    /// Ids of the units that failed.
    pub fn failures(&self) -> Vec<String> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_failure(&self, id: &LineageId) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id.to_string());
    }
}

// =============================================================================
// Step Runtime
// =============================================================================

/// One input port bound to a stream.
#[derive(Debug)]
pub struct InputPort {
    /// Port name, as seen by the step in [`StepInput::inputs`].
    pub name: String,
    /// The stream this port consumes.
    pub stream: Arc<Stream>,
    consumer: ConsumerId,
}

/// Executes one step with a fixed pool of workers.
pub struct StepRuntime {
    name: String,
    kind: StepKind,
    parallel: usize,
    ports: Vec<InputPort>,
    outputs: Vec<Arc<Stream>>,
    ledger: Arc<dyn Ledger>,
    tracker: Arc<WorkTracker>,
    stats: StepStats,
    /// Claimed join inputs waiting for a partner.
    join: Mutex<JoinBuffer>,
}

/// Join inputs keyed by [`LineageId::ordinals`], then one id-sorted list
/// per port.
type JoinBuffer = BTreeMap<Vec<u64>, Vec<Vec<Delivery>>>;

impl StepRuntime {
    /// Create a runtime with one worker and no ports.
    pub fn new(
        name: impl Into<String>,
        kind: StepKind,
        ledger: Arc<dyn Ledger>,
        tracker: Arc<WorkTracker>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            parallel: 1,
            ports: Vec::new(),
            outputs: Vec::new(),
            ledger,
            tracker,
            stats: StepStats::default(),
            join: Mutex::new(BTreeMap::new()),
        }
    }

    /// Set the worker count (at least 1).
    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    /// Bind `port` to `stream` as a consumer with `weight`.
    pub fn with_input(mut self, port: impl Into<String>, stream: Arc<Stream>, weight: u32) -> Result<Self> {
        if self.kind.is_source() {
            return Err(CascadeError::topology(format!(
                "source step {} cannot consume stream {}",
                self.name,
                stream.name()
            )));
        }
        let consumer = stream.register_consumer(self.name.clone(), weight)?;
        self.ports.push(InputPort {
            name: port.into(),
            stream,
            consumer,
        });
        Ok(self)
    }

    /// Publish every output to `stream`.
    pub fn with_output(mut self, stream: Arc<Stream>) -> Self {
        self.outputs.push(stream);
        self
    }

    /// Step name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Worker count.
    pub fn parallel(&self) -> usize {
        self.parallel
    }

    /// Bound input ports.
    pub fn ports(&self) -> &[InputPort] {
        &self.ports
    }

    /// Counters for this run.
    pub fn stats(&self) -> &StepStats {
        &self.stats
    }

    /// Whether the step body is a source.
    pub fn is_source(&self) -> bool {
        self.kind.is_source()
    }

    fn needs_history(&self) -> bool {
        match &self.kind {
            StepKind::Transform(step) => step.needs_history(),
            StepKind::Source(_) => false,
        }
    }

    fn join_state(&self) -> MutexGuard<'_, JoinBuffer> {
        self.join.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the worker pool.
    ///
    /// Source workers hold an outstanding unit from the moment they are
    /// spawned until their index range is exhausted.
    pub fn spawn(self: &Arc<Self>, workers: &mut JoinSet<Result<()>>, shutdown: &CancellationToken) {
        info!(step = %self.name, parallel = self.parallel, inputs = self.ports.len(), "Starting step workers");

        for worker in 0..self.parallel {
            let runtime = self.clone();
            let shutdown = shutdown.child_token();
            let task = match &self.kind {
                StepKind::Source(source) => {
                    let source = source.clone();
                    let guard = WorkGuard::acquire(self.tracker.clone(), 1);
                    async move {
                        let _guard = guard;
                        runtime.run_source(source, worker, shutdown).await
                    }
                    .boxed()
                }
                StepKind::Transform(step) if self.ports.len() == 1 => {
                    let step = step.clone();
                    async move { runtime.run_transform(step).await }.boxed()
                }
                StepKind::Transform(step) => {
                    let step = step.clone();
                    async move { runtime.run_join(step).await }.boxed()
                }
            };

            let step_name = self.name.clone();
            workers.spawn(async move {
                match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic_info) => Err(CascadeError::WorkerCrashed {
                        step: step_name,
                        reason: extract_panic_message(&panic_info),
                    }),
                }
            });
        }
    }

    async fn run_source(&self, source: Arc<dyn Source>, worker: usize, shutdown: CancellationToken) -> Result<()> {
        let count = source.count();
        for index in (worker as u64..count).step_by(self.parallel) {
            if shutdown.is_cancelled() {
                debug!(step = %self.name, worker, index, "Source stopped by shutdown");
                break;
            }

            let unit = LineageId::root(self.name.as_str(), index)?;
            let source = source.clone();
            self.process_unit(&unit, &[], move |_| async move {
                let payload = source.generate(index).await?;
                Ok::<Vec<Value>, anyhow::Error>(payload.into_iter().collect())
            })
            .await?;
        }

        trace!(step = %self.name, worker, "Source worker finished");
        Ok(())
    }

    async fn run_transform(&self, step: Arc<dyn Step>) -> Result<()> {
        let port = &self.ports[0];
        while let Some(delivery) = port.stream.claim(port.consumer).await? {
            let (message, _guard) = delivery.into_parts();
            let unit = LineageId::chain(&message.id, self.name.as_str(), None)?;

            let parents = IndexMap::from([(port.name.clone(), message.id)]);
            let inputs = IndexMap::from([(port.name.clone(), message.payload)]);
            self.invoke(&step, unit, parents, inputs).await?;
        }
        Ok(())
    }

    async fn run_join(&self, step: Arc<dyn Step>) -> Result<()> {
        loop {
            let claims = self
                .ports
                .iter()
                .map(|port| Box::pin(port.stream.claim(port.consumer)));
            let (claimed, position, _) = futures::future::select_all(claims).await;

            let delivery = match claimed? {
                Some(delivery) => delivery,
                None => break,
            };

            if let Some(set) = self.park_join_input(position, delivery) {
                let mut guards = Vec::with_capacity(set.len());
                let mut parents = IndexMap::new();
                let mut inputs = IndexMap::new();
                for (port, delivery) in self.ports.iter().zip(set) {
                    let (message, guard) = delivery.into_parts();
                    guards.push(guard);
                    parents.insert(port.name.clone(), message.id);
                    inputs.insert(port.name.clone(), message.payload);
                }

                let unit = LineageId::merge(parents.values().cloned(), self.name.as_str())?;
                self.invoke(&step, unit, parents, inputs).await?;
                drop(guards);
            }
        }
        Ok(())
    }

    /// Buffer a claimed join input under its ordinals.
    ///
    /// Returns one input per port, in port order, once every port holds an
    /// input with the same ordinals. Several inputs with equal ordinals on
    /// one port are taken smallest id first.
    fn park_join_input(&self, position: usize, delivery: Delivery) -> Option<Vec<Delivery>> {
        let key = delivery.message.id.ordinals();
        let mut join = self.join_state();
        let slots = join
            .entry(key.clone())
            .or_insert_with(|| self.ports.iter().map(|_| Vec::new()).collect());

        let queue = &mut slots[position];
        let at = queue.partition_point(|held| held.message.id < delivery.message.id);
        queue.insert(at, delivery);

        if slots.iter().any(Vec::is_empty) {
            trace!(step = %self.name, port = %self.ports[position].name, key = ?key, "Holding join input");
            self.tracker.park(1);
            return None;
        }

        let set: Vec<Delivery> = slots.iter_mut().map(|queue| queue.remove(0)).collect();
        if slots.iter().all(Vec::is_empty) {
            join.remove(&key);
        }
        // The input that completed the set was never parked
        self.tracker.unpark(set.len() - 1);
        Some(set)
    }

    /// Release join inputs that never found a partner.
    ///
    /// Called once every worker has stopped. Returns how many were dropped.
    pub fn drain_unmatched(&self) -> u64 {
        let buffer = std::mem::take(&mut *self.join_state());
        let leftovers: Vec<Delivery> = buffer.into_values().flatten().flatten().collect();

        for delivery in &leftovers {
            warn!(step = %self.name, id = %delivery.message.id, "Join input had no partner");
        }

        let count = leftovers.len();
        // Parked units were already removed from the outstanding count
        self.tracker.unpark(count);
        drop(leftovers);

        self.stats.unmatched.fetch_add(count as u64, Ordering::Relaxed);
        count as u64
    }

    async fn invoke(
        &self,
        step: &Arc<dyn Step>,
        unit: LineageId,
        parents: IndexMap<String, LineageId>,
        inputs: IndexMap<String, Value>,
    ) -> Result<()> {
        let parent_ids: Vec<LineageId> = parents.values().cloned().collect();
        let step = step.clone();
        let id = unit.clone();
        self.process_unit(&unit, &parent_ids, move |history| async move {
            step.process(StepInput {
                id,
                parents,
                inputs,
                history,
            })
            .await
        })
        .await
    }

    /// Run the claim / execute / commit protocol for one unit.
    async fn process_unit<B, Fut>(&self, unit: &LineageId, parents: &[LineageId], body: B) -> Result<()>
    where
        B: FnOnce(Option<History>) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Vec<Value>>> + Send,
    {
        match self.ledger.try_claim(&self.name, unit).await? {
            ClaimOutcome::AlreadyDone(record) => {
                trace!(step = %self.name, id = %unit, outputs = record.outputs.len(), "Replaying committed unit");
                match self.publish_outputs(unit, &record.outputs).await {
                    Ok(()) => {
                        self.stats.replayed.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(e) if e.is_fatal() => Err(e),
                    Err(_) => Ok(()),
                }
            }
            ClaimOutcome::InFlight => {
                debug!(step = %self.name, id = %unit, "Unit claimed by another worker, skipping");
                self.stats.in_flight.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            ClaimOutcome::Proceed => self.execute(unit, parents, body).await,
        }
    }

    async fn execute<B, Fut>(&self, unit: &LineageId, parents: &[LineageId], body: B) -> Result<()>
    where
        B: FnOnce(Option<History>) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Vec<Value>>> + Send,
    {
        let history = if self.needs_history() {
            match history::unroll_all(self.ledger.as_ref(), parents).await {
                Ok(history) => Some(history),
                Err(e) => {
                    self.ledger.rollback(&self.name, unit).await?;
                    return Err(e);
                }
            }
        } else {
            None
        };

        // AssertUnwindSafe is required because step bodies are not UnwindSafe
        let outputs = match AssertUnwindSafe(body(history.clone())).catch_unwind().await {
            Ok(Ok(outputs)) => outputs,
            Ok(Err(e)) => return self.fail(unit, e).await,
            Err(panic_info) => {
                let panic_msg = extract_panic_message(&panic_info);
                return self.fail(unit, anyhow!("step panicked: {}", panic_msg)).await;
            }
        };

        if outputs.len() > 1 && !matches!(unit, LineageId::Chain { .. }) {
            let err = anyhow!(
                "produced {} outputs; only transforms may fan out",
                outputs.len()
            );
            return self.fail(unit, err).await;
        }

        if let Err(e) = self.publish_outputs(unit, &outputs).await {
            self.ledger.rollback(&self.name, unit).await?;
            return if e.is_fatal() { Err(e) } else { Ok(()) };
        }

        self.ledger
            .commit(&self.name, unit, &outputs, history.as_ref())
            .await?;
        self.stats.done.fetch_add(1, Ordering::Relaxed);
        debug!(step = %self.name, id = %unit, outputs = outputs.len(), "Committed unit");
        Ok(())
    }

    async fn fail(&self, unit: &LineageId, source: anyhow::Error) -> Result<()> {
        let err = CascadeError::StepExecution {
            step: self.name.clone(),
            id: unit.to_string(),
            source,
        };
        warn!(step = %self.name, id = %unit, error = %err, "Step failed, unit left for retry");

        self.ledger.rollback(&self.name, unit).await?;
        self.stats.record_failure(unit);
        Ok(())
    }

    async fn publish_outputs(&self, unit: &LineageId, outputs: &[Value]) -> Result<()> {
        let total = outputs.len();
        for (position, payload) in outputs.iter().enumerate() {
            let id = output_id(unit, position, total)?;
            for stream in &self.outputs {
                stream.publish(Message::new(id.clone(), payload.clone())).await?;
                self.stats.emitted.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for StepRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRuntime")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("parallel", &self.parallel)
            .field("ports", &self.ports.len())
            .field("outputs", &self.outputs.len())
            .finish_non_exhaustive()
    }
}

/// Id of the `position`-th of `total` outputs of `unit`.
///
/// A single output keeps the unit's id. Several outputs of a transform get
/// `:index=K` on the last link.
pub fn output_id(unit: &LineageId, position: usize, total: usize) -> Result<LineageId> {
    if total <= 1 {
        return Ok(unit.clone());
    }
    match unit {
        LineageId::Chain { parent, step, .. } => {
            LineageId::chain(parent, step.as_str(), Some(position as u64))
        }
        other => Err(CascadeError::malformed(
            &other.to_string(),
            "only chain links carry a fan-out index",
        )),
    }
}

/// Extract a readable message from a panic payload.
fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
