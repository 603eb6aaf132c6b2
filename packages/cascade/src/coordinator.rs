//! Wires steps and streams into a running pipeline and detects completion.
//!
//! # Lifecycle
//!
//! 1. **Build**: validate the topology, create every stream, bind every
//!    step's ports and outputs. Any problem is a fatal topology error and
//!    nothing runs.
//! 2. **Start**: release in-progress claims left by a crashed run, then
//!    spawn every step's worker pool.
//! 3. **Drain**: wait until the outstanding-work count reaches zero and
//!    stays there, with no change at all, for the debounce window.
//! 4. **Stop**: cancel every worker, collect the per-step report.
//!
//! A fatal error from any worker (ledger failure, broken topology) cancels
//! the run and is returned instead of the report.
//!
//! # Example
//!
//! ```ignore
//! let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::open("sqlite://./run.db").await?);
//!
//! let report = Coordinator::builder(ledger)
//!     .source(StepSpec::new("gen").output("vars"), ideas)
//!     .step(StepSpec::new("expand").input("vars").output("prompts"), template)
//!     .step(StepSpec::new("export").input("prompts"), exporter)
//!     .build()?
//!     .run()
//!     .await?;
//!
//! info!(failed = report.total_failed(), "run finished");
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{CascadeError, Result};
use crate::ledger::Ledger;
use crate::registry::StepRegistry;
use crate::runtime::StepRuntime;
use crate::step::{Source, Step, StepKind};
use crate::stream::Stream;
use crate::topology::{StepSpec, StreamSpec, TopologySpec};
use crate::tracker::WorkTracker;

// =============================================================================
// Reports
// =============================================================================

/// Outcome of one step in one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Step name.
    pub step: String,
    /// Units executed and committed during this run.
    pub done: u64,
    /// Units already committed by an earlier run and replayed.
    pub replayed: u64,
    /// Units skipped because they were claimed concurrently.
    pub in_flight: u64,
    /// Units that failed and remain retryable.
    pub failed: u64,
    /// Messages published to output streams.
    pub emitted: u64,
    /// Join inputs that never found a partner.
    pub unmatched: u64,
    /// Done records in the ledger after the run, across all runs.
    pub committed: u64,
    /// Ids of the failed units.
    pub failures: Vec<String>,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    /// One report per step, in declaration order.
    pub steps: Vec<StepReport>,
    /// Stale claims released before the run started.
    pub released_claims: u64,
    /// Wall time from start to quiescence.
    pub elapsed: Duration,
}

impl RunReport {
    /// Report for `step`.
    pub fn step(&self, step: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step == step)
    }

    /// Failed units across all steps.
    pub fn total_failed(&self) -> u64 {
        self.steps.iter().map(|s| s.failed).sum()
    }

    /// Unmatched join inputs across all steps.
    pub fn total_unmatched(&self) -> u64 {
        self.steps.iter().map(|s| s.unmatched).sum()
    }

    /// Whether every unit reached a committed state.
    pub fn is_clean(&self) -> bool {
        self.total_failed() == 0 && self.total_unmatched() == 0
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`Coordinator`] from step specs and step bodies.
pub struct CoordinatorBuilder {
    config: EngineConfig,
    ledger: Arc<dyn Ledger>,
    topology: TopologySpec,
    kinds: HashMap<String, StepKind>,
}

impl CoordinatorBuilder {
    /// Start a builder around `ledger` with default settings.
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            config: EngineConfig::default(),
            ledger,
            topology: TopologySpec::default(),
            kinds: HashMap::new(),
        }
    }

    /// Use `config` for debounce, stream bounds and progress logging.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Override a stream's settings.
    pub fn stream(mut self, spec: StreamSpec) -> Self {
        self.topology.streams.push(spec);
        self
    }

    /// Add a source step.
    pub fn source(self, spec: StepSpec, source: impl Source + 'static) -> Self {
        self.add(spec, StepKind::source(source))
    }

    /// Add a transform, fan-out or fan-in step.
    pub fn step(self, spec: StepSpec, step: impl Step + 'static) -> Self {
        self.add(spec, StepKind::transform(step))
    }

    /// Add a step with an already wrapped body.
    pub fn add(mut self, spec: StepSpec, kind: StepKind) -> Self {
        self.kinds.insert(spec.name.clone(), kind);
        self.topology.steps.push(spec);
        self
    }

    /// Validate the graph and wire every stream and step.
    pub fn build(mut self) -> Result<Coordinator> {
        self.topology.validate()?;

        let tracker = Arc::new(WorkTracker::new());
        let shutdown = CancellationToken::new();

        let mut streams = IndexMap::new();
        for name in self.topology.stream_names() {
            let mut stream = Stream::new(name.clone(), tracker.clone(), shutdown.clone());
            if let Some(capacity) = self
                .topology
                .capacity_of(&name)
                .or(self.config.stream_capacity)
            {
                stream = stream.with_capacity(capacity);
            }
            streams.insert(name, Arc::new(stream));
        }

        let mut runtimes = Vec::with_capacity(self.topology.steps.len());
        for spec in &self.topology.steps {
            let kind = self.kinds.remove(&spec.name).ok_or_else(|| {
                CascadeError::topology(format!("step {} has no body", spec.name))
            })?;
            if kind.is_source() != spec.is_source() {
                return Err(CascadeError::topology(if kind.is_source() {
                    format!("source step {} cannot have inputs", spec.name)
                } else {
                    format!("step {} has no inputs", spec.name)
                }));
            }

            let mut runtime = StepRuntime::new(
                spec.name.clone(),
                kind,
                self.ledger.clone(),
                tracker.clone(),
            )
            .with_parallel(spec.parallel);

            for (port, binding) in &spec.inputs {
                runtime = runtime.with_input(port.clone(), streams[&binding.stream].clone(), binding.weight)?;
            }
            for output in &spec.outputs {
                runtime = runtime.with_output(streams[output].clone());
            }
            runtimes.push(Arc::new(runtime));
        }

        Ok(Coordinator {
            config: self.config,
            ledger: self.ledger,
            tracker,
            shutdown,
            streams,
            runtimes,
        })
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// A wired pipeline, ready to run once.
pub struct Coordinator {
    config: EngineConfig,
    ledger: Arc<dyn Ledger>,
    tracker: Arc<WorkTracker>,
    shutdown: CancellationToken,
    streams: IndexMap<String, Arc<Stream>>,
    runtimes: Vec<Arc<StepRuntime>>,
}

impl Coordinator {
    /// Start building a pipeline around `ledger`.
    pub fn builder(ledger: Arc<dyn Ledger>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(ledger)
    }

    /// Build a pipeline from a declarative topology.
    ///
    /// Every step's body is created by `registry` from the step's `type`
    /// and `params`.
    pub fn from_spec(
        topology: TopologySpec,
        registry: &StepRegistry,
        ledger: Arc<dyn Ledger>,
        config: EngineConfig,
    ) -> Result<Self> {
        topology.validate()?;

        let mut builder = CoordinatorBuilder::new(ledger).config(config);
        for stream in topology.streams {
            builder = builder.stream(stream);
        }
        for spec in topology.steps {
            let kind = registry.build(&spec)?;
            builder = builder.add(spec, kind);
        }
        builder.build()
    }

    /// Token that stops the run early when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Look up a stream by name.
    pub fn stream(&self, name: &str) -> Option<&Arc<Stream>> {
        self.streams.get(name)
    }

    /// Run until the pipeline drains, then stop every worker.
    pub async fn run(self) -> Result<RunReport> {
        let started = Instant::now();

        let released_claims = self.ledger.release_stale_claims().await?;
        if released_claims > 0 {
            info!(released_claims, "Released claims left by an earlier run");
        }

        info!(
            steps = self.runtimes.len(),
            streams = self.streams.len(),
            debounce_ms = self.config.debounce.as_millis() as u64,
            "Starting cascade run"
        );

        let mut workers = JoinSet::new();
        for runtime in &self.runtimes {
            runtime.spawn(&mut workers, &self.shutdown);
        }

        let mut fatal = self.supervise(&mut workers).await.err();
        self.shutdown.cancel();

        while let Some(joined) = workers.join_next().await {
            let outcome = joined.map_err(|e| CascadeError::WorkerCrashed {
                step: "unknown".to_string(),
                reason: e.to_string(),
            });
            match outcome.and_then(|result| result) {
                Ok(()) => {}
                Err(e) if e.is_fatal() && fatal.is_none() => fatal = Some(e),
                Err(e) => debug!(error = %e, "Worker stopped with error during shutdown"),
            }
        }

        for runtime in &self.runtimes {
            runtime.drain_unmatched();
        }

        if let Some(e) = fatal {
            error!(error = %e, "Cascade run aborted");
            return Err(e);
        }

        let mut steps = Vec::with_capacity(self.runtimes.len());
        for runtime in &self.runtimes {
            let stats = runtime.stats();
            steps.push(StepReport {
                step: runtime.name().to_string(),
                done: stats.done(),
                replayed: stats.replayed(),
                in_flight: stats.in_flight(),
                failed: stats.failed(),
                emitted: stats.emitted(),
                unmatched: stats.unmatched(),
                committed: self.ledger.count_done(runtime.name()).await? as u64,
                failures: stats.failures(),
            });
        }

        let report = RunReport {
            steps,
            released_claims,
            elapsed: started.elapsed(),
        };

        if report.is_clean() {
            info!(elapsed_ms = report.elapsed.as_millis() as u64, "Cascade run complete");
        } else {
            warn!(
                failed = report.total_failed(),
                unmatched = report.total_unmatched(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Cascade run complete with unfinished items"
            );
        }
        Ok(report)
    }

    /// Wait for quiescence, an external shutdown, or a fatal worker error.
    async fn supervise(&self, workers: &mut JoinSet<Result<()>>) -> Result<()> {
        let quiescent = self.tracker.wait_quiescent(self.config.debounce);
        tokio::pin!(quiescent);

        let mut progress =
            tokio::time::interval(self.config.progress_interval.max(Duration::from_millis(1)));
        progress.tick().await;

        loop {
            tokio::select! {
                _ = &mut quiescent => {
                    debug!("Pipeline quiescent");
                    return Ok(());
                }
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, stopping workers");
                    return Ok(());
                }
                Some(joined) = workers.join_next() => {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) if e.is_fatal() => return Err(e),
                        Ok(Err(e)) => warn!(error = %e, "Worker stopped"),
                        Err(e) => {
                            return Err(CascadeError::WorkerCrashed {
                                step: "unknown".to_string(),
                                reason: e.to_string(),
                            })
                        }
                    }
                }
                _ = progress.tick() => self.log_progress(),
            }
        }
    }

    fn log_progress(&self) {
        let snapshot = self.tracker.snapshot();
        let busy: Vec<String> = self
            .streams
            .values()
            .filter(|s| !s.is_empty())
            .map(|s| format!("{}={}", s.name(), s.pending_len()))
            .collect();
        let done: u64 = self.runtimes.iter().map(|r| r.stats().done()).sum();

        debug!(
            outstanding = snapshot.outstanding,
            parked = snapshot.parked,
            done,
            pending = ?busy,
            "Waiting for pipeline to drain"
        );
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("steps", &self.runtimes.iter().map(|r| r.name()).collect::<Vec<_>>())
            .field("streams", &self.streams.keys().collect::<Vec<_>>())
            .field("tracker", &self.tracker)
            .finish()
    }
}
