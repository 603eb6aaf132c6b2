//! Declarative description of a pipeline graph.
//!
//! A topology lists the steps, the stream each input port consumes (with
//! an optional `:weight`), and the streams each step publishes to. It is
//! plain serde data so loaders can feed it from JSON or YAML:
//!
//! ```json
//! {
//!   "streams": [{ "name": "prompts", "capacity": 32 }],
//!   "steps": [
//!     { "name": "gen", "type": "idea_source", "outputs": ["vars"],
//!       "params": { "count": 5 } },
//!     { "name": "expand", "type": "template", "parallel": 2,
//!       "inputs": { "input": "vars:1" }, "outputs": ["prompts"] }
//!   ]
//! }
//! ```
//!
//! [`TopologySpec::validate`] rejects graphs that could never run: streams
//! without consumers or producers, duplicate step names, sources with
//! inputs and transforms without them.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CascadeError, Result};
use crate::lineage::validate_step_name;
use crate::step::DEFAULT_PORT;
use crate::stream::StreamBinding;

fn default_parallel() -> usize {
    1
}

/// Per-stream settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamSpec {
    /// Stream name.
    pub name: String,
    /// Maximum pending messages before publishers suspend.
    #[serde(default)]
    pub capacity: Option<usize>,
}

/// One step of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    /// Unique step name; appears in every lineage id the step derives.
    pub name: String,
    /// Registry type name, for topologies built through a registry.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    /// Input ports and the stream each consumes. Empty for sources.
    #[serde(default)]
    pub inputs: IndexMap<String, StreamBinding>,
    /// Streams every output is published to.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Worker count.
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    /// Step-type specific parameters, decoded by the registry.
    #[serde(default)]
    pub params: Value,
}

impl StepSpec {
    /// A step with no ports, one worker and no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_type: None,
            inputs: IndexMap::new(),
            outputs: Vec::new(),
            parallel: default_parallel(),
            params: Value::Null,
        }
    }

    /// Set the registry type name.
    pub fn with_type(mut self, step_type: impl Into<String>) -> Self {
        self.step_type = Some(step_type.into());
        self
    }

    /// Consume `stream` on the default port with weight 1.
    pub fn input(self, stream: impl Into<String>) -> Self {
        self.port(DEFAULT_PORT, StreamBinding::new(stream))
    }

    /// Consume `stream` on the default port with `weight`.
    pub fn weighted_input(self, stream: impl Into<String>, weight: u32) -> Self {
        self.port(DEFAULT_PORT, StreamBinding::new(stream).with_weight(weight))
    }

    /// Bind a named input port.
    pub fn port(mut self, port: impl Into<String>, binding: StreamBinding) -> Self {
        self.inputs.insert(port.into(), binding);
        self
    }

    /// Publish outputs to `stream`.
    pub fn output(mut self, stream: impl Into<String>) -> Self {
        self.outputs.push(stream.into());
        self
    }

    /// Set the worker count.
    pub fn parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    /// Set the step parameters.
    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Whether the step takes no inputs.
    pub fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// A whole pipeline graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologySpec {
    /// Stream overrides. Streams referenced by steps exist implicitly.
    #[serde(default)]
    pub streams: Vec<StreamSpec>,
    /// Steps in declaration order.
    pub steps: Vec<StepSpec>,
}

impl TopologySpec {
    /// Parse a topology from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Add a step.
    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Add a stream override.
    pub fn stream(mut self, stream: StreamSpec) -> Self {
        self.streams.push(stream);
        self
    }

    /// Look up a step by name.
    pub fn find_step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Every stream name, in first-mention order.
    pub fn stream_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        let mentioned = self
            .streams
            .iter()
            .map(|s| s.name.as_str())
            .chain(self.steps.iter().flat_map(|step| {
                step.outputs
                    .iter()
                    .map(String::as_str)
                    .chain(step.inputs.values().map(|b| b.stream.as_str()))
            }));
        for name in mentioned {
            if seen.insert(name) {
                names.push(name.to_string());
            }
        }
        names
    }

    /// Capacity override for `stream`, if any.
    pub fn capacity_of(&self, stream: &str) -> Option<usize> {
        self.streams
            .iter()
            .find(|s| s.name == stream)
            .and_then(|s| s.capacity)
    }

    /// Check that the graph can run.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(CascadeError::topology("topology has no steps"));
        }

        let mut names = HashSet::new();
        let mut consumers: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut producers: HashMap<&str, Vec<&str>> = HashMap::new();

        for step in &self.steps {
            validate_step_name(&step.name)
                .map_err(|e| CascadeError::topology(format!("invalid step name: {e}")))?;
            if !names.insert(step.name.as_str()) {
                return Err(CascadeError::topology(format!(
                    "step {} is declared twice",
                    step.name
                )));
            }
            if step.parallel == 0 {
                return Err(CascadeError::topology(format!(
                    "step {} has parallel = 0",
                    step.name
                )));
            }

            let mut consumed = HashSet::new();
            for (port, binding) in &step.inputs {
                binding
                    .validate()
                    .map_err(|e| CascadeError::topology(format!("step {} port {port}: {e}", step.name)))?;
                if !consumed.insert(binding.stream.as_str()) {
                    return Err(CascadeError::topology(format!(
                        "step {} consumes stream {} on more than one port",
                        step.name, binding.stream
                    )));
                }
                consumers
                    .entry(binding.stream.as_str())
                    .or_default()
                    .push(step.name.as_str());
            }

            let mut published = HashSet::new();
            for stream in &step.outputs {
                validate_step_name(stream).map_err(|_| {
                    CascadeError::topology(format!(
                        "step {} publishes to invalid stream name {stream:?}",
                        step.name
                    ))
                })?;
                if !published.insert(stream.as_str()) {
                    return Err(CascadeError::topology(format!(
                        "step {} lists output stream {stream} twice",
                        step.name
                    )));
                }
                producers.entry(stream.as_str()).or_default().push(step.name.as_str());
            }
        }

        let mut overrides = HashSet::new();
        for stream in &self.streams {
            if !overrides.insert(stream.name.as_str()) {
                return Err(CascadeError::topology(format!(
                    "stream {} is configured twice",
                    stream.name
                )));
            }
            if stream.capacity == Some(0) {
                return Err(CascadeError::topology(format!(
                    "stream {} has capacity 0",
                    stream.name
                )));
            }
        }

        for name in self.stream_names() {
            if !consumers.contains_key(name.as_str()) {
                return Err(CascadeError::topology(format!("stream {name} has no consumers")));
            }
            if !producers.contains_key(name.as_str()) {
                return Err(CascadeError::topology(format!("stream {name} has no producers")));
            }
        }

        Ok(())
    }
}
