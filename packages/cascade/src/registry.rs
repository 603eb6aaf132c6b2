//! Registry mapping step type names to typed factories.
//!
//! Topologies loaded from data name their steps by type (`"template"`,
//! `"idea_source"`, ...). The registry turns a [`StepSpec`] into a runnable
//! [`StepKind`] by decoding the step's `params` into the factory's config
//! type and calling the factory. Decoding happens once, when the topology
//! is built, so bad parameters are rejected before any worker starts.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Deserialize)]
//! #[serde(deny_unknown_fields)]
//! struct TemplateConfig {
//!     template: String,
//! }
//!
//! let mut registry = StepRegistry::new();
//! registry.register_step("template", |config: TemplateConfig| Ok(Template::new(config.template)));
//!
//! let coordinator = Coordinator::from_spec(topology, &registry, ledger, EngineConfig::default())?;
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{CascadeError, Result};
use crate::step::{Source, Step, StepKind};
use crate::topology::StepSpec;

/// Type-erased factory function.
type FactoryFn = Box<dyn Fn(&Value) -> anyhow::Result<StepKind> + Send + Sync>;

/// Internal representation of a registered step type.
struct StepFactory {
    /// Whether the factory produces a source.
    source: bool,
    /// The factory function.
    build: FactoryFn,
}

fn decode<C: DeserializeOwned>(params: &Value) -> anyhow::Result<C> {
    // Missing params mean "all defaults"
    let params = match params {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(params).map_err(|e| anyhow::anyhow!("invalid params: {}", e))
}

/// Registry of step types.
#[derive(Default)]
pub struct StepRegistry {
    factories: HashMap<String, StepFactory>,
}

impl StepRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transform type.
    ///
    /// # Type Parameters
    ///
    /// * `C` - The step's config type, decoded from `params`. Use
    ///   `#[serde(deny_unknown_fields)]` to reject typos.
    ///
    /// # Panics
    ///
    /// Panics if a factory is already registered for this type name.
    pub fn register_step<C, S, F>(&mut self, type_name: &str, factory: F)
    where
        C: DeserializeOwned + 'static,
        S: Step + 'static,
        F: Fn(C) -> anyhow::Result<S> + Send + Sync + 'static,
    {
        let build: FactoryFn = Box::new(move |params: &Value| {
            let config: C = decode(params)?;
            Ok(StepKind::transform(factory(config)?))
        });
        self.insert(type_name, false, build);
    }

    /// Register a source type.
    ///
    /// # Panics
    ///
    /// Panics if a factory is already registered for this type name.
    pub fn register_source<C, S, F>(&mut self, type_name: &str, factory: F)
    where
        C: DeserializeOwned + 'static,
        S: Source + 'static,
        F: Fn(C) -> anyhow::Result<S> + Send + Sync + 'static,
    {
        let build: FactoryFn = Box::new(move |params: &Value| {
            let config: C = decode(params)?;
            Ok(StepKind::source(factory(config)?))
        });
        self.insert(type_name, true, build);
    }

    fn insert(&mut self, type_name: &str, source: bool, build: FactoryFn) {
        if self.factories.contains_key(type_name) {
            panic!("factory already registered for step type: {}", type_name);
        }
        self.factories
            .insert(type_name.to_string(), StepFactory { source, build });
    }

    /// Build the step described by `spec`.
    ///
    /// # Errors
    ///
    /// - `Topology` if the step has no type, the type is unknown, or a
    ///   source type is bound to inputs (or a transform to none)
    /// - `Config` if the params do not decode or the factory refuses them
    pub fn build(&self, spec: &StepSpec) -> Result<StepKind> {
        let type_name = spec.step_type.as_deref().ok_or_else(|| {
            CascadeError::topology(format!("step {} has no type", spec.name))
        })?;

        let entry = self.factories.get(type_name).ok_or_else(|| {
            CascadeError::topology(format!(
                "step {} has unknown type {type_name:?}",
                spec.name
            ))
        })?;

        if entry.source != spec.is_source() {
            let expected = if entry.source { "no inputs" } else { "at least one input" };
            return Err(CascadeError::topology(format!(
                "step {} of type {type_name} needs {expected}",
                spec.name
            )));
        }

        (entry.build)(&spec.params).map_err(|e| {
            CascadeError::Config(format!("step {} ({type_name}): {e:#}", spec.name))
        })
    }

    /// Check if a type name is registered.
    pub fn has(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Get the number of registered types.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.factories.keys().collect();
        types.sort();
        f.debug_struct("StepRegistry")
            .field("registered_types", &types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{source_fn, step_fn, StepInput};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct CountConfig {
        count: u64,
    }

    #[derive(Deserialize, Default)]
    #[serde(deny_unknown_fields, default)]
    struct SuffixConfig {
        suffix: String,
    }

    fn registry() -> StepRegistry {
        let mut registry = StepRegistry::new();
        registry.register_source("counter", |config: CountConfig| {
            Ok(source_fn(config.count, |i| async move { Ok(Some(json!(i))) }))
        });
        registry.register_step("suffix", |config: SuffixConfig| {
            let suffix = config.suffix;
            Ok(step_fn(move |input: StepInput| {
                let suffix = suffix.clone();
                async move {
                    let text = input.payload().map(|v| v.to_string()).unwrap_or_default();
                    Ok(vec![json!(format!("{text}{suffix}"))])
                }
            }))
        });
        registry
    }

    #[test]
    fn test_build_source_and_step() {
        let registry = registry();
        assert_eq!(registry.len(), 2);
        assert!(registry.has("counter"));

        let source = registry
            .build(
                &StepSpec::new("gen")
                    .with_type("counter")
                    .output("vars")
                    .params(json!({"count": 4})),
            )
            .unwrap();
        match source {
            StepKind::Source(source) => assert_eq!(source.count(), 4),
            other => panic!("expected source, got {other:?}"),
        }

        let step = registry
            .build(&StepSpec::new("xform").with_type("suffix").input("vars"))
            .unwrap();
        assert!(!step.is_source());
    }

    #[test]
    fn test_unknown_type_is_topology_error() {
        let err = registry()
            .build(&StepSpec::new("x").with_type("nope").input("vars"))
            .unwrap_err();
        assert!(matches!(err, CascadeError::Topology(_)));
    }

    #[test]
    fn test_bad_params_are_config_errors() {
        let registry = registry();

        let missing = registry
            .build(&StepSpec::new("gen").with_type("counter").output("vars"))
            .unwrap_err();
        assert!(matches!(missing, CascadeError::Config(_)), "{missing}");

        let unknown = registry
            .build(
                &StepSpec::new("xform")
                    .with_type("suffix")
                    .input("vars")
                    .params(json!({"sufix": "!"})),
            )
            .unwrap_err();
        assert!(unknown.to_string().contains("sufix"), "{unknown}");
    }

    #[test]
    fn test_kind_must_match_ports() {
        let err = registry()
            .build(&StepSpec::new("gen").with_type("counter").input("vars"))
            .unwrap_err();
        assert!(err.to_string().contains("needs no inputs"), "{err}");
    }

    #[test]
    #[should_panic(expected = "factory already registered")]
    fn test_duplicate_registration_panics() {
        let mut registry = registry();
        registry.register_source("counter", |config: CountConfig| {
            Ok(source_fn(config.count, |_| async { Ok(None) }))
        });
    }
}
