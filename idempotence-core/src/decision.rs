//! Deciding whether an operation executes, and recording what was applied.

use std::{collections::BTreeMap, future::Future};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    buffer::{FlushReport, RunStateBuffer},
    change::{changed_keys, deep_diff, Change, Drift},
    error::Error,
    guard::{continue_if_any, Guard, GuardContext, GuardSet, OrIfGuards},
    hasher::{hash_state, PropertyBag, Snapshot, SnapshotPolicy},
    key::{source_prefix, StateKey},
    store::{StateStore, StateType},
};

/// An operation whose execution is decided by its properties.
#[derive(Debug, Clone)]
pub struct Operation {
    /// First segment of the state key; groups the state of related operations.
    pub namespace: String,
    /// Where the operation is declared, relative to the project root.
    pub source: String,
    pub operation_type: String,
    pub identity: String,
    pub action: String,
    pub properties: PropertyBag,
    pub guards: GuardSet,
}

impl Operation {
    pub fn new(
        namespace: impl Into<String>,
        source: impl Into<String>,
        operation_type: impl Into<String>,
        identity: impl Into<String>,
    ) -> Operation {
        Operation {
            namespace: namespace.into(),
            source: source.into(),
            operation_type: operation_type.into(),
            identity: identity.into(),
            action: "run".to_string(),
            properties: PropertyBag::new(),
            guards: GuardSet::new(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Operation {
        self.action = action.into();
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Operation {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_guard(mut self, guard: impl Into<Guard>) -> Operation {
        self.or_if(guard);
        self
    }
}

impl OrIfGuards for Operation {
    fn guards(&self) -> &GuardSet {
        &self.guards
    }

    fn guards_mut(&mut self) -> &mut GuardSet {
        &mut self.guards
    }
}

/// How an operation's properties are checked and where its state is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionOptions {
    /// Only check these properties. Empty checks all of them.
    pub idempotent_properties: Vec<String>,
    /// Never check these properties.
    pub excluded_properties: Vec<String>,
    pub state_type: StateType,
    /// Values observed on the system. A checked property whose observed value
    /// differs from the desired one makes the operation execute.
    pub current_loaded_values: PropertyBag,
    pub snapshot_policy: SnapshotPolicy,
    /// Persist a single digest of the checked properties. Overrides
    /// `snapshot_policy`.
    pub sensitive: bool,
}

impl DecisionOptions {
    pub fn policy(&self) -> SnapshotPolicy {
        if self.sensitive {
            SnapshotPolicy::Sensitive
        } else {
            self.snapshot_policy
        }
    }

    /// The properties of `properties` that take part in the decision.
    pub fn checked_properties(&self, properties: &PropertyBag) -> PropertyBag {
        properties
            .iter()
            .filter(|(name, _)| {
                self.idempotent_properties.is_empty() || self.idempotent_properties.contains(name)
            })
            .filter(|(name, _)| !self.excluded_properties.contains(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

/// The outcome of [`ConvergenceEngine::decide`].
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub execute: bool,
    /// An `or_if` guard held.
    pub forced: bool,
    pub state_key: StateKey,
    pub state_type: StateType,
    /// What to record once the operation has been applied.
    pub desired: Snapshot,
    pub changed: BTreeMap<String, Change>,
    pub drift: BTreeMap<String, Drift>,
}

/// Decides operations during one run and persists their state when the run
/// completes.
///
/// Operations are decided one at a time; the engine is not meant to be shared
/// between concurrent callers without a lock.
pub struct ConvergenceEngine {
    store: StateStore,
    buffer: RunStateBuffer,
    guard_context: GuardContext,
}

impl ConvergenceEngine {
    pub fn new(store: StateStore, guard_context: GuardContext) -> ConvergenceEngine {
        ConvergenceEngine {
            store,
            buffer: RunStateBuffer::new(),
            guard_context,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn buffer(&self) -> &RunStateBuffer {
        &self.buffer
    }

    pub fn guard_context_mut(&mut self) -> &mut GuardContext {
        &mut self.guard_context
    }

    /// Limit this run to the operations declared in `sources` of `namespace`.
    ///
    /// Without it, the flush replaces the whole namespace with what this run
    /// recorded. With it, states persisted by other sources of the namespace
    /// are kept. Call it before deciding, once per namespace, with all of the
    /// sources applied in the run.
    pub fn scope_to_sources(&mut self, namespace: &str, sources: &[&str]) -> Result<()> {
        let prefixes = sources
            .iter()
            .map(|source| source_prefix(namespace, source))
            .collect::<Result<Vec<_>, _>>()?;
        let Some(root) = prefixes.first().map(|prefix| prefix[0].clone()) else {
            return Ok(());
        };
        for state_type in [StateType::Attribute, StateType::File] {
            if let Some(Value::Object(persisted)) =
                self.store.backend(state_type).read(&[root.clone()])?
            {
                debug!(%state_type, %root, "Carrying over states of other sources");
                self.buffer
                    .carry_over(state_type, &root, persisted, &prefixes);
            }
        }
        Ok(())
    }

    /// Decide whether `operation` has to execute.
    ///
    /// It does when an `or_if` guard holds, when a checked property changed
    /// since it was last applied, or when a checked property has drifted from
    /// its observed value. Otherwise its state is carried over into this run
    /// and nothing else needs to happen.
    pub async fn decide(
        &mut self,
        operation: &Operation,
        options: &DecisionOptions,
    ) -> Result<Decision> {
        let checked = options.checked_properties(&operation.properties);
        let state_key = StateKey::for_operation(
            &operation.namespace,
            &operation.source,
            &operation.operation_type,
            &operation.identity,
            &operation.action,
            checked.keys().map(String::as_str),
        )?;
        let state_type = options.state_type;

        let desired = hash_state(&checked, options.policy());
        let previous = self.store.read_state(&state_key, state_type)?;

        let changed = changed_keys(previous.as_ref(), &desired);
        for name in changed.keys() {
            info!("Property {} has changed...", name);
        }
        let drift = deep_diff(&checked, &options.current_loaded_values);
        for name in drift.keys() {
            info!("Property {} differs from the observed value", name);
        }

        let forced = continue_if_any(operation.guards(), &self.guard_context).await?;
        let execute = forced || !changed.is_empty() || !drift.is_empty();
        debug!(
            key = %state_key,
            %state_type,
            execute,
            forced,
            "Decided {} {}",
            operation.operation_type,
            operation.identity
        );

        let decision = Decision {
            execute,
            forced,
            state_key,
            state_type,
            desired,
            changed,
            drift,
        };
        if !execute {
            self.buffer
                .add(decision.state_type, &decision.state_key, &decision.desired);
        }
        Ok(decision)
    }

    /// Record that the operation of `decision` has been applied.
    ///
    /// Call this once, after the action succeeded. File states are persisted
    /// right away if they changed; all states are persisted again by
    /// [`ConvergenceEngine::flush`].
    pub fn record_applied(&mut self, decision: &Decision) -> Result<()> {
        self.store.write_state(
            &mut self.buffer,
            &decision.state_key,
            &decision.desired,
            decision.state_type,
        )
    }

    /// Decide `operation`, run `action` if it has to execute, and record the
    /// state once the action succeeded.
    ///
    /// A failing action records nothing, so the operation executes again in
    /// the next run.
    pub async fn converge<F, Fut>(
        &mut self,
        operation: &Operation,
        options: &DecisionOptions,
        action: F,
    ) -> Result<Decision>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let decision = self.decide(operation, options).await?;
        if decision.execute {
            action().await?;
            self.record_applied(&decision)?;
        }
        Ok(decision)
    }

    /// Persist the states of this run. Call once, when the run completed.
    pub fn flush(&mut self) -> Result<FlushReport, Error> {
        self.buffer.flush(&mut self.store)
    }
}
