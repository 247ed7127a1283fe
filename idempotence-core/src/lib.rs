//! Idempotence by properties.
//!
//! Wraps inherently non-idempotent operations (running a command, writing a
//! file) and decides whether they need to run, based on the properties they
//! were last applied with. The evidence of what was applied is kept in one of
//! two stores:
//!
//! - [`StateType::Attribute`]: a tree of states that is read once per run and
//!   only written when the run completes ([`ConvergenceEngine::flush`]).
//! - [`StateType::File`]: one JSON document per root key, written as soon as
//!   an operation has been applied.
//!
//! A typical run:
//!
//! ```no_run
//! # async fn example() -> anyhow::Result<()> {
//! use idempotence_core::{EngineConfig, DecisionOptions, Operation};
//!
//! let mut engine = EngineConfig::default().open()?;
//! let op = Operation::new("webapp", "recipes/default.json", "execute", "migrate")
//!     .with_property("command", "./migrate.sh");
//! let decision = engine.decide(&op, &DecisionOptions::default()).await?;
//! if decision.execute {
//!     // ... perform the action ...
//!     engine.record_applied(&decision)?;
//! }
//! engine.flush()?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod change;
pub mod config;
pub mod decision;
pub mod error;
pub mod guard;
pub mod hasher;
pub mod key;
pub mod store;
#[cfg(test)]
mod test_log;
mod tree;

pub use buffer::{FlushReport, RunStateBuffer};
pub use change::{changed_keys, deep_diff, Change, Drift};
pub use config::EngineConfig;
pub use decision::{ConvergenceEngine, Decision, DecisionOptions, Operation};
pub use error::Error;
pub use guard::{continue_if_any, Guard, GuardContext, GuardOptions, GuardPredicate, GuardSet, OrIfGuards};
pub use hasher::{fingerprint, hash_state, Fingerprint, PropertyBag, Snapshot, SnapshotPolicy};
pub use key::StateKey;
pub use store::{StateStore, StateType};
