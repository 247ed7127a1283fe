use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    decision::ConvergenceEngine,
    guard::{GuardContext, DEFAULT_GUARD_TIMEOUT},
    store::{EventLogAttributes, StateStore, StatesFolder},
};

/// Where state is persisted and how guards are run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory of the file backend's documents.
    pub states_folder: PathBuf,
    /// Event log holding the attribute tree.
    pub attributes_file: PathBuf,
    /// Default timeout of command guards, in seconds. `None` waits
    /// indefinitely.
    pub guard_timeout: Option<u64>,
    /// Interpreter argv for command guards.
    pub shell: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            states_folder: PathBuf::from(".idempotence/states"),
            attributes_file: PathBuf::from(".idempotence/attributes.json"),
            guard_timeout: Some(DEFAULT_GUARD_TIMEOUT.as_secs()),
            shell: GuardContext::default().shell,
        }
    }
}

impl EngineConfig {
    pub fn guard_context(&self) -> GuardContext {
        GuardContext {
            shell: self.shell.clone(),
            timeout: self.guard_timeout.map(Duration::from_secs),
            ..GuardContext::default()
        }
    }

    pub fn open_store(&self) -> Result<StateStore> {
        StateStore::new(
            Box::new(EventLogAttributes::new(&self.attributes_file)),
            Box::new(StatesFolder::new(&self.states_folder)),
        )
        .with_context(|| {
            format!(
                "Could not open the state store at {}",
                self.attributes_file.display()
            )
        })
    }

    /// Open the store and start a run.
    pub fn open(&self) -> Result<ConvergenceEngine> {
        Ok(ConvergenceEngine::new(
            self.open_store()?,
            self.guard_context(),
        ))
    }
}
