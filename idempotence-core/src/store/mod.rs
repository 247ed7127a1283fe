//! Reading and writing snapshots.
//!
//! [`StateStore`] holds one [`StateBackend`] per [`StateType`]. Backends reach
//! persisted storage only through the repository traits, so a host can plug
//! in its own storage and tests can run against [`memory::MemoryRepository`].

pub mod attribute;
pub mod event_log;
pub mod file;
pub mod memory;

use std::{fmt::Display, str::FromStr};

use anyhow::Result;
use serde_json::{Map, Value};

use crate::{buffer::RunStateBuffer, error::Error, hasher::Snapshot, key::StateKey};

pub use attribute::AttributeBackend;
pub use event_log::EventLogAttributes;
pub use file::{FileBackend, StatesFolder};
pub use memory::MemoryRepository;

/// Where the snapshot of an operation is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StateType {
    /// In the attribute tree, persisted when the run completes.
    #[default]
    Attribute,
    /// In a per-root-key document, persisted as soon as the operation applied.
    File,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Attribute => "attribute",
            StateType::File => "file",
        }
    }
}

impl Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attribute" => Ok(StateType::Attribute),
            "file" => Ok(StateType::File),
            other => Err(Error::UnsupportedStateType(other.to_string())),
        }
    }
}

impl serde::Serialize for StateType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for StateType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Persisted storage of the attribute tree: read once per run, written once
/// when the run completes.
pub trait AttributeRepository: Send {
    /// Read the whole tree, by root key.
    fn load(&mut self) -> Result<Map<String, Value>>;

    /// Replace the given root keys, leaving the others alone.
    fn replace_roots(&mut self, roots: &Map<String, Value>) -> Result<()>;
}

/// Persisted storage with one document per root key.
pub trait FileRepository: Send {
    fn read(&self, root: &str) -> Result<Option<Value>>;

    fn write(&mut self, root: &str, content: &Value) -> Result<()>;
}

/// One storage strategy, as selected by a [`StateType`].
///
/// Paths are state key segments; the first one is the root key.
pub trait StateBackend {
    fn state_type(&self) -> StateType;

    /// The currently persisted value at `path`.
    fn read(&self, path: &[String]) -> Result<Option<Value>>;

    /// Whether `content` differs from what is persisted at `path`.
    fn changed(&self, path: &[String], content: &Value) -> Result<bool> {
        Ok(self.read(path)?.as_ref() != Some(content))
    }

    /// Replace the contents of a root key.
    fn write(&mut self, root: &str, content: &Value) -> Result<()>;

    /// Make the writes since the last commit durable.
    fn commit(&mut self) -> Result<()>;
}

/// Read/write access to snapshots in both backends.
pub struct StateStore {
    attribute: AttributeBackend,
    file: FileBackend,
}

impl StateStore {
    /// Open the store. The attribute tree is hydrated here, once.
    pub fn new(
        attributes: Box<dyn AttributeRepository>,
        files: Box<dyn FileRepository>,
    ) -> Result<StateStore> {
        Ok(StateStore {
            attribute: AttributeBackend::hydrate(attributes)?,
            file: FileBackend::new(files),
        })
    }

    pub fn backend(&self, state_type: StateType) -> &dyn StateBackend {
        match state_type {
            StateType::Attribute => &self.attribute,
            StateType::File => &self.file,
        }
    }

    pub fn backend_mut(&mut self, state_type: StateType) -> &mut dyn StateBackend {
        match state_type {
            StateType::Attribute => &mut self.attribute,
            StateType::File => &mut self.file,
        }
    }

    /// The snapshot persisted at `key`, if any.
    ///
    /// A value that is not a snapshot is reported and treated as absent, so
    /// that the operation runs again and overwrites it.
    pub fn read_state(&self, key: &StateKey, state_type: StateType) -> Result<Option<Snapshot>> {
        let value = self.backend(state_type).read(key.segments())?;
        Ok(value.and_then(|value| {
            let snapshot = Snapshot::from_value(&value);
            if snapshot.is_none() {
                tracing::warn!(%key, %state_type, "Ignoring malformed state: {}", value);
            }
            snapshot
        }))
    }

    /// Whether `snapshot` differs from what is persisted at `key`.
    pub fn state_changed(
        &self,
        key: &StateKey,
        snapshot: &Snapshot,
        state_type: StateType,
    ) -> Result<bool> {
        self.backend(state_type)
            .changed(key.segments(), &snapshot.to_value())
    }

    /// Record `snapshot` as applied.
    ///
    /// The snapshot always goes into the run buffer, so that it survives the
    /// flush. The file backend also persists it right away, if it changed.
    pub fn write_state(
        &mut self,
        buffer: &mut RunStateBuffer,
        key: &StateKey,
        snapshot: &Snapshot,
        state_type: StateType,
    ) -> Result<()> {
        buffer.add(state_type, key, snapshot);
        match state_type {
            StateType::Attribute => Ok(()),
            StateType::File => {
                if self.state_changed(key, snapshot, state_type)? {
                    self.file.merge(key.segments(), snapshot.to_value())
                } else {
                    Ok(())
                }
            }
        }
    }
}
