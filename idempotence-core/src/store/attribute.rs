use std::collections::BTreeSet;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use super::{AttributeRepository, StateBackend, StateType};
use crate::tree::get_at;

/// Reads come from a tree loaded once when the store opens; writes are held
/// until [`StateBackend::commit`].
pub struct AttributeBackend {
    repository: Box<dyn AttributeRepository>,
    tree: Map<String, Value>,
    dirty: BTreeSet<String>,
}

impl AttributeBackend {
    pub fn hydrate(mut repository: Box<dyn AttributeRepository>) -> Result<AttributeBackend> {
        let tree = repository
            .load()
            .context("Could not load the persisted attribute states")?;
        Ok(AttributeBackend {
            repository,
            tree,
            dirty: BTreeSet::new(),
        })
    }
}

impl StateBackend for AttributeBackend {
    fn state_type(&self) -> StateType {
        StateType::Attribute
    }

    fn read(&self, path: &[String]) -> Result<Option<Value>> {
        Ok(get_at(&self.tree, path).cloned())
    }

    fn write(&mut self, root: &str, content: &Value) -> Result<()> {
        self.tree.insert(root.to_string(), content.clone());
        self.dirty.insert(root.to_string());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let roots: Map<String, Value> = self
            .dirty
            .iter()
            .filter_map(|root| Some((root.clone(), self.tree.get(root)?.clone())))
            .collect();
        self.repository.replace_roots(&roots)?;
        self.dirty.clear();
        Ok(())
    }
}
