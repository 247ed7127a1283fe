use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

use anyhow::{bail, Result};
use serde_json::{Map, Value};

use super::{AttributeRepository, FileRepository};

/// In-memory implementation of both repositories.
///
/// Clones share their contents, so a test can hand one clone to a
/// [`super::StateStore`] and inspect the other. Writes are counted, and
/// writes to selected file root keys can be made to fail.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    attributes: Map<String, Value>,
    files: BTreeMap<String, Value>,
    attribute_writes: usize,
    file_writes: usize,
    failing_roots: BTreeSet<String>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn attributes(&self) -> Map<String, Value> {
        self.lock().attributes.clone()
    }

    pub fn file(&self, root: &str) -> Option<Value> {
        self.lock().files.get(root).cloned()
    }

    /// Seed persisted attribute state, without counting a write.
    pub fn set_attribute(&self, root: &str, content: Value) {
        self.lock().attributes.insert(root.to_string(), content);
    }

    /// Seed a persisted file document, without counting a write.
    pub fn set_file(&self, root: &str, content: Value) {
        self.lock().files.insert(root.to_string(), content);
    }

    /// Make writes to `root` fail.
    pub fn fail_writes_to(&self, root: &str) {
        self.lock().failing_roots.insert(root.to_string());
    }

    pub fn attribute_writes(&self) -> usize {
        self.lock().attribute_writes
    }

    pub fn file_writes(&self) -> usize {
        self.lock().file_writes
    }
}

impl AttributeRepository for MemoryRepository {
    fn load(&mut self) -> Result<Map<String, Value>> {
        Ok(self.attributes())
    }

    fn replace_roots(&mut self, roots: &Map<String, Value>) -> Result<()> {
        let mut inner = self.lock();
        for (root, content) in roots {
            inner.attributes.insert(root.clone(), content.clone());
        }
        inner.attribute_writes += 1;
        Ok(())
    }
}

impl FileRepository for MemoryRepository {
    fn read(&self, root: &str) -> Result<Option<Value>> {
        Ok(self.file(root))
    }

    fn write(&mut self, root: &str, content: &Value) -> Result<()> {
        let mut inner = self.lock();
        if inner.failing_roots.contains(root) {
            bail!("simulated write failure for {}", root);
        }
        inner.files.insert(root.to_string(), content.clone());
        inner.file_writes += 1;
        Ok(())
    }
}
