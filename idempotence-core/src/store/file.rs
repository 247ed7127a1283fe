use std::{
    fs::{self, OpenOptions},
    io::{self, Seek as _, Write as _},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use super::{FileRepository, StateBackend, StateType};
use crate::{
    error::Error,
    tree::{get_at, insert_at},
};

/// Reads and writes go straight to the [`FileRepository`], one document per
/// root key.
pub struct FileBackend {
    repository: Box<dyn FileRepository>,
}

impl FileBackend {
    pub fn new(repository: Box<dyn FileRepository>) -> FileBackend {
        FileBackend { repository }
    }

    /// Assign `value` at `path` inside the persisted document of its root key,
    /// keeping the rest of the document.
    pub fn merge(&mut self, path: &[String], value: Value) -> Result<()> {
        let Some((root, rest)) = path.split_first() else {
            return Ok(());
        };
        if rest.is_empty() {
            return self.repository.write(root, &value);
        }
        let mut document = match self.repository.read(root)? {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        insert_at(&mut document, rest, value);
        self.repository.write(root, &Value::Object(document))
    }
}

impl StateBackend for FileBackend {
    fn state_type(&self) -> StateType {
        StateType::File
    }

    fn read(&self, path: &[String]) -> Result<Option<Value>> {
        let Some((root, rest)) = path.split_first() else {
            return Ok(None);
        };
        let document = self.repository.read(root)?;
        if rest.is_empty() {
            return Ok(document);
        }
        Ok(match document {
            Some(Value::Object(map)) => get_at(&map, rest).cloned(),
            _ => None,
        })
    }

    fn write(&mut self, root: &str, content: &Value) -> Result<()> {
        self.repository.write(root, content)
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }
}

/// [`FileRepository`] that keeps each root key in `<dir>/<root>.json`.
pub struct StatesFolder {
    dir: PathBuf,
}

impl StatesFolder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        StatesFolder { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, root: &str) -> Result<PathBuf, Error> {
        if root.is_empty()
            || root.starts_with('.')
            || root.contains(|c: char| c == '/' || c == '\\' || c == '\0')
        {
            return Err(Error::InvalidRootKey(root.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", root)))
    }

    /// The root keys that have a document in the folder.
    pub fn roots(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Could not list {}", self.dir.display()))
            }
        };
        let mut roots = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(stem) = path.file_stem() {
                    roots.push(stem.to_string_lossy().into_owned());
                }
            }
        }
        roots.sort();
        Ok(roots)
    }
}

impl FileRepository for StatesFolder {
    fn read(&self, root: &str) -> Result<Option<Value>> {
        let path = self.path_for(root)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Could not read {}", path.display()))
            }
        };
        let value = serde_json::from_str(&contents)
            .with_context(|| format!("Could not parse state file {}", path.display()))?;
        Ok(Some(value))
    }

    fn write(&mut self, root: &str, content: &Value) -> Result<()> {
        let path = self.path_for(root)?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Could not create {}", self.dir.display()))?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Could not open {}", path.display()))?;
        let mut locking = fd_lock::RwLock::new(file);
        let mut file = locking.write()?;
        file.set_len(0)?;
        file.rewind()?;
        let mut contents = serde_json::to_vec_pretty(content)?;
        contents.push(b'\n');
        file.write_all(&contents)
            .with_context(|| format!("Could not write {}", path.display()))?;
        file.flush()?;
        Ok(())
    }
}
