//! Snapshots recorded during one run, persisted together when the run
//! completes.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::{
    error::Error,
    hasher::Snapshot,
    key::StateKey,
    store::{StateStore, StateType},
    tree::{get_at, insert_at, merge_missing, remove_at},
};

/// Run-scoped tree of snapshots, by state type and then by state key path.
///
/// Flushing replaces each root key with its run tree, which drops entries of
/// operations that no longer exist. Entries persisted by sources that were
/// not part of this run are kept by [`RunStateBuffer::carry_over`].
#[derive(Debug, Default)]
pub struct RunStateBuffer {
    states: BTreeMap<StateType, Map<String, Value>>,
}

/// What a [`RunStateBuffer::flush`] persisted.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Root keys written, by state type. State types without writes are
    /// absent.
    pub written: BTreeMap<StateType, Vec<String>>,
}

impl FlushReport {
    pub fn write_count(&self) -> usize {
        self.written.values().map(Vec::len).sum()
    }
}

impl RunStateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `snapshot` into the tree at `key`. A later add to the same key
    /// replaces the earlier one.
    pub fn add(&mut self, state_type: StateType, key: &StateKey, snapshot: &Snapshot) {
        let tree = self.states.entry(state_type).or_default();
        insert_at(tree, key.segments(), snapshot.to_value());
    }

    pub fn get(&self, state_type: StateType, key: &StateKey) -> Option<Snapshot> {
        let tree = self.states.get(&state_type)?;
        Snapshot::from_value(get_at(tree, key.segments())?)
    }

    /// Keep the `persisted` content of `root` in the run tree, except for the
    /// subtrees below `applied` source prefixes. Those sources are applied in
    /// this run and only keep what the run records for them.
    ///
    /// Entries already in the run tree win over persisted ones. Call this
    /// once per root key, with every source of that root applied in the run.
    pub fn carry_over(
        &mut self,
        state_type: StateType,
        root: &str,
        mut persisted: Map<String, Value>,
        applied: &[Vec<String>],
    ) {
        for prefix in applied {
            match prefix.split_first() {
                Some((first, [])) if first == root => persisted.clear(),
                Some((first, rest)) if first == root => {
                    remove_at(&mut persisted, rest);
                }
                _ => {}
            }
        }
        let tree = self.states.entry(state_type).or_default();
        let entry = tree
            .entry(root.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(run) = entry {
            merge_missing(run, persisted);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.states.values().all(Map::is_empty)
    }

    /// Persist every root key whose run tree differs from what is persisted.
    ///
    /// The buffer is emptied first, so a second flush writes nothing. A
    /// failure to write one root key does not stop the others; all failures
    /// are returned together as [`Error::FlushFailed`].
    pub fn flush(&mut self, store: &mut StateStore) -> Result<FlushReport, Error> {
        let states = std::mem::take(&mut self.states);
        let mut report = FlushReport::default();
        let mut failures = Vec::new();

        for (state_type, roots) in states {
            let backend = store.backend_mut(state_type);
            let mut written = Vec::new();

            for (root, content) in roots {
                let path = [root.clone()];
                let changed = match backend.changed(&path, &content) {
                    Ok(changed) => changed,
                    Err(source) => {
                        failures.push(Error::BackendWrite {
                            root_key: root,
                            source,
                        });
                        continue;
                    }
                };
                if !changed {
                    debug!(%state_type, %root, "State unchanged, not writing");
                    continue;
                }
                match backend.write(&root, &content) {
                    Ok(()) => written.push(root),
                    Err(source) => failures.push(Error::BackendWrite {
                        root_key: root,
                        source,
                    }),
                }
            }

            if written.is_empty() {
                continue;
            }
            if let Err(source) = backend.commit() {
                failures.push(Error::BackendWrite {
                    root_key: written.join(", "),
                    source,
                });
                continue;
            }
            info!(
                "States saved by {} state type: {}",
                state_type,
                written.join(", ")
            );
            report.written.insert(state_type, written);
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(Error::FlushFailed { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hasher::{hash_state, PropertyBag, SnapshotPolicy},
        store::MemoryRepository,
    };
    use serde_json::json;

    fn key(namespace: &str, identity: &str) -> StateKey {
        StateKey::for_operation(namespace, "a.json", "execute", identity, "run", ["command"])
            .unwrap()
    }

    fn snapshot(command: &str) -> Snapshot {
        let bag: PropertyBag = [("command".to_string(), json!(command))].into();
        hash_state(&bag, SnapshotPolicy::Fingerprinted)
    }

    fn store(repo: &MemoryRepository) -> StateStore {
        StateStore::new(Box::new(repo.clone()), Box::new(repo.clone())).unwrap()
    }

    #[test]
    fn add_merges_and_last_write_wins() {
        let mut buffer = RunStateBuffer::new();
        assert!(buffer.is_empty());
        buffer.add(StateType::Attribute, &key("ns", "x"), &snapshot("a"));
        buffer.add(StateType::Attribute, &key("ns", "y"), &snapshot("b"));
        buffer.add(StateType::Attribute, &key("ns", "x"), &snapshot("c"));
        assert!(!buffer.is_empty());
        assert_eq!(
            buffer.get(StateType::Attribute, &key("ns", "x")),
            Some(snapshot("c"))
        );
        assert_eq!(
            buffer.get(StateType::Attribute, &key("ns", "y")),
            Some(snapshot("b"))
        );
        assert_eq!(buffer.get(StateType::File, &key("ns", "x")), None);
    }

    #[test]
    fn flush_empty_is_noop() {
        let repo = MemoryRepository::new();
        let mut store = store(&repo);
        let report = RunStateBuffer::new().flush(&mut store).unwrap();
        assert_eq!(report, FlushReport::default());
        assert_eq!(repo.attribute_writes(), 0);
        assert_eq!(repo.file_writes(), 0);
    }

    #[test]
    fn flush_persists_attribute_roots_once() {
        let repo = MemoryRepository::new();
        let mut store = store(&repo);
        let mut buffer = RunStateBuffer::new();
        buffer.add(StateType::Attribute, &key("a", "x"), &snapshot("1"));
        buffer.add(StateType::Attribute, &key("b", "x"), &snapshot("2"));

        let report = buffer.flush(&mut store).unwrap();
        assert_eq!(
            report.written.get(&StateType::Attribute),
            Some(&vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(repo.attribute_writes(), 1);
        assert!(buffer.is_empty());

        // second flush has nothing left
        let report = buffer.flush(&mut store).unwrap();
        assert_eq!(report.write_count(), 0);
        assert_eq!(repo.attribute_writes(), 1);
    }

    #[test]
    fn unchanged_content_is_not_written() {
        let repo = MemoryRepository::new();
        let mut first = RunStateBuffer::new();
        first.add(StateType::Attribute, &key("ns", "x"), &snapshot("1"));
        first.add(StateType::File, &key("ns", "x"), &snapshot("1"));
        first.flush(&mut store(&repo)).unwrap();
        assert_eq!(repo.attribute_writes(), 1);
        assert_eq!(repo.file_writes(), 1);

        // next run, same content
        let mut second = RunStateBuffer::new();
        second.add(StateType::Attribute, &key("ns", "x"), &snapshot("1"));
        second.add(StateType::File, &key("ns", "x"), &snapshot("1"));
        let report = second.flush(&mut store(&repo)).unwrap();
        assert_eq!(report.write_count(), 0);
        assert_eq!(repo.attribute_writes(), 1);
        assert_eq!(repo.file_writes(), 1);
    }

    #[test]
    fn stale_entries_are_dropped() {
        let repo = MemoryRepository::new();
        let mut first = RunStateBuffer::new();
        first.add(StateType::Attribute, &key("ns", "old"), &snapshot("1"));
        first.add(StateType::Attribute, &key("ns", "kept"), &snapshot("1"));
        first.flush(&mut store(&repo)).unwrap();

        let mut second = RunStateBuffer::new();
        second.add(StateType::Attribute, &key("ns", "kept"), &snapshot("1"));
        second.flush(&mut store(&repo)).unwrap();

        let store = store(&repo);
        assert_eq!(
            store
                .read_state(&key("ns", "old"), StateType::Attribute)
                .unwrap(),
            None
        );
        assert_eq!(
            store
                .read_state(&key("ns", "kept"), StateType::Attribute)
                .unwrap(),
            Some(snapshot("1"))
        );
    }

    #[test]
    fn file_failure_is_isolated() {
        let repo = MemoryRepository::new();
        repo.fail_writes_to("broken");
        let mut store = store(&repo);
        let mut buffer = RunStateBuffer::new();
        buffer.add(StateType::File, &key("broken", "x"), &snapshot("1"));
        buffer.add(StateType::File, &key("fine", "x"), &snapshot("1"));
        buffer.add(StateType::Attribute, &key("attr", "x"), &snapshot("1"));

        let err = buffer.flush(&mut store).unwrap_err();
        match &err {
            Error::FlushFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert!(matches!(
                    &failures[0],
                    Error::BackendWrite { root_key, .. } if root_key == "broken"
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(repo.file("fine").is_some());
        assert!(repo.file("broken").is_none());
        assert!(repo.attributes().contains_key("attr"));
    }

    fn keyed(source: &str, identity: &str) -> StateKey {
        StateKey::for_operation("ns", source, "execute", identity, "run", ["command"]).unwrap()
    }

    fn persisted_root(repo: &MemoryRepository) -> Map<String, Value> {
        match repo.attributes().get("ns") {
            Some(Value::Object(root)) => root.clone(),
            _ => Map::new(),
        }
    }

    #[test]
    fn carried_over_sources_survive_the_flush() {
        let repo = MemoryRepository::new();
        let mut first = RunStateBuffer::new();
        first.add(StateType::Attribute, &keyed("a.json", "x"), &snapshot("1"));
        first.add(StateType::Attribute, &keyed("a.json", "gone"), &snapshot("1"));
        first.add(StateType::Attribute, &keyed("b.json", "y"), &snapshot("1"));
        first.flush(&mut store(&repo)).unwrap();

        // a.json is applied again and only declares x now
        let applied = vec![crate::key::source_prefix("ns", "a.json").unwrap()];
        let mut second = RunStateBuffer::new();
        second.carry_over(StateType::Attribute, "ns", persisted_root(&repo), &applied);
        second.add(StateType::Attribute, &keyed("a.json", "x"), &snapshot("2"));
        second.flush(&mut store(&repo)).unwrap();

        let store = store(&repo);
        let read = |key: StateKey| store.read_state(&key, StateType::Attribute).unwrap();
        assert_eq!(read(keyed("a.json", "x")), Some(snapshot("2")));
        assert_eq!(read(keyed("a.json", "gone")), None);
        assert_eq!(read(keyed("b.json", "y")), Some(snapshot("1")));
    }

    #[test]
    fn carry_over_alone_writes_nothing() {
        let repo = MemoryRepository::new();
        let mut first = RunStateBuffer::new();
        first.add(StateType::Attribute, &keyed("b.json", "y"), &snapshot("1"));
        first.flush(&mut store(&repo)).unwrap();
        assert_eq!(repo.attribute_writes(), 1);

        let applied = vec![crate::key::source_prefix("ns", "a.json").unwrap()];
        let mut second = RunStateBuffer::new();
        second.carry_over(StateType::Attribute, "ns", persisted_root(&repo), &applied);
        let report = second.flush(&mut store(&repo)).unwrap();
        assert_eq!(report.write_count(), 0);
        assert_eq!(repo.attribute_writes(), 1);
    }

    #[test]
    fn one_log_line_per_saved_state_type() {
        let logs = crate::test_log::capture();
        let repo = MemoryRepository::new();
        let mut first = RunStateBuffer::new();
        first.add(StateType::Attribute, &key("a", "x"), &snapshot("1"));
        first.add(StateType::Attribute, &key("b", "x"), &snapshot("1"));
        first.flush(&mut store(&repo)).unwrap();
        assert_eq!(
            logs.starting_with("States saved by"),
            vec!["States saved by attribute state type: a, b".to_string()]
        );

        let mut second = RunStateBuffer::new();
        second.add(StateType::Attribute, &key("a", "x"), &snapshot("1"));
        second.add(StateType::Attribute, &key("b", "x"), &snapshot("1"));
        second.flush(&mut store(&repo)).unwrap();
        assert_eq!(logs.starting_with("States saved by").len(), 1);
    }
}
