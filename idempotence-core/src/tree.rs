use serde_json::{Map, Value};

/// Assign `value` at `path`, creating intermediate objects as needed.
///
/// Anything that is not an object on the way down is replaced, so the last
/// assignment to a path wins.
pub(crate) fn insert_at(tree: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((leaf, parents)) = path.split_last() else {
        return;
    };
    let mut current = tree;
    for segment in parents {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(map) => map,
            _ => unreachable!("replaced by an object above"),
        };
    }
    current.insert(leaf.clone(), value);
}

pub(crate) fn get_at<'a>(tree: &'a Map<String, Value>, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    rest.iter()
        .try_fold(tree.get(first)?, |value, segment| value.as_object()?.get(segment))
}

/// Remove the value at `path`, then any objects left empty above it.
pub(crate) fn remove_at(tree: &mut Map<String, Value>, path: &[String]) -> Option<Value> {
    match path {
        [] => None,
        [leaf] => tree.remove(leaf),
        [first, rest @ ..] => {
            let child = tree.get_mut(first)?.as_object_mut()?;
            let removed = remove_at(child, rest);
            if child.is_empty() {
                tree.remove(first);
            }
            removed
        }
    }
}

/// Copy the entries of `from` that `into` does not have yet. Existing
/// entries of `into` win.
pub(crate) fn merge_missing(into: &mut Map<String, Value>, from: Map<String, Value>) {
    for (name, value) in from {
        match (into.get_mut(&name), value) {
            (None, value) => {
                into.insert(name, value);
            }
            (Some(Value::Object(existing)), Value::Object(value)) => merge_missing(existing, value),
            (Some(_), _) => {}
        }
    }
}
