//! Change detection against recorded snapshots, and drift detection against
//! live-observed values.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;

use crate::hasher::{PropertyBag, Snapshot};

/// A property whose recorded and desired values differ. `None` means the
/// property is absent on that side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// A desired property that disagrees with the value observed on the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Drift {
    pub desired: Value,
    pub observed: Value,
}

/// Compare a recorded snapshot with the desired one.
///
/// A property counts as changed when it is present in only one of the two, or
/// present in both with structurally different values. A missing `prev` is
/// treated as an empty snapshot: if nothing is desired, nothing has changed.
pub fn changed_keys(prev: Option<&Snapshot>, desired: &Snapshot) -> BTreeMap<String, Change> {
    let old = prev.map(Snapshot::entries).unwrap_or_default();
    let new = desired.entries();

    let names: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    names
        .into_iter()
        .filter_map(|name| {
            let (o, n) = (old.get(name), new.get(name));
            if o == n {
                None
            } else {
                Some((
                    name.clone(),
                    Change {
                        old: o.cloned(),
                        new: n.cloned(),
                    },
                ))
            }
        })
        .collect()
}

/// Compare desired properties with values observed on the live system.
///
/// Only properties present in `observed` are checked; an observed property
/// that is not desired is ignored. Nested objects are compared on the keys
/// the observed side provides, so an observer can report a subset.
pub fn deep_diff(desired: &PropertyBag, observed: &PropertyBag) -> BTreeMap<String, Drift> {
    observed
        .iter()
        .filter_map(|(name, observed_value)| {
            let desired_value = desired.get(name)?;
            if differs(desired_value, observed_value) {
                Some((
                    name.clone(),
                    Drift {
                        desired: desired_value.clone(),
                        observed: observed_value.clone(),
                    },
                ))
            } else {
                None
            }
        })
        .collect()
}

fn differs(desired: &Value, observed: &Value) -> bool {
    match (desired, observed) {
        (Value::Object(d), Value::Object(o)) => o
            .iter()
            .any(|(k, ov)| d.get(k).is_some_and(|dv| differs(dv, ov))),
        (d, o) => d != o,
    }
}
