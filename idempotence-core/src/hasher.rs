//! Deterministic fingerprints of property values, and the snapshots that are
//! persisted as evidence of what was applied.

use std::{collections::BTreeMap, fmt::Display};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// The desired properties of one operation, by name.
pub type PropertyBag = BTreeMap<String, Value>;

/// Name under which a [`Snapshot::Digest`] takes part in change detection.
pub const DIGEST_ENTRY: &str = "(sensitive properties)";

/// A digest of a JSON value, rendered as `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex part only, for use where a `:` is unwelcome, such as key paths.
    pub fn hex(&self) -> &str {
        self.0.strip_prefix("sha256:").unwrap_or(&self.0)
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint an arbitrary value.
///
/// Object keys are sorted before hashing, so two values that only differ in
/// key insertion order have the same fingerprint.
pub fn fingerprint(value: &Value) -> Fingerprint {
    let mut canonical = Vec::new();
    write_canonical(value, &mut canonical);
    Fingerprint(format!("sha256:{:x}", Sha256::digest(&canonical)))
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Array(items) => {
            out.push(b'[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (idx, (key, item)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                out.extend(Value::String(key.clone()).to_string().into_bytes());
                out.push(b':');
                write_canonical(item, out);
            }
            out.push(b'}');
        }
        // Scalars have a single JSON rendering
        scalar => out.extend(scalar.to_string().into_bytes()),
    }
}

/// How [`hash_state`] turns a property bag into a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPolicy {
    /// Store each property's fingerprint. Changes are reported per property,
    /// without revealing values in the persisted state.
    #[default]
    Fingerprinted,
    /// Store the property values as they are.
    Raw,
    /// Store a single digest of the whole bag.
    Sensitive,
}

/// The stored representation of property state as last applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Snapshot {
    Properties(BTreeMap<String, Value>),
    Digest(Fingerprint),
}

impl Snapshot {
    pub fn empty() -> Snapshot {
        Snapshot::Properties(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Snapshot::Properties(p) if p.is_empty())
    }

    /// View the snapshot as named entries, as compared by change detection.
    pub fn entries(&self) -> BTreeMap<String, Value> {
        match self {
            Snapshot::Properties(p) => p.clone(),
            Snapshot::Digest(d) => {
                BTreeMap::from([(DIGEST_ENTRY.to_string(), Value::String(d.to_string()))])
            }
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Snapshot::Properties(p) => {
                Value::Object(p.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            }
            Snapshot::Digest(d) => Value::String(d.to_string()),
        }
    }

    /// Interpret a persisted value. Returns `None` for values that no snapshot
    /// serializes to.
    pub fn from_value(value: &Value) -> Option<Snapshot> {
        match value {
            Value::Object(map) => Some(Snapshot::Properties(
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            )),
            Value::String(s) => Some(Snapshot::Digest(Fingerprint(s.clone()))),
            _ => None,
        }
    }
}

/// Compute the snapshot of `bag` under `policy`.
pub fn hash_state(bag: &PropertyBag, policy: SnapshotPolicy) -> Snapshot {
    match policy {
        SnapshotPolicy::Raw => Snapshot::Properties(bag.clone()),
        SnapshotPolicy::Fingerprinted => Snapshot::Properties(
            bag.iter()
                .map(|(k, v)| (k.clone(), Value::String(fingerprint(v).to_string())))
                .collect(),
        ),
        SnapshotPolicy::Sensitive => Snapshot::Digest(fingerprint(&Value::Object(
            bag.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        ))),
    }
}
