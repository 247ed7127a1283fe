//! Where the snapshot of an operation is stored.

use std::{fmt::Display, path::Path, str::FromStr};

use serde_json::json;

use crate::{error::Error, hasher::fingerprint};

/// Final segment of every state key.
pub const PROPERTIES_SEGMENT: &str = "properties";

/// A `/`-separated path to a snapshot, of the form
///
/// ```text
/// <namespace>/<relative-source-path>/<operation-type>/<identity>/<properties-fingerprint>/properties
/// ```
///
/// The first segment is the root key: the unit in which state is persisted
/// and replaced at flush time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateKey {
    segments: Vec<String>,
}

impl StateKey {
    /// Build the key for an operation.
    ///
    /// `action` and `checked_properties` only enter the key through a
    /// fingerprint, so property names do not show up in the persisted tree,
    /// while operations that look alike but check different properties or
    /// run different actions still get their own key.
    pub fn for_operation<'a>(
        namespace: &str,
        source_path: &str,
        operation_type: &str,
        identity: &str,
        action: &str,
        checked_properties: impl IntoIterator<Item = &'a str>,
    ) -> Result<StateKey, Error> {
        let mut names: Vec<&str> = checked_properties.into_iter().collect();
        names.sort_unstable();
        names.dedup();
        let properties_fingerprint = fingerprint(&json!({
            "action": action,
            "properties": names,
        }));

        let segments = source_prefix(namespace, source_path)?
            .into_iter()
            .chain([operation_type, identity].into_iter().filter_map(escape_segment))
            .chain(std::iter::once(properties_fingerprint.hex().to_string()))
            .chain(std::iter::once(PROPERTIES_SEGMENT.to_string()))
            .collect();
        Ok(StateKey { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn root(&self) -> &str {
        &self.segments[0]
    }
}

fn split(s: &str) -> impl Iterator<Item = &str> {
    s.split('/').filter(|segment| !segment.is_empty())
}

/// The leading segments shared by the keys of all operations declared in
/// `source_path`: the namespace followed by the source path.
pub fn source_prefix(namespace: &str, source_path: &str) -> Result<Vec<String>, Error> {
    let namespace = namespace.trim_matches('/');
    if namespace.is_empty() || namespace.contains('/') {
        return Err(Error::MalformedStateKey(format!(
            "namespace `{}` must be a single non-empty segment",
            namespace
        )));
    }

    let mut source = split(source_path).peekable();
    // A source path inside the namespace's own directory would repeat it
    if source.peek() == Some(&namespace) {
        source.next();
    }
    Ok(std::iter::once(namespace)
        .chain(source)
        .map(str::to_string)
        .collect())
}

/// A whole value as one segment. `%` and `/` are percent-encoded, so that
/// an identity containing `/` cannot collide with a longer source path.
fn escape_segment(s: &str) -> Option<String> {
    if s.is_empty() {
        return None;
    }
    Some(s.replace('%', "%25").replace('/', "%2F"))
}

impl Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl FromStr for StateKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<String> = split(s).map(str::to_string).collect();
        match segments.last() {
            Some(last) if last == PROPERTIES_SEGMENT && segments.len() >= 2 => {
                Ok(StateKey { segments })
            }
            _ => Err(Error::MalformedStateKey(s.to_string())),
        }
    }
}

/// Render `source` relative to `base`, with `/` separators.
///
/// Paths outside `base` are kept whole, minus any root or drive prefix.
pub fn relative_source_path(source: &Path, base: &Path) -> String {
    let relative = source.strip_prefix(base).unwrap_or(source);
    relative
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(source: &str, identity: &str, props: &[&str]) -> StateKey {
        StateKey::for_operation(
            "webapp",
            source,
            "execute",
            identity,
            "run",
            props.iter().copied(),
        )
        .unwrap()
    }

    #[test]
    fn layout() {
        let k = key("recipes/default.json", "This is a test", &["command"]);
        let s = k.segments();
        assert_eq!(s[0], "webapp");
        assert_eq!(s[1], "recipes");
        assert_eq!(s[2], "default.json");
        assert_eq!(s[3], "execute");
        assert_eq!(s[4], "This is a test");
        assert_eq!(s[5].len(), 64);
        assert_eq!(s[6], "properties");
        assert_eq!(k.root(), "webapp");
    }

    #[test]
    fn doubled_namespace_is_collapsed() {
        let a = key("webapp/recipes/default.json", "x", &["command"]);
        let b = key("recipes/default.json", "x", &["command"]);
        assert_eq!(a, b);
        assert!(!a.to_string().starts_with("webapp/webapp/"));
    }

    #[test]
    fn stable_across_runs() {
        assert_eq!(
            key("a.json", "x", &["command", "cwd"]),
            key("a.json", "x", &["cwd", "command"])
        );
    }

    #[test]
    fn disjoint_keys() {
        let base = key("a.json", "x", &["command"]);
        assert_ne!(base, key("b.json", "x", &["command"]));
        assert_ne!(base, key("a.json", "y", &["command"]));
        assert_ne!(base, key("a.json", "x", &["command", "cwd"]));
        let other_type =
            StateKey::for_operation("webapp", "a.json", "file", "x", "run", ["command"]).unwrap();
        assert_ne!(base, other_type);
        let other_action =
            StateKey::for_operation("webapp", "a.json", "execute", "x", "stop", ["command"])
                .unwrap();
        assert_ne!(base, other_action);
    }

    #[test]
    fn property_names_are_hidden() {
        let k = key("a.json", "x", &["database_password"]);
        assert!(!k.to_string().contains("database_password"));
    }

    #[test]
    fn parse_display() {
        let k = key("recipes/default.json", "x", &["command"]);
        let parsed: StateKey = k.to_string().parse().unwrap();
        assert_eq!(parsed, k);
        assert!("webapp/recipes".parse::<StateKey>().is_err());
        assert!("properties".parse::<StateKey>().is_err());
    }

    #[test]
    fn slash_in_identity_stays_one_segment() {
        let nested = key("recipes/a.json/x", "y", &["command"]);
        let slashed = key("recipes/a.json", "x/y", &["command"]);
        assert_ne!(nested, slashed);
        assert_eq!(slashed.segments()[4], "x%2Fy");
        let parsed: StateKey = slashed.to_string().parse().unwrap();
        assert_eq!(parsed, slashed);
        assert_ne!(
            key("a.json", "x%2Fy", &["command"]),
            key("a.json", "x/y", &["command"])
        );
    }

    #[test]
    fn prefix_of_key() {
        let k = key("webapp/recipes/default.json", "x", &["command"]);
        let prefix = source_prefix("webapp", "webapp/recipes/default.json").unwrap();
        assert_eq!(prefix, vec!["webapp", "recipes", "default.json"]);
        assert!(k.segments().starts_with(&prefix));
    }

    #[test]
    fn invalid_namespace() {
        assert!(StateKey::for_operation("", "a", "t", "i", "run", []).is_err());
        assert!(StateKey::for_operation("a/b", "a", "t", "i", "run", []).is_err());
    }

    #[test]
    fn relative_source() {
        assert_eq!(
            relative_source_path(Path::new("/srv/repo/recipes/a.json"), Path::new("/srv/repo")),
            "recipes/a.json"
        );
        assert_eq!(
            relative_source_path(Path::new("/elsewhere/a.json"), Path::new("/srv/repo")),
            "elsewhere/a.json"
        );
    }
}
