//! The JSON document read by `idempotence apply`.

use std::{collections::BTreeMap, path::Path};

use anyhow::{bail, Context, Result};
use idempotence_core::{DecisionOptions, Guard, GuardOptions, Operation, PropertyBag};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub namespace: String,
    #[serde(default)]
    pub operations: Vec<OperationSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Execute,
    File,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Execute => "execute",
            OperationType::File => "file",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OperationSpec {
    #[serde(rename = "type")]
    pub type_: OperationType,
    pub name: String,
    pub action: Option<String>,
    #[serde(default)]
    pub properties: PropertyBag,
    #[serde(default)]
    pub or_if: Vec<GuardSpec>,
    #[serde(flatten)]
    pub options: DecisionOptions,
    /// Keys not matched by any field above.
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum GuardSpec {
    Command(String),
    Detailed {
        command: String,
        #[serde(flatten)]
        options: GuardOptions,
    },
}

impl From<&GuardSpec> for Guard {
    fn from(spec: &GuardSpec) -> Guard {
        match spec {
            GuardSpec::Command(command) => Guard::command(command.as_str()),
            GuardSpec::Detailed { command, options } => {
                Guard::command_with(command.as_str(), options.clone())
            }
        }
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Manifest> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read manifest {}", path.display()))?;
        Manifest::parse(&contents)
            .with_context(|| format!("Could not parse manifest {}", path.display()))
    }

    /// Parse a manifest. Unknown operation keys are rejected, so that a
    /// misspelled option does not silently change what is checked.
    pub fn parse(contents: &str) -> Result<Manifest> {
        let manifest: Manifest = serde_json::from_str(contents)?;
        for spec in &manifest.operations {
            if let Some(key) = spec.unknown.keys().next() {
                bail!("unknown field `{}` in operation {}", key, spec.name);
            }
        }
        Ok(manifest)
    }
}

impl OperationSpec {
    /// The operation as the engine sees it. `source` is where the manifest
    /// lives, relative to the project root.
    pub fn to_operation(&self, namespace: &str, source: &str) -> Operation {
        let mut operation = Operation::new(namespace, source, self.type_.as_str(), &self.name);
        if let Some(action) = &self.action {
            operation = operation.with_action(action);
        }
        operation.properties = self.properties.clone();
        self.or_if
            .iter()
            .fold(operation, |operation, guard| operation.with_guard(guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idempotence_core::{OrIfGuards, StateType};
    use serde_json::json;

    const MANIFEST: &str = r#"
    {
        "namespace": "webapp",
        "operations": [
            {
                "type": "execute",
                "name": "migrate",
                "properties": { "command": "./migrate.sh", "cwd": "/srv/app" },
                "excluded_properties": ["cwd"],
                "or_if": [
                    "test ! -f /srv/app/.migrated",
                    { "command": "./needs-migration", "cwd": "/srv/app", "timeout": 30 }
                ]
            },
            {
                "type": "file",
                "name": "config",
                "action": "create",
                "state_type": "file",
                "sensitive": true,
                "properties": { "path": "/etc/app.conf", "content": "secret" }
            }
        ]
    }
    "#;

    #[test]
    fn parse() {
        let manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();
        assert_eq!(manifest.namespace, "webapp");
        assert_eq!(manifest.operations.len(), 2);

        let migrate = &manifest.operations[0];
        assert_eq!(migrate.type_, OperationType::Execute);
        assert_eq!(migrate.options.excluded_properties, vec!["cwd"]);
        assert_eq!(migrate.options.state_type, StateType::Attribute);
        match &migrate.or_if[1] {
            GuardSpec::Detailed { command, options } => {
                assert_eq!(command, "./needs-migration");
                assert_eq!(options.timeout, Some(30));
            }
            other => panic!("unexpected guard: {:?}", other),
        }

        let config = &manifest.operations[1];
        assert_eq!(config.options.state_type, StateType::File);
        assert!(config.options.sensitive);
    }

    #[test]
    fn to_operation() {
        let manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();
        let op = manifest.operations[0].to_operation("webapp", "deploy/manifest.json");
        assert_eq!(op.operation_type, "execute");
        assert_eq!(op.identity, "migrate");
        assert_eq!(op.action, "run");
        assert_eq!(op.properties["command"], json!("./migrate.sh"));
        assert_eq!(op.guards().len(), 2);

        let op = manifest.operations[1].to_operation("webapp", "deploy/manifest.json");
        assert_eq!(op.action, "create");
    }

    #[test]
    fn misspelled_option_is_rejected() {
        let err = Manifest::parse(
            &json!({
                "namespace": "webapp",
                "operations": [{
                    "type": "execute",
                    "name": "migrate",
                    "properties": {"command": "./migrate.sh"},
                    "excluded_property": ["cwd"],
                }]
            })
            .to_string(),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "unknown field `excluded_property` in operation migrate"
        );
        assert!(Manifest::parse(MANIFEST).is_ok());
    }

    #[test]
    fn unknown_state_type() {
        let err = serde_json::from_value::<Manifest>(json!({
            "namespace": "webapp",
            "operations": [{"type": "execute", "name": "x", "state_type": "node"}]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("node"));
    }
}
