//! The side effects behind the operation types of a manifest.

use std::{path::PathBuf, process::Stdio};

use anyhow::{bail, Context, Result};
use idempotence_core::PropertyBag;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use crate::manifest::OperationType;

#[derive(Debug, Deserialize)]
struct ExecuteProperties {
    command: String,
    cwd: Option<PathBuf>,
    #[serde(default)]
    environment: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FileProperties {
    path: PathBuf,
    content: Value,
}

fn properties<P: serde::de::DeserializeOwned>(
    type_: OperationType,
    properties: &PropertyBag,
) -> Result<P> {
    let value = Value::Object(
        properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    serde_json::from_value(value)
        .with_context(|| format!("Invalid properties for a `{}` operation", type_.as_str()))
}

/// Apply an operation of type `type_`.
///
/// `shell` is the interpreter argv that `execute` commands are passed to.
pub async fn perform(type_: OperationType, props: &PropertyBag, shell: &[String]) -> Result<()> {
    match type_ {
        OperationType::Execute => {
            let p: ExecuteProperties = properties(type_, props)?;
            let Some((program, args)) = shell.split_first() else {
                bail!("No shell configured to run commands");
            };
            let mut command = Command::new(program);
            command
                .args(args)
                .arg(&p.command)
                .envs(&p.environment)
                .stdin(Stdio::null())
                .kill_on_drop(true);
            if let Some(cwd) = &p.cwd {
                command.current_dir(cwd);
            }
            let status = command
                .status()
                .await
                .with_context(|| format!("Could not spawn {}", program))?;
            if !status.success() {
                bail!("Command `{}` failed with {}", p.command, status);
            }
            Ok(())
        }
        OperationType::File => {
            let p: FileProperties = properties(type_, props)?;
            let contents = match p.content {
                Value::String(s) => s,
                other => serde_json::to_string_pretty(&other)?,
            };
            if let Some(parent) = p.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Could not create {}", parent.display()))?;
            }
            std::fs::write(&p.path, contents)
                .with_context(|| format!("Could not write {}", p.path.display()))?;
            Ok(())
        }
    }
}
