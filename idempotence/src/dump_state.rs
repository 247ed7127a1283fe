use anyhow::Result;
use idempotence_core::{
    store::{AttributeRepository as _, EventLogAttributes, FileRepository as _, StatesFolder},
    EngineConfig,
};
use serde_json::{json, Map, Value};

/// Everything persisted: the attribute tree and every file state document.
pub(crate) fn dump_state(config: &EngineConfig) -> Result<String> {
    let attributes = EventLogAttributes::new(&config.attributes_file).load()?;

    let folder = StatesFolder::new(&config.states_folder);
    let mut files = Map::new();
    for root in folder.roots()? {
        if let Some(document) = folder.read(&root)? {
            files.insert(root, document);
        }
    }

    let state = json!({
        "attribute": Value::Object(attributes),
        "file": Value::Object(files),
    });
    Ok(serde_json::to_string_pretty(&state)?)
}
