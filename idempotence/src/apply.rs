use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use idempotence_core::{key::relative_source_path, EngineConfig, FlushReport};
use tracing::info;

use crate::{action, interrupt::InterruptState, manifest::Manifest, options::Options};

#[derive(clap::Parser, Debug)]
pub(crate) struct Args {
    /// JSON manifests listing the operations to apply, in order
    #[arg(required = true)]
    manifests: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub(crate) struct Summary {
    pub executed: usize,
    pub up_to_date: usize,
    pub flush: FlushReport,
}

/// Run the `apply` command.
pub(crate) async fn apply(
    interrupt_state: &InterruptState,
    options: &Options,
    args: &Args,
) -> Result<()> {
    let cwd = std::env::current_dir().context("getting current directory")?;
    let summary =
        apply_manifests(interrupt_state, &options.engine_config(), &args.manifests, &cwd).await?;
    eprintln!(
        "{} operation(s) executed, {} up to date, {} state(s) saved",
        summary.executed,
        summary.up_to_date,
        summary.flush.write_count()
    );
    Ok(())
}

/// Decide and apply every operation of the manifests in order, then persist
/// the states of the run.
///
/// States that other manifests of the same namespace persisted in earlier runs
/// are kept. An interruption between operations ends the run without
/// persisting the buffered states.
pub(crate) async fn apply_manifests(
    interrupt_state: &InterruptState,
    config: &EngineConfig,
    manifest_paths: &[PathBuf],
    base: &Path,
) -> Result<Summary> {
    let mut manifests = Vec::new();
    for manifest_path in manifest_paths {
        let manifest_path = base.join(manifest_path);
        let manifest = Manifest::load(&manifest_path)?;
        manifests.push((relative_source_path(&manifest_path, base), manifest));
    }

    let mut sources: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (source, manifest) in &manifests {
        sources
            .entry(manifest.namespace.as_str())
            .or_default()
            .push(source.as_str());
    }

    let mut engine = config.open()?;
    for (namespace, sources) in &sources {
        engine
            .scope_to_sources(namespace, sources)
            .with_context(|| format!("Could not read the states of namespace {}", namespace))?;
    }

    let mut summary = Summary::default();
    for (source, manifest) in &manifests {
        for spec in &manifest.operations {
            interrupt_state.check_interrupted()?;

            let operation = spec.to_operation(&manifest.namespace, source);
            let decision = engine
                .converge(&operation, &spec.options, || {
                    info!("Applying {} {}", spec.type_.as_str(), spec.name);
                    action::perform(spec.type_, &spec.properties, &config.shell)
                })
                .await
                .with_context(|| format!("{} {} in {}", spec.type_.as_str(), spec.name, source))?;

            if decision.execute {
                summary.executed += 1;
            } else {
                info!("{} {} is up to date", spec.type_.as_str(), spec.name);
                summary.up_to_date += 1;
            }
        }
    }

    interrupt_state.check_interrupted()?;
    summary.flush = engine.flush()?;
    Ok(summary)
}
