use std::{io::IsTerminal as _, path::PathBuf};

use clap::{ColorChoice, Parser};
use idempotence_core::EngineConfig;

#[derive(Parser, Debug, Clone)]
pub struct Options {
    #[arg(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// Directory holding the documents of `file` states
    #[arg(long, global = true, env = "IDEMPOTENCE_STATES_FOLDER")]
    pub states_folder: Option<PathBuf>,

    /// Event log holding the `attribute` states
    #[arg(long, global = true, env = "IDEMPOTENCE_ATTRIBUTES_FILE")]
    pub attributes_file: Option<PathBuf>,

    /// Seconds an `or_if` command may run; 0 waits indefinitely
    #[arg(long, global = true, env = "IDEMPOTENCE_GUARD_TIMEOUT")]
    pub guard_timeout: Option<u64>,
}

impl Options {
    pub fn use_color(&self) -> bool {
        match self.color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => std::io::stderr().is_terminal(),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if let Some(dir) = &self.states_folder {
            config.states_folder = dir.clone();
        }
        if let Some(file) = &self.attributes_file {
            config.attributes_file = file.clone();
        }
        match self.guard_timeout {
            Some(0) => config.guard_timeout = None,
            Some(secs) => config.guard_timeout = Some(secs),
            None => {}
        }
        config
    }
}
