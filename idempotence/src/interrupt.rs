use std::{
    error::Error,
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};

#[derive(Clone, Debug, Default)]
pub struct InterruptState {
    interrupted: Arc<AtomicBool>,
}

#[derive(Clone, Debug)]
pub struct InterruptedError {}
impl Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "interrupted")
    }
}
impl Error for InterruptedError {}

impl InterruptState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_interrupted(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn check_interrupted(&self) -> Result<()> {
        if self.is_interrupted() {
            Err(InterruptedError {}.into())
        } else {
            Ok(())
        }
    }
}

/// Install a Ctrl-C handler that marks the returned state as interrupted.
///
/// Work in progress is not cancelled; callers check the state between steps.
pub fn set_up_process_interrupt_handler() -> Result<InterruptState> {
    let interrupt_state = InterruptState::new();
    let handler_state = interrupt_state.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("Interrupted; stopping after the current operation");
        handler_state.set_interrupted();
    })
    .context("Error setting interrupt handler")?;
    Ok(interrupt_state)
}
