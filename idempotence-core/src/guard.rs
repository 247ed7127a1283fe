//! `or_if` guards: predicates that force an operation to execute.
//!
//! Conventional guards (`only_if`, `not_if`) can only prevent an operation
//! from running. An `or_if` guard works the other way around: when any of an
//! operation's guards holds, the operation executes even if its properties
//! did not change.

use std::{
    collections::BTreeMap,
    fmt::{self, Debug},
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::Error;

/// How long a command guard may run, unless configured otherwise.
pub const DEFAULT_GUARD_TIMEOUT: Duration = Duration::from_secs(600);

/// Per-guard settings for command guards. Unset fields fall back to the
/// [`GuardContext`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// Seconds. `0` waits indefinitely; unset falls back to the
    /// [`GuardContext`] timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// A predicate implemented in Rust.
#[async_trait]
pub trait GuardPredicate: Send + Sync {
    async fn evaluate(&self) -> Result<bool>;

    /// Shown in logs and errors.
    fn describe(&self) -> String {
        "callable".to_string()
    }
}

struct FnPredicate<F>(F);

#[async_trait]
impl<F> GuardPredicate for FnPredicate<F>
where
    F: Fn() -> Result<bool> + Send + Sync,
{
    async fn evaluate(&self) -> Result<bool> {
        (self.0)()
    }
}

#[derive(Clone)]
pub enum Guard {
    /// A shell command; holds when it exits with status 0.
    Command {
        command: String,
        options: GuardOptions,
    },
    Callable(Arc<dyn GuardPredicate>),
}

impl Guard {
    pub fn command(command: impl Into<String>) -> Guard {
        Guard::Command {
            command: command.into(),
            options: GuardOptions::default(),
        }
    }

    pub fn command_with(command: impl Into<String>, options: GuardOptions) -> Guard {
        Guard::Command {
            command: command.into(),
            options,
        }
    }

    pub fn callable<F>(f: F) -> Guard
    where
        F: Fn() -> Result<bool> + Send + Sync + 'static,
    {
        Guard::Callable(Arc::new(FnPredicate(f)))
    }

    pub fn describe(&self) -> String {
        match self {
            Guard::Command { command, .. } => command.clone(),
            Guard::Callable(p) => p.describe(),
        }
    }
}

impl Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::Command { command, options } => f
                .debug_struct("Command")
                .field("command", command)
                .field("options", options)
                .finish(),
            Guard::Callable(p) => f.debug_tuple("Callable").field(&p.describe()).finish(),
        }
    }
}

impl From<&str> for Guard {
    fn from(command: &str) -> Self {
        Guard::command(command)
    }
}

impl From<String> for Guard {
    fn from(command: String) -> Self {
        Guard::command(command)
    }
}

/// The `or_if` guards of one operation, in registration order.
#[derive(Debug, Clone, Default)]
pub struct GuardSet(Vec<Guard>);

impl GuardSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, guard: Guard) {
        self.0.push(guard);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Guard> {
        self.0.iter()
    }
}

impl FromIterator<Guard> for GuardSet {
    fn from_iter<T: IntoIterator<Item = Guard>>(iter: T) -> Self {
        GuardSet(iter.into_iter().collect())
    }
}

/// Operations that accept `or_if` guards.
pub trait OrIfGuards {
    fn guards(&self) -> &GuardSet;

    fn guards_mut(&mut self) -> &mut GuardSet;

    /// Register a guard. It is evaluated at decision time, not here.
    fn or_if(&mut self, guard: impl Into<Guard>) -> &mut Self
    where
        Self: Sized,
    {
        self.guards_mut().push(guard.into());
        self
    }
}

/// Settings shared by all command guards of a run.
#[derive(Debug, Clone)]
pub struct GuardContext {
    /// Interpreter argv; the command is appended as the last argument.
    pub shell: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    /// `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for GuardContext {
    fn default() -> Self {
        GuardContext {
            shell: vec!["sh".to_string(), "-c".to_string()],
            cwd: None,
            environment: BTreeMap::new(),
            timeout: Some(DEFAULT_GUARD_TIMEOUT),
        }
    }
}

/// Whether any guard holds.
///
/// Guards run in order and evaluation stops at the first one that holds. An
/// empty set never holds. A guard that cannot be evaluated is an error, not
/// `false`.
pub async fn continue_if_any(guards: &GuardSet, context: &GuardContext) -> Result<bool, Error> {
    for guard in guards.iter() {
        let holds = match guard {
            Guard::Command { command, options } => {
                run_command(command, options, context).await?
            }
            Guard::Callable(predicate) => {
                predicate
                    .evaluate()
                    .await
                    .map_err(|source| Error::GuardEvaluation {
                        guard: predicate.describe(),
                        source,
                    })?
            }
        };
        debug!(guard = %guard.describe(), holds, "Evaluated or_if guard");
        if holds {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn run_command(
    command: &str,
    options: &GuardOptions,
    context: &GuardContext,
) -> Result<bool, Error> {
    let evaluation_error = |source: anyhow::Error| Error::GuardEvaluation {
        guard: command.to_string(),
        source,
    };

    let (program, args) = context
        .shell
        .split_first()
        .context("No shell configured for or_if guards")
        .map_err(evaluation_error)?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .arg(command)
        .envs(&context.environment)
        .envs(&options.environment)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(cwd) = options.cwd.as_ref().or(context.cwd.as_ref()) {
        cmd.current_dir(cwd);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Could not spawn {}", program))
        .map_err(evaluation_error)?;

    let timeout = match options.timeout {
        Some(0) => None,
        Some(seconds) => Some(Duration::from_secs(seconds)),
        None => context.timeout,
    };
    let status = match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status,
            Err(_elapsed) => {
                return Err(Error::GuardTimeout {
                    guard: command.to_string(),
                    timeout,
                })
            }
        },
        None => child.wait().await,
    };
    let status = status
        .context("Could not wait for guard process")
        .map_err(evaluation_error)?;
    Ok(status.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(result: bool, counter: &Arc<AtomicUsize>) -> Guard {
        let counter = counter.clone();
        Guard::callable(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(result)
        })
    }

    #[tokio::test]
    async fn empty_set_does_not_hold() {
        let holds = continue_if_any(&GuardSet::new(), &GuardContext::default())
            .await
            .unwrap();
        assert!(!holds);
    }

    #[tokio::test]
    async fn short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let guards: GuardSet = [
            counting(false, &calls),
            counting(true, &calls),
            counting(true, &calls),
        ]
        .into_iter()
        .collect();
        assert!(continue_if_any(&guards, &GuardContext::default())
            .await
            .unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn callable_error_propagates() {
        let guards: GuardSet = [Guard::callable(|| anyhow::bail!("boom"))]
            .into_iter()
            .collect();
        let err = continue_if_any(&guards, &GuardContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GuardEvaluation { .. }));
    }

    #[tokio::test]
    async fn command_exit_status() {
        let context = GuardContext::default();
        let t: GuardSet = [Guard::from("true")].into_iter().collect();
        let f: GuardSet = [Guard::from("false"), Guard::from("exit 3")]
            .into_iter()
            .collect();
        assert!(continue_if_any(&t, &context).await.unwrap());
        assert!(!continue_if_any(&f, &context).await.unwrap());
    }

    #[tokio::test]
    async fn command_options() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();
        let options = GuardOptions {
            cwd: Some(dir.path().to_path_buf()),
            environment: [("EXPECTED".to_string(), "yes".to_string())].into(),
            timeout: None,
        };
        let guards: GuardSet = [Guard::command_with(
            r#"test -f marker && test "$EXPECTED" = yes"#,
            options,
        )]
        .into_iter()
        .collect();
        assert!(continue_if_any(&guards, &GuardContext::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let context = GuardContext {
            shell: vec!["/nonexistent/shell".to_string()],
            ..GuardContext::default()
        };
        let guards: GuardSet = [Guard::from("true")].into_iter().collect();
        let err = continue_if_any(&guards, &context).await.unwrap_err();
        assert!(matches!(err, Error::GuardEvaluation { guard, .. } if guard == "true"));
    }

    #[tokio::test]
    async fn timeout_is_an_error() {
        let options = GuardOptions {
            timeout: Some(1),
            ..GuardOptions::default()
        };
        let guards: GuardSet = [Guard::command_with("sleep 30", options)]
            .into_iter()
            .collect();
        let err = continue_if_any(&guards, &GuardContext::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::GuardTimeout { timeout, .. } if timeout == Duration::from_secs(1)
        ));
    }

    #[tokio::test]
    async fn zero_timeout_waits_indefinitely() {
        let options = GuardOptions {
            timeout: Some(0),
            ..GuardOptions::default()
        };
        let guards: GuardSet = [Guard::command_with("sleep 1", options)]
            .into_iter()
            .collect();
        let context = GuardContext {
            timeout: Some(Duration::from_millis(100)),
            ..GuardContext::default()
        };
        assert!(continue_if_any(&guards, &context).await.unwrap());
    }

    #[test]
    fn or_if_registers_without_evaluating() {
        struct Op(GuardSet);
        impl OrIfGuards for Op {
            fn guards(&self) -> &GuardSet {
                &self.0
            }
            fn guards_mut(&mut self) -> &mut GuardSet {
                &mut self.0
            }
        }
        let calls = Arc::new(AtomicUsize::new(0));
        let mut op = Op(GuardSet::new());
        op.or_if("true").or_if(counting(true, &calls));
        assert_eq!(op.guards().len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
