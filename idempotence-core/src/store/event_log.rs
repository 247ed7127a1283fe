//! The persisted attribute tree, kept as an append-only log of JSON patches.
//!
//! The first event creates the document
//!
//! ```json
//! { "_type": "idempotenceState", "states": {} }
//! ```
//!
//! and every flush appends one event that adds or replaces the root keys that
//! changed during the run. Replaying the log yields the current tree.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use json_patch::{jsonptr::PointerBuf, AddOperation, Patch, PatchOperation};
use serde::{Deserialize, Deserializer};
use serde_json::{de::IoRead, Deserializer as JsonDeserializer, Map, StreamDeserializer, Value};
use std::{
    fs::{File, OpenOptions},
    io::{self, Seek as _, Write},
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use super::AttributeRepository;

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct StateEvent {
    pub index: u64,
    pub meta: StateEventMeta,
    pub patch: Patch,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct StateEventMeta {
    pub time: String,
    #[serde(flatten)]
    pub other_fields: Value,
}

pub struct StateEventStream<'a, R: io::Read> {
    iter: StreamDeserializer<'a, IoRead<R>, StateEvent>,
    /// Save the validated first event for processing by our caller
    /// (basically prepend it to the iterator)
    first_event: Option<StateEvent>,
}
impl<'a, R: io::Read> StateEventStream<'a, R> {
    pub fn open_from_reader(reader: R) -> Result<StateEventStream<'a, R>> {
        let deserializer = JsonDeserializer::from_reader(reader);
        let mut iter = deserializer.into_iter();
        let first_event = match iter.next() {
            Some(Ok(ev @ StateEvent { index, .. })) => {
                if index != 0 {
                    bail!("Expected initial state event with index 0, got {}", index);
                }
                ev
            }
            Some(Err(e)) => bail!(
                "State file invalid: error parsing initial state event: {}",
                e
            ),
            None => bail!("State file invalid: no initial state event"),
        };
        Ok(StateEventStream {
            iter,
            first_event: Some(first_event),
        })
    }
}

impl<'a, R: io::Read> Iterator for StateEventStream<'a, R> {
    type Item = Result<StateEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.first_event.is_some() {
            self.first_event.take().map(Ok)
        } else {
            self.iter.next().map(|r| r.map_err(Into::into))
        }
    }
}

pub fn apply_state_event(state: &mut Value, event: &StateEvent) -> Result<()> {
    json_patch::patch(state, event.patch.0.as_slice()).map_err(Into::into)
}

/// Apply all events, returning the index of the last one.
pub fn apply_state_events(
    state: &mut Value,
    events: impl Iterator<Item = Result<StateEvent>>,
) -> Result<Option<u64>> {
    let mut last = None;
    for event in events {
        let event = event?;
        apply_state_event(state, &event)
            .with_context(|| format!("applying state event {}", event.index))?;
        last = Some(event.index);
    }
    Ok(last)
}

/// Report on a task which may take a long time.
/// After SILENT_INTERVAL: log activity
/// After LOG_INTERVAL: log activity and duration
pub struct WaitMonitor {
    done: Arc<AtomicBool>,
}
impl WaitMonitor {
    const SILENT_INTERVAL: Duration = Duration::from_millis(500);
    const LOG_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(activity: String) -> WaitMonitor {
        let done = Arc::new(AtomicBool::new(false));
        let r = WaitMonitor { done: done.clone() };
        std::thread::spawn(|| {
            WaitMonitor::run(done, activity);
        });
        r
    }
    fn run(done: Arc<AtomicBool>, activity: String) {
        let start = std::time::Instant::now();
        let mut waited = Self::SILENT_INTERVAL;
        loop {
            if done.load(std::sync::atomic::Ordering::Relaxed) {
                break;
            }
            let elapsed = start.elapsed();
            if waited > elapsed {
                std::thread::sleep(waited - elapsed);
            }
            if done.load(std::sync::atomic::Ordering::Relaxed) {
                break;
            }
            if waited == Self::SILENT_INTERVAL {
                tracing::info!("{}", activity);
                waited = Self::LOG_INTERVAL;
            } else {
                tracing::info!("{} ({} s)", activity, waited.as_secs());
                waited += Self::LOG_INTERVAL;
            }
        }
    }
    pub fn done(&self) {
        self.done.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}
impl Drop for WaitMonitor {
    fn drop(&mut self) {
        self.done()
    }
}

pub struct StateHandle {
    file: Arc<File>,
    locking: fd_lock::RwLock<Arc<File>>,
    expected_size: Option<u64>,
}
impl StateHandle {
    pub fn open<P: AsRef<Path>>(name: P, create_new: bool) -> Result<StateHandle> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(create_new)
            .open(name)?;
        let file = Arc::new(file);
        let locking = fd_lock::RwLock::new(file.clone());
        let mut handle = StateHandle {
            file,
            locking,
            expected_size: None,
        };
        if create_new {
            handle.append(&[&Self::init_event()])?;
        }
        Ok(handle)
    }
    fn init_event() -> StateEvent {
        StateEvent {
            index: 0,
            meta: StateEventMeta {
                time: Utc::now().to_rfc3339(),
                other_fields: serde_json::json!({}),
            },
            patch: Patch(vec![PatchOperation::Add(AddOperation {
                path: PointerBuf::root(),
                value: serde_json::json!({
                    "_type": STATE_TYPE_TAG,
                    "states": {},
                }),
            })]),
        }
    }
    fn lock_write(
        locking: &mut fd_lock::RwLock<Arc<File>>,
    ) -> Result<fd_lock::RwLockWriteGuard<'_, Arc<File>>> {
        let lock_wait_mon = WaitMonitor::new("Waiting for state file write lock".to_owned());
        let lock = locking.write()?;
        lock_wait_mon.done();
        Ok(lock)
    }
    pub fn append(&mut self, events: &[&StateEvent]) -> Result<()> {
        let lock_guard = Self::lock_write(&mut self.locking)?;
        let pos = (&*self.file).seek(io::SeekFrom::End(0))?;
        match self.expected_size {
            None => self.expected_size = Some(pos),
            Some(expected_size) => {
                if pos != expected_size {
                    tracing::error!(
                        "Detected concurrent writing. Foreign bytes: [{}..{})",
                        expected_size,
                        pos
                    );
                }
            }
        }
        let mut writer = io::BufWriter::new(&*self.file);

        for event in events {
            // Pretty, so that the state history can be reviewed by hand
            serde_json::to_writer_pretty(&mut writer, event)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        drop(writer);

        self.expected_size = Some((&*self.file).stream_position()?);

        drop(lock_guard);
        Ok(())
    }
}

const STATE_TYPE_TAG: &str = "idempotenceState";

/// The document that the event log resolves to.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
struct AttributeState {
    #[serde(deserialize_with = "type_is_idempotence_state")]
    _type: String,
    states: Map<String, Value>,
}

fn type_is_idempotence_state<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == STATE_TYPE_TAG {
        Ok(s)
    } else {
        Err(serde::de::Error::custom(format!(
            "unexpected _type in state file: expected '{}', got '{}'",
            STATE_TYPE_TAG, s
        )))
    }
}

/// [`AttributeRepository`] backed by a state event log file.
///
/// The file is created on the first write.
pub struct EventLogAttributes {
    path: PathBuf,
    last_index: Option<u64>,
}

impl EventLogAttributes {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        EventLogAttributes {
            path: path.into(),
            last_index: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(&self) -> Result<Option<(Map<String, Value>, u64)>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Could not open state file {}", self.path.display())
                })
            }
        };
        let stream = StateEventStream::open_from_reader(io::BufReader::new(file))?;
        let mut state = serde_json::json!({});
        let last = apply_state_events(&mut state, stream)?.unwrap_or(0);
        let state: AttributeState = serde_json::from_value(state)
            .with_context(|| format!("Could not interpret state file {}", self.path.display()))?;
        Ok(Some((state.states, last)))
    }
}

impl AttributeRepository for EventLogAttributes {
    fn load(&mut self) -> Result<Map<String, Value>> {
        match self.replay()? {
            Some((states, last)) => {
                self.last_index = Some(last);
                Ok(states)
            }
            None => Ok(Map::new()),
        }
    }

    fn replace_roots(&mut self, roots: &Map<String, Value>) -> Result<()> {
        if roots.is_empty() {
            return Ok(());
        }
        let (mut handle, last_index) = match self.last_index {
            Some(last) => (StateHandle::open(&self.path, false)?, last),
            None => match self.replay()? {
                Some((_, last)) => (StateHandle::open(&self.path, false)?, last),
                None => {
                    if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty())
                    {
                        std::fs::create_dir_all(parent).with_context(|| {
                            format!("Could not create {}", parent.display())
                        })?;
                    }
                    (StateHandle::open(&self.path, true)?, 0)
                }
            },
        };
        let index = last_index + 1;
        let patch = roots
            .iter()
            .map(|(root, content)| {
                PatchOperation::Add(AddOperation {
                    path: PointerBuf::from_tokens(["states", root.as_str()]),
                    value: content.clone(),
                })
            })
            .collect();
        handle
            .append(&[&StateEvent {
                index,
                meta: StateEventMeta {
                    time: Utc::now().to_rfc3339(),
                    other_fields: serde_json::json!({
                        "event": "flush",
                    }),
                },
                patch: Patch(patch),
            }])
            .with_context(|| format!("Could not write state file {}", self.path.display()))?;
        self.last_index = Some(index);
        Ok(())
    }
}
