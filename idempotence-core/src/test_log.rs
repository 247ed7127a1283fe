//! Capturing log messages in tests.

use std::sync::{Arc, Mutex};

use tracing::{
    field::{Field, Visit},
    subscriber::DefaultGuard,
    Event, Subscriber,
};
use tracing_subscriber::{
    layer::{Context, Layer, SubscriberExt},
    Registry,
};

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }
}

struct CaptureLayer {
    messages: Arc<Mutex<Vec<String>>>,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if let Some(message) = visitor.message {
            self.messages.lock().unwrap().push(message);
        }
    }
}

/// Messages logged on this thread while it is alive.
pub(crate) struct CapturedLogs {
    messages: Arc<Mutex<Vec<String>>>,
    _guard: DefaultGuard,
}

pub(crate) fn capture() -> CapturedLogs {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let subscriber = Registry::default().with(CaptureLayer {
        messages: messages.clone(),
    });
    CapturedLogs {
        messages,
        _guard: tracing::subscriber::set_default(subscriber),
    }
}

impl CapturedLogs {
    pub(crate) fn starting_with(&self, prefix: &str) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|message| message.starts_with(prefix))
            .cloned()
            .collect()
    }
}
