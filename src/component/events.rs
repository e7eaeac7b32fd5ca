//! Lifecycle events and inbound stanza handlers.
//!
//! Both registries are filled while the component is being built and are
//! shared immutably afterwards. Nothing registers or unregisters at runtime.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::element::{Element, NS_TLS};

/// Lifecycle events emitted by the component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    /// The listening socket is bound.
    Listened,
    /// A peer connection was accepted.
    Connected,
    /// Stream negotiation finished and stanzas may flow.
    SessionStart,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Listened => "listened",
            EventName::Connected => "connected",
            EventName::SessionStart => "session_start",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Subscribers run on the raising task before `raise` returns.
    Direct,
    /// Subscribers run later on the queue worker, in raise order.
    Queued,
}

/// An event carries no payload: subscribers query state they care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub name: EventName,
    pub mode: DispatchMode,
}

pub type EventCallback = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

type Subscribers = HashMap<EventName, Vec<EventCallback>>;

#[derive(Default)]
pub struct EventBusBuilder {
    subscribers: Subscribers,
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&mut self, name: EventName, callback: F) -> &mut Self
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.subscribers
            .entry(name)
            .or_default()
            .push(Arc::new(callback));
        self
    }

    pub fn build(self) -> EventBus {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        EventBus {
            subscribers: Arc::new(self.subscribers),
            queue_tx,
            queue_rx: Arc::new(Mutex::new(Some(queue_rx))),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Subscribers>,
    queue_tx: mpsc::UnboundedSender<LifecycleEvent>,
    queue_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<LifecycleEvent>>>>,
}

impl EventBus {
    pub fn raise(&self, name: EventName, mode: DispatchMode) {
        let event = LifecycleEvent { name, mode };
        debug!(event = %name, mode = ?mode, "Raising event");
        match mode {
            DispatchMode::Direct => deliver(&self.subscribers, &event),
            DispatchMode::Queued => {
                if self.queue_tx.send(event).is_err() {
                    warn!(event = %name, "Event queue closed, dropping queued event");
                }
            }
        }
    }

    /// Start the task that delivers queued events. Only the first call spawns
    /// a worker; later calls return `None`.
    pub fn spawn_queue_worker(&self) -> Option<JoinHandle<()>> {
        let mut rx = self.queue_rx.lock().ok()?.take()?;
        let subscribers = self.subscribers.clone();
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                deliver(&subscribers, &event);
            }
        }))
    }
}

fn deliver(subscribers: &Subscribers, event: &LifecycleEvent) {
    if let Some(callbacks) = subscribers.get(&event.name) {
        for callback in callbacks {
            callback(event);
        }
    }
}

/// Requests a handler can make of the stream negotiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    StartTls,
}

/// When a handler is eligible to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Runs during stream negotiation and after it.
    Negotiation,
    /// Runs only once the session is established.
    Session,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    ns: Option<String>,
    name: String,
}

/// XPath-style matcher: `{ns}name/{ns}child/...`.
///
/// The first step matches the top-level stanza, each following step a child
/// of the previous match. A step without `{ns}` matches any namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matcher {
    path: String,
    steps: Vec<Step>,
}

impl Matcher {
    pub fn xpath(path: &str) -> Self {
        Self {
            path: path.to_string(),
            steps: parse_steps(path),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn matches(&self, stanza: &Element) -> bool {
        match self.steps.split_first() {
            Some((root, rest)) => step_matches(root, stanza) && descend(rest, stanza),
            None => false,
        }
    }
}

fn step_matches(step: &Step, el: &Element) -> bool {
    el.name() == step.name && step.ns.as_deref().map_or(true, |ns| ns == el.ns())
}

fn descend(steps: &[Step], el: &Element) -> bool {
    match steps.split_first() {
        None => true,
        Some((step, rest)) => el
            .children()
            .any(|child| step_matches(step, child) && descend(rest, child)),
    }
}

// Namespaces may contain '/', so only split outside braces.
fn parse_steps(path: &str) -> Vec<Step> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_braces = false;
    for ch in path.chars() {
        match ch {
            '{' => {
                in_braces = true;
                current.push(ch);
            }
            '}' => {
                in_braces = false;
                current.push(ch);
            }
            '/' if !in_braces => segments.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    segments.push(current);

    segments
        .into_iter()
        .filter(|s| !s.is_empty())
        .map(|segment| {
            let (ns, name) = match segment.strip_prefix('{').and_then(|s| s.split_once('}')) {
                Some((ns, name)) => (Some(ns.to_string()), name.to_string()),
                None => (None, segment.clone()),
            };
            Step { ns, name }
        })
        .collect()
}

pub type HandlerCallback = Arc<dyn Fn(&Element) -> Option<Signal> + Send + Sync>;

struct Handler {
    name: String,
    matcher: Matcher,
    stage: Stage,
    callback: HandlerCallback,
}

/// Result of dispatching one stanza.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub matched: Vec<String>,
    pub signal: Option<Signal>,
}

pub struct HandlerRegistry {
    handlers: Vec<Handler>,
}

impl HandlerRegistry {
    /// A registry holding the built-in STARTTLS handler.
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: Vec::new(),
        };
        registry.handlers.push(Handler {
            name: "StartTLS".to_string(),
            matcher: Matcher::xpath(&format!("{{{}}}starttls", NS_TLS)),
            stage: Stage::Negotiation,
            callback: Arc::new(|_| Some(Signal::StartTls)),
        });
        registry
    }

    /// Register a session-stage handler. Collaborator handlers never signal
    /// the negotiator.
    pub fn register<F>(&mut self, name: &str, matcher: Matcher, callback: F)
    where
        F: Fn(&Element) + Send + Sync + 'static,
    {
        debug!(handler = name, matcher = matcher.path(), "Registering handler");
        self.handlers.push(Handler {
            name: name.to_string(),
            matcher,
            stage: Stage::Session,
            callback: Arc::new(move |el| {
                callback(el);
                None
            }),
        });
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every handler eligible at `stage` whose matcher accepts `stanza`,
    /// in registration order. The first signal raised wins.
    pub fn dispatch(&self, stanza: &Element, stage: Stage) -> Dispatch {
        let mut result = Dispatch::default();
        for handler in &self.handlers {
            if stage == Stage::Negotiation && handler.stage != Stage::Negotiation {
                continue;
            }
            if !handler.matcher.matches(stanza) {
                continue;
            }
            result.matched.push(handler.name.clone());
            let signal = (handler.callback)(stanza);
            if result.signal.is_none() {
                result.signal = signal;
            }
        }
        result
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
