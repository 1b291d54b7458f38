//! Event bus for orchestration observability and chaining.
//!
//! Publish-subscribe with typed handler lists plus a wildcard channel, on
//! top of a durable, date-sharded, append-only JSONL log. Every event is
//! persisted before any subscriber sees it, and history can be replayed
//! with filters.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::position::PositionId;

/// An immutable, timestamped fact published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID.
    pub id: String,
    /// Dot-namespaced type, e.g. `task.created`.
    pub event_type: String,
    /// Position the event originated from, if any.
    pub source: Option<PositionId>,
    /// Position the event is addressed to, if any.
    pub target: Option<PositionId>,
    /// Opaque payload.
    pub payload: Value,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
}

/// Filter for history replay. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Exact event type.
    pub event_type: Option<String>,
    /// Source position.
    pub source: Option<PositionId>,
    /// Target position.
    pub target: Option<PositionId>,
    /// Only events at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Keep only the last N matches, in chronological order.
    pub limit: Option<usize>,
}

impl EventFilter {
    fn matches(&self, event: &Event) -> bool {
        if let Some(event_type) = &self.event_type {
            if &event.event_type != event_type {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if event.source.as_ref() != Some(source) {
                return false;
            }
        }
        if let Some(target) = &self.target {
            if event.target.as_ref() != Some(target) {
                return false;
            }
        }
        if let Some(since) = &self.since {
            if event.timestamp < *since {
                return false;
            }
        }
        true
    }
}

/// Append-only JSONL event log, one shard per calendar day.
pub struct EventLog {
    dir: PathBuf,
}

impl EventLog {
    /// Open (creating if needed) a log directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn shard_path(&self, timestamp: &DateTime<Utc>) -> PathBuf {
        self.dir.join(format!("events-{}.jsonl", timestamp.format("%Y-%m-%d")))
    }

    /// Append one event to the shard for its timestamp's day.
    pub fn append(&self, event: &Event) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.shard_path(&event.timestamp))?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Replay persisted events matching `filter`. Shards are read in
    /// lexicographic filename order, which is chronological; malformed
    /// lines are skipped. A limit keeps the tail of the match set, so the
    /// result is always the most recent N in chronological order.
    pub fn read(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let mut shards: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("events-") && n.ends_with(".jsonl"))
                    .unwrap_or(false)
            })
            .collect();
        shards.sort();

        let mut matched = Vec::new();
        for shard in shards {
            let file = fs::File::open(&shard)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                match serde_json::from_str::<Event>(&line) {
                    Ok(event) => {
                        if filter.matches(&event) {
                            matched.push(event);
                        }
                    }
                    Err(e) => {
                        log::warn!("skipping malformed event line in {}: {}", shard.display(), e);
                    }
                }
            }
        }

        if let Some(limit) = filter.limit {
            if matched.len() > limit {
                matched.drain(..matched.len() - limit);
            }
        }
        Ok(matched)
    }
}

/// Async event handler. Errors are logged and isolated, never propagated
/// past the bus.
pub type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Opaque token identifying a registered handler, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_type: HashMap<String, Vec<(HandlerId, Handler)>>,
}

/// Publish-subscribe hub with a durable log.
///
/// Notification is deterministic: exact-type handlers in registration
/// order, then wildcard handlers in registration order, each awaited
/// sequentially, all after the event has been appended to the log.
pub struct EventBus {
    registry: Mutex<Registry>,
    log: Option<EventLog>,
}

impl EventBus {
    /// The type string matched against every event.
    pub const WILDCARD: &'static str = "*";

    /// Create a bus without persistence. Events are delivered but not
    /// retained; history is always empty.
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            log: None,
        }
    }

    /// Create a bus that persists every event to `log` before delivery.
    pub fn with_log(log: EventLog) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            log: Some(log),
        }
    }

    /// Build an event with a fresh ID and the current timestamp. Does not
    /// publish it.
    pub fn create_event(
        &self,
        event_type: impl Into<String>,
        source: Option<PositionId>,
        payload: Value,
        target: Option<PositionId>,
    ) -> Event {
        Event {
            id: format!("evt-{}", Uuid::now_v7()),
            event_type: event_type.into(),
            source,
            target,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Register a handler for an exact event type, or for
    /// [`EventBus::WILDCARD`] to observe every event.
    pub fn on<F>(&self, event_type: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().expect("bus registry poisoned");
        let id = HandlerId(registry.next_id);
        registry.next_id += 1;
        registry
            .by_type
            .entry(event_type.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a previously registered handler. Returns whether it existed.
    pub fn off(&self, event_type: &str, id: HandlerId) -> bool {
        let mut registry = self.registry.lock().expect("bus registry poisoned");
        match registry.by_type.get_mut(event_type) {
            Some(handlers) => {
                let before = handlers.len();
                handlers.retain(|(hid, _)| *hid != id);
                handlers.len() != before
            }
            None => false,
        }
    }

    fn handlers_for(&self, event_type: &str) -> Vec<Handler> {
        let registry = self.registry.lock().expect("bus registry poisoned");
        registry
            .by_type
            .get(event_type)
            .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    /// Publish an event: persist it, then notify exact-type handlers, then
    /// wildcard handlers. A failing handler is logged and does not stop
    /// its siblings.
    pub async fn emit(&self, event: Event) -> Result<()> {
        if let Some(log) = &self.log {
            log.append(&event)?;
        }

        // Snapshot outside the lock so handlers can publish recursively.
        for handler in self.handlers_for(&event.event_type) {
            if let Err(e) = handler(event.clone()).await {
                log::warn!("handler for {} failed: {}", event.event_type, e);
            }
        }
        for handler in self.handlers_for(Self::WILDCARD) {
            if let Err(e) = handler(event.clone()).await {
                log::warn!("wildcard handler failed on {}: {}", event.event_type, e);
            }
        }
        Ok(())
    }

    /// Replay persisted events. Empty when the bus has no log.
    pub fn history(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        match &self.log {
            Some(log) => log.read(filter),
            None => Ok(Vec::new()),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Mutex as AsyncMutex;

    fn pos_id(s: &str) -> PositionId {
        PositionId(s.to_string())
    }

    fn logged_bus() -> (TempDir, EventBus) {
        let temp = TempDir::new().unwrap();
        let bus = EventBus::with_log(EventLog::new(temp.path()).unwrap());
        (temp, bus)
    }

    #[tokio::test]
    async fn test_exact_then_wildcard_order() {
        let bus = EventBus::new();
        let seen = Arc::new(AsyncMutex::new(Vec::new()));

        for label in ["exact-1", "exact-2"] {
            let seen = seen.clone();
            bus.on("task.created", move |_event| {
                let seen = seen.clone();
                Box::pin(async move {
                    seen.lock().await.push(label);
                    Ok(())
                })
            });
        }
        let wildcard_seen = seen.clone();
        bus.on(EventBus::WILDCARD, move |_event| {
            let seen = wildcard_seen.clone();
            Box::pin(async move {
                seen.lock().await.push("wildcard");
                Ok(())
            })
        });

        let event = bus.create_event("task.created", None, json!({}), None);
        bus.emit(event).await.unwrap();

        assert_eq!(*seen.lock().await, vec!["exact-1", "exact-2", "wildcard"]);
    }

    #[tokio::test]
    async fn test_off_removes_handler() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let id = bus.on("ping", move |_| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        bus.emit(bus.create_event("ping", None, json!({}), None)).await.unwrap();
        assert!(bus.off("ping", id));
        assert!(!bus.off("ping", id));
        bus.emit(bus.create_event("ping", None, json!({}), None)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_is_isolated() {
        let (_temp, bus) = logged_bus();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.on("task.completed", |_| {
            Box::pin(async { Err(crate::Error::Handler("subscriber exploded".to_string())) })
        });
        let counter = calls.clone();
        bus.on("task.completed", move |_| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let event = bus.create_event("task.completed", Some(pos_id("a")), json!({}), None);
        bus.emit(event).await.unwrap();

        // The sibling ran and the event still made it to disk.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let history = bus.history(&EventFilter::default()).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_persisted_before_notification() {
        let temp = TempDir::new().unwrap();
        let bus = Arc::new(EventBus::with_log(EventLog::new(temp.path()).unwrap()));
        let seen_in_handler = Arc::new(AsyncMutex::new(0usize));

        let bus_for_handler = bus.clone();
        let seen = seen_in_handler.clone();
        bus.on("task.created", move |_| {
            let bus = bus_for_handler.clone();
            let seen = seen.clone();
            Box::pin(async move {
                *seen.lock().await = bus.history(&EventFilter::default())?.len();
                Ok(())
            })
        });

        bus.emit(bus.create_event("task.created", None, json!({}), None))
            .await
            .unwrap();
        assert_eq!(*seen_in_handler.lock().await, 1);
    }

    #[tokio::test]
    async fn test_history_filters() {
        let (_temp, bus) = logged_bus();

        bus.emit(bus.create_event("task.created", Some(pos_id("a")), json!({}), Some(pos_id("b"))))
            .await
            .unwrap();
        bus.emit(bus.create_event("task.completed", Some(pos_id("a")), json!({}), None))
            .await
            .unwrap();
        bus.emit(bus.create_event("task.created", Some(pos_id("c")), json!({}), None))
            .await
            .unwrap();

        let created = bus
            .history(&EventFilter {
                event_type: Some("task.created".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(created.len(), 2);

        let from_a = bus
            .history(&EventFilter {
                source: Some(pos_id("a")),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(from_a.len(), 2);

        let to_b = bus
            .history(&EventFilter {
                target: Some(pos_id("b")),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(to_b.len(), 1);
    }

    #[tokio::test]
    async fn test_history_limit_keeps_tail() {
        let (_temp, bus) = logged_bus();

        for i in 0..5 {
            bus.emit(bus.create_event("tick", None, json!({"index": i}), None))
                .await
                .unwrap();
        }

        let tail = bus
            .history(&EventFilter {
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].payload["index"], 3);
        assert_eq!(tail[1].payload["index"], 4);
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped() {
        let temp = TempDir::new().unwrap();
        let log = EventLog::new(temp.path()).unwrap();
        let bus = EventBus::with_log(log);

        bus.emit(bus.create_event("tick", None, json!({}), None)).await.unwrap();

        // Corrupt the shard with a garbage line.
        let shard = std::fs::read_dir(temp.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let mut file = OpenOptions::new().append(true).open(&shard).unwrap();
        writeln!(file, "not json at all").unwrap();

        bus.emit(bus.create_event("tick", None, json!({}), None)).await.unwrap();

        let history = bus.history(&EventFilter::default()).unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_shard_named_by_day() {
        let temp = TempDir::new().unwrap();
        let log = EventLog::new(temp.path()).unwrap();
        let bus = EventBus::with_log(log);

        let event = bus.create_event("tick", None, json!({}), None);
        let expected = format!("events-{}.jsonl", event.timestamp.format("%Y-%m-%d"));
        bus.emit(event).await.unwrap();

        assert!(temp.path().join(expected).exists());
    }

    #[tokio::test]
    async fn test_unpersisted_bus_has_empty_history() {
        let bus = EventBus::new();
        bus.emit(bus.create_event("tick", None, json!({}), None)).await.unwrap();
        assert!(bus.history(&EventFilter::default()).unwrap().is_empty());
    }
}
