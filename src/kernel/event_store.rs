//! Append-only ordered log of kernel events.
//!
//! Every kernel decision lands here: the store assigns a monotonically
//! increasing `seq` under a single mutex, evicts by count or age, pushes new
//! events to subscribers over a broadcast channel, and mirrors each append to
//! any attached sinks (JSONL audit file, SQLite journal).

use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{TimeDelta, Utc};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::config::EventStoreSection;
use crate::types::{Event, EventKind};

/// Buffered events per subscriber before lagging ones drop messages.
const BROADCAST_CAPACITY: usize = 256;

/// A write-through destination for appended events.
///
/// Sinks must not block for long: they run under the append lock so that
/// mirrored order matches `seq` order.
pub trait EventSink: Send + Sync {
    /// Record one event. Failures are the sink's problem; the in-memory
    /// log is authoritative.
    fn record(&self, event: &Event);
}

/// Filter for [`EventStore::query`].
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Only events with `seq >= from_seq`.
    pub from_seq: Option<u64>,
    /// Only events of these kinds.
    pub kinds: Option<Vec<EventKind>>,
    /// Only events of this episode.
    pub episode_id: Option<Uuid>,
    /// Cap on returned events.
    pub limit: Option<usize>,
}

struct Inner {
    events: VecDeque<Event>,
    next_seq: u64,
}

/// Append-only ordered event log with bounded retention.
pub struct EventStore {
    inner: Mutex<Inner>,
    bounds: EventStoreSection,
    broadcast: broadcast::Sender<Event>,
    sinks: Mutex<Vec<Arc<dyn EventSink>>>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.inner.lock().map(|i| i.events.len()).unwrap_or(0);
        f.debug_struct("EventStore")
            .field("len", &len)
            .field("bounds", &self.bounds)
            .finish()
    }
}

impl EventStore {
    /// Create a store with the given bounds.
    pub fn new(bounds: EventStoreSection) -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                next_seq: 1,
            }),
            bounds,
            broadcast: tx,
            sinks: Mutex::new(Vec::new()),
        }
    }

    /// Attach a write-through sink. Call during kernel assembly, before
    /// traffic starts.
    pub fn attach_sink(&self, sink: Arc<dyn EventSink>) {
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.push(sink);
        }
    }

    /// Append an event, returning its assigned `seq`.
    ///
    /// Atomic: seq assignment, eviction, sink mirroring, and broadcast all
    /// happen under one lock so cross-pipeline order is total.
    pub fn append(
        &self,
        kind: EventKind,
        episode_id: Option<Uuid>,
        payload: serde_json::Value,
    ) -> u64 {
        let event = {
            let mut inner = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            let seq = inner.next_seq;
            inner.next_seq = inner.next_seq.saturating_add(1);

            let event = Event {
                seq,
                ts: Utc::now(),
                kind,
                episode_id,
                payload,
            };

            self.evict(&mut inner);
            inner.events.push_back(event.clone());

            if let Ok(sinks) = self.sinks.lock() {
                for sink in sinks.iter() {
                    sink.record(&event);
                }
            }

            event
        };

        // No receivers is fine; subscribers come and go.
        let _send = self.broadcast.send(event.clone());

        event.seq
    }

    /// Apply count and age bounds before inserting a new event.
    fn evict(&self, inner: &mut Inner) {
        if let Some(max) = self.bounds.max_events {
            while inner.events.len() >= max.max(1) {
                inner.events.pop_front();
            }
        }
        if let Some(retention_ms) = self.bounds.retention_ms {
            let horizon = TimeDelta::milliseconds(i64::try_from(retention_ms).unwrap_or(i64::MAX));
            let cutoff = Utc::now().checked_sub_signed(horizon);
            if let Some(cutoff) = cutoff {
                while inner
                    .events
                    .front()
                    .map(|e| e.ts < cutoff)
                    .unwrap_or(false)
                {
                    inner.events.pop_front();
                }
            }
        }
    }

    /// Return retained events matching the query, in `seq` order.
    pub fn query(&self, query: &EventQuery) -> Vec<Event> {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let limit = query.limit.unwrap_or(usize::MAX);
        inner
            .events
            .iter()
            .filter(|e| query.from_seq.map(|from| e.seq >= from).unwrap_or(true))
            .filter(|e| {
                query
                    .kinds
                    .as_ref()
                    .map(|kinds| kinds.contains(&e.kind))
                    .unwrap_or(true)
            })
            .filter(|e| {
                query
                    .episode_id
                    .map(|id| e.episode_id == Some(id))
                    .unwrap_or(true)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// All retained events for one episode, in `seq` order.
    pub fn episode_slice(&self, episode_id: Uuid) -> Vec<Event> {
        self.query(&EventQuery {
            episode_id: Some(episode_id),
            ..EventQuery::default()
        })
    }

    /// Subscribe to new events. The receiver observes events in append order;
    /// a lagging subscriber drops oldest messages, never reorders.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast.subscribe()
    }

    /// Highest assigned seq so far (0 when empty).
    pub fn last_seq(&self) -> u64 {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.next_seq.saturating_sub(1)
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.events.len()
    }

    /// True when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Append-only JSONL mirror of the event log.
///
/// One JSON object per line; secrets never reach the event payloads so no
/// redaction happens here.
pub struct JsonlSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonlSink {
    /// Create a sink that appends to the given file path.
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
        })
    }

    /// Create a sink from an arbitrary writer (for testing).
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl EventSink for JsonlSink {
    fn record(&self, event: &Event) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize event for jsonl sink");
                return;
            }
        };
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            warn!(error = %e, "failed to write event to jsonl sink");
        }
    }
}
