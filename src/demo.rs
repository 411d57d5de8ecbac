//! Demo application served by the `resync` binary.
//!
//! APIs:
//! - `add([a, b])` → `a + b`
//! - `set({name, value})` → stores a synced session value
//! - `increment()` → dispatches a session action, returns its serial
//! - `track_clock({id, serial?})` → opens a tracker on the clock channel,
//!   replacing an open tracker with the same id
//! - `untrack({id})` → closes a tracker, returns whether one was open
//!
//! A background task publishes a `TICK` action on the clock channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use packets::{CLOSE_NORMAL, CLOSE_REPLACED};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::warn;

use crate::services::channel::{Channel, ChannelHub};
use crate::services::session::{
    ApiError, ApiResult, Apis, Initializer, Populate, Session, SessionError, populate_with,
};
use crate::services::tracker::{Tracker, TrackerError, TrackerSource, now_ms};

pub const CLOCK_CHANNEL: &str = "clock";

async fn add(payload: Value) -> ApiResult {
    let (Some(a), Some(b)) = (payload.get(0), payload.get(1)) else {
        return Err(ApiError::new("add expects two numbers"));
    };
    if let Some(sum) = a.as_i64().zip(b.as_i64()).and_then(|(a, b)| a.checked_add(b)) {
        return Ok(json!(sum));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok(json!(a + b)),
        _ => Err(ApiError::new("add expects two numbers")),
    }
}

/// API table for the demo app.
#[must_use]
pub fn apis(hub: ChannelHub) -> Apis {
    let table = TrackerTable::default();
    Apis::new()
        .register("add", |_: &Session| add)
        .register("set", |session: &Session| {
            let session = session.clone();
            move |payload: Value| {
                let result = match payload.get("name").and_then(Value::as_str) {
                    Some(name) => {
                        let value = payload.get("value").cloned().unwrap_or(Value::Null);
                        session.set(name, value);
                        Ok(Value::Null)
                    }
                    None => Err(ApiError::new("set expects a name")),
                };
                async move { result }
            }
        })
        .register("increment", |session: &Session| {
            let session = session.clone();
            move |_: Value| {
                let serial = session.dispatch(json!({ "type": "INCREMENT" }));
                async move { Ok::<_, ApiError>(json!(serial)) }
            }
        })
        .register("track_clock", {
            let table = table.clone();
            move |session: &Session| {
                let session = session.clone();
                let hub = hub.clone();
                let table = table.clone();
                move |payload: Value| {
                    let session = session.clone();
                    let hub = hub.clone();
                    let table = table.clone();
                    async move { track_clock(&session, &hub, &table, &payload).await }
                }
            }
        })
        .register("untrack", move |session: &Session| {
            let session = session.clone();
            let table = table.clone();
            move |payload: Value| {
                let session = session.clone();
                let table = table.clone();
                async move { untrack(&session, &table, &payload).await }
            }
        })
}

fn tracker_id<'a>(api: &str, payload: &'a Value) -> Result<&'a str, ApiError> {
    payload
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::new(format!("{api} expects an id")))
}

async fn track_clock(session: &Session, hub: &ChannelHub, table: &TrackerTable, payload: &Value) -> ApiResult {
    let id = tracker_id("track_clock", payload)?;
    let since = payload.get("serial").and_then(Value::as_u64);

    if let Some(previous) = table.remove(session, id) {
        previous.close(CLOSE_REPLACED, "replaced by a newer tracker").await;
    }
    let tracker = Tracker::open(id, session, hub, ClockSource, payload, since)
        .map_err(|e| ApiError::new(e.to_string()))?;
    // A concurrent call for the same id lost the race.
    if let Some(previous) = table.insert(session, tracker) {
        previous.close(CLOSE_REPLACED, "replaced by a newer tracker").await;
    }
    Ok(json!({ "tracker": id }))
}

async fn untrack(session: &Session, table: &TrackerTable, payload: &Value) -> ApiResult {
    let id = tracker_id("untrack", payload)?;
    let Some(tracker) = table.remove(session, id) else {
        return Ok(json!(false));
    };
    let was_open = tracker.is_open();
    tracker.close(CLOSE_NORMAL, "untracked").await;
    Ok(json!(was_open))
}

/// Open trackers per session, keyed by tracker id.
#[derive(Clone, Default)]
struct TrackerTable {
    sessions: Arc<Mutex<HashMap<String, HashMap<String, Tracker>>>>,
}

impl TrackerTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, Tracker>>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Record `tracker` under its id, returning the tracker it displaced.
    fn insert(&self, session: &Session, tracker: Tracker) -> Option<Tracker> {
        let mut sessions = self.lock();
        let trackers = sessions.entry(session.id().to_owned()).or_insert_with(|| {
            let table = self.clone();
            session.add_close_listener(move |id| {
                table.lock().remove(id);
            });
            HashMap::new()
        });
        trackers.retain(|_, t| t.is_open());
        trackers.insert(tracker.id().to_owned(), tracker)
    }

    fn remove(&self, session: &Session, id: &str) -> Option<Tracker> {
        self.lock().get_mut(session.id())?.remove(id)
    }
}

/// Full sync for the demo: a single `WELCOME` action echoing the context.
pub struct DemoInit;

#[async_trait]
impl Initializer for DemoInit {
    async fn init(&self, _session: &Session) -> Result<Populate, SessionError> {
        Ok(populate_with(|context| async move {
            Ok(vec![json!({ "type": "WELCOME", "payload": context })])
        }))
    }
}

/// Tracker source for the clock channel.
pub struct ClockSource;

#[async_trait]
impl TrackerSource for ClockSource {
    fn channel(&self, hub: &ChannelHub) -> Channel {
        hub.channel(CLOCK_CHANNEL)
    }

    async fn initial_data(&self) -> Result<Value, TrackerError> {
        Ok(json!({ "now": now_ms() }))
    }
}

/// Publish a `TICK` on the clock channel every `period`.
pub fn spawn_clock(hub: ChannelHub, period: Duration) -> JoinHandle<()> {
    let channel = hub.channel(CLOCK_CHANNEL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let tick = json!({ "type": "TICK", "payload": { "now": now_ms() } });
            if let Err(e) = channel.publish(tick).await {
                warn!(error = %e, "clock: publish failed");
            }
        }
    })
}

#[cfg(test)]
#[path = "demo_test.rs"]
mod tests;
