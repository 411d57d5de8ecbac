//! Trackers: expose one channel subscription to one session.
//!
//! DESIGN
//! ======
//! A tracker is composed from a [`TrackerSource`] (which channel, what the
//! snapshot looks like, optional lifecycle hooks) and generic plumbing that
//! turns channel deliveries into tracker packets for the owning session.
//! The two required behaviors are trait methods without defaults, so a
//! source that forgets one does not compile.
//!
//! LIFECYCLE
//! =========
//! 1. `open` → `on_create`, resolve channel, spawn the forwarding task
//! 2. subscribe; no replay → `initial_data` delivered as an `INIT` action
//! 3. anything queued during catch-up is flushed, then `on_open` + OPEN
//! 4. live deliveries → ACTION / EVENT packets until `close`
//!
//! RESUME
//! ======
//! A delivery that cannot be queued because the session is detached stalls
//! the tracker: later deliveries are dropped and the last channel serial the
//! session accepted is kept. The next `synced` baseline on the session
//! re-subscribes with that serial, so the peer gets the missed actions from
//! the channel backlog, or a fresh `INIT` when the backlog no longer reaches.
//!
//! A catch-up failure is reported as an `error` event on the tracker and
//! closes it; the session is unaffected. Closing the session closes every
//! tracker bound to it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use packets::{CLOSE_SESSION_CLOSED, CLOSE_SYNC_FAILED, EVENT_ERROR, Packet};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::services::channel::{Channel, ChannelError, ChannelHub, Delivery, Subscribed, Subscriber, SubscriberId};
use crate::services::session::{ListenerId, Session};

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("initial data unavailable: {0}")]
    Snapshot(String),
    #[error("session {0} is closed")]
    SessionClosed(String),
}

/// The domain half of a tracker.
#[async_trait]
pub trait TrackerSource: Send + Sync + 'static {
    /// Runs once with the tracker's creation params, before the channel is resolved.
    fn on_create(&mut self, _params: &Value) {}

    /// The channel this tracker binds to.
    fn channel(&self, hub: &ChannelHub) -> Channel;

    /// Full snapshot for a subscriber that could not be served by replay.
    async fn initial_data(&self) -> Result<Value, TrackerError>;

    fn on_open(&self, _tracker: &Tracker) {}

    fn on_close(&self, _tracker: &Tracker) {}

    /// Whether this source records client timestamps, which is what makes
    /// [`Tracker::request_client_timestamp`] meaningful.
    fn records_client_timestamp(&self) -> bool {
        false
    }
}

struct TrackerState {
    /// `None` once closed.
    channel: Option<Channel>,
    subscriber: SubscriberId,
    task: Option<JoinHandle<()>>,
    listener: Option<ListenerId>,
    /// Serial of the last action the session accepted.
    delivered: Option<u64>,
    /// A delivery was dropped; waiting for the next baseline.
    stalled: bool,
    /// `on_open` ran.
    opened: bool,
    /// The peer was sent `TrackerOpen`.
    announced: bool,
}

struct TrackerInner {
    id: String,
    session: Session,
    source: Box<dyn TrackerSource>,
    state: Mutex<TrackerState>,
}

/// Handle to a live channel subscription owned by a session.
///
/// The forwarding task holds a handle of its own, so a tracker stays alive
/// until it is closed even when the caller drops every other handle.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

impl Tracker {
    /// Build a tracker and start its subscription.
    ///
    /// `since` is the channel serial the peer already has, if any.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::SessionClosed`] when `session` is already closed.
    pub fn open<S: TrackerSource>(
        id: impl Into<String>,
        session: &Session,
        hub: &ChannelHub,
        mut source: S,
        params: &Value,
        since: Option<u64>,
    ) -> Result<Self, TrackerError> {
        let id = id.into();
        if session.is_closed() {
            return Err(TrackerError::SessionClosed(session.id().to_owned()));
        }

        source.on_create(params);
        let channel = source.channel(hub);
        let (subscriber, rx) = Subscriber::new();

        let tracker = Self {
            inner: Arc::new(TrackerInner {
                id,
                session: session.clone(),
                source: Box::new(source),
                state: Mutex::new(TrackerState {
                    channel: Some(channel.clone()),
                    subscriber: subscriber.id(),
                    task: None,
                    listener: None,
                    delivered: None,
                    stalled: false,
                    opened: false,
                    announced: false,
                }),
            }),
        };

        let weak = Arc::downgrade(&tracker.inner);
        let listener = session.add_close_listener(move |_| {
            if let Some(inner) = weak.upgrade() {
                let tracker = Tracker { inner };
                tokio::spawn(async move {
                    tracker.close(CLOSE_SESSION_CLOSED, "session closed").await;
                });
            }
        });

        let baselines = session.baselines();
        let task = tokio::spawn(tracker.clone().run(channel, subscriber, rx, since, baselines));
        {
            let mut state = tracker.lock();
            if state.channel.is_some() {
                state.task = Some(task);
                state.listener = Some(listener);
            } else {
                task.abort();
                session.remove_close_listener(listener);
            }
        }

        debug!(tracker = %tracker.id(), session_id = %session.id(), "tracker: opened");
        Ok(tracker)
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lock().channel.is_some()
    }

    // -------------------------------------------------------------------------
    // forwarding task
    // -------------------------------------------------------------------------

    async fn run(
        self,
        channel: Channel,
        subscriber: Subscriber,
        mut rx: mpsc::UnboundedReceiver<Delivery>,
        since: Option<u64>,
        mut baselines: watch::Receiver<u64>,
    ) {
        if let Err(e) = self.catch_up(&channel, subscriber, &mut rx, since).await {
            self.fail(e).await;
            return;
        }

        loop {
            tokio::select! {
                delivery = rx.recv() => {
                    let Some(delivery) = delivery else { break };
                    if !self.is_open() {
                        break;
                    }
                    self.forward(delivery);
                }
                changed = baselines.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !self.lock().stalled {
                        continue;
                    }
                    if let Err(e) = self.resume(&channel, &mut rx).await {
                        self.fail(e).await;
                        return;
                    }
                }
            }
        }
    }

    async fn fail(&self, e: TrackerError) {
        let message = e.to_string();
        warn!(tracker = %self.id(), session_id = %self.session().id(), error = %message, "tracker: catch-up failed");
        self.emit(EVENT_ERROR, json!({ "message": message }));
        self.close(CLOSE_SYNC_FAILED, &message).await;
    }

    /// Swap in a fresh subscription starting after the last delivered serial.
    async fn resume(
        &self,
        channel: &Channel,
        rx: &mut mpsc::UnboundedReceiver<Delivery>,
    ) -> Result<(), TrackerError> {
        let (subscriber, fresh_rx) = Subscriber::new();
        let (previous, since) = {
            let mut state = self.lock();
            if state.channel.is_none() {
                return Ok(());
            }
            let previous = std::mem::replace(&mut state.subscriber, subscriber.id());
            state.stalled = false;
            (previous, state.delivered)
        };
        if let Err(e) = channel.unsubscribe(previous).await {
            warn!(tracker = %self.id(), error = %e, "tracker: unsubscribe failed");
        }
        *rx = fresh_rx;

        debug!(tracker = %self.id(), session_id = %self.session().id(), ?since, "tracker: resuming");
        self.catch_up(channel, subscriber, rx, since).await
    }

    async fn catch_up(
        &self,
        channel: &Channel,
        subscriber: Subscriber,
        rx: &mut mpsc::UnboundedReceiver<Delivery>,
        since: Option<u64>,
    ) -> Result<(), TrackerError> {
        let subscribed = channel.subscribe(subscriber, since).await?;
        if let Subscribed::Fresh { serial } = subscribed {
            let data = self.inner.source.initial_data().await?;
            self.forward(Delivery::Action {
                action: packets::init_tracker(data),
                serial,
            });
        }

        // Replayed actions and anything published during the snapshot.
        while let Ok(delivery) = rx.try_recv() {
            self.forward(delivery);
        }

        let (run_hook, announce) = {
            let mut state = self.lock();
            if state.channel.is_none() || state.stalled {
                (false, false)
            } else {
                let run_hook = !state.opened;
                state.opened = true;
                (run_hook, !state.announced)
            }
        };
        if run_hook {
            self.inner.source.on_open(self);
        }
        if announce {
            let sent = self.inner.session.send(Packet::TrackerOpen {
                tracker: self.inner.id.clone(),
            });
            self.lock().announced = sent;
        }
        Ok(())
    }

    fn forward(&self, delivery: Delivery) {
        let tracker = self.inner.id.clone();
        let (packet, serial) = match delivery {
            Delivery::Action { action, serial } => {
                let action = match action {
                    Value::Array(actions) => packets::batch_actions(actions),
                    other => other,
                };
                let packet = Packet::TrackerAction {
                    tracker,
                    action,
                    serial,
                };
                (packet, Some(serial))
            }
            Delivery::Event { event, data } => {
                let packet = Packet::TrackerEvent {
                    tracker,
                    event,
                    data,
                };
                (packet, None)
            }
        };

        let mut state = self.lock();
        if state.channel.is_none() || state.stalled {
            return;
        }
        if self.inner.session.send(packet) {
            if serial.is_some() {
                state.delivered = serial;
            }
        } else {
            debug!(tracker = %self.inner.id, "tracker: session detached, stalling");
            state.stalled = true;
        }
    }

    // -------------------------------------------------------------------------
    // public operations
    // -------------------------------------------------------------------------

    /// Close the tracker. Idempotent.
    pub async fn close(&self, code: u16, message: &str) {
        let (channel, subscriber, task, listener) = {
            let mut state = self.lock();
            let Some(channel) = state.channel.take() else {
                return;
            };
            (channel, state.subscriber, state.task.take(), state.listener.take())
        };

        self.inner.session.send(Packet::TrackerClose {
            tracker: self.inner.id.clone(),
            code,
            message: message.to_owned(),
        });
        self.inner.source.on_close(self);
        if let Some(listener) = listener {
            self.inner.session.remove_close_listener(listener);
        }
        if let Err(e) = channel.unsubscribe(subscriber).await {
            warn!(tracker = %self.id(), error = %e, "tracker: unsubscribe failed");
        }
        info!(tracker = %self.id(), session_id = %self.session().id(), code, "tracker: closed");

        // Last, since this may be the forwarding task itself.
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Send a tracker event to the peer while open.
    pub fn emit(&self, event: impl Into<String>, data: Value) -> bool {
        if !self.is_open() {
            return false;
        }
        self.inner.session.send(Packet::TrackerEvent {
            tracker: self.inner.id.clone(),
            event: event.into(),
            data,
        })
    }

    /// Publish an action on the bound channel while open.
    ///
    /// # Errors
    ///
    /// Returns the channel's publish error.
    pub async fn dispatch(&self, action: Value) -> Result<(), TrackerError> {
        let channel = self.lock().channel.clone();
        if let Some(channel) = channel {
            channel.publish(action).await?;
        }
        Ok(())
    }

    /// Send the server clock so the peer can measure round-trip latency.
    ///
    /// # Panics
    ///
    /// In debug builds, when the source does not record client timestamps.
    pub fn request_client_timestamp(&self) {
        debug_assert!(
            self.inner.source.records_client_timestamp(),
            "tracker {} requests client timestamps but its source does not record them",
            self.inner.id
        );
        if self.is_open() {
            self.inner.session.send(Packet::TrackerTimestamp {
                tracker: self.inner.id.clone(),
                server_time_ms: now_ms(),
            });
        }
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
#[path = "tracker_test.rs"]
mod tests;
