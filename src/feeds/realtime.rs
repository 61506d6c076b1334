//! Push-update channel.
//!
//! [`Realtime`] is an in-process hub: components open a [`Subscription`]
//! scoped to a table and an optional row filter, and receive every matching
//! change as a [`ChangeEvent`]. The websocket transport started by
//! [`spawn_transport`] joins one channel per open subscription and feeds
//! server frames into [`Realtime::publish`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;

const SUBSCRIBER_BUFFER: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "*")]
    All,
}

impl ChangeKind {
    fn accepts(&self, kind: ChangeKind) -> bool {
        *self == ChangeKind::All || *self == kind
    }
}

/// One row change as delivered by the push channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    /// The row after the change. Null for deletes.
    #[serde(rename = "record", default)]
    pub new: Value,
    /// The row before the change, sent for updates and deletes
    #[serde(rename = "old_record", default)]
    pub old: Value,
}

impl ChangeEvent {
    /// The row a filter is checked against: the old row for a delete,
    /// the new one otherwise.
    pub fn row(&self) -> &Value {
        match self.kind {
            ChangeKind::Delete => &self.old,
            _ => &self.new,
        }
    }
}

/// What to listen for.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSpec {
    pub topic: String,
    pub table: String,
    /// `column=eq.value`
    pub filter: Option<String>,
    pub event: ChangeKind,
}

impl SubscriptionSpec {
    pub fn new(topic: impl Into<String>, table: impl Into<String>, event: ChangeKind) -> Self {
        Self {
            topic: topic.into(),
            table: table.into(),
            filter: None,
            event,
        }
    }

    pub fn eq_filter(mut self, column: &str, value: &str) -> Self {
        self.filter = Some(format!("{}=eq.{}", column, value));
        self
    }

    fn matches(&self, topic: &str, change: &ChangeEvent) -> bool {
        self.topic == topic
            && self.table == change.table
            && self.event.accepts(change.kind)
            && self.filter.as_deref().map_or(true, |f| filter_matches(f, change.row()))
    }

    fn channel_topic(&self) -> String {
        format!("realtime:{}", self.topic)
    }
}

/// Only `column=eq.value` filters are understood; anything else passes.
fn filter_matches(filter: &str, record: &Value) -> bool {
    let Some((column, value)) = filter.split_once("=eq.") else {
        return true;
    };
    match record.get(column) {
        Some(Value::String(s)) => s == value,
        Some(Value::Null) | None => false,
        Some(other) => other.to_string() == value,
    }
}

enum Control {
    Join(SubscriptionSpec),
    Leave(String),
}

struct Entry {
    spec: SubscriptionSpec,
    tx: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
struct Hub {
    next_id: u64,
    entries: HashMap<u64, Entry>,
    transport: Option<mpsc::UnboundedSender<Control>>,
}

impl Hub {
    fn notify_transport(&mut self, control: Control) {
        if let Some(transport) = &self.transport {
            if transport.send(control).is_err() {
                self.transport = None;
            }
        }
    }
}

/// Shared handle to the subscription hub. Cheap to clone.
#[derive(Clone, Default)]
pub struct Realtime {
    hub: Arc<Mutex<Hub>>,
}

impl Realtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, spec: SubscriptionSpec) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut hub = lock(&self.hub);
        let id = hub.next_id;
        hub.next_id += 1;
        hub.notify_transport(Control::Join(spec.clone()));
        hub.entries.insert(id, Entry { spec, tx });
        tracing::debug!(id, "subscription opened");

        Subscription {
            guard: SubscriptionGuard {
                id,
                hub: Arc::downgrade(&self.hub),
            },
            rx,
        }
    }

    /// Deliver a change to every subscription on `topic` that matches it.
    /// Returns how many subscribers received it.
    pub fn publish(&self, topic: &str, change: ChangeEvent) -> usize {
        let hub = lock(&self.hub);
        let mut delivered = 0;
        for entry in hub.entries.values() {
            if !entry.spec.matches(topic, &change) {
                continue;
            }
            match entry.tx.try_send(change.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(topic, "dropping change: {}", e),
            }
        }
        delivered
    }

    #[cfg(test)]
    pub fn subscription_count(&self) -> usize {
        lock(&self.hub).entries.len()
    }

    fn unsubscribe(hub: &Mutex<Hub>, id: u64) {
        let mut hub = lock(hub);
        if let Some(entry) = hub.entries.remove(&id) {
            hub.notify_transport(Control::Leave(entry.spec.channel_topic()));
            tracing::debug!(id, "subscription closed");
        }
    }

    fn attach_transport(&self) -> (mpsc::UnboundedReceiver<Control>, Vec<SubscriptionSpec>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut hub = lock(&self.hub);
        hub.transport = Some(tx);
        let specs = hub.entries.values().map(|e| e.spec.clone()).collect();
        (rx, specs)
    }

    fn detach_transport(&self) {
        lock(&self.hub).transport = None;
    }
}

fn lock(hub: &Mutex<Hub>) -> std::sync::MutexGuard<'_, Hub> {
    // The hub holds no invariants a panicking holder could break halfway.
    hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An open subscription. Dropping it unsubscribes.
pub struct Subscription {
    guard: SubscriptionGuard,
    rx: mpsc::Receiver<ChangeEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Separate the lifetime of the subscription from its stream. Once the
    /// guard is dropped the receiver drains what was buffered and then ends.
    pub fn split(self) -> (SubscriptionGuard, mpsc::Receiver<ChangeEvent>) {
        (self.guard, self.rx)
    }
}

/// Keeps a subscription open; unsubscribes on drop.
pub struct SubscriptionGuard {
    id: u64,
    hub: Weak<Mutex<Hub>>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            Realtime::unsubscribe(&hub, self.id);
        }
    }
}

// =========================================================================
// WIRE FRAMES
// =========================================================================

#[derive(Serialize)]
struct OutgoingFrame<'a> {
    topic: &'a str,
    event: &'a str,
    payload: Value,
    #[serde(rename = "ref")]
    msg_ref: String,
}

#[derive(Deserialize, Debug)]
struct IncomingFrame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct ChangePayload {
    data: ChangeEvent,
}

fn join_frame(spec: &SubscriptionSpec, access_token: &str, msg_ref: u64) -> String {
    let mut change = json!({
        "event": spec.event,
        "schema": "public",
        "table": spec.table,
    });
    if let Some(filter) = &spec.filter {
        change["filter"] = json!(filter);
    }
    let frame = OutgoingFrame {
        topic: &spec.channel_topic(),
        event: "phx_join",
        payload: json!({
            "config": { "postgres_changes": [change] },
            "access_token": access_token,
        }),
        msg_ref: msg_ref.to_string(),
    };
    serde_json::to_string(&frame).unwrap_or_default()
}

fn simple_frame(topic: &str, event: &str, msg_ref: u64) -> String {
    let frame = OutgoingFrame {
        topic,
        event,
        payload: json!({}),
        msg_ref: msg_ref.to_string(),
    };
    serde_json::to_string(&frame).unwrap_or_default()
}

/// Decode a server frame into (hub topic, change). `None` for anything that
/// is not a row change (replies, presence, system messages) or is malformed.
fn decode_frame(text: String) -> Option<(String, ChangeEvent)> {
    let mut bytes = text.into_bytes();
    let frame: IncomingFrame = match simd_json::from_slice(&mut bytes) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!("unreadable frame: {}", e);
            return None;
        }
    };
    if frame.event != "postgres_changes" {
        return None;
    }
    let topic = frame.topic.strip_prefix("realtime:")?.to_string();
    match serde_json::from_value::<ChangePayload>(frame.payload) {
        Ok(payload) => Some((topic, payload.data)),
        Err(e) => {
            tracing::debug!(topic, "malformed change payload: {}", e);
            None
        }
    }
}

/// Connect to the push server and keep it connected.
///
/// On every (re)connect all open subscriptions are joined again; later
/// subscribes and unsubscribes are forwarded as join/leave frames.
pub fn spawn_transport(realtime: Realtime, url: String, access_token: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut msg_ref: u64 = 0;
        loop {
            tracing::info!("[realtime] Connecting...");

            match connect_async(url.as_str()).await {
                Ok((ws_stream, _)) => {
                    tracing::info!("[realtime] Connected");
                    let (mut write, mut read) = ws_stream.split();
                    let (mut control_rx, specs) = realtime.attach_transport();

                    let mut joined = true;
                    for spec in &specs {
                        msg_ref += 1;
                        let frame = join_frame(spec, &access_token, msg_ref);
                        if let Err(e) = write.send(tungstenite::Message::Text(frame)).await {
                            tracing::warn!("[realtime] Failed to join {}: {}", spec.topic, e);
                            joined = false;
                            break;
                        }
                    }

                    let mut keepalive = tokio::time::interval(KEEPALIVE_PERIOD);
                    keepalive.tick().await;

                    while joined {
                        tokio::select! {
                            msg = read.next() => match msg {
                                Some(Ok(tungstenite::Message::Text(text))) => {
                                    if let Some((topic, change)) = decode_frame(text) {
                                        realtime.publish(&topic, change);
                                    }
                                }
                                Some(Ok(tungstenite::Message::Close(_))) | None => {
                                    tracing::info!("[realtime] Server closed the connection");
                                    break;
                                }
                                Some(Err(e)) => {
                                    tracing::warn!("[realtime] Error: {}", e);
                                    break;
                                }
                                Some(Ok(_)) => {}
                            },
                            control = control_rx.recv() => {
                                let Some(control) = control else { break };
                                msg_ref += 1;
                                let frame = match control {
                                    Control::Join(spec) => join_frame(&spec, &access_token, msg_ref),
                                    Control::Leave(topic) => simple_frame(&topic, "phx_leave", msg_ref),
                                };
                                if let Err(e) = write.send(tungstenite::Message::Text(frame)).await {
                                    tracing::warn!("[realtime] Send failed: {}", e);
                                    break;
                                }
                            }
                            _ = keepalive.tick() => {
                                msg_ref += 1;
                                let frame = simple_frame("phoenix", "heartbeat", msg_ref);
                                if let Err(e) = write.send(tungstenite::Message::Text(frame)).await {
                                    tracing::warn!("[realtime] Keepalive failed: {}", e);
                                    break;
                                }
                            }
                        }
                    }

                    realtime.detach_transport();
                }
                Err(e) => {
                    tracing::warn!("[realtime] Failed to connect: {}", e);
                }
            }

            // Wait before reconnecting
            tracing::info!("[realtime] Reconnecting in {} seconds...", RECONNECT_DELAY.as_secs());
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    })
}
