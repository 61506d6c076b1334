use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::api::rest::{Backend, Filter};
use crate::error::SyncError;
use crate::events::Event;
use crate::feeds::realtime::{ChangeKind, Realtime, Subscription, SubscriptionSpec};
use crate::state::{RoundDuration, RoundRecord, RoundView};

pub const ROUNDS_TABLE: &str = "rounds";

/// Local expiry asks for this; it is never a phase change by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshRequest;

/// Commands from the event loop into the round driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundCommand {
    /// Countdown reached zero for this end time
    Expired { end_time_ms: i64 },
    SelectDuration(RoundDuration),
}

/// Current round projection. Only the authority may move a round to
/// closed; the watcher just mirrors whatever it last heard.
#[derive(Debug)]
pub struct RoundWatcher {
    view: RoundView,
    end_tx: watch::Sender<Option<i64>>,
}

impl RoundWatcher {
    pub fn new() -> (Self, watch::Receiver<Option<i64>>) {
        let (end_tx, end_rx) = watch::channel(None);
        (
            Self {
                view: RoundView::NoRound,
                end_tx,
            },
            end_rx,
        )
    }

    pub fn view(&self) -> &RoundView {
        &self.view
    }

    /// Replace the projection with `record` (no merging). Returns true if
    /// the visible state changed.
    pub fn apply(&mut self, record: Option<&RoundRecord>) -> bool {
        let view = RoundView::from_record(record);
        if view == self.view {
            return false;
        }
        let end_time = view.end_time_ms();
        self.view = view;
        self.end_tx.send_if_modified(|current| {
            if *current == end_time {
                return false;
            }
            *current = end_time;
            true
        });
        true
    }

    /// Countdown hit zero. Ask for a refetch if it was for the round we are
    /// showing; ignore stale expiries.
    pub fn on_expired(&self, end_time_ms: i64) -> Option<RefreshRequest> {
        (self.view.end_time_ms() == Some(end_time_ms)).then_some(RefreshRequest)
    }
}

fn subscribe_rounds(realtime: &Realtime, duration: RoundDuration) -> Subscription {
    let minutes = duration.minutes().to_string();
    realtime.subscribe(
        SubscriptionSpec::new(format!("rounds-{}", minutes), ROUNDS_TABLE, ChangeKind::All)
            .eq_filter("duration_minutes", &minutes),
    )
}

/// Fetch the newest round for `duration`. `Ok(None)` when there is none yet.
pub async fn fetch_latest<B: Backend>(
    backend: &B,
    duration: RoundDuration,
) -> Result<Option<RoundRecord>, SyncError> {
    let filter = Filter::new()
        .eq("duration_minutes", duration.minutes())
        .latest_by("created_at");
    match backend.query_single(ROUNDS_TABLE, &filter).await {
        Ok(row) => Ok(Some(serde_json::from_value(row)?)),
        Err(SyncError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

struct Fetched {
    duration: RoundDuration,
    result: Result<Option<RoundRecord>, SyncError>,
}

fn spawn_fetch<B: Backend>(backend: &Arc<B>, duration: RoundDuration, done: &mpsc::Sender<Fetched>) {
    let backend = backend.clone();
    let done = done.clone();
    tokio::spawn(async move {
        let result = fetch_latest(backend.as_ref(), duration).await;
        let _ = done.send(Fetched { duration, result }).await;
    });
}

/// Run the round watcher for the selected duration.
///
/// Returns the end-time watch for the countdown and a command sender for
/// expiries and duration switches. Every visible change is reported as
/// `Event::RoundChanged`.
pub fn spawn<B: Backend>(
    backend: Arc<B>,
    realtime: Realtime,
    initial: RoundDuration,
    events: mpsc::Sender<Event>,
) -> (watch::Receiver<Option<i64>>, mpsc::Sender<RoundCommand>, JoinHandle<()>) {
    let (mut watcher, end_rx) = RoundWatcher::new();
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<RoundCommand>(16);
    let (done_tx, mut done_rx) = mpsc::channel::<Fetched>(16);

    let task = tokio::spawn(async move {
        let mut duration = initial;
        let mut sub = subscribe_rounds(&realtime, duration);
        spawn_fetch(&backend, duration, &done_tx);

        loop {
            let record = tokio::select! {
                change = sub.recv() => {
                    let Some(change) = change else {
                        tracing::warn!("round subscription closed");
                        return;
                    };
                    if change.kind == ChangeKind::Delete {
                        None
                    } else {
                        match serde_json::from_value::<RoundRecord>(change.new) {
                            Ok(record) => Some(record),
                            Err(e) => {
                                tracing::debug!("unusable round push: {}", e);
                                continue;
                            }
                        }
                    }
                }
                fetched = done_rx.recv() => {
                    let Some(fetched) = fetched else { return };
                    if fetched.duration != duration {
                        continue;
                    }
                    match fetched.result {
                        Ok(record) => record,
                        Err(e) => {
                            tracing::warn!("round fetch failed, keeping current view: {}", e);
                            continue;
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None => return,
                        Some(RoundCommand::Expired { end_time_ms }) => {
                            if watcher.on_expired(end_time_ms).is_some() {
                                tracing::debug!(end_time_ms, "countdown expired, refreshing round");
                                spawn_fetch(&backend, duration, &done_tx);
                            }
                        }
                        Some(RoundCommand::SelectDuration(next)) if next != duration => {
                            tracing::info!(minutes = next.minutes(), "switching round duration");
                            duration = next;
                            // Close the old channel before opening the new one
                            drop(sub);
                            sub = subscribe_rounds(&realtime, duration);
                            if watcher.apply(None) {
                                let _ = events.send(Event::RoundChanged(watcher.view().clone())).await;
                            }
                            spawn_fetch(&backend, duration, &done_tx);
                        }
                        Some(RoundCommand::SelectDuration(_)) => {}
                    }
                    continue;
                }
            };

            if watcher.apply(record.as_ref()) {
                tracing::info!(view = ?watcher.view(), "round changed");
                if events.send(Event::RoundChanged(watcher.view().clone())).await.is_err() {
                    return;
                }
            }
        }
    });

    (end_rx, cmd_tx, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::countdown;
    use crate::feeds::realtime::ChangeEvent;
    use crate::test_helpers::{settle, MockBackend, Reply};
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::time;

    fn open_record(id: &str, end_ms: i64, minutes: u32) -> RoundRecord {
        RoundRecord {
            id: id.to_string(),
            status: crate::state::RoundPhase::Open,
            end_time: Utc.timestamp_millis_opt(end_ms).single(),
            duration_minutes: minutes,
            result: None,
        }
    }

    fn row(id: &str, status: &str, end_ms: Option<i64>, minutes: u32) -> Value {
        let end_time = end_ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single()).map(|t| t.to_rfc3339());
        json!({
            "id": id,
            "status": status,
            "end_time": end_time,
            "duration_minutes": minutes,
        })
    }

    fn push(rt: &Realtime, minutes: u32, kind: ChangeKind, record: Value) -> usize {
        // Deletes carry the row only as the old record
        let (new, old) = match kind {
            ChangeKind::Delete => (Value::Null, record),
            _ => (record, Value::Null),
        };
        rt.publish(
            &format!("rounds-{}", minutes),
            ChangeEvent {
                table: ROUNDS_TABLE.to_string(),
                kind,
                new,
                old,
            },
        )
    }

    fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[test]
    fn test_apply_replaces_projection() {
        let (mut watcher, end_rx) = RoundWatcher::new();
        assert!(watcher.view().is_waiting());

        assert!(watcher.apply(Some(&open_record("r1", 60_000, 1))));
        assert_eq!(*end_rx.borrow(), Some(60_000));

        // Same payload again is not a change
        assert!(!watcher.apply(Some(&open_record("r1", 60_000, 1))));

        let mut closed = open_record("r1", 60_000, 1);
        closed.status = crate::state::RoundPhase::Closed;
        assert!(watcher.apply(Some(&closed)));
        assert!(matches!(watcher.view(), RoundView::ClosedRound { .. }));
        // Countdown is discarded, not frozen
        assert_eq!(*end_rx.borrow(), None);

        assert!(watcher.apply(None));
        assert!(watcher.view().is_waiting());
    }

    #[test]
    fn test_expiry_requests_refresh_without_closing() {
        let (mut watcher, _end_rx) = RoundWatcher::new();
        watcher.apply(Some(&open_record("r1", 60_000, 1)));

        assert_eq!(watcher.on_expired(60_000), Some(RefreshRequest));
        assert!(matches!(watcher.view(), RoundView::OpenRound { .. }));

        // Stale expiry for an older end time
        assert_eq!(watcher.on_expired(1_000), None);
    }

    #[tokio::test]
    async fn test_fetch_latest_maps_not_found() {
        let backend = MockBackend::new();
        assert_eq!(fetch_latest(&backend, RoundDuration::One).await.unwrap(), None);

        backend.push_reply(ROUNDS_TABLE, Reply::Row(row("r9", "pending", None, 1)));
        let rec = fetch_latest(&backend, RoundDuration::One).await.unwrap().unwrap();
        assert_eq!(rec.id, "r9");

        backend.push_reply(ROUNDS_TABLE, Reply::Fail);
        assert!(fetch_latest(&backend, RoundDuration::One).await.is_err());
    }

    #[tokio::test]
    async fn test_open_round_expires_into_refresh_only() {
        time::pause();
        let now_ms = 1_767_225_600_000_i64;
        let end_ms = now_ms + 5 * 60_000;

        let rt = Realtime::new();
        let backend = Arc::new(MockBackend::new());
        let (events_tx, mut events_rx) = mpsc::channel(512);
        let (end_rx, cmd_tx, _round) = spawn(backend.clone(), rt.clone(), RoundDuration::Five, events_tx.clone());
        settle().await;
        // Nothing there yet: waiting placeholder, no event
        assert!(drain(&mut events_rx).is_empty());
        assert_eq!(backend.query_count(), 1);

        let start = time::Instant::now();
        let _countdown = countdown::spawn(end_rx, events_tx, move || now_ms + start.elapsed().as_millis() as i64);

        push(&rt, 5, ChangeKind::Insert, row("r1", "open", Some(end_ms), 5));
        settle().await;
        let events = drain(&mut events_rx);
        assert_eq!(
            events[0],
            Event::RoundChanged(RoundView::OpenRound {
                round_id: "r1".to_string(),
                end_time_ms: end_ms,
                duration: Some(RoundDuration::Five),
            })
        );
        assert_eq!(events[1], Event::Countdown { remaining: 300, urgency: None });

        // Authority has not closed it yet; the refetch still says open
        backend.push_reply(ROUNDS_TABLE, Reply::Row(row("r1", "open", Some(end_ms), 5)));

        let mut expiries = 0;
        for _ in 0..301 {
            time::advance(Duration::from_secs(1)).await;
            settle().await;
            for event in drain(&mut events_rx) {
                match event {
                    Event::RoundExpired { end_time_ms } => {
                        expiries += 1;
                        cmd_tx.send(RoundCommand::Expired { end_time_ms }).await.unwrap();
                    }
                    Event::RoundChanged(view) => panic!("unexpected round change: {:?}", view),
                    _ => {}
                }
            }
        }
        settle().await;
        assert_eq!(expiries, 1);
        assert_eq!(backend.query_count(), 2);
        assert!(drain(&mut events_rx).is_empty());

        // Only the authority closes the round
        push(&rt, 5, ChangeKind::Update, row("r1", "closed", Some(end_ms), 5));
        settle().await;
        assert!(matches!(
            drain(&mut events_rx).as_slice(),
            [Event::RoundChanged(RoundView::ClosedRound { .. })]
        ));
    }

    #[tokio::test]
    async fn test_fetch_error_keeps_view() {
        let rt = Realtime::new();
        let backend = Arc::new(MockBackend::new());
        backend.push_reply(ROUNDS_TABLE, Reply::Row(row("r1", "open", Some(9_000_000), 1)));
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (_end_rx, cmd_tx, _task) = spawn(backend.clone(), rt, RoundDuration::One, events_tx);
        settle().await;
        assert_eq!(drain(&mut events_rx).len(), 1);

        backend.push_reply(ROUNDS_TABLE, Reply::Fail);
        cmd_tx.send(RoundCommand::Expired { end_time_ms: 9_000_000 }).await.unwrap();
        settle().await;
        assert_eq!(backend.query_count(), 2);
        assert!(drain(&mut events_rx).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_push_ignored_and_delete_clears() {
        let rt = Realtime::new();
        let backend = Arc::new(MockBackend::new());
        backend.push_reply(ROUNDS_TABLE, Reply::Row(row("r1", "open", Some(9_000_000), 1)));
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (end_rx, _cmd_tx, _task) = spawn(backend, rt.clone(), RoundDuration::One, events_tx);
        settle().await;
        drain(&mut events_rx);

        push(&rt, 1, ChangeKind::Update, json!({"id": "r1", "duration_minutes": 1}));
        settle().await;
        assert!(drain(&mut events_rx).is_empty());
        assert_eq!(*end_rx.borrow(), Some(9_000_000));

        assert_eq!(push(&rt, 1, ChangeKind::Delete, json!({"id": "r1", "duration_minutes": 1})), 1);
        settle().await;
        assert_eq!(drain(&mut events_rx), vec![Event::RoundChanged(RoundView::NoRound)]);
        assert_eq!(*end_rx.borrow(), None);
    }

    #[tokio::test]
    async fn test_switching_duration_resubscribes() {
        let rt = Realtime::new();
        let backend = Arc::new(MockBackend::new());
        backend.push_reply(ROUNDS_TABLE, Reply::Row(row("r1", "open", Some(9_000_000), 1)));
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (_end_rx, cmd_tx, _task) = spawn(backend.clone(), rt.clone(), RoundDuration::One, events_tx);
        settle().await;
        drain(&mut events_rx);

        backend.push_reply(ROUNDS_TABLE, Reply::Row(row("r3", "open", Some(9_500_000), 3)));
        cmd_tx.send(RoundCommand::SelectDuration(RoundDuration::Three)).await.unwrap();
        settle().await;

        assert_eq!(rt.subscription_count(), 1);
        assert_eq!(push(&rt, 1, ChangeKind::Update, row("r1", "closed", None, 1)), 0);
        assert_eq!(
            drain(&mut events_rx),
            vec![
                Event::RoundChanged(RoundView::NoRound),
                Event::RoundChanged(RoundView::OpenRound {
                    round_id: "r3".to_string(),
                    end_time_ms: 9_500_000,
                    duration: Some(RoundDuration::Three),
                }),
            ]
        );

        // Same duration again is a no-op
        cmd_tx.send(RoundCommand::SelectDuration(RoundDuration::Three)).await.unwrap();
        settle().await;
        assert_eq!(backend.query_count(), 2);
    }
}
