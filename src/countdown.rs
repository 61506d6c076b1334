use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::events::Event;

/// Below this many seconds the display gets an urgency signal.
pub const URGENCY_THRESHOLD_SECS: u64 = 10;

const TICK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownPhase {
    Idle,
    Running,
    Expired,
}

/// Result of one recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub remaining: u64,
    /// True only on the tick that first reached zero for this end time
    pub expired: bool,
}

/// Seconds-remaining state machine over an authoritative end timestamp.
///
/// Knows nothing about where the end time came from or how often it is
/// ticked; the driver in [`spawn`] owns the schedule.
#[derive(Debug, Default)]
pub struct Countdown {
    end_time_ms: Option<i64>,
    remaining: u64,
    expiry_fired: bool,
}

impl Countdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap the end time. Returns false if it is unchanged, in which case
    /// the expiry latch is kept.
    pub fn set_end_time(&mut self, end_time_ms: Option<i64>) -> bool {
        if self.end_time_ms == end_time_ms {
            return false;
        }
        self.end_time_ms = end_time_ms;
        self.remaining = 0;
        self.expiry_fired = false;
        true
    }

    pub fn end_time_ms(&self) -> Option<i64> {
        self.end_time_ms
    }

    /// Recompute against `now_ms`. `None` while idle.
    pub fn tick(&mut self, now_ms: i64) -> Option<Tick> {
        let end = self.end_time_ms?;
        self.remaining = ((end - now_ms).max(0) / 1000) as u64;

        let expired = self.remaining == 0 && !self.expiry_fired;
        if expired {
            self.expiry_fired = true;
        }
        Some(Tick {
            remaining: self.remaining,
            expired,
        })
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn phase(&self) -> CountdownPhase {
        match self.end_time_ms {
            None => CountdownPhase::Idle,
            Some(_) if self.expiry_fired => CountdownPhase::Expired,
            Some(_) => CountdownPhase::Running,
        }
    }

    pub fn urgency(&self) -> Option<f64> {
        match self.phase() {
            CountdownPhase::Idle => None,
            _ => urgency(self.remaining),
        }
    }
}

/// `m:ss`, seconds zero-padded.
pub fn format_mmss(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// Presentation-only urgency in [0, 1]; `None` above the threshold.
pub fn urgency(remaining: u64) -> Option<f64> {
    if remaining > URGENCY_THRESHOLD_SECS {
        return None;
    }
    Some((remaining as f64 / URGENCY_THRESHOLD_SECS as f64).clamp(0.0, 1.0))
}

/// Drive a [`Countdown`] from an end-time watch.
///
/// Every change of the end time cancels the running schedule, recomputes
/// immediately and starts a fresh one-second schedule. Emits `Countdown`
/// whenever the whole-second value changes and `RoundExpired` once per end time.
pub fn spawn<C>(mut end_rx: watch::Receiver<Option<i64>>, tx: mpsc::Sender<Event>, now_ms: C) -> JoinHandle<()>
where
    C: Fn() -> i64 + Send + 'static,
{
    tokio::spawn(async move {
        let mut countdown = Countdown::new();

        loop {
            countdown.set_end_time(*end_rx.borrow_and_update());

            if countdown.end_time_ms().is_none() {
                if end_rx.changed().await.is_err() {
                    return;
                }
                continue;
            }

            // First tick completes immediately
            let mut interval = time::interval(TICK_PERIOD);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_sent: Option<u64> = None;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(tick) = countdown.tick(now_ms()) else {
                            break;
                        };
                        if last_sent != Some(tick.remaining) {
                            last_sent = Some(tick.remaining);
                            let event = Event::Countdown {
                                remaining: countdown.remaining(),
                                urgency: countdown.urgency(),
                            };
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        if tick.expired {
                            if let Some(end_time_ms) = countdown.end_time_ms() {
                                if tx.send(Event::RoundExpired { end_time_ms }).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    changed = end_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        // Re-arm with the new end time
                        break;
                    }
                }
            }
        }
    })
}
