use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::events::Event;
use crate::state::RoundDuration;

/// Minimum spacing between two accepted selections.
pub const DEBOUNCE_INTERVAL: Duration = Duration::from_millis(300);

/// Rate limiter that collapses bursts from overlapping input channels
/// (press, release, synthetic click) into one logical action.
#[derive(Debug, Clone)]
pub struct Debounce {
    min_interval: Duration,
    last_accepted: Option<Instant>,
}

impl Debounce {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_accepted: None,
        }
    }

    /// Accept if at least `min_interval` passed since the last accepted call.
    pub fn try_accept(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_accepted {
            if now.saturating_duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.last_accepted = Some(now);
        true
    }
}

/// Stateless duration picker. The caller owns which duration is current;
/// the selector only turns raw input into debounced `DurationSelected` events.
pub struct DurationSelector {
    debounce: Debounce,
    disabled: bool,
    tx: mpsc::Sender<Event>,
}

impl DurationSelector {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self {
            debounce: Debounce::new(DEBOUNCE_INTERVAL),
            disabled: false,
            tx,
        }
    }

    pub fn options(&self) -> &'static [RoundDuration] {
        &RoundDuration::ALL
    }

    pub fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
    }

    /// Returns true if the selection was accepted and emitted. A selection
    /// that cannot be delivered does not consume the debounce window.
    pub fn select(&mut self, value: RoundDuration, now: Instant) -> bool {
        if self.disabled {
            return false;
        }
        let permit = match self.tx.try_reserve() {
            Ok(permit) => permit,
            Err(e) => {
                tracing::debug!("selection dropped: {}", e);
                return false;
            }
        };
        if !self.debounce.try_accept(now) {
            return false;
        }
        permit.send(Event::DurationSelected(value));
        true
    }
}

/// Parse a line of user input ("1", "3", "5") into a duration.
pub fn parse_choice(input: &str) -> Option<RoundDuration> {
    input
        .trim()
        .trim_end_matches('m')
        .parse::<u32>()
        .ok()
        .and_then(RoundDuration::from_minutes)
}
