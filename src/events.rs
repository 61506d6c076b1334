use crate::state::{RoundDuration, RoundView, WalletSnapshot};

// Everything the presentation loop reacts to. Components never touch each
// other's state; they only push one of these into the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // Round projection replaced by a push or a refetch
    RoundChanged(RoundView),

    // Countdown recomputed (whole seconds left, never negative)
    Countdown {
        remaining: u64,
        urgency: Option<f64>,
    },

    // Local timer hit zero for this end time. A refresh trigger only,
    // never a statement that the round is closed.
    RoundExpired { end_time_ms: i64 },

    // Cached wallet changed
    BalanceChanged(WalletSnapshot),

    // Auto-controller flag changed remotely
    ControllerToggled { enabled: bool },

    // User picked a round length (already debounced)
    DurationSelected(RoundDuration),

    // Ctrl+C or kill signal
    Shutdown,
}
