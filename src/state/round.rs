use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Selectable round lengths, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundDuration {
    One,
    Three,
    Five,
}

impl RoundDuration {
    pub const ALL: [RoundDuration; 3] = [Self::One, Self::Three, Self::Five];

    pub fn minutes(&self) -> u32 {
        match self {
            Self::One => 1,
            Self::Three => 3,
            Self::Five => 5,
        }
    }

    pub fn from_minutes(minutes: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.minutes() == minutes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundPhase {
    Pending,
    Open,
    Closed,
}

/// One row of the `rounds` table, as the authority writes it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoundRecord {
    pub id: String,
    pub status: RoundPhase,
    /// Only meaningful while status is open
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub duration_minutes: u32,
    #[serde(default)]
    pub result: Option<String>,
}

impl RoundRecord {
    /// End time in unix milliseconds.
    pub fn end_time_ms(&self) -> Option<i64> {
        self.end_time.map(|t| t.timestamp_millis())
    }
}

/// What the client shows for the current round.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundView {
    /// No round yet: show the "waiting for next round" placeholder
    NoRound,
    OpenRound {
        round_id: String,
        end_time_ms: i64,
        duration: Option<RoundDuration>,
    },
    ClosedRound {
        round_id: String,
        result: Option<String>,
    },
}

impl RoundView {
    pub fn from_record(record: Option<&RoundRecord>) -> Self {
        let Some(record) = record else {
            return Self::NoRound;
        };
        match record.status {
            RoundPhase::Pending => Self::NoRound,
            RoundPhase::Open => match record.end_time_ms() {
                Some(end_time_ms) => Self::OpenRound {
                    round_id: record.id.clone(),
                    end_time_ms,
                    duration: RoundDuration::from_minutes(record.duration_minutes),
                },
                None => Self::NoRound,
            },
            RoundPhase::Closed => Self::ClosedRound {
                round_id: record.id.clone(),
                result: record.result.clone(),
            },
        }
    }

    /// End time to drive the countdown with. `None` outside an open round.
    pub fn end_time_ms(&self) -> Option<i64> {
        match self {
            Self::OpenRound { end_time_ms, .. } => Some(*end_time_ms),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::NoRound)
    }
}
