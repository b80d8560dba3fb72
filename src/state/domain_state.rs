use chrono::{DateTime, Utc};
use std::fmt;
use std::time::{Duration, Instant};

/// Circuit breaker position for one domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BreakerState {
    /// Normal operation
    #[default]
    Closed,

    /// Fetches are rejected until the cooldown elapses
    Open,

    /// One probe fetch may test whether the domain recovered
    HalfOpen,
}

impl BreakerState {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(Self::Closed),
            "open" => Some(Self::Open),
            "half_open" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// Durable per-(target, domain) record
///
/// This is the persisted view of the politeness tracker and the circuit
/// breaker for one domain. The live trackers keep `Instant`s; this record
/// carries wall-clock timestamps so it survives a restart.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainState {
    pub domain: String,

    /// Last time a fetch to this domain started or finished
    pub last_fetch_at: Option<DateTime<Utc>>,

    /// In-flight fetches when the record was written
    pub in_flight: u32,

    pub breaker: BreakerState,

    /// When the breaker last opened
    pub opened_at: Option<DateTime<Utc>>,

    pub consecutive_failures: u32,
}

impl DomainState {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            last_fetch_at: None,
            in_flight: 0,
            breaker: BreakerState::Closed,
            opened_at: None,
            consecutive_failures: 0,
        }
    }
}

/// Maps an `Instant` observed at `now_instant` onto the wall clock
pub fn instant_to_utc(at: Instant, now_instant: Instant, now_utc: DateTime<Utc>) -> DateTime<Utc> {
    let age = now_instant.saturating_duration_since(at);
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now_utc.checked_sub_signed(age))
        .unwrap_or(now_utc)
}

/// Maps a stored wall-clock timestamp back onto the monotonic clock
///
/// Timestamps in the future are clamped to `now_instant`; timestamps older
/// than the process can represent are clamped to the oldest representable
/// instant.
pub fn utc_to_instant(at: DateTime<Utc>, now_instant: Instant, now_utc: DateTime<Utc>) -> Instant {
    let age = (now_utc - at).to_std().unwrap_or(Duration::ZERO);
    now_instant.checked_sub(age).unwrap_or(now_instant)
}
