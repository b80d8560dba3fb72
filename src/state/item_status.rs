/// Lifecycle status of a crawl item
///
/// Items move `pending → in_flight` on lease and leave `in_flight` through
/// `complete`. `done` and `dead` are terminal; `failed` is terminal for the
/// run but an operator may requeue it.
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemStatus {
    /// Waiting to be leased
    Pending,

    /// Leased by a worker; a fetch attempt is running
    InFlight,

    /// Fetched successfully
    Done,

    /// Permanent failure parked for operator review
    Failed,

    /// Dead-lettered: retries exhausted or permanently unfetchable
    Dead,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 5] = [
        Self::Pending,
        Self::InFlight,
        Self::Done,
        Self::Failed,
        Self::Dead,
    ];

    /// Returns true if the item needs no further scheduling in this run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Dead)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    /// Parses a status from its stored representation
    ///
    /// Returns None if the string doesn't match any known status.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_flight" => Some(Self::InFlight),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}
