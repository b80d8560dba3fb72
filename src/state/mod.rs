//! State types shared by the job store and the live trackers
//!
//! # Components
//!
//! - `ItemStatus`: lifecycle of a single crawl item
//! - `BreakerState`: circuit breaker position for a domain
//! - `DomainState`: persisted politeness and breaker record for a domain

mod domain_state;
mod item_status;

pub use domain_state::{instant_to_utc, utc_to_instant, BreakerState, DomainState};
pub use item_status::ItemStatus;
