//! Robots.txt fetching and per-origin caching
//!
//! Rules are fetched once per origin for the lifetime of a fetcher and
//! shared between its concurrent workers.

mod parser;

pub use parser::RobotsRules;

use dashmap::DashMap;
use reqwest::Client;
use std::sync::Arc;
use url::Url;

/// Fetches `robots.txt` for the origin of `url`
///
/// A missing file (4xx) allows everything. Server or network errors also
/// allow everything and are logged: an unreachable robots.txt must not
/// stall a crawl that the fetch itself will classify.
pub async fn fetch_robots(client: &Client, url: &Url) -> RobotsRules {
    let mut robots_url = url.clone();
    robots_url.set_path("/robots.txt");
    robots_url.set_query(None);
    robots_url.set_fragment(None);

    match client.get(robots_url.as_str()).send().await {
        Ok(response) if response.status().is_success() => match response.text().await {
            Ok(body) => RobotsRules::from_content(&body),
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", robots_url, e);
                RobotsRules::allow_all()
            }
        },
        Ok(response) => {
            tracing::debug!("{} returned {}", robots_url, response.status());
            RobotsRules::allow_all()
        }
        Err(e) => {
            tracing::warn!("Failed to fetch {}: {}", robots_url, e);
            RobotsRules::allow_all()
        }
    }
}

/// Origin-keyed robots.txt cache
#[derive(Debug, Default)]
pub struct RobotsCache {
    origins: DashMap<String, Arc<RobotsRules>>,
}

impl RobotsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the rules for `url`'s origin, fetching them on first use
    pub async fn rules_for(&self, client: &Client, url: &Url) -> Arc<RobotsRules> {
        let origin = url.origin().ascii_serialization();
        if let Some(rules) = self.origins.get(&origin) {
            return Arc::clone(&rules);
        }

        // concurrent first requests may both fetch; the last insert wins
        let rules = Arc::new(fetch_robots(client, url).await);
        self.origins.insert(origin, Arc::clone(&rules));
        rules
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}
