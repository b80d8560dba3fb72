//! Pagination driver
//!
//! Turns a fetched page into follow-up URLs according to the target's rule
//! and enqueues them one depth further. Cycles end themselves: a successor
//! that was already discovered is an `AlreadyExists` no-op in the store.

use crate::crawler::fetcher::Page;
use crate::store::{CrawlItem, EnqueueOutcome, JobStore, StoreError, StoreResult};
use crate::url::{extract_domain, DomainScope};
use scraper::{Html, Selector};
use url::Url;

/// How a target's next pages are found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationRule {
    /// No follow-ups; only start paths are crawled
    None,
    /// Follow the `href` of every element matching a CSS selector
    NextLink { selector: String },
    /// Substitute a page counter into `{page}`; start paths are page `start_page`
    UrlTemplate { template: String, start_page: u32 },
}

#[derive(Debug, Clone)]
pub struct PaginationDriver {
    rule: PaginationRule,
    max_pages: u32,
    scope: DomainScope,
}

impl PaginationDriver {
    pub fn new(rule: PaginationRule, max_pages: u32, scope: DomainScope) -> Self {
        Self {
            rule,
            max_pages,
            scope,
        }
    }

    /// Computes the follow-up URLs of `page`, which was fetched for `item`
    ///
    /// A start path is page one of its chain; nothing is produced once the
    /// chain would exceed `max_pages`.
    pub fn follow_ups(&self, item: &CrawlItem, page: &Page) -> Vec<String> {
        if item.depth.saturating_add(1) >= self.max_pages {
            tracing::debug!("Pagination limit reached at {}", item.url);
            return Vec::new();
        }

        let base = match Url::parse(&page.final_url).or_else(|_| Url::parse(&item.url)) {
            Ok(base) => base,
            Err(e) => {
                tracing::warn!("Cannot resolve follow-ups of {}: {}", item.url, e);
                return Vec::new();
            }
        };

        let candidates = match &self.rule {
            PaginationRule::None => Vec::new(),
            PaginationRule::NextLink { selector } => successor_links(&page.body, selector, &base),
            PaginationRule::UrlTemplate {
                template,
                start_page,
            } => {
                let next = start_page.saturating_add(item.depth).saturating_add(1);
                resolve_link(&template.replace("{page}", &next.to_string()), &base)
                    .into_iter()
                    .collect()
            }
        };

        let mut urls: Vec<String> = Vec::new();
        for url in candidates {
            let in_scope = Url::parse(&url)
                .ok()
                .and_then(|u| extract_domain(&u))
                .is_some_and(|domain| self.scope.allows(&domain));
            if !in_scope {
                tracing::debug!("Skipping out-of-scope follow-up {}", url);
            } else if !urls.contains(&url) {
                urls.push(url);
            }
        }
        urls
    }

    /// Enqueues the follow-ups of `page`; returns how many were new
    pub fn enqueue_follow_ups(
        &self,
        store: &dyn JobStore,
        item: &CrawlItem,
        page: &Page,
    ) -> StoreResult<usize> {
        let mut inserted = 0;
        for url in self.follow_ups(item, page) {
            match store.enqueue(&item.target_id, &url, item.depth + 1) {
                Ok(EnqueueOutcome::Inserted(_)) => inserted += 1,
                Ok(EnqueueOutcome::AlreadyExists) => {
                    tracing::trace!("Follow-up {} already known", url);
                }
                Err(StoreError::InvalidUrl { url, reason }) => {
                    tracing::debug!("Ignoring follow-up {}: {}", url, reason);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(inserted)
    }
}

/// Extracts `href`s of elements matching `selector`, resolved against `base`
fn successor_links(body: &str, selector: &str, base: &Url) -> Vec<String> {
    let selector = match Selector::parse(selector) {
        Ok(selector) => selector,
        Err(e) => {
            tracing::warn!("Invalid next-link selector {:?}: {:?}", selector, e);
            return Vec::new();
        }
    };

    let document = Html::parse_document(body);
    document
        .select(&selector)
        .filter_map(|element| element.value().attr("href"))
        .filter_map(|href| resolve_link(href, base))
        .collect()
}

/// Resolves an href to an absolute http(s) URL
///
/// Returns None for script, mail, phone and data links, fragment-only
/// anchors and anything that doesn't resolve to http(s).
fn resolve_link(href: &str, base: &Url) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let lowered = href.to_ascii_lowercase();
    if ["javascript:", "mailto:", "tel:", "data:"]
        .iter()
        .any(|scheme| lowered.starts_with(scheme))
    {
        return None;
    }

    let absolute = base.join(href).ok()?;
    matches!(absolute.scheme(), "http" | "https").then(|| absolute.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ItemStatus;
    use crate::store::SqliteJobStore;

    fn item(url: &str, depth: u32) -> CrawlItem {
        CrawlItem {
            id: 1,
            run_id: 1,
            target_id: "shop".into(),
            url: url.into(),
            domain: "a.test".into(),
            depth,
            status: ItemStatus::InFlight,
            attempt_count: 1,
            discovered_at: "2026-01-01T00:00:00+00:00".into(),
            last_attempt_at: None,
            last_error: None,
        }
    }

    fn next_link_driver(max_pages: u32) -> PaginationDriver {
        PaginationDriver::new(
            PaginationRule::NextLink {
                selector: "a.next".into(),
            },
            max_pages,
            DomainScope::new(["a.test"]),
        )
    }

    #[test]
    fn test_next_link_resolved_against_final_url() {
        let driver = next_link_driver(10);
        let mut page = Page::html(
            "https://a.test/list",
            r#"<a href="/other">x</a><a class="next" href="?page=2">Next</a>"#,
        );
        page.final_url = "https://a.test/catalog/list".into();

        let urls = driver.follow_ups(&item("https://a.test/list", 0), &page);
        assert_eq!(urls, vec!["https://a.test/catalog/list?page=2".to_string()]);
    }

    #[test]
    fn test_next_link_out_of_scope_and_junk_skipped() {
        let driver = next_link_driver(10);
        let page = Page::html(
            "https://a.test/list",
            r##"<a class="next" href="https://evil.test/p2">1</a>
               <a class="next" href="javascript:void(0)">2</a>
               <a class="next" href="#top">3</a>"##,
        );
        assert!(driver.follow_ups(&item("https://a.test/list", 0), &page).is_empty());
    }

    #[test]
    fn test_no_next_link_terminates() {
        let driver = next_link_driver(10);
        let page = Page::html("https://a.test/list?page=9", "<p>last page</p>");
        assert!(driver
            .follow_ups(&item("https://a.test/list?page=9", 8), &page)
            .is_empty());
    }

    #[test]
    fn test_url_template_counts_from_start_page() {
        let driver = PaginationDriver::new(
            PaginationRule::UrlTemplate {
                template: "/list?page={page}".into(),
                start_page: 1,
            },
            5,
            DomainScope::new(["a.test"]),
        );
        let page = Page::html("https://a.test/list", "");

        assert_eq!(
            driver.follow_ups(&item("https://a.test/list", 0), &page),
            vec!["https://a.test/list?page=2".to_string()]
        );
        assert_eq!(
            driver.follow_ups(&item("https://a.test/list?page=4", 3), &page),
            vec!["https://a.test/list?page=5".to_string()]
        );
        assert!(driver
            .follow_ups(&item("https://a.test/list?page=5", 4), &page)
            .is_empty());
    }

    #[test]
    fn test_none_rule_yields_nothing() {
        let driver = PaginationDriver::new(PaginationRule::None, 100, DomainScope::default());
        let page = Page::html("https://a.test/", r#"<a class="next" href="/2">n</a>"#);
        assert!(driver.follow_ups(&item("https://a.test/", 0), &page).is_empty());
    }

    #[test]
    fn test_self_referencing_next_link_is_deduplicated() {
        let store = SqliteJobStore::new_in_memory().unwrap();
        store.begin_run("shop", "h", false).unwrap();
        store.enqueue("shop", "https://a.test/list?page=3", 0).unwrap();
        let leased = store.lease_next("shop", None).unwrap().unwrap();

        let driver = next_link_driver(10);
        let page = Page::html(
            "https://a.test/list?page=3",
            r#"<a class="next" href="/list?page=3">Next</a>"#,
        );

        assert_eq!(driver.enqueue_follow_ups(&store, &leased, &page).unwrap(), 0);
        assert_eq!(store.snapshot_counts("shop").unwrap().total(), 1);
    }

    #[test]
    fn test_follow_ups_enqueued_one_level_deeper() {
        let store = SqliteJobStore::new_in_memory().unwrap();
        store.begin_run("shop", "h", false).unwrap();
        store.enqueue("shop", "https://a.test/list", 0).unwrap();
        let leased = store.lease_next("shop", None).unwrap().unwrap();

        let driver = next_link_driver(10);
        let page = Page::html(
            "https://a.test/list",
            r#"<a class="next" href="/list?page=2">Next</a>"#,
        );
        assert_eq!(driver.enqueue_follow_ups(&store, &leased, &page).unwrap(), 1);

        let next = store.lease_next("shop", None).unwrap().unwrap();
        assert_eq!(next.url, "https://a.test/list?page=2");
        assert_eq!(next.depth, 1);
    }
}
