//! URL handling: dedup-key normalization, domain extraction and domain scoping

mod domain;
mod normalize;

pub use domain::{extract_domain, is_valid_pattern, matches_wildcard, require_domain, DomainScope};
pub use normalize::normalize_url;

use crate::UrlResult;

/// Normalizes `raw` and returns it together with its domain
pub fn normalize_with_domain(raw: &str) -> UrlResult<(::url::Url, String)> {
    let url = normalize_url(raw)?;
    let domain = require_domain(&url)?;
    Ok((url, domain))
}
