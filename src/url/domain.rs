use crate::UrlError;
use url::Url;

/// Extracts the lowercase host of a URL, or `None` for host-less URLs
///
/// # Examples
///
/// ```
/// use url::Url;
/// use hexcrawl::url::extract_domain;
///
/// let url = Url::parse("https://Docs.Example.com:8443/a").unwrap();
/// assert_eq!(extract_domain(&url), Some("docs.example.com".to_string()));
/// ```
pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_lowercase())
}

/// Same as [`extract_domain`] but treats a missing host as an error
pub fn require_domain(url: &Url) -> Result<String, UrlError> {
    extract_domain(url).ok_or(UrlError::MissingDomain)
}

/// Checks a lowercase domain against a pattern
///
/// `example.com` matches only itself; `*.example.com` matches the bare
/// domain and any subdomain at any depth.
pub fn matches_wildcard(pattern: &str, candidate: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(base) => {
            candidate == base
                || candidate
                    .strip_suffix(base)
                    .is_some_and(|head| head.ends_with('.'))
        }
        None => candidate == pattern,
    }
}

/// The set of domains a target is allowed to enqueue follow-up URLs for
#[derive(Debug, Clone, Default)]
pub struct DomainScope {
    patterns: Vec<String>,
}

impl DomainScope {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// An empty scope admits every domain
    pub fn allows(&self, domain: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| matches_wildcard(p, domain))
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// Returns true when `pattern` is a usable domain pattern
pub fn is_valid_pattern(pattern: &str) -> bool {
    let base = pattern.strip_prefix("*.").unwrap_or(pattern);
    !base.is_empty()
        && !base.contains('*')
        && !base.starts_with('.')
        && !base.ends_with('.')
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_with_port() {
        let url = Url::parse("https://example.com:8080/").unwrap();
        assert_eq!(extract_domain(&url), Some("example.com".to_string()));
    }

    #[test]
    fn test_extract_ip_host() {
        let url = Url::parse("http://127.0.0.1:9000/x").unwrap();
        assert_eq!(extract_domain(&url), Some("127.0.0.1".to_string()));
    }

    #[test]
    fn test_require_domain_rejects_hostless() {
        let url = Url::parse("data:text/plain,hello").unwrap();
        assert!(matches!(require_domain(&url), Err(UrlError::MissingDomain)));
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(matches_wildcard("example.com", "example.com"));
        assert!(!matches_wildcard("example.com", "blog.example.com"));
        assert!(matches_wildcard("*.example.com", "example.com"));
        assert!(matches_wildcard("*.example.com", "api.v2.example.com"));
        assert!(!matches_wildcard("*.example.com", "myexample.com"));
        assert!(!matches_wildcard("*.example.com", "example.com.org"));
    }

    #[test]
    fn test_scope_allows() {
        let scope = DomainScope::new(["shop.example.com", "*.cdn.example.net"]);
        assert!(scope.allows("shop.example.com"));
        assert!(scope.allows("img.cdn.example.net"));
        assert!(!scope.allows("example.com"));
    }

    #[test]
    fn test_empty_scope_allows_everything() {
        let scope = DomainScope::default();
        assert!(scope.allows("anything.org"));
    }

    #[test]
    fn test_pattern_validation() {
        assert!(is_valid_pattern("example.com"));
        assert!(is_valid_pattern("*.example.com"));
        assert!(!is_valid_pattern("*."));
        assert!(!is_valid_pattern("ex*ample.com"));
        assert!(!is_valid_pattern("example.com."));
        assert!(!is_valid_pattern("exa mple.com"));
    }
}
