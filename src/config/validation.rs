use crate::config::types::{
    Config, MetricsConfig, NotifyConfig, OutputKind, ScheduleConfig, TargetConfig,
};
use crate::url::is_valid_pattern;
use crate::ConfigError;
use std::collections::HashSet;
use std::net::SocketAddr;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.store.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    validate_notify_config(&config.notify)?;
    validate_metrics_config(&config.metrics)?;
    validate_schedule_config(&config.schedule)?;

    if config.targets.is_empty() {
        return Err(ConfigError::Validation(
            "At least one [[target]] must be configured".to_string(),
        ));
    }

    let mut names = HashSet::new();
    for target in &config.targets {
        if !names.insert(target.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Duplicate target name '{}'",
                target.name
            )));
        }
        validate_target(target)?;
    }

    Ok(())
}

fn validate_notify_config(config: &NotifyConfig) -> Result<(), ConfigError> {
    if let Some(webhook) = &config.webhook_url {
        let url = Url::parse(webhook)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid webhook-url: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(format!(
                "webhook-url must use http or https, got '{}'",
                webhook
            )));
        }
    }
    Ok(())
}

fn validate_metrics_config(config: &MetricsConfig) -> Result<(), ConfigError> {
    if let Some(bind) = &config.bind {
        bind.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Validation(format!("Invalid metrics bind address '{}': {}", bind, e))
        })?;
    }
    Ok(())
}

fn validate_schedule_config(config: &ScheduleConfig) -> Result<(), ConfigError> {
    // one week
    if config.interval_minutes == 0 || config.interval_minutes > 10_080 {
        return Err(ConfigError::Validation(format!(
            "interval-minutes must be between 1 and 10080, got {}",
            config.interval_minutes
        )));
    }
    Ok(())
}

/// Validates one target definition
fn validate_target(target: &TargetConfig) -> Result<(), ConfigError> {
    let name = &target.name;
    if name.trim().is_empty() {
        return Err(ConfigError::Validation(
            "Target name cannot be empty".to_string(),
        ));
    }

    let base = Url::parse(&target.base_url).map_err(|e| {
        ConfigError::InvalidUrl(format!("Target '{}' base-url '{}': {}", name, target.base_url, e))
    })?;
    if !matches!(base.scheme(), "http" | "https") || base.host_str().is_none() {
        return Err(ConfigError::InvalidUrl(format!(
            "Target '{}' base-url must be an http(s) URL with a host, got '{}'",
            name, target.base_url
        )));
    }

    if target.start_paths.is_empty() {
        return Err(ConfigError::Validation(format!(
            "Target '{}' must have at least one start path",
            name
        )));
    }
    target.start_urls().map_err(|e| {
        ConfigError::InvalidUrl(format!("Target '{}' has an invalid start path: {}", name, e))
    })?;

    for pattern in &target.allowed_domains {
        if !is_valid_pattern(pattern) {
            return Err(ConfigError::InvalidPattern(format!(
                "Target '{}' allowed domain '{}'",
                name, pattern
            )));
        }
    }

    let concurrency = &target.concurrency;
    for (label, value) in [
        ("global", concurrency.global),
        ("per-domain", concurrency.per_domain),
    ] {
        if !(1..=100).contains(&value) {
            return Err(ConfigError::Validation(format!(
                "Target '{}' {} concurrency must be between 1 and 100, got {}",
                name, label, value
            )));
        }
    }
    if concurrency.per_domain > concurrency.global {
        return Err(ConfigError::Validation(format!(
            "Target '{}' per-domain concurrency ({}) exceeds global ({})",
            name, concurrency.per_domain, concurrency.global
        )));
    }

    let jitter = target.rate_limit.jitter_fraction;
    if !(0.0..=1.0).contains(&jitter) {
        return Err(ConfigError::Validation(format!(
            "Target '{}' jitter-fraction must be between 0 and 1, got {}",
            name, jitter
        )));
    }

    if target.breaker.failure_threshold < 1 {
        return Err(ConfigError::Validation(format!(
            "Target '{}' failure-threshold must be >= 1",
            name
        )));
    }

    if target.fetch.timeout_ms < 1 {
        return Err(ConfigError::Validation(format!(
            "Target '{}' timeout-ms must be >= 1",
            name
        )));
    }

    let pagination = &target.pagination;
    if pagination.next_selector.is_some() && pagination.url_template.is_some() {
        return Err(ConfigError::Validation(format!(
            "Target '{}' pagination sets both next-selector and url-template",
            name
        )));
    }
    if let Some(selector) = &pagination.next_selector {
        scraper::Selector::parse(selector).map_err(|e| {
            ConfigError::Validation(format!(
                "Target '{}' next-selector {:?} is not valid CSS: {:?}",
                name, selector, e
            ))
        })?;
    }
    if let Some(template) = &pagination.url_template {
        if !template.contains("{page}") {
            return Err(ConfigError::Validation(format!(
                "Target '{}' url-template must contain {{page}}",
                name
            )));
        }
    }
    if pagination.max_pages < 1 {
        return Err(ConfigError::Validation(format!(
            "Target '{}' max-pages must be >= 1",
            name
        )));
    }

    if target.output.kind != OutputKind::None
        && target.output.path.as_deref().map_or(true, str::is_empty)
    {
        return Err(ConfigError::Validation(format!(
            "Target '{}' output kind {:?} needs a path",
            name, target.output.kind
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_target(extra: &str) -> Config {
        let src = format!(
            r#"
[store]
database-path = "./crawl.db"

[[target]]
name = "shop"
base-url = "https://shop.test"
start-paths = ["/"]
{}
"#,
            extra
        );
        toml::from_str(&src).unwrap()
    }

    #[test]
    fn test_minimal_config_is_valid() {
        assert!(validate(&config_with_target("")).is_ok());
    }

    #[test]
    fn test_duplicate_target_names() {
        let mut config = config_with_target("");
        config.targets.push(config.targets[0].clone());
        assert!(matches!(validate(&config), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_no_targets() {
        let mut config = config_with_target("");
        config.targets.clear();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_bad_base_url() {
        let mut config = config_with_target("");
        config.targets[0].base_url = "ftp://shop.test".into();
        assert!(matches!(validate(&config), Err(ConfigError::InvalidUrl(_))));
    }

    #[test]
    fn test_per_domain_above_global() {
        let config = config_with_target("[target.concurrency]\nglobal = 2\nper-domain = 3\n");
        assert!(matches!(validate(&config), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_concurrency_out_of_range() {
        let config = config_with_target("[target.concurrency]\nglobal = 0\nper-domain = 0\n");
        assert!(validate(&config).is_err());
        let config = config_with_target("[target.concurrency]\nglobal = 101\n");
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_jitter_range() {
        let config = config_with_target("[target.rate-limit]\njitter-fraction = 1.5\n");
        assert!(validate(&config).is_err());
        let config = config_with_target("[target.rate-limit]\njitter-fraction = 0.0\n");
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_threshold_and_timeout() {
        let config = config_with_target("[target.breaker]\nfailure-threshold = 0\n");
        assert!(validate(&config).is_err());
        let config = config_with_target("[target.fetch]\ntimeout-ms = 0\n");
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_pagination_rules() {
        let both = config_with_target(
            "[target.pagination]\nnext-selector = \"a.next\"\nurl-template = \"/p/{page}\"\n",
        );
        assert!(validate(&both).is_err());

        let no_placeholder = config_with_target("[target.pagination]\nurl-template = \"/p/2\"\n");
        assert!(validate(&no_placeholder).is_err());

        let bad_css = config_with_target("[target.pagination]\nnext-selector = \"a[[\"\n");
        assert!(validate(&bad_css).is_err());

        let ok = config_with_target("[target.pagination]\nnext-selector = \"a[rel=next]\"\n");
        assert!(validate(&ok).is_ok());
    }

    #[test]
    fn test_output_path_required() {
        let config = config_with_target("[target.output]\nkind = \"jsonl\"\n");
        assert!(validate(&config).is_err());
        let config = config_with_target("[target.output]\nkind = \"csv\"\npath = \"out.csv\"\n");
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_allowed_domain_patterns() {
        let mut config = config_with_target("");
        config.targets[0].allowed_domains = vec!["*.shop.test".into()];
        assert!(validate(&config).is_ok());
        config.targets[0].allowed_domains = vec!["shop..*".into()];
        assert!(matches!(validate(&config), Err(ConfigError::InvalidPattern(_))));
    }

    #[test]
    fn test_webhook_url() {
        let mut config = config_with_target("");
        config.notify.webhook_url = Some("not a url".into());
        assert!(matches!(validate(&config), Err(ConfigError::InvalidUrl(_))));
        config.notify.webhook_url = Some("https://hooks.test/crawl".into());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_metrics_bind_address() {
        let mut config = config_with_target("");
        assert!(config.metrics.bind.is_none());
        config.metrics.bind = Some("localhost".into());
        assert!(matches!(validate(&config), Err(ConfigError::Validation(_))));
        config.metrics.bind = Some("127.0.0.1:9100".into());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_schedule_interval() {
        let mut config = config_with_target("");
        assert_eq!(config.schedule.interval_minutes, 60);
        config.schedule.interval_minutes = 0;
        assert!(validate(&config).is_err());
        config.schedule.interval_minutes = 15;
        assert!(validate(&config).is_ok());
        assert_eq!(config.schedule.interval().as_secs(), 900);
    }
}
