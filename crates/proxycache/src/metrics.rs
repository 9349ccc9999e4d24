use std::collections::BTreeMap;

use anyhow::{Context, Result};
use proxycache_service::config::Metrics;
use proxycache_service::metrics::configure_statsd;

/// Collects the tags sent with every metric: the custom tags plus the hostname, if configured.
fn global_tags(config: &Metrics) -> BTreeMap<String, String> {
    let mut tags = config.custom_tags.clone();

    let hostname = config.hostname_tag.clone().and_then(|tag| {
        hostname::get()
            .ok()
            .and_then(|s| s.into_string().ok())
            .map(|name| (tag, name))
    });
    if let Some((tag, name)) = hostname {
        tags.insert(tag, name);
    }

    tags
}

/// Reports metrics to the statsd server at `statsd`.
pub fn configure(config: &Metrics, statsd: &str) -> Result<()> {
    configure_statsd(&config.prefix, statsd, global_tags(config))
        .with_context(|| format!("failed to report metrics to {statsd}"))
}
