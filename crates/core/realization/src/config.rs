use std::time::Duration;

use metadata_store::{RetryPolicy, txn};

/// Engine configuration, injected into every manager of a [`MetadataContext`].
///
/// [`MetadataContext`]: crate::MetadataContext
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct RealizationConfig {
    /// Maximum number of retries of a conflicting mutation (default: 7)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Delay before the first retry, in milliseconds (default: 10)
    #[serde(default = "default_retry_min_delay_ms")]
    pub retry_min_delay_ms: u64,
    /// Upper bound of the delay between retries, in milliseconds (default: 500)
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Maximum on-disk bytes of the segments of one merge, 0 for unlimited (default: 0)
    #[serde(default)]
    pub merge_max_storage_bytes: i64,
    /// Report every segment's dictionaries as not built, forcing the next build to rebuild
    /// them (default: false)
    #[serde(default)]
    pub force_rebuild_dictionaries: bool,
    /// Promote a newly added WARNING segment to READY when it has no layouts (default: true)
    #[serde(default = "default_auto_promote")]
    pub auto_promote_empty_warning_segments: bool,
}

impl Default for RealizationConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_min_delay_ms: default_retry_min_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            merge_max_storage_bytes: 0,
            force_rebuild_dictionaries: false,
            auto_promote_empty_warning_segments: default_auto_promote(),
        }
    }
}

impl RealizationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            min_delay: Duration::from_millis(self.retry_min_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    /// The merge storage quota, or `None` if merges are unlimited.
    pub fn merge_quota(&self) -> Option<i64> {
        (self.merge_max_storage_bytes > 0).then_some(self.merge_max_storage_bytes)
    }
}

fn default_max_retries() -> usize {
    txn::DEFAULT_MAX_RETRIES
}

fn default_retry_min_delay_ms() -> u64 {
    txn::DEFAULT_MIN_RETRY_DELAY.as_millis() as u64
}

fn default_retry_max_delay_ms() -> u64 {
    txn::DEFAULT_MAX_RETRY_DELAY.as_millis() as u64
}

fn default_auto_promote() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::RealizationConfig;

    #[test]
    fn empty_document_yields_defaults() {
        let config: RealizationConfig = serde_json::from_str("{}").expect("config should parse");
        assert_eq!(config, RealizationConfig::default());
        assert_eq!(config.merge_quota(), None);
        assert!(config.auto_promote_empty_warning_segments);
    }
}
