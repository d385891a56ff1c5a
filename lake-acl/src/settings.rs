//! Run settings: command line flags, then environment, then defaults.

use anyhow::{Context, Result};
use lake_acl_core::backend::datalake::{DEFAULT_API_VERSION, DEFAULT_DFS_SUFFIX};
use lake_acl_core::{ReconcileOptions, RetryPolicy};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub dfs_suffix: String,
    pub api_version: String,
    pub reconcile: ReconcileOptions,
}

pub fn load_settings(dfs_suffix: Option<&str>) -> Result<Settings> {
    settings_from(|key| std::env::var(key).ok(), dfs_suffix)
}

/// Resolve settings against an arbitrary variable source.
pub fn settings_from<F>(lookup: F, dfs_suffix: Option<&str>) -> Result<Settings>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let number = |key: &str| -> Result<Option<u64>> {
        var(key)
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .with_context(|| format!("{} must be a whole number, got `{}`", key, v))
            })
            .transpose()
    };

    let backoff = Duration::from_millis(number("LAKE_ACL_RETRY_BACKOFF_MS")?.unwrap_or(500));
    let apply_attempts = number("LAKE_ACL_APPLY_RETRIES")?.unwrap_or(1);
    let recursive_attempts = number("LAKE_ACL_RECURSIVE_RETRIES")?.unwrap_or(3);
    let timeout = number("LAKE_ACL_OPERATION_TIMEOUT_SECS")?.map(Duration::from_secs);

    Ok(Settings {
        dfs_suffix: dfs_suffix
            .map(str::to_string)
            .or_else(|| var("LAKE_ACL_DFS_SUFFIX"))
            .unwrap_or_else(|| DEFAULT_DFS_SUFFIX.to_string()),
        api_version: var("LAKE_ACL_API_VERSION")
            .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
        reconcile: ReconcileOptions {
            apply: RetryPolicy::attempts(clamp(apply_attempts)).with_backoff(backoff),
            recursive: RetryPolicy::attempts(clamp(recursive_attempts))
                .with_backoff(backoff)
                .with_timeout(timeout),
        },
    })
}

fn clamp(attempts: u64) -> u32 {
    u32::try_from(attempts).unwrap_or(u32::MAX)
}
