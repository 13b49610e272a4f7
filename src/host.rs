//! Local host identity for the default `host` tag.

use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::point::{clean_name, Tagset, HOST_TAG};

const KERNEL_HOSTNAME: &str = "/proc/sys/kernel/hostname";

/// Returns the raw machine hostname, or `unknown`.
pub fn hostname() -> String {
    std::fs::read_to_string(KERNEL_HOSTNAME)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
        .or_else(|| std::env::var("COMPUTERNAME").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Normalizes a hostname for tagging: lowercased, truncated to the first
/// label unless `full` is set, and stripped of disallowed characters.
pub fn clean_hostname(raw: &str, full: bool) -> String {
    let lower = raw.trim().to_lowercase();
    let name = if full {
        lower.as_str()
    } else {
        lower.split('.').next().unwrap_or_default()
    };
    clean_name(name)
}

/// Builds the process-wide default tagset from the host name and any
/// configured extra tags. A configured `host` tag replaces the detected one.
pub fn default_tags(
    raw_hostname: &str,
    full_hostname: bool,
    extra: &HashMap<String, String>,
) -> Result<Tagset> {
    let mut tags = Tagset::new();

    let host = clean_hostname(raw_hostname, full_hostname);
    if host.is_empty() {
        bail!("hostname {raw_hostname:?} has no usable characters");
    }
    tags.insert(HOST_TAG, host);

    for (k, v) in extra {
        tags.insert(k.clone(), v.clone());
    }

    tags.validate()?;
    Ok(tags)
}
