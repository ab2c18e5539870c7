//! Pseudo-filesystem helpers
//!
//! Small readers and parsers shared by every collector stage: integer
//! files with the `max` sentinel, `key value` stat files, cpuset range
//! lists, systemd path unescaping, and the host-level facts used to
//! normalize "unlimited" kernel sentinels.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;
use tracing::warn;

/// Sentinel for an unlimited kernel counter.
pub const UNLIMITED: u64 = u64::MAX;

/// cgroup v1 reports "no limit" as the page-counter ceiling rather than
/// an all-ones word.
const V1_PAGE_COUNTER_MAX: u64 = 0x7fff_ffff_ffff_f000;

/// True when a kernel-reported limit means "unlimited" under either ABI.
pub fn is_unlimited(value: u64) -> bool {
    value >= V1_PAGE_COUNTER_MAX
}

/// Read a single unsigned integer from a pseudo-file. The literal `max`
/// maps to [`UNLIMITED`].
pub async fn read_uint(path: &Path) -> Result<u64> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_uint(content.trim()).with_context(|| format!("failed to parse {}", path.display()))
}

/// Parse a single unsigned integer, honoring the `max` sentinel.
pub fn parse_uint(s: &str) -> Result<u64> {
    if s == "max" {
        return Ok(UNLIMITED);
    }
    s.parse()
        .with_context(|| format!("not an unsigned integer: {s:?}"))
}

/// Parse a flat `key value` file (cpu.stat, memory.stat, memory.events)
/// into a map. Lines that do not parse are skipped.
pub fn parse_keyed(content: &str) -> HashMap<String, u64> {
    let mut stats = HashMap::new();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
            if let Ok(value) = parse_uint(value) {
                stats.insert(key.to_string(), value);
            }
        }
    }
    stats
}

/// Parse a comma-separated cpu range list (`0-3,5,7-8`) into the set of
/// cpu indices it names. The empty string is the empty set.
pub fn parse_range(list: &str) -> Result<Vec<u32>> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start
                    .trim()
                    .parse()
                    .with_context(|| format!("bad range start in {part:?}"))?;
                let end: u32 = end
                    .trim()
                    .parse()
                    .with_context(|| format!("bad range end in {part:?}"))?;
                if end < start {
                    anyhow::bail!("descending range {part:?}");
                }
                cpus.extend(start..=end);
            }
            None => {
                cpus.push(
                    part.trim()
                        .parse()
                        .with_context(|| format!("bad cpu index {part:?}"))?,
                );
            }
        }
    }
    Ok(cpus)
}

/// Decode systemd-style `\xNN` escapes in a path segment.
///
/// `machine-qemu\x2d2\x2dinstance\x2d00000001.scope` becomes
/// `machine-qemu-2-instance-00000001.scope`. Malformed escapes are left
/// as-is.
pub fn unescape_systemd(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1] == b'x' {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 2..i + 4]) {
                if let Ok(value) = u8::from_str_radix(hex, 16) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Host-level facts used to substitute for unlimited kernel sentinels
/// and to resolve `major:minor` pairs to device names.
#[derive(Debug, Clone, Default)]
pub struct HostFacts {
    /// Total host memory in bytes, 0 when unknown.
    pub mem_total_bytes: u64,
    /// Total host swap in bytes, 0 when unknown.
    pub swap_total_bytes: u64,
    /// `major:minor` -> kernel device name.
    pub block_devices: HashMap<String, String>,
}

impl HostFacts {
    /// Load facts from `<procfs>/meminfo` and `<procfs>/diskstats`.
    /// Either file being unreadable leaves the corresponding facts empty
    /// rather than failing the exporter.
    pub async fn load(procfs: &Path) -> Self {
        let mut facts = Self::default();

        match fs::read_to_string(procfs.join("meminfo")).await {
            Ok(content) => {
                for line in content.lines() {
                    let mut parts = line.split_whitespace();
                    match (parts.next(), parts.next()) {
                        (Some("MemTotal:"), Some(kb)) => {
                            facts.mem_total_bytes = kb.parse::<u64>().unwrap_or(0) * 1024;
                        }
                        (Some("SwapTotal:"), Some(kb)) => {
                            facts.swap_total_bytes = kb.parse::<u64>().unwrap_or(0) * 1024;
                        }
                        _ => {}
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not read meminfo, memory totals unavailable"),
        }

        match fs::read_to_string(procfs.join("diskstats")).await {
            Ok(content) => {
                for line in content.lines() {
                    let mut parts = line.split_whitespace();
                    if let (Some(major), Some(minor), Some(name)) =
                        (parts.next(), parts.next(), parts.next())
                    {
                        facts
                            .block_devices
                            .insert(format!("{major}:{minor}"), name.to_string());
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not read diskstats, device names unavailable"),
        }

        facts
    }

    /// Resolve a `major:minor` pair to its device name, keeping the pair
    /// itself when unknown.
    pub fn device_name(&self, major_minor: &str) -> String {
        self.block_devices
            .get(major_minor)
            .cloned()
            .unwrap_or_else(|| major_minor.to_string())
    }

    /// Substitute the host memory total when the kernel reports an
    /// unlimited memory limit.
    pub fn normalize_mem_limit(&self, limit: u64) -> u64 {
        if is_unlimited(limit) && self.mem_total_bytes > 0 {
            self.mem_total_bytes
        } else {
            limit
        }
    }

    /// Substitute for an unlimited swap limit: host swap total first,
    /// host memory total when the host has no swap configured.
    pub fn normalize_swap_limit(&self, limit: u64) -> u64 {
        if !is_unlimited(limit) {
            return limit;
        }
        if self.swap_total_bytes > 0 {
            self.swap_total_bytes
        } else if self.mem_total_bytes > 0 {
            self.mem_total_bytes
        } else {
            limit
        }
    }
}
