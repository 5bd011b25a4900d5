//! Host statistics from procfs
//!
//! Reads:
//! - meminfo for physical memory and swap
//! - stat for CPU time and CPU count
//! - vmstat for paging activity

use crate::models::HostStats;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;

/// Kernel clock ticks per second used by /proc/stat
pub const USER_HZ: f64 = 100.0;

/// Reader for node-wide statistics
#[derive(Debug, Clone)]
pub struct HostStatsReader {
    proc_root: PathBuf,
    hostname: String,
}

impl HostStatsReader {
    pub fn new(proc_root: impl Into<PathBuf>, hostname: impl Into<String>) -> Self {
        Self {
            proc_root: proc_root.into(),
            hostname: hostname.into(),
        }
    }

    /// Parse a `key: value kB` file such as meminfo
    pub fn parse_meminfo(content: &str) -> HashMap<String, u64> {
        let mut values = HashMap::new();

        for line in content.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            if let Some(value) = rest.split_whitespace().next().and_then(|v| v.parse().ok()) {
                values.insert(key.trim().to_string(), value);
            }
        }

        values
    }

    /// Parse /proc/stat; returns (busy+idle CPU seconds, logical CPU count)
    pub fn parse_stat(content: &str) -> Result<(f64, u32)> {
        let mut total_ticks: Option<u64> = None;
        let mut cpu_count = 0u32;

        for line in content.lines() {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("cpu") => {
                    // user nice system idle iowait irq softirq steal; guest time is
                    // already folded into user/nice
                    let ticks: u64 = parts
                        .take(8)
                        .filter_map(|v| v.parse::<u64>().ok())
                        .sum();
                    total_ticks = Some(ticks);
                }
                Some(label) if label.starts_with("cpu") => cpu_count += 1,
                _ => {}
            }
        }

        let ticks = total_ticks.context("no aggregate cpu line in stat")?;
        Ok((ticks as f64 / USER_HZ, cpu_count))
    }

    /// Parse vmstat; returns (paged in KiB, paged out KiB)
    ///
    /// pgpgin/pgpgout are already counted in KiB.
    pub fn parse_vmstat(content: &str) -> (u64, u64) {
        let mut paged_in = 0u64;
        let mut paged_out = 0u64;

        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 {
                match parts[0] {
                    "pgpgin" => paged_in = parts[1].parse().unwrap_or(0),
                    "pgpgout" => paged_out = parts[1].parse().unwrap_or(0),
                    _ => {}
                }
            }
        }

        (paged_in, paged_out)
    }

    /// Read a fresh snapshot
    pub async fn read(&self) -> Result<HostStats> {
        let meminfo_path = self.proc_root.join("meminfo");
        let meminfo = fs::read_to_string(&meminfo_path)
            .await
            .with_context(|| format!("Failed to read {:?}", meminfo_path))?;
        let mem = Self::parse_meminfo(&meminfo);

        let stat_path = self.proc_root.join("stat");
        let stat = fs::read_to_string(&stat_path)
            .await
            .with_context(|| format!("Failed to read {:?}", stat_path))?;
        let (total_cpu_time_secs, cpu_count) = Self::parse_stat(&stat)?;

        // vmstat is missing in some sandboxes; paging counters stay zero then
        let (paged_in_kib, paged_out_kib) =
            match fs::read_to_string(self.proc_root.join("vmstat")).await {
                Ok(content) => Self::parse_vmstat(&content),
                Err(_) => (0, 0),
            };

        let field = |name: &str| mem.get(name).copied().unwrap_or(0);

        Ok(HostStats {
            hostname: self.hostname.clone(),
            cpu_count,
            total_cpu_time_secs,
            mem_total_kib: field("MemTotal"),
            mem_free_kib: field("MemFree"),
            mem_available_kib: field("MemAvailable"),
            swap_total_kib: field("SwapTotal"),
            swap_free_kib: field("SwapFree"),
            paged_in_kib,
            paged_out_kib,
            timestamp: chrono::Utc::now().timestamp(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MEMINFO: &str = "MemTotal:       16384000 kB
MemFree:         4096000 kB
MemAvailable:    8192000 kB
SwapTotal:       2048000 kB
SwapFree:        1024000 kB
HugePages_Total:       0
";

    const STAT: &str = "cpu  1000 20 300 5000 40 0 10 0 0 0
cpu0 500 10 150 2500 20 0 5 0 0 0
cpu1 500 10 150 2500 20 0 5 0 0 0
intr 12345
ctxt 999
";

    #[test]
    fn test_parse_meminfo() {
        let mem = HostStatsReader::parse_meminfo(MEMINFO);
        assert_eq!(mem["MemTotal"], 16_384_000);
        assert_eq!(mem["SwapFree"], 1_024_000);
        assert_eq!(mem["HugePages_Total"], 0);
    }

    #[test]
    fn test_parse_stat() {
        let (secs, cpus) = HostStatsReader::parse_stat(STAT).unwrap();
        assert_eq!(cpus, 2);
        assert!((secs - 63.7).abs() < 1e-9);
    }

    #[test]
    fn test_parse_stat_requires_cpu_line() {
        assert!(HostStatsReader::parse_stat("intr 1\n").is_err());
    }

    #[test]
    fn test_parse_vmstat() {
        let (paged_in, paged_out) =
            HostStatsReader::parse_vmstat("pgpgin 100\npgpgout 250\nnr_free_pages 7\n");
        assert_eq!(paged_in, 100);
        assert_eq!(paged_out, 250);
    }

    #[tokio::test]
    async fn test_read_from_mock_proc() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("meminfo"), MEMINFO).await.unwrap();
        tokio::fs::write(dir.path().join("stat"), STAT).await.unwrap();

        let reader = HostStatsReader::new(dir.path(), "node-1");
        let stats = reader.read().await.unwrap();

        assert_eq!(stats.hostname, "node-1");
        assert_eq!(stats.cpu_count, 2);
        assert_eq!(stats.mem_free_kib, 4_096_000);
        assert_eq!(stats.paged_in_kib, 0);
        assert!(stats.timestamp > 0);
    }

    #[tokio::test]
    async fn test_read_missing_meminfo_fails() {
        let dir = TempDir::new().unwrap();
        let reader = HostStatsReader::new(dir.path(), "node-1");
        assert!(reader.read().await.is_err());
    }
}
