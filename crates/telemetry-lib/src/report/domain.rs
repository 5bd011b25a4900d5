//! Per-VM statistics sources

use super::host::{HostStatsReader, USER_HZ};
use crate::models::{DomainStats, VmInfo};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;

/// Source of per-VM statistics
///
/// `endpoint` names the physical source a VM is scraped through and doubles
/// as the collector's busy key. Returning `None` marks the VM unreachable
/// for this round.
#[async_trait]
pub trait DomainStatsSource: Send + Sync {
    fn endpoint(&self, vm: &VmInfo) -> Option<String>;

    async fn domain_stats(&self, vm: &VmInfo) -> Result<DomainStats>;
}

/// Reads statistics of the hypervisor process from procfs
#[derive(Debug, Clone)]
pub struct ProcDomainStats {
    proc_root: PathBuf,
}

impl ProcDomainStats {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn process_dir(&self, pid: u32) -> PathBuf {
        self.proc_root.join(pid.to_string())
    }

    /// Parse `<pid>/stat`; returns utime + stime in seconds
    pub fn parse_process_stat(content: &str) -> Result<f64> {
        // comm may contain spaces and parentheses, fields resume after the last ')'
        let rest = content
            .rfind(')')
            .map(|idx| &content[idx + 1..])
            .context("malformed process stat")?;
        let fields: Vec<&str> = rest.split_whitespace().collect();

        // fields[0] is the state (field 3), utime is field 14 and stime field 15
        let utime: u64 = fields
            .get(11)
            .and_then(|v| v.parse().ok())
            .context("missing utime")?;
        let stime: u64 = fields
            .get(12)
            .and_then(|v| v.parse().ok())
            .context("missing stime")?;

        Ok((utime + stime) as f64 / USER_HZ)
    }
}

#[async_trait]
impl DomainStatsSource for ProcDomainStats {
    fn endpoint(&self, vm: &VmInfo) -> Option<String> {
        let dir = self.process_dir(vm.pid);
        dir.exists().then(|| dir.to_string_lossy().into_owned())
    }

    async fn domain_stats(&self, vm: &VmInfo) -> Result<DomainStats> {
        let dir = self.process_dir(vm.pid);

        let stat = fs::read_to_string(dir.join("stat"))
            .await
            .with_context(|| format!("Failed to read stat of pid {}", vm.pid))?;
        let cpu_time_secs = Self::parse_process_stat(&stat)?;

        let status = fs::read_to_string(dir.join("status"))
            .await
            .with_context(|| format!("Failed to read status of pid {}", vm.pid))?;
        let resident_kib = HostStatsReader::parse_meminfo(&status)
            .get("VmRSS")
            .copied()
            .unwrap_or(0);

        Ok(DomainStats {
            cpu_time_secs,
            resident_kib,
            vcpus: vm.vcpus,
            memory_limit_kib: vm.memory_kib,
        })
    }
}
