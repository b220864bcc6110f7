// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::{
    CgroupEntry, ProviderKind, SnapshotProvider, join_cgroup_path, own_cgroups, parse_limit,
    read_counter_u64, read_limit_file, shares_to_cores,
};
use crate::errors::{Error, Result};
use crate::sample::{Quota, Snapshot};
use log::debug;
use std::path::{Path, PathBuf};

/// `memory.limit_in_bytes` reports PAGE_COUNTER_MAX rounded to the page size
/// when no limit is set. Anything at or above this is treated as unlimited.
const UNLIMITED_MEMORY_THRESHOLD: u64 = 1 << 62;

/// Reads the legacy per-controller hierarchies: `cpuacct.usage`,
/// `memory.usage_in_bytes`, `cpu.cfs_quota_us`/`cpu.cfs_period_us`,
/// `cpu.shares` and `memory.limit_in_bytes`.
///
/// Limits are the tightest found between the controller directory and
/// `root`, since a limit on a parent cgroup also bounds its children.
#[derive(Debug)]
pub struct CgroupV1Provider {
    root: PathBuf,
    cpuacct_dir: PathBuf,
    cpu_dir: PathBuf,
    memory_dir: PathBuf,
}

impl CgroupV1Provider {
    pub fn new(
        root: impl Into<PathBuf>,
        cpuacct_dir: impl Into<PathBuf>,
        cpu_dir: impl Into<PathBuf>,
        memory_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            root: root.into(),
            cpuacct_dir: cpuacct_dir.into(),
            cpu_dir: cpu_dir.into(),
            memory_dir: memory_dir.into(),
        }
    }

    /// Returns a provider if the cpuacct and memory controllers are mounted
    /// under `cgroup_root`. The cpu controller is optional and defaults to
    /// the cpuacct directory, since the two are usually co-mounted.
    pub fn detect(cgroup_root: &Path, proc_root: &Path) -> Option<Self> {
        let entries = own_cgroups(proc_root);
        let cpuacct_dir = controller_dir(cgroup_root, &entries, "cpuacct", "cpuacct.usage")?;
        let memory_dir = controller_dir(cgroup_root, &entries, "memory", "memory.usage_in_bytes")?;
        let cpu_dir = controller_dir(cgroup_root, &entries, "cpu", "cpu.cfs_quota_us")
            .unwrap_or_else(|| cpuacct_dir.clone());

        debug!(
            "cgroup v1 controllers detected (cpuacct={}, cpu={}, memory={})",
            cpuacct_dir.display(),
            cpu_dir.display(),
            memory_dir.display()
        );
        Some(Self::new(cgroup_root, cpuacct_dir, cpu_dir, memory_dir))
    }

    /// `dir` and its ancestors up to the cgroup root, innermost first.
    fn hierarchy<'a>(&'a self, dir: &'a Path) -> impl Iterator<Item = &'a Path> {
        dir.ancestors().take_while(move |dir| dir.starts_with(&self.root))
    }

    fn read_cpu_limit(&self) -> Result<Option<f64>> {
        let mut limit: Option<f64> = None;
        for dir in self.hierarchy(&self.cpu_dir) {
            if let Some(cores) = read_cfs_limit(dir)? {
                limit = Some(limit.map_or(cores, |l| l.min(cores)));
            }
        }
        Ok(limit)
    }

    fn read_cpu_request(&self) -> Result<Option<f64>> {
        let path = self.cpu_dir.join("cpu.shares");
        match read_limit_file(&path)? {
            Some(value) => {
                let shares: u64 = parse_limit(&path, &value)?;
                Ok(Some(shares_to_cores(shares)))
            }
            None => Ok(None),
        }
    }

    fn read_memory_limit(&self) -> Result<Option<u64>> {
        let mut limit: Option<u64> = None;
        for dir in self.hierarchy(&self.memory_dir) {
            let path = dir.join("memory.limit_in_bytes");
            if let Some(value) = read_limit_file(&path)? {
                let bytes: u64 = parse_limit(&path, &value)?;
                if bytes < UNLIMITED_MEMORY_THRESHOLD {
                    limit = Some(limit.map_or(bytes, |l| l.min(bytes)));
                }
            }
        }
        Ok(limit)
    }
}

/// The CFS bandwidth limit of a single cgroup directory, in cores.
fn read_cfs_limit(dir: &Path) -> Result<Option<f64>> {
    let quota_path = dir.join("cpu.cfs_quota_us");
    let Some(quota) = read_limit_file(&quota_path)? else {
        return Ok(None);
    };
    let quota: i64 = parse_limit(&quota_path, &quota)?;
    if quota <= 0 {
        // -1 means no quota
        return Ok(None);
    }

    let period_path = dir.join("cpu.cfs_period_us");
    let period: u64 = match read_limit_file(&period_path)? {
        Some(period) => parse_limit(&period_path, &period)?,
        None => {
            return Err(Error::QuotaResolution {
                context: format!("{} is set but {} is missing", quota_path.display(), period_path.display()),
            });
        }
    };
    if period == 0 {
        return Err(Error::QuotaResolution {
            context: format!("{} is zero", period_path.display()),
        });
    }
    Ok(Some(quota as f64 / period as f64))
}

/// Finds the directory of `controller` that contains `probe_file`.
///
/// Candidates are the process's own cgroup under each plausible mount name,
/// then the bare mount point.
fn controller_dir(
    cgroup_root: &Path,
    entries: &[CgroupEntry],
    controller: &str,
    probe_file: &str,
) -> Option<PathBuf> {
    let own_path = entries
        .iter()
        .find(|entry| entry.controllers.iter().any(|c| c == controller))
        .map(|entry| entry.path.as_str());

    let mounts = [controller, "cpu,cpuacct", "cpuacct,cpu"];
    let mut candidates = Vec::new();
    for mount in mounts {
        let mount = cgroup_root.join(mount);
        if let Some(path) = own_path {
            candidates.push(join_cgroup_path(&mount, path));
        }
        candidates.push(mount);
    }

    candidates
        .into_iter()
        .find(|dir| dir.join(probe_file).exists())
}

impl SnapshotProvider for CgroupV1Provider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CgroupV1
    }

    fn read_snapshot(&mut self) -> Result<Snapshot> {
        Ok(Snapshot {
            cpu_time_consumed_nanos: read_counter_u64(&self.cpuacct_dir.join("cpuacct.usage"))?,
            memory_used_bytes: read_counter_u64(&self.memory_dir.join("memory.usage_in_bytes"))?,
        })
    }

    fn read_quota(&mut self) -> Result<Quota> {
        Ok(Quota {
            cpu_limit_units: self.read_cpu_limit()?,
            cpu_request_units: self.read_cpu_request()?,
            memory_limit_bytes: self.read_memory_limit()?,
        })
    }
}
