// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::{
    ProviderKind, SnapshotProvider, join_cgroup_path, own_cgroups, parse_limit,
    read_counter_file, read_counter_u64, read_limit_file, shares_to_cores, weight_to_shares,
};
use crate::errors::{Error, Result};
use crate::sample::{Quota, Snapshot};
use log::debug;
use std::path::{Path, PathBuf};

const UNLIMITED: &str = "max";

/// Reads the unified (v2) hierarchy: `cpu.stat`, `memory.current`,
/// `cpu.max`, `cpu.weight` and `memory.max`.
#[derive(Debug)]
pub struct CgroupV2Provider {
    root: PathBuf,
    dir: PathBuf,
}

impl CgroupV2Provider {
    pub fn new(root: impl Into<PathBuf>, dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dir: dir.into(),
        }
    }

    /// Returns a provider if `cgroup_root` is a unified hierarchy with
    /// readable counters.
    ///
    /// The process's own cgroup is taken from `<proc_root>/self/cgroup`.
    /// When that directory is not visible (cgroup namespaces), the mount
    /// root is used instead. The host root cgroup has no `memory.current`,
    /// so a process outside any container is not matched here.
    pub fn detect(cgroup_root: &Path, proc_root: &Path) -> Option<Self> {
        if !cgroup_root.join("cgroup.controllers").exists() {
            return None;
        }

        let own = own_cgroups(proc_root)
            .into_iter()
            .find(|entry| entry.hierarchy_id == "0" && entry.controllers.is_empty())
            .map(|entry| join_cgroup_path(cgroup_root, &entry.path));
        let Some(dir) = own
            .into_iter()
            .chain(std::iter::once(cgroup_root.to_path_buf()))
            .find(|dir| has_counters(dir))
        else {
            debug!(
                "unified hierarchy at {} has no cpu.stat/memory.current for this process",
                cgroup_root.display()
            );
            return None;
        };

        debug!("cgroup v2 hierarchy detected, reading {}", dir.display());
        Some(Self::new(cgroup_root, dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_usage_usec(&self) -> Result<u64> {
        let path = self.dir.join("cpu.stat");
        let contents = read_counter_file(&path)?;
        let value = contents
            .lines()
            .find_map(|line| line.strip_prefix("usage_usec "))
            .ok_or_else(|| Error::unavailable(format!("usage_usec not found in {}", path.display())))?;
        value.trim().parse().map_err(|e| {
            Error::unavailable(format!("parsing usage_usec in {}: {e}", path.display()))
        })
    }

    /// The cgroup and its ancestors up to the mount root, innermost first.
    /// Limits set on a parent also bound the children.
    fn hierarchy(&self) -> impl Iterator<Item = &Path> {
        self.dir
            .ancestors()
            .take_while(move |dir| dir.starts_with(&self.root))
    }

    fn read_cpu_limit(&self) -> Result<Option<f64>> {
        let mut limit: Option<f64> = None;
        for dir in self.hierarchy() {
            let path = dir.join("cpu.max");
            if let Some(value) = read_limit_file(&path)?
                && let Some(cores) = parse_cpu_max(&path, &value)?
            {
                limit = Some(limit.map_or(cores, |l| l.min(cores)));
            }
        }
        Ok(limit)
    }

    fn read_cpu_request(&self) -> Result<Option<f64>> {
        let path = self.dir.join("cpu.weight");
        match read_limit_file(&path)? {
            Some(value) => {
                let weight: u64 = parse_limit(&path, &value)?;
                Ok(Some(shares_to_cores(weight_to_shares(weight))))
            }
            None => Ok(None),
        }
    }

    fn read_memory_limit(&self) -> Result<Option<u64>> {
        let mut limit: Option<u64> = None;
        for dir in self.hierarchy() {
            let path = dir.join("memory.max");
            match read_limit_file(&path)? {
                Some(value) if value != UNLIMITED => {
                    let bytes: u64 = parse_limit(&path, &value)?;
                    limit = Some(limit.map_or(bytes, |l| l.min(bytes)));
                }
                _ => {}
            }
        }
        Ok(limit)
    }
}

fn has_counters(dir: &Path) -> bool {
    dir.join("cpu.stat").exists() && dir.join("memory.current").exists()
}

/// Parses `cpu.max` (`"$MAX $PERIOD"`, `$MAX` may be `max`) into cores.
fn parse_cpu_max(path: &Path, value: &str) -> Result<Option<f64>> {
    let mut fields = value.split_whitespace();
    let quota = fields.next().unwrap_or(UNLIMITED);
    if quota == UNLIMITED {
        return Ok(None);
    }
    let quota: u64 = parse_limit(path, quota)?;
    let period: u64 = match fields.next() {
        Some(period) => parse_limit(path, period)?,
        None => 100_000,
    };
    if period == 0 {
        return Err(Error::QuotaResolution {
            context: format!("{} has a zero period", path.display()),
        });
    }
    Ok(Some(quota as f64 / period as f64))
}

impl SnapshotProvider for CgroupV2Provider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CgroupV2
    }

    fn read_snapshot(&mut self) -> Result<Snapshot> {
        let usage_usec = self.read_usage_usec()?;
        let memory_used_bytes = read_counter_u64(&self.dir.join("memory.current"))?;
        Ok(Snapshot {
            cpu_time_consumed_nanos: usage_usec.saturating_mul(1_000),
            memory_used_bytes,
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
