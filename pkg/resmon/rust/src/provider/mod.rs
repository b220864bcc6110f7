// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Platform snapshot providers.
//!
//! A provider reads raw cumulative CPU time, resident memory and the quota in
//! effect. The variant is chosen once when the monitor starts by probing the
//! environment: a cgroup v2 unified hierarchy wins, then cgroup v1 controller
//! files, and otherwise the host's own process accounting is used.

pub mod cgroup_v1;
pub mod cgroup_v2;
pub mod host;

use crate::errors::{Error, Result};
use crate::sample::{Quota, Snapshot};
use log::{debug, info};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use cgroup_v1::CgroupV1Provider;
pub use cgroup_v2::CgroupV2Provider;
pub use host::HostProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    CgroupV2,
    CgroupV1,
    Host,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::CgroupV2 => write!(f, "cgroup-v2"),
            ProviderKind::CgroupV1 => write!(f, "cgroup-v1"),
            ProviderKind::Host => write!(f, "host"),
        }
    }
}

/// Which provider the configuration asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderSelection {
    Auto,
    Explicit(ProviderKind),
}

impl FromStr for ProviderSelection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(ProviderSelection::Auto),
            "cgroup-v2" | "cgroupv2" => Ok(ProviderSelection::Explicit(ProviderKind::CgroupV2)),
            "cgroup-v1" | "cgroupv1" => Ok(ProviderSelection::Explicit(ProviderKind::CgroupV1)),
            "host" | "native" => Ok(ProviderSelection::Explicit(ProviderKind::Host)),
            other => Err(Error::InvalidConfig(format!(
                "unknown snapshot provider {other:?} (expected auto, cgroup-v2, cgroup-v1 or host)"
            ))),
        }
    }
}

/// Reads raw counters and limits for the monitored process or container.
///
/// Calls may block on file or syscall I/O; the sampler runs them off the
/// async executor and bounds them with a deadline.
pub trait SnapshotProvider: Send {
    fn kind(&self) -> ProviderKind;

    /// Reads cumulative CPU time and current memory usage.
    fn read_snapshot(&mut self) -> Result<Snapshot>;

    /// Reads the limits currently in effect. A missing limit is reported as
    /// `None` in the returned quota, not as an error.
    fn read_quota(&mut self) -> Result<Quota>;
}

/// Filesystem roots used when probing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePaths {
    pub cgroup_root: PathBuf,
    pub proc_root: PathBuf,
}

/// Selects and builds the provider for this environment.
pub fn probe(selection: ProviderSelection, paths: &ProbePaths) -> Result<Box<dyn SnapshotProvider>> {
    let provider: Box<dyn SnapshotProvider> = match selection {
        ProviderSelection::Auto => {
            if let Some(v2) = CgroupV2Provider::detect(&paths.cgroup_root, &paths.proc_root) {
                Box::new(v2)
            } else if let Some(v1) = CgroupV1Provider::detect(&paths.cgroup_root, &paths.proc_root)
            {
                Box::new(v1)
            } else {
                debug!(
                    "no cgroup hierarchy found under {}, using host accounting",
                    paths.cgroup_root.display()
                );
                Box::new(HostProvider::new()?)
            }
        }
        ProviderSelection::Explicit(ProviderKind::CgroupV2) => Box::new(
            CgroupV2Provider::detect(&paths.cgroup_root, &paths.proc_root).ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "cgroup-v2 requested but no unified hierarchy with cpu.stat and memory.current found at {}",
                    paths.cgroup_root.display()
                ))
            })?,
        ),
        ProviderSelection::Explicit(ProviderKind::CgroupV1) => Box::new(
            CgroupV1Provider::detect(&paths.cgroup_root, &paths.proc_root).ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "cgroup-v1 requested but no cpuacct/memory controllers found under {}",
                    paths.cgroup_root.display()
                ))
            })?,
        ),
        ProviderSelection::Explicit(ProviderKind::Host) => Box::new(HostProvider::new()?),
    };
    info!("using {} snapshot provider", provider.kind());
    Ok(provider)
}

/// One line of `/proc/<pid>/cgroup`: `hierarchy-ID:controller-list:cgroup-path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CgroupEntry {
    pub hierarchy_id: String,
    pub controllers: Vec<String>,
    pub path: String,
}

pub(crate) fn parse_proc_cgroup(contents: &str) -> Vec<CgroupEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ':');
            let hierarchy_id = parts.next()?.trim();
            let controllers = parts.next()?;
            let path = parts.next()?.trim();
            if hierarchy_id.is_empty() {
                return None;
            }
            Some(CgroupEntry {
                hierarchy_id: hierarchy_id.to_string(),
                controllers: controllers
                    .split(',')
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect(),
                path: path.to_string(),
            })
        })
        .collect()
}

/// Entries of the current process's `cgroup` file, empty if unreadable.
pub(crate) fn own_cgroups(proc_root: &Path) -> Vec<CgroupEntry> {
    let path = proc_root.join("self").join("cgroup");
    match fs::read_to_string(&path) {
        Ok(contents) => parse_proc_cgroup(&contents),
        Err(e) => {
            debug!("could not read {}: {e}", path.display());
            Vec::new()
        }
    }
}

/// Joins a cgroup path from `/proc/self/cgroup` under a mount point.
pub(crate) fn join_cgroup_path(mount: &Path, cgroup_path: &str) -> PathBuf {
    let relative = cgroup_path.trim_start_matches('/');
    if relative.is_empty() {
        mount.to_path_buf()
    } else {
        mount.join(relative)
    }
}

pub(crate) fn read_counter_file(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::unavailable_io(format!("reading {}", path.display()), e))
}

pub(crate) fn read_counter_u64(path: &Path) -> Result<u64> {
    let contents = read_counter_file(path)?;
    contents.trim().parse().map_err(|e| {
        Error::unavailable(format!(
            "parsing {} ({:?}): {e}",
            path.display(),
            contents.trim()
        ))
    })
}

/// Reads a limit file, `Ok(None)` when the file does not exist.
pub(crate) fn read_limit_file(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents.trim().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::QuotaResolution {
            context: format!("reading {}: {e}", path.display()),
        }),
    }
}

pub(crate) fn parse_limit<T: FromStr>(path: &Path, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value.parse().map_err(|e| Error::QuotaResolution {
        context: format!("parsing {} ({value:?}): {e}", path.display()),
    })
}

/// Converts `cpu.shares` into fractional cores.
pub(crate) fn shares_to_cores(shares: u64) -> f64 {
    shares as f64 / 1024.0
}

/// Converts a cgroup v2 `cpu.weight` (1..=10000) into v1-equivalent shares.
pub(crate) fn weight_to_shares(weight: u64) -> u64 {
    let weight = weight.clamp(1, 10_000);
    2 + ((weight - 1) * 262_142) / 9_999
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_provider_selection_from_str() {
        assert_eq!("auto".parse::<ProviderSelection>().unwrap(), ProviderSelection::Auto);
        assert_eq!("".parse::<ProviderSelection>().unwrap(), ProviderSelection::Auto);
        assert_eq!(
            "cgroup-v2".parse::<ProviderSelection>().unwrap(),
            ProviderSelection::Explicit(ProviderKind::CgroupV2)
        );
        assert_eq!(
            "CGROUP-V1".parse::<ProviderSelection>().unwrap(),
            ProviderSelection::Explicit(ProviderKind::CgroupV1)
        );
        assert_eq!(
            "host".parse::<ProviderSelection>().unwrap(),
            ProviderSelection::Explicit(ProviderKind::Host)
        );
        assert!(matches!(
            "job-object-v9".parse::<ProviderSelection>(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_parse_proc_cgroup_v2() {
        let entries = parse_proc_cgroup("0::/system.slice/datadog-agent.service\n");
        assert_eq!(
            entries,
            vec![CgroupEntry {
                hierarchy_id: "0".into(),
                controllers: vec![],
                path: "/system.slice/datadog-agent.service".into(),
            }]
        );
    }

    #[test]
    fn test_parse_proc_cgroup_v1() {
        let contents = "\
12:memory:/docker/abc
4:cpu,cpuacct:/docker/abc
1:name=systemd:/docker/abc
garbage
";
        let entries = parse_proc_cgroup(contents);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].controllers, vec!["cpu", "cpuacct"]);
        assert_eq!(entries[1].path, "/docker/abc");
        assert_eq!(entries[2].controllers, vec!["name=systemd"]);
    }

    #[test]
    fn test_join_cgroup_path() {
        let mount = Path::new("/sys/fs/cgroup");
        assert_eq!(join_cgroup_path(mount, "/"), PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(
            join_cgroup_path(mount, "/kubepods/pod1"),
            PathBuf::from("/sys/fs/cgroup/kubepods/pod1")
        );
    }

    #[test]
    fn test_weight_and_shares_conversion() {
        assert_eq!(weight_to_shares(1), 2);
        assert_eq!(weight_to_shares(10_000), 262_144);
        // kubernetes maps a 1 core request to weight 39
        let cores = shares_to_cores(weight_to_shares(39));
        assert!((cores - 1.0).abs() < 0.05, "{cores}");
        assert_eq!(shares_to_cores(512), 0.5);
    }

    #[test]
    fn test_read_counter_u64_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(
            read_counter_u64(&missing),
            Err(Error::SnapshotUnavailable { source: Some(_), .. })
        ));

        let garbage = dir.path().join("garbage");
        fs::write(&garbage, "not-a-number\n").unwrap();
        assert!(matches!(
            read_counter_u64(&garbage),
            Err(Error::SnapshotUnavailable { source: None, .. })
        ));

        let good = dir.path().join("good");
        fs::write(&good, "12345\n").unwrap();
        assert_eq!(read_counter_u64(&good).unwrap(), 12345);
    }

    #[test]
    fn test_read_limit_file_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_limit_file(&dir.path().join("memory.max")).unwrap(), None);
        fs::write(dir.path().join("memory.max"), "max\n").unwrap();
        assert_eq!(
            read_limit_file(&dir.path().join("memory.max")).unwrap(),
            Some("max".to_string())
        );
    }

    #[test]
    fn test_probe_explicit_cgroup_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProbePaths {
            cgroup_root: dir.path().join("cgroup"),
            proc_root: dir.path().join("proc"),
        };
        for kind in [ProviderKind::CgroupV2, ProviderKind::CgroupV1] {
            assert!(matches!(
                probe(ProviderSelection::Explicit(kind), &paths),
                Err(Error::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_probe_auto_prefers_v2() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cgroup");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("cgroup.controllers"), "cpu memory\n").unwrap();
        fs::write(root.join("cpu.stat"), "usage_usec 1\n").unwrap();
        fs::write(root.join("memory.current"), "4096\n").unwrap();
        // v1 files present too, v2 still wins
        fs::create_dir_all(root.join("cpuacct")).unwrap();
        fs::write(root.join("cpuacct/cpuacct.usage"), "1\n").unwrap();

        let paths = ProbePaths {
            cgroup_root: root,
            proc_root: dir.path().join("proc"),
        };
        let provider = probe(ProviderSelection::Auto, &paths).unwrap();
        assert_eq!(provider.kind(), ProviderKind::CgroupV2);
    }

    #[test]
    fn test_probe_auto_skips_v2_host_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cgroup");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("cgroup.controllers"), "cpu memory\n").unwrap();
        fs::write(root.join("cpu.stat"), "usage_usec 1\n").unwrap();

        let paths = ProbePaths {
            cgroup_root: root,
            proc_root: dir.path().join("proc"),
        };
        let provider = probe(ProviderSelection::Auto, &paths).unwrap();
        assert_eq!(provider.kind(), ProviderKind::Host);
    }

    #[test]
    fn test_probe_auto_falls_back_to_host() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProbePaths {
            cgroup_root: dir.path().join("cgroup"),
            proc_root: dir.path().join("proc"),
        };
        let provider = probe(ProviderSelection::Auto, &paths).unwrap();
        assert_eq!(provider.kind(), ProviderKind::Host);
    }
}
