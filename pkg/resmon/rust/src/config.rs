// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::aggregator::WindowAnchor;
use crate::errors::{Error, Result as MonitorResult};
use crate::provider::{ProbePaths, ProviderSelection};
use crate::sampler::SamplerSettings;
use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/datadog-agent/resmon.yaml";
const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
const DEFAULT_PROC_ROOT: &str = "/proc";

fn default_sampling_interval_ms() -> u64 {
    1_000
}

fn default_retention_ms() -> u64 {
    60_000
}

fn default_limits_refresh_interval_ms() -> u64 {
    30_000
}

fn default_snapshot_timeout_ms() -> u64 {
    1_000
}

fn default_auto() -> String {
    "auto".to_string()
}

fn default_window_anchor() -> String {
    WindowAnchor::default().to_string()
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from(DEFAULT_CGROUP_ROOT)
}

/// `HOST_PROC` lets a containerised monitor read the host's procfs.
fn default_proc_root() -> PathBuf {
    std::env::var("HOST_PROC")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_PROC_ROOT))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_report_interval_ms() -> u64 {
    10_000
}

fn default_report_window_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: u64,
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
    #[serde(default = "default_limits_refresh_interval_ms")]
    pub limits_refresh_interval_ms: u64,
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,
    /// `auto`, `cgroup-v2`, `cgroup-v1` or `host`.
    #[serde(default = "default_auto")]
    pub provider: String,
    /// `at-or-before` or `within`.
    #[serde(default = "default_window_anchor")]
    pub window_anchor: String,
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
    #[serde(default = "default_report_window_ms")]
    pub report_window_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sampling_interval_ms: default_sampling_interval_ms(),
            retention_ms: default_retention_ms(),
            limits_refresh_interval_ms: default_limits_refresh_interval_ms(),
            snapshot_timeout_ms: default_snapshot_timeout_ms(),
            provider: default_auto(),
            window_anchor: default_window_anchor(),
            cgroup_root: default_cgroup_root(),
            proc_root: default_proc_root(),
            log_level: default_log_level(),
            report_interval_ms: default_report_interval_ms(),
            report_window_ms: default_report_window_ms(),
        }
    }
}

impl MonitorConfig {
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn report_window(&self) -> Duration {
        Duration::from_millis(self.report_window_ms)
    }

    pub fn provider_selection(&self) -> MonitorResult<ProviderSelection> {
        self.provider.parse()
    }

    pub fn window_anchor(&self) -> MonitorResult<WindowAnchor> {
        self.window_anchor.parse()
    }

    pub fn probe_paths(&self) -> ProbePaths {
        ProbePaths {
            cgroup_root: self.cgroup_root.clone(),
            proc_root: self.proc_root.clone(),
        }
    }

    pub fn sampler_settings(&self) -> SamplerSettings {
        SamplerSettings {
            interval: self.sampling_interval(),
            snapshot_timeout: Duration::from_millis(self.snapshot_timeout_ms),
            limits_refresh_ticks: SamplerSettings::refresh_ticks(
                Duration::from_millis(self.limits_refresh_interval_ms),
                self.sampling_interval(),
            ),
        }
    }

    /// Checks everything that would make the monitor fail at start.
    pub fn validate(&self) -> MonitorResult<()> {
        if self.sampling_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "sampling_interval_ms must be greater than 0".into(),
            ));
        }
        if self.snapshot_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "snapshot_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.limits_refresh_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "limits_refresh_interval_ms must be greater than 0".into(),
            ));
        }
        if self.report_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "report_interval_ms must be greater than 0".into(),
            ));
        }
        if self.retention_ms < self.sampling_interval_ms {
            return Err(Error::InvalidConfig(format!(
                "retention_ms ({}) must be at least sampling_interval_ms ({})",
                self.retention_ms, self.sampling_interval_ms
            )));
        }
        self.provider_selection()?;
        self.window_anchor()?;
        Ok(())
    }
}

pub fn config_path() -> PathBuf {
    std::env::var("DD_RESMON_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Reads the YAML config at `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<MonitorConfig> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} not found, using default configuration", path.display());
            return Ok(MonitorConfig::default());
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    if contents.trim().is_empty() {
        return Ok(MonitorConfig::default());
    }
    let config: MonitorConfig =
        serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

/// Go-style level names; anything unknown is `info`.
pub fn parse_log_level(level: &str) -> log::Level {
    match level.to_lowercase().as_str() {
        "trace" => log::Level::Trace,
        "debug" => log::Level::Debug,
        "info" => log::Level::Info,
        "warn" | "warning" => log::Level::Warn,
        "error" | "critical" | "off" => log::Level::Error,
        _ => log::Level::Info,
    }
}

/// `DD_LOG_LEVEL` wins over the configured level.
pub fn get_log_level(config: &MonitorConfig) -> log::Level {
    match std::env::var("DD_LOG_LEVEL") {
        Ok(level) => parse_log_level(&level),
        Err(_) => parse_log_level(&config.log_level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;
    use std::fs;

    #[test]
    fn test_defaults() {
        let cfg = temp_env::with_var_unset("HOST_PROC", MonitorConfig::default);
        assert_eq!(cfg.sampling_interval(), Duration::from_secs(1));
        assert_eq!(cfg.retention(), Duration::from_secs(60));
        assert_eq!(cfg.provider, "auto");
        assert_eq!(cfg.window_anchor, "at-or-before");
        assert_eq!(cfg.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(cfg.proc_root, PathBuf::from("/proc"));
        assert!(cfg.validate().is_ok());

        let settings = cfg.sampler_settings();
        assert_eq!(settings.limits_refresh_ticks, 30);
        assert_eq!(settings.snapshot_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_host_proc_env() {
        temp_env::with_var("HOST_PROC", Some("/host/proc"), || {
            assert_eq!(MonitorConfig::default().proc_root, PathBuf::from("/host/proc"));
        });
    }

    #[test]
    fn test_load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resmon.yaml");
        let yaml = r#"
sampling_interval_ms: 500
retention_ms: 30000
limits_refresh_interval_ms: 10000
snapshot_timeout_ms: 250
provider: cgroup-v2
window_anchor: within
cgroup_root: /host/sys/fs/cgroup
proc_root: /host/proc
log_level: debug
report_interval_ms: 2000
report_window_ms: 1000
"#;
        fs::write(&path, yaml).unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.sampling_interval_ms, 500);
        assert_eq!(cfg.retention_ms, 30_000);
        assert_eq!(
            cfg.provider_selection().unwrap(),
            ProviderSelection::Explicit(ProviderKind::CgroupV2)
        );
        assert_eq!(cfg.window_anchor().unwrap(), WindowAnchor::Within);
        assert_eq!(cfg.cgroup_root, PathBuf::from("/host/sys/fs/cgroup"));
        assert_eq!(cfg.report_window(), Duration::from_secs(1));
        assert_eq!(cfg.sampler_settings().limits_refresh_ticks, 20);
    }

    #[test]
    fn test_load_partial_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resmon.yaml");
        fs::write(&path, "sampling_interval_ms: 250\n").unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.sampling_interval_ms, 250);
        assert_eq!(cfg.retention_ms, 60_000);
        assert_eq!(cfg.provider, "auto");
    }

    #[test]
    fn test_load_missing_or_empty_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = load_config(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(missing.sampling_interval_ms, 1_000);

        let empty = dir.path().join("empty.yaml");
        fs::write(&empty, "\n").unwrap();
        assert_eq!(load_config(&empty).unwrap().retention_ms, 60_000);
    }

    #[test]
    fn test_load_malformed_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resmon.yaml");
        fs::write(&path, "sampling_interval_ms: [not, a, number]\n").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parsing"), "{err:#}");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases = [
            MonitorConfig {
                sampling_interval_ms: 0,
                ..MonitorConfig::default()
            },
            MonitorConfig {
                snapshot_timeout_ms: 0,
                ..MonitorConfig::default()
            },
            MonitorConfig {
                limits_refresh_interval_ms: 0,
                ..MonitorConfig::default()
            },
            MonitorConfig {
                report_interval_ms: 0,
                ..MonitorConfig::default()
            },
            MonitorConfig {
                retention_ms: 500,
                ..MonitorConfig::default()
            },
            MonitorConfig {
                provider: "hyperv".into(),
                ..MonitorConfig::default()
            },
            MonitorConfig {
                window_anchor: "closest".into(),
                ..MonitorConfig::default()
            },
        ];
        for cfg in cases {
            assert!(
                matches!(cfg.validate(), Err(Error::InvalidConfig(_))),
                "{cfg:?}"
            );
        }
    }

    #[test]
    fn test_config_path_env() {
        temp_env::with_var("DD_RESMON_CONFIG", Some("/tmp/custom.yaml"), || {
            assert_eq!(config_path(), PathBuf::from("/tmp/custom.yaml"));
        });
        temp_env::with_var_unset("DD_RESMON_CONFIG", || {
            assert_eq!(config_path(), PathBuf::from(DEFAULT_CONFIG_PATH));
        });
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("TRACE"), log::Level::Trace);
        assert_eq!(parse_log_level("warning"), log::Level::Warn);
        assert_eq!(parse_log_level("critical"), log::Level::Error);
        assert_eq!(parse_log_level("bogus"), log::Level::Info);
    }

    #[test]
    fn test_get_log_level_env_override() {
        let cfg = MonitorConfig {
            log_level: "error".into(),
            ..MonitorConfig::default()
        };
        temp_env::with_var("DD_LOG_LEVEL", Some("debug"), || {
            assert_eq!(get_log_level(&cfg), log::Level::Debug);
        });
        temp_env::with_var_unset("DD_LOG_LEVEL", || {
            assert_eq!(get_log_level(&cfg), log::Level::Error);
        });
    }
}
