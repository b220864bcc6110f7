// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;
use std::time::Duration;

/// Raw counters as read by a snapshot provider, before the sampler stamps them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Cumulative CPU time consumed, in nanoseconds.
    pub cpu_time_consumed_nanos: u64,
    /// Memory currently resident, in bytes.
    pub memory_used_bytes: u64,
}

impl Snapshot {
    pub fn at(self, timestamp: Duration) -> Sample {
        Sample {
            timestamp,
            cpu_time_consumed_nanos: self.cpu_time_consumed_nanos,
            memory_used_bytes: self.memory_used_bytes,
        }
    }
}

/// One point-in-time reading. Immutable once recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Monotonic timestamp relative to the monitor clock's origin.
    pub timestamp: Duration,
    /// Cumulative CPU time consumed, in nanoseconds. Monotonic, but may reset.
    pub cpu_time_consumed_nanos: u64,
    /// Memory gauge, in bytes.
    pub memory_used_bytes: u64,
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "t={:.3}s cpu={}ns mem={}B",
            self.timestamp.as_secs_f64(),
            self.cpu_time_consumed_nanos,
            self.memory_used_bytes
        )
    }
}

/// Limits read from the platform. `None` means no limit is configured.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Quota {
    /// Hard CPU ceiling, in fractional cores.
    pub cpu_limit_units: Option<f64>,
    /// CPU the workload is guaranteed (request/shares), in fractional cores.
    pub cpu_request_units: Option<f64>,
    /// Hard memory ceiling, in bytes.
    pub memory_limit_bytes: Option<u64>,
}

impl Quota {
    pub fn unconstrained() -> Self {
        Self::default()
    }
}

/// The denominator used for percentages. Replaced as a whole on refresh,
/// never mutated in place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemResources {
    pub guaranteed_cpu_units: f64,
    pub maximum_cpu_units: f64,
    pub guaranteed_memory_bytes: u64,
    pub maximum_memory_bytes: u64,
}

impl fmt::Display for SystemResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={:.2}/{:.2} cores, memory={}/{} bytes",
            self.guaranteed_cpu_units,
            self.maximum_cpu_units,
            self.guaranteed_memory_bytes,
            self.maximum_memory_bytes
        )
    }
}

/// A windowed utilization reading returned to callers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Utilization {
    /// CPU consumed over the window relative to `maximum_cpu_units`, in [0, 100].
    pub cpu_percentage: f64,
    /// Memory in use at the most recent sample.
    pub memory_used_bytes: u64,
    pub system_resources: SystemResources,
    /// Span actually covered by the samples used, which may be shorter than
    /// the requested window while the series is still filling.
    pub window: Duration,
}

impl Utilization {
    /// Memory in use relative to `maximum_memory_bytes`, in [0, 100].
    pub fn memory_percentage(&self) -> f64 {
        if self.system_resources.maximum_memory_bytes == 0 {
            return 0.0;
        }
        let pct = self.memory_used_bytes as f64
            / self.system_resources.maximum_memory_bytes as f64
            * 100.0;
        pct.min(100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(max_mem: u64) -> SystemResources {
        SystemResources {
            guaranteed_cpu_units: 1.0,
            maximum_cpu_units: 1.0,
            guaranteed_memory_bytes: max_mem,
            maximum_memory_bytes: max_mem,
        }
    }

    #[test]
    fn test_snapshot_at_stamps_timestamp() {
        let sample = Snapshot {
            cpu_time_consumed_nanos: 42,
            memory_used_bytes: 7,
        }
        .at(Duration::from_secs(3));
        assert_eq!(sample.timestamp, Duration::from_secs(3));
        assert_eq!(sample.cpu_time_consumed_nanos, 42);
        assert_eq!(sample.memory_used_bytes, 7);
    }

    #[test]
    fn test_memory_percentage() {
        let u = Utilization {
            cpu_percentage: 0.0,
            memory_used_bytes: 256,
            system_resources: resources(1024),
            window: Duration::ZERO,
        };
        assert_eq!(u.memory_percentage(), 25.0);
    }

    #[test]
    fn test_memory_percentage_clamped_and_zero_limit() {
        let over = Utilization {
            cpu_percentage: 0.0,
            memory_used_bytes: 4096,
            system_resources: resources(1024),
            window: Duration::ZERO,
        };
        assert_eq!(over.memory_percentage(), 100.0);

        let zero = Utilization {
            system_resources: resources(0),
            ..over
        };
        assert_eq!(zero.memory_percentage(), 0.0);
    }
}
