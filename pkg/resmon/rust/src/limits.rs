// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Resolves the percentage denominator from the host capacity and the
//! quota reported by the snapshot provider.

use crate::diagnostics::{DiagnosticEvent, DiagnosticSink, describe};
use crate::errors::Result;
use crate::provider::ProviderKind;
use crate::sample::{Quota, SystemResources};
use log::debug;
use sysinfo::System;

/// Host-wide totals used when no tighter quota applies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostCapacity {
    pub logical_cpus: f64,
    /// 0 when the physical memory size could not be determined.
    pub physical_memory_bytes: u64,
}

impl HostCapacity {
    pub fn detect() -> Self {
        let logical_cpus = std::thread::available_parallelism()
            .map(|n| n.get() as f64)
            .unwrap_or(1.0);

        let mut system = System::new();
        system.refresh_memory();
        let physical_memory_bytes = system.total_memory();

        debug!("host capacity: {logical_cpus} logical cpus, {physical_memory_bytes} bytes of memory");
        Self {
            logical_cpus,
            physical_memory_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LimitsResolver {
    host: HostCapacity,
}

impl LimitsResolver {
    pub fn new(host: HostCapacity) -> Self {
        Self { host }
    }

    pub fn host(&self) -> HostCapacity {
        self.host
    }

    /// Resources with no quota applied.
    pub fn host_totals(&self) -> SystemResources {
        self.apply(&Quota::unconstrained())
    }

    /// Bounds `quota` by the host capacity.
    ///
    /// Unset or non-positive limits fall back to host totals. A CPU request
    /// above the maximum is capped at the maximum.
    pub fn apply(&self, quota: &Quota) -> SystemResources {
        let host_cpus = self.host.logical_cpus;
        let maximum_cpu_units = match quota.cpu_limit_units {
            Some(limit) if limit.is_finite() && limit > 0.0 => limit.min(host_cpus),
            _ => host_cpus,
        };
        let guaranteed_cpu_units = match quota.cpu_request_units {
            Some(request) if request.is_finite() && request > 0.0 => {
                request.min(maximum_cpu_units)
            }
            _ => maximum_cpu_units,
        };

        let host_memory = self.host.physical_memory_bytes;
        let maximum_memory_bytes = match quota.memory_limit_bytes {
            Some(limit) if limit > 0 && host_memory > 0 => limit.min(host_memory),
            Some(limit) if limit > 0 => limit,
            _ => host_memory,
        };

        SystemResources {
            guaranteed_cpu_units,
            maximum_cpu_units,
            guaranteed_memory_bytes: maximum_memory_bytes,
            maximum_memory_bytes,
        }
    }

    /// Turns the outcome of a quota read into resources. A failed read is
    /// reported to `sink` and degrades to host totals.
    pub fn resolve(
        &self,
        quota: Result<Quota>,
        provider: ProviderKind,
        sink: &dyn DiagnosticSink,
    ) -> SystemResources {
        match quota {
            Ok(quota) => self.apply(&quota),
            Err(e) => {
                sink.emit(DiagnosticEvent::QuotaResolutionFailure {
                    provider,
                    error: describe(&e),
                });
                self.host_totals()
            }
        }
    }
}
