// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Host process accounting, used when no cgroup hierarchy is available.
//!
//! CPU time is the process's own user+system time (or, on Windows, the
//! accounting of the job object it belongs to). Memory is the resident set
//! reported by `sysinfo`.

use super::{ProviderKind, SnapshotProvider};
use crate::errors::{Error, Result};
use crate::sample::{Quota, Snapshot};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

pub struct HostProvider {
    system: System,
    pid: Pid,
}

impl std::fmt::Debug for HostProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProvider").field("pid", &self.pid).finish()
    }
}

impl HostProvider {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| Error::unavailable(format!("resolving current pid: {e}")))?;
        Ok(Self {
            system: System::new(),
            pid,
        })
    }

    fn read_memory(&mut self) -> Result<u64> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system
            .process(self.pid)
            .map(|process| process.memory())
            .ok_or_else(|| Error::unavailable(format!("process {} not found", self.pid)))
    }
}

impl SnapshotProvider for HostProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Host
    }

    fn read_snapshot(&mut self) -> Result<Snapshot> {
        let cpu_time_consumed_nanos = platform::cpu_time_nanos()?;
        let memory_used_bytes = self.read_memory()?;
        Ok(Snapshot {
            cpu_time_consumed_nanos,
            memory_used_bytes,
        })
    }

    fn read_quota(&mut self) -> Result<Quota> {
        platform::quota()
    }
}

#[cfg(unix)]
mod platform {
    use crate::errors::{Error, Result};
    use crate::sample::Quota;
    use nix::sys::resource::{UsageWho, getrusage};
    use nix::sys::time::TimeVal;

    fn timeval_nanos(tv: TimeVal) -> u64 {
        let secs = u64::try_from(i64::from(tv.tv_sec())).unwrap_or(0);
        let micros = u64::try_from(i64::from(tv.tv_usec())).unwrap_or(0);
        secs.saturating_mul(1_000_000_000)
            .saturating_add(micros.saturating_mul(1_000))
    }

    pub(super) fn cpu_time_nanos() -> Result<u64> {
        let usage = getrusage(UsageWho::RUSAGE_SELF).map_err(|errno| {
            Error::unavailable_io("getrusage(RUSAGE_SELF)", std::io::Error::from(errno))
        })?;
        Ok(timeval_nanos(usage.user_time()).saturating_add(timeval_nanos(usage.system_time())))
    }

    /// Plain processes carry no quota outside a cgroup.
    pub(super) fn quota() -> Result<Quota> {
        Ok(Quota::unconstrained())
    }

}

#[cfg(windows)]
mod platform {
    use crate::errors::{Error, Result};
    use crate::sample::Quota;
    use std::ffi::c_void;
    use std::mem;
    use std::ptr;
    use windows_sys::Win32::Foundation::FILETIME;
    use windows_sys::Win32::System::JobObjects::{
        IsProcessInJob, JOB_OBJECT_CPU_RATE_CONTROL_ENABLE, JOB_OBJECT_CPU_RATE_CONTROL_HARD_CAP,
        JOB_OBJECT_CPU_RATE_CONTROL_MIN_MAX_RATE, JOB_OBJECT_LIMIT_JOB_MEMORY,
        JOB_OBJECT_LIMIT_PROCESS_MEMORY, JOBOBJECT_BASIC_ACCOUNTING_INFORMATION,
        JOBOBJECT_CPU_RATE_CONTROL_INFORMATION, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JOBOBJECTINFOCLASS, JobObjectBasicAccountingInformation,
        JobObjectCpuRateControlInformation, JobObjectExtendedLimitInformation,
        QueryInformationJobObject,
    };
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, GetProcessTimes};

    /// Job CPU rates are expressed in 1/100th of a percent of all cores.
    const CPU_RATE_SCALE: f64 = 10_000.0;

    fn in_job() -> bool {
        let mut result = 0;
        // SAFETY: the pseudo handle from GetCurrentProcess is always valid and
        // a null job handle asks about any job; `result` outlives the call.
        let ok = unsafe { IsProcessInJob(GetCurrentProcess(), ptr::null_mut(), &mut result) };
        ok != 0 && result != 0
    }

    /// Queries the job of the calling process. `T` must be the structure
    /// matching `class`.
    fn query_job<T>(class: JOBOBJECTINFOCLASS) -> std::io::Result<T> {
        // SAFETY: T is one of the plain-data JOBOBJECT_* structures, valid
        // when zeroed, and the length passed matches its size.
        unsafe {
            let mut info: T = mem::zeroed();
            let ok = QueryInformationJobObject(
                ptr::null_mut(),
                class,
                &mut info as *mut T as *mut c_void,
                mem::size_of::<T>() as u32,
                ptr::null_mut(),
            );
            if ok == 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(info)
        }
    }

    fn filetime_ticks(ft: &FILETIME) -> u64 {
        (u64::from(ft.dwHighDateTime) << 32) | u64::from(ft.dwLowDateTime)
    }

    pub(super) fn cpu_time_nanos() -> Result<u64> {
        if in_job() {
            let info: JOBOBJECT_BASIC_ACCOUNTING_INFORMATION =
                query_job(JobObjectBasicAccountingInformation).map_err(|e| {
                    Error::unavailable_io("querying job accounting information", e)
                })?;
            let ticks = u64::try_from(info.TotalUserTime.saturating_add(info.TotalKernelTime))
                .unwrap_or(0);
            return Ok(ticks.saturating_mul(100));
        }

        // SAFETY: all out-pointers reference live, writable FILETIMEs.
        unsafe {
            let mut creation: FILETIME = mem::zeroed();
            let mut exit: FILETIME = mem::zeroed();
            let mut kernel: FILETIME = mem::zeroed();
            let mut user: FILETIME = mem::zeroed();
            let ok = GetProcessTimes(
                GetCurrentProcess(),
                &mut creation,
                &mut exit,
                &mut kernel,
                &mut user,
            );
            if ok == 0 {
                return Err(Error::unavailable_io(
                    "GetProcessTimes",
                    std::io::Error::last_os_error(),
                ));
            }
            let ticks = filetime_ticks(&kernel).saturating_add(filetime_ticks(&user));
            Ok(ticks.saturating_mul(100))
        }
    }

    fn logical_cpus() -> f64 {
        std::thread::available_parallelism()
            .map(|n| n.get() as f64)
            .unwrap_or(1.0)
    }

    pub(super) fn quota() -> Result<Quota> {
        if !in_job() {
            return Ok(Quota::unconstrained());
        }

        let mut quota = Quota::unconstrained();
        let rate: JOBOBJECT_CPU_RATE_CONTROL_INFORMATION =
            query_job(JobObjectCpuRateControlInformation).map_err(|e| Error::QuotaResolution {
                context: format!("querying job cpu rate control: {e}"),
            })?;
        let cores = logical_cpus();
        if rate.ControlFlags & JOB_OBJECT_CPU_RATE_CONTROL_ENABLE != 0 {
            // SAFETY: the active union member is selected by ControlFlags.
            unsafe {
                if rate.ControlFlags & JOB_OBJECT_CPU_RATE_CONTROL_HARD_CAP != 0 {
                    quota.cpu_limit_units =
                        Some(f64::from(rate.Anonymous.CpuRate) / CPU_RATE_SCALE * cores);
                } else if rate.ControlFlags & JOB_OBJECT_CPU_RATE_CONTROL_MIN_MAX_RATE != 0 {
                    let rates = rate.Anonymous.Anonymous;
                    quota.cpu_limit_units =
                        Some(f64::from(rates.MaxRate) / CPU_RATE_SCALE * cores);
                    if rates.MinRate > 0 {
                        quota.cpu_request_units =
                            Some(f64::from(rates.MinRate) / CPU_RATE_SCALE * cores);
                    }
                }
            }
        }

        let limits: JOBOBJECT_EXTENDED_LIMIT_INFORMATION =
            query_job(JobObjectExtendedLimitInformation).map_err(|e| Error::QuotaResolution {
                context: format!("querying job extended limits: {e}"),
            })?;
        let flags = limits.BasicLimitInformation.LimitFlags;
        if flags & JOB_OBJECT_LIMIT_JOB_MEMORY != 0 {
            quota.memory_limit_bytes = Some(limits.JobMemoryLimit as u64);
        } else if flags & JOB_OBJECT_LIMIT_PROCESS_MEMORY != 0 {
            quota.memory_limit_bytes = Some(limits.ProcessMemoryLimit as u64);
        }
        Ok(quota)
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use crate::errors::{Error, Result};
    use crate::sample::Quota;

    pub(super) fn cpu_time_nanos() -> Result<u64> {
        Err(Error::unavailable("process cpu accounting is not supported on this platform"))
    }

    pub(super) fn quota() -> Result<Quota> {
        Ok(Quota::unconstrained())
    }
}
