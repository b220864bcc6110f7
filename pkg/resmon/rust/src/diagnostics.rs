// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::provider::ProviderKind;
use crate::sample::{Sample, SystemResources};
use log::Level;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    /// The cumulative CPU counter went backwards.
    Reset,
    /// The CPU counter advanced faster than the allocation allows.
    ImplausibleJump,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyKind::Reset => write!(f, "reset"),
            AnomalyKind::ImplausibleJump => write!(f, "implausible jump"),
        }
    }
}

/// Events the monitor recovers from locally but reports for operator visibility.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    SnapshotUnavailable {
        provider: ProviderKind,
        error: String,
    },
    SnapshotTimeout {
        provider: ProviderKind,
        timeout: Duration,
    },
    CounterAnomaly {
        kind: AnomalyKind,
        start: Sample,
        end: Sample,
    },
    QuotaResolutionFailure {
        provider: ProviderKind,
        error: String,
    },
    ResourcesChanged {
        previous: SystemResources,
        current: SystemResources,
    },
    /// The sampler task exited on its own and no new samples will arrive
    /// until the monitor is started again.
    SamplerFailed {
        provider: ProviderKind,
        error: String,
    },
}

impl DiagnosticEvent {
    pub fn level(&self) -> Level {
        match self {
            DiagnosticEvent::ResourcesChanged { .. } => Level::Info,
            DiagnosticEvent::SamplerFailed { .. } => Level::Error,
            _ => Level::Warn,
        }
    }
}

impl fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticEvent::SnapshotUnavailable { provider, error } => {
                write!(f, "[{provider}] snapshot unavailable, skipping tick: {error}")
            }
            DiagnosticEvent::SnapshotTimeout { provider, timeout } => write!(
                f,
                "[{provider}] snapshot read exceeded {}ms, tick abandoned",
                timeout.as_millis()
            ),
            DiagnosticEvent::CounterAnomaly { kind, start, end } => {
                write!(f, "cpu counter anomaly ({kind}) between [{start}] and [{end}]")
            }
            DiagnosticEvent::QuotaResolutionFailure { provider, error } => write!(
                f,
                "[{provider}] could not resolve quota, using host totals: {error}"
            ),
            DiagnosticEvent::ResourcesChanged { previous, current } => {
                write!(f, "system resources changed from ({previous}) to ({current})")
            }
            DiagnosticEvent::SamplerFailed { provider, error } => {
                write!(f, "[{provider}] sampler stopped, no further samples: {error}")
            }
        }
    }
}

/// Receiver for diagnostic events. The monitor emits, the sink decides
/// how events are displayed or stored.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, event: DiagnosticEvent);
}

/// Writes each event as a single `log` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn emit(&self, event: DiagnosticEvent) {
        log::log!(event.level(), "{event}");
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, matches: impl Fn(&DiagnosticEvent) -> bool) -> usize {
        self.events().iter().filter(|e| matches(e)).count()
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, event: DiagnosticEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Renders an error and its source chain on one line.
pub(crate) fn describe(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
