// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Windowed utilization over a point-in-time copy of the sample series.

use crate::clock::duration_to_nanos;
use crate::diagnostics::{AnomalyKind, DiagnosticEvent, DiagnosticSink};
use crate::errors::{Error, Result};
use crate::sample::{Sample, SystemResources, Utilization};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A rate above this multiple of the CPU allocation is reported as an
/// implausible jump.
const IMPLAUSIBLE_RATE_FACTOR: f64 = 4.0;

/// Which sample starts the window `[now - window, now]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowAnchor {
    /// The nearest sample at or before the window start, so the span used
    /// covers the whole requested window whenever history allows.
    #[default]
    AtOrBefore,
    /// The oldest sample inside the window, so the span never exceeds it.
    Within,
}

impl fmt::Display for WindowAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowAnchor::AtOrBefore => write!(f, "at-or-before"),
            WindowAnchor::Within => write!(f, "within"),
        }
    }
}

impl FromStr for WindowAnchor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "at-or-before" | "at_or_before" => Ok(WindowAnchor::AtOrBefore),
            "within" => Ok(WindowAnchor::Within),
            other => Err(Error::InvalidConfig(format!(
                "unknown window anchor {other:?} (expected at-or-before or within)"
            ))),
        }
    }
}

pub struct Aggregator {
    anchor: WindowAnchor,
    sink: Arc<dyn DiagnosticSink>,
    /// Timestamp (nanos + 1) of the newest end sample already reported, per
    /// anomaly kind. Queries over the same data report an anomaly once.
    reported_reset: AtomicU64,
    reported_jump: AtomicU64,
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("anchor", &self.anchor)
            .finish_non_exhaustive()
    }
}

impl Aggregator {
    pub fn new(anchor: WindowAnchor, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            anchor,
            sink,
            reported_reset: AtomicU64::new(0),
            reported_jump: AtomicU64::new(0),
        }
    }

    pub fn anchor(&self) -> WindowAnchor {
        self.anchor
    }

    /// Picks the `(start, end)` pair for `window` ending at `now`.
    ///
    /// `samples` must be strictly ordered by timestamp. When history is
    /// shorter than the window the oldest sample is used, and when the
    /// anchor lands on the newest sample its predecessor is used instead.
    pub fn select<'a>(
        &self,
        samples: &'a [Sample],
        window: Duration,
        now: Duration,
    ) -> Result<(&'a Sample, &'a Sample)> {
        let [.., before_last, end] = samples else {
            return Err(Error::InsufficientData {
                available: samples.len(),
            });
        };

        let window_start = now.saturating_sub(window);
        let candidate = match self.anchor {
            WindowAnchor::AtOrBefore => {
                // index of the first sample after the window start
                let after = samples.partition_point(|s| s.timestamp <= window_start);
                samples.get(after.saturating_sub(1))
            }
            WindowAnchor::Within => {
                let first_inside = samples.partition_point(|s| s.timestamp < window_start);
                samples.get(first_inside)
            }
        };

        let start = match candidate {
            Some(start) if start.timestamp < end.timestamp => start,
            _ => before_last,
        };
        Ok((start, end))
    }

    /// Computes utilization over `window` ending at `now`.
    ///
    /// `previous_cpu` is the last successfully computed CPU percentage, used
    /// when the selected samples share a timestamp.
    pub fn compute(
        &self,
        samples: &[Sample],
        resources: &SystemResources,
        window: Duration,
        now: Duration,
        previous_cpu: Option<f64>,
    ) -> Result<Utilization> {
        let (start, end) = self.select(samples, window, now)?;

        let cpu_delta = match end
            .cpu_time_consumed_nanos
            .checked_sub(start.cpu_time_consumed_nanos)
        {
            Some(delta) => delta,
            None => {
                self.report(AnomalyKind::Reset, start, end);
                0
            }
        };

        let wall_delta = end.timestamp.saturating_sub(start.timestamp);
        let cpu_percentage = if wall_delta.is_zero() {
            previous_cpu.unwrap_or(0.0)
        } else {
            let rate = cpu_delta as f64 / wall_delta.as_nanos() as f64;
            if rate > resources.maximum_cpu_units * IMPLAUSIBLE_RATE_FACTOR {
                self.report(AnomalyKind::ImplausibleJump, start, end);
            }
            cpu_percentage(rate, resources.maximum_cpu_units)
        };

        Ok(Utilization {
            cpu_percentage,
            memory_used_bytes: end.memory_used_bytes,
            system_resources: *resources,
            window: wall_delta,
        })
    }

    fn report(&self, kind: AnomalyKind, start: &Sample, end: &Sample) {
        let reported = match kind {
            AnomalyKind::Reset => &self.reported_reset,
            AnomalyKind::ImplausibleJump => &self.reported_jump,
        };
        let key = duration_to_nanos(end.timestamp).saturating_add(1);
        if reported.fetch_max(key, Ordering::AcqRel) < key {
            self.sink.emit(DiagnosticEvent::CounterAnomaly {
                kind,
                start: *start,
                end: *end,
            });
        }
    }
}

/// `rate` is in cores; the result is clamped to [0, 100].
fn cpu_percentage(rate: f64, maximum_cpu_units: f64) -> f64 {
    if maximum_cpu_units.is_nan() || maximum_cpu_units <= 0.0 || !rate.is_finite() {
        return 0.0;
    }
    (rate / maximum_cpu_units * 100.0).clamp(0.0, 100.0)
}
