// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::indexing_slicing
    )
)]

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod diagnostics;
mod errors;
pub mod limits;
mod monitor;
pub mod provider;
mod sample;
pub mod sampler;
mod state;
pub mod timeseries;

// Re-export the public API
pub use aggregator::{Aggregator, WindowAnchor};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::MonitorConfig;
pub use diagnostics::{AnomalyKind, CollectingSink, DiagnosticEvent, DiagnosticSink, LogSink};
pub use errors::{Error, Result};
pub use limits::{HostCapacity, LimitsResolver};
pub use monitor::{MonitorBuilder, ResourceMonitor};
pub use provider::{ProviderKind, ProviderSelection, SnapshotProvider};
pub use sample::{Quota, Sample, Snapshot, SystemResources, Utilization};
pub use sampler::{CounterGuard, SamplerSettings};
pub use state::SamplerState;
pub use timeseries::TimeSeries;
