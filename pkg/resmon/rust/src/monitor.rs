// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! The query surface and lifecycle of the monitor.
//!
//! Queries read the shared series and resources without locking and never
//! wait on the sampler. Only `start`/`stop` take the lifecycle mutex.

use crate::aggregator::Aggregator;
use crate::clock::{Clock, MonotonicClock};
use crate::config::MonitorConfig;
use crate::diagnostics::{DiagnosticSink, LogSink};
use crate::errors::{Error, Result};
use crate::limits::{HostCapacity, LimitsResolver};
use crate::provider::{self, ProviderKind, SnapshotProvider};
use crate::sample::{Sample, SystemResources, Utilization};
use crate::sampler::{CounterGuard, Sampler};
use crate::state::SamplerState;
use crate::timeseries::TimeSeries;
use arc_swap::{ArcSwap, ArcSwapOption};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

type SamplerTask = JoinHandle<Option<Box<dyn SnapshotProvider>>>;

#[derive(Default)]
struct Lifecycle {
    state: SamplerState,
    /// Held while stopped, so a restart reuses the probed provider.
    provider: Option<Box<dyn SnapshotProvider>>,
    provider_kind: Option<ProviderKind>,
    task: Option<SamplerTask>,
    shutdown: Option<watch::Sender<bool>>,
}

impl Lifecycle {
    /// Moves to `Stopped` if the sampler task ended without being asked to.
    fn reap(&mut self) {
        if self.state.is_running() && self.task.as_ref().is_some_and(JoinHandle::is_finished) {
            warn!("sampler task exited on its own, resource monitor is stopped");
            self.task = None;
            self.shutdown = None;
            self.transition(SamplerState::Stopped);
        }
    }

    fn transition(&mut self, next: SamplerState) {
        if !self.state.can_transition_to(next) {
            warn!("unexpected sampler transition {} -> {next}", self.state);
        }
        self.state = next;
    }
}

/// Builds a [`ResourceMonitor`] with optional injected collaborators.
pub struct MonitorBuilder {
    config: MonitorConfig,
    provider: Option<Box<dyn SnapshotProvider>>,
    clock: Option<Arc<dyn Clock>>,
    sink: Option<Arc<dyn DiagnosticSink>>,
    host: Option<HostCapacity>,
}

impl MonitorBuilder {
    /// Uses `provider` instead of probing the environment at start.
    pub fn provider(mut self, provider: Box<dyn SnapshotProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn host_capacity(mut self, host: HostCapacity) -> Self {
        self.host = Some(host);
        self
    }

    pub fn build(self) -> ResourceMonitor {
        let config = self.config;
        let sink = self.sink.unwrap_or_else(|| Arc::new(LogSink));
        let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let resolver = LimitsResolver::new(self.host.unwrap_or_else(HostCapacity::detect));

        // an invalid anchor is reported by start()
        let anchor = config.window_anchor().unwrap_or_default();
        let series = TimeSeries::with_retention(config.retention(), config.sampling_interval());
        debug!(
            "time series capacity {} samples ({}ms retention, {}ms interval)",
            series.capacity(),
            config.retention_ms,
            config.sampling_interval_ms
        );

        ResourceMonitor {
            series: Arc::new(series),
            guard: Arc::new(Mutex::new(CounterGuard::new())),
            resources: Arc::new(ArcSwap::from_pointee(resolver.host_totals())),
            aggregator: Aggregator::new(anchor, Arc::clone(&sink)),
            last_good: ArcSwapOption::empty(),
            resolver,
            clock,
            sink,
            lifecycle: Mutex::new(Lifecycle {
                provider: self.provider,
                ..Lifecycle::default()
            }),
            config,
        }
    }
}

/// Continuously samples CPU and memory and answers windowed utilization
/// queries.
///
/// `start` needs a tokio runtime. Queries may be issued from any thread,
/// before, during and after sampling; after `stop` they keep serving the
/// data collected so far.
pub struct ResourceMonitor {
    config: MonitorConfig,
    series: Arc<TimeSeries>,
    /// Outlives sampler tasks, so samples after a restart continue the
    /// rebased counter already stored in `series`.
    guard: Arc<Mutex<CounterGuard>>,
    resources: Arc<ArcSwap<SystemResources>>,
    aggregator: Aggregator,
    last_good: ArcSwapOption<Utilization>,
    resolver: LimitsResolver,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn DiagnosticSink>,
    lifecycle: Mutex<Lifecycle>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: MonitorConfig) -> MonitorBuilder {
        MonitorBuilder {
            config,
            provider: None,
            clock: None,
            sink: None,
            host: None,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        match self.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Also reports `Stopped` once the sampler has failed on its own.
    pub fn state(&self) -> SamplerState {
        let mut lifecycle = self.lifecycle();
        lifecycle.reap();
        lifecycle.state
    }

    /// The provider in use, once the monitor has been started.
    pub fn provider_kind(&self) -> Option<ProviderKind> {
        self.lifecycle().provider_kind
    }

    /// Starts the sampler on the current tokio runtime.
    ///
    /// A no-op while already running. Configuration errors, including an
    /// explicitly requested provider that is not available, are returned
    /// before any task is spawned.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        lifecycle.reap();
        match lifecycle.state {
            SamplerState::Running => {
                debug!("start requested while running, ignoring");
                return Ok(());
            }
            SamplerState::Stopping => return Err(Error::Stopping),
            SamplerState::Stopped => {}
        }

        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let mut provider = match lifecycle.provider.take() {
            Some(provider) => provider,
            None => provider::probe(
                self.config.provider_selection()?,
                &self.config.probe_paths(),
            )?,
        };
        let kind = provider.kind();

        let initial = self
            .resolver
            .resolve(provider.read_quota(), kind, self.sink.as_ref());
        self.resources.store(Arc::new(initial));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let sampler = Sampler::new(
            provider,
            self.config.sampler_settings(),
            Arc::clone(&self.series),
            Arc::clone(&self.guard),
            Arc::clone(&self.resources),
            self.resolver,
            Arc::clone(&self.clock),
            Arc::clone(&self.sink),
        );
        lifecycle.task = Some(runtime.spawn(sampler.run(shutdown_rx)));
        lifecycle.shutdown = Some(shutdown);
        lifecycle.provider_kind = Some(kind);
        lifecycle.transition(SamplerState::Running);

        info!("resource monitor started ({kind}, {initial})");
        Ok(())
    }

    /// Signals the sampler and waits for its in-flight tick to finish.
    ///
    /// A no-op unless running. A concurrent second call returns immediately
    /// while the first is still waiting.
    pub async fn stop(&self) {
        let (task, shutdown) = {
            let mut lifecycle = self.lifecycle();
            lifecycle.reap();
            if !lifecycle.state.is_running() {
                return;
            }
            lifecycle.transition(SamplerState::Stopping);
            (lifecycle.task.take(), lifecycle.shutdown.take())
        };

        if let Some(shutdown) = shutdown {
            shutdown.send_replace(true);
        }
        let provider = match task {
            Some(task) => match task.await {
                Ok(provider) => provider,
                Err(e) => {
                    error!("sampler task failed: {e}");
                    None
                }
            },
            None => None,
        };

        let mut lifecycle = self.lifecycle();
        lifecycle.provider = provider;
        lifecycle.transition(SamplerState::Stopped);
        info!("resource monitor stopped");
    }

    /// Utilization over the last `window`.
    ///
    /// Until two samples exist this fails with `InsufficientData`, unless a
    /// result was computed before, in which case that result is returned.
    pub fn get_utilization(&self, window: Duration) -> Result<Utilization> {
        let resources = **self.resources.load();
        let samples = self.series.snapshot();
        let now = self.clock.now();
        let previous_cpu = self
            .last_good
            .load()
            .as_ref()
            .map(|last| last.cpu_percentage);

        match self
            .aggregator
            .compute(&samples, &resources, window, now, previous_cpu)
        {
            Ok(utilization) => {
                self.last_good.store(Some(Arc::new(utilization)));
                Ok(utilization)
            }
            Err(Error::InsufficientData { available }) => match self.last_good.load_full() {
                Some(last) => Ok(*last),
                None => Err(Error::InsufficientData { available }),
            },
            Err(e) => Err(e),
        }
    }

    pub fn system_resources(&self) -> SystemResources {
        **self.resources.load()
    }

    pub fn latest_sample(&self) -> Option<Sample> {
        self.series.latest()
    }

    /// Point-in-time copy of the retained samples, oldest first.
    pub fn samples(&self) -> Vec<Sample> {
        self.series.snapshot()
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        let lifecycle = match self.lifecycle.get_mut() {
            Ok(lifecycle) => lifecycle,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(shutdown) = lifecycle.shutdown.take() {
            debug!("resource monitor dropped while running, cancelling sampler");
            shutdown.send_replace(true);
        }
    }
}
