// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! The background loop that feeds the time series.
//!
//! The sampler is the series' only writer. Each tick reads the provider on
//! the blocking pool under a deadline; a read that overruns is abandoned for
//! that tick and no new read starts until it has returned, so reads never
//! overlap. Every `limits_refresh_ticks` ticks the same blocking call also
//! reads the quota and the resolved resources are published by swap.

use crate::clock::Clock;
use crate::diagnostics::{AnomalyKind, DiagnosticEvent, DiagnosticSink, describe};
use crate::errors::Result;
use crate::limits::LimitsResolver;
use crate::provider::{ProviderKind, SnapshotProvider};
use crate::sample::{Quota, Sample, SystemResources};
use crate::timeseries::TimeSeries;
use arc_swap::ArcSwap;
use log::debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerSettings {
    pub interval: Duration,
    pub snapshot_timeout: Duration,
    /// Quota is re-read every this many ticks. Never 0.
    pub limits_refresh_ticks: u64,
}

impl SamplerSettings {
    /// Converts a refresh period into a tick count, at least 1.
    pub fn refresh_ticks(refresh: Duration, interval: Duration) -> u64 {
        let interval = interval.as_nanos().max(1);
        let ticks = refresh.as_nanos().div_ceil(interval);
        u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
    }
}

/// Keeps the exported CPU counter monotonic across provider resets.
///
/// A raw reading below the previous one is reported once as a
/// [`AnomalyKind::Reset`] and the counter is rebased onto the last value
/// seen, so the aggregator never has to reason about the discontinuity.
#[derive(Debug, Default)]
pub struct CounterGuard {
    last_raw: Option<Sample>,
    offset: u64,
}

impl CounterGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, raw: Sample, sink: &dyn DiagnosticSink) -> Sample {
        if let Some(last) = self.last_raw
            && raw.cpu_time_consumed_nanos < last.cpu_time_consumed_nanos
        {
            sink.emit(DiagnosticEvent::CounterAnomaly {
                kind: AnomalyKind::Reset,
                start: last,
                end: raw,
            });
            self.offset = self.offset.saturating_add(last.cpu_time_consumed_nanos);
        }
        self.last_raw = Some(raw);
        Sample {
            cpu_time_consumed_nanos: raw.cpu_time_consumed_nanos.saturating_add(self.offset),
            ..raw
        }
    }
}

type ReadOutcome = (Box<dyn SnapshotProvider>, Result<Sample>, Option<Result<Quota>>);

enum ProviderSlot {
    Idle(Box<dyn SnapshotProvider>),
    /// A read that overran its deadline and has not been collected yet.
    Busy(JoinHandle<ReadOutcome>),
    /// The provider was lost to a panicking read.
    Lost,
}

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Stop,
}

pub(crate) struct Sampler {
    slot: ProviderSlot,
    kind: ProviderKind,
    settings: SamplerSettings,
    series: Arc<TimeSeries>,
    resources: Arc<ArcSwap<SystemResources>>,
    resolver: LimitsResolver,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn DiagnosticSink>,
    /// Shared with the monitor so a restarted sampler keeps rebasing onto
    /// the series already stored.
    guard: Arc<Mutex<CounterGuard>>,
    ticks: u64,
}

impl Sampler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        provider: Box<dyn SnapshotProvider>,
        settings: SamplerSettings,
        series: Arc<TimeSeries>,
        guard: Arc<Mutex<CounterGuard>>,
        resources: Arc<ArcSwap<SystemResources>>,
        resolver: LimitsResolver,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            kind: provider.kind(),
            slot: ProviderSlot::Idle(provider),
            settings,
            series,
            resources,
            resolver,
            clock,
            sink,
            guard,
            ticks: 0,
        }
    }

    /// Ticks until `shutdown` flips or its sender is dropped, then hands the
    /// provider back if it can be recovered.
    pub(crate) async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<Box<dyn SnapshotProvider>> {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(
            "[{}] sampler started, interval {}ms",
            self.kind,
            self.settings.interval.as_millis()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if self.tick().await == Step::Stop {
                        break;
                    }
                }
            }
        }

        debug!("[{}] sampler stopped after {} ticks", self.kind, self.ticks);
        self.into_provider().await
    }

    async fn tick(&mut self) -> Step {
        let refresh_quota = self.ticks > 0 && self.ticks % self.settings.limits_refresh_ticks == 0;
        self.ticks += 1;

        let provider = match std::mem::replace(&mut self.slot, ProviderSlot::Lost) {
            ProviderSlot::Idle(provider) => provider,
            ProviderSlot::Busy(handle) if !handle.is_finished() => {
                debug!("[{}] previous snapshot read still in flight, skipping tick", self.kind);
                self.slot = ProviderSlot::Busy(handle);
                return Step::Continue;
            }
            ProviderSlot::Busy(handle) => match handle.await {
                Ok((provider, _, _)) => {
                    debug!("[{}] discarding late snapshot result", self.kind);
                    provider
                }
                Err(e) => return self.fail(format!("snapshot read task failed: {e}")),
            },
            ProviderSlot::Lost => return self.fail("provider lost".to_string()),
        };

        let clock = Arc::clone(&self.clock);
        let mut handle = tokio::task::spawn_blocking(move || {
            let mut provider = provider;
            let sample = provider.read_snapshot().map(|snap| snap.at(clock.now()));
            let quota = refresh_quota.then(|| provider.read_quota());
            (provider, sample, quota)
        });

        match timeout(self.settings.snapshot_timeout, &mut handle).await {
            Ok(Ok((provider, sample, quota))) => {
                self.slot = ProviderSlot::Idle(provider);
                self.record(sample);
                if let Some(quota) = quota {
                    self.refresh_resources(quota);
                }
                Step::Continue
            }
            Ok(Err(e)) => self.fail(format!("snapshot read task failed: {e}")),
            Err(_) => {
                self.sink.emit(DiagnosticEvent::SnapshotTimeout {
                    provider: self.kind,
                    timeout: self.settings.snapshot_timeout,
                });
                self.slot = ProviderSlot::Busy(handle);
                Step::Continue
            }
        }
    }

    /// The provider went down with its read; no further ticks can run.
    fn fail(&self, error: String) -> Step {
        self.sink.emit(DiagnosticEvent::SamplerFailed {
            provider: self.kind,
            error,
        });
        Step::Stop
    }

    fn record(&mut self, sample: Result<Sample>) {
        match sample {
            Ok(raw) => {
                let sample = match self.guard.lock() {
                    Ok(mut guard) => guard.admit(raw, self.sink.as_ref()),
                    Err(poisoned) => poisoned.into_inner().admit(raw, self.sink.as_ref()),
                };
                if !self.series.push(sample) {
                    debug!("[{}] dropping sample [{sample}], not newer than the latest", self.kind);
                }
            }
            Err(e) => self.sink.emit(DiagnosticEvent::SnapshotUnavailable {
                provider: self.kind,
                error: describe(&e),
            }),
        }
    }

    fn refresh_resources(&self, quota: Result<Quota>) {
        let current = self.resolver.resolve(quota, self.kind, self.sink.as_ref());
        let previous = **self.resources.load();
        if previous != current {
            self.resources.store(Arc::new(current));
            self.sink
                .emit(DiagnosticEvent::ResourcesChanged { previous, current });
        }
    }

    async fn into_provider(self) -> Option<Box<dyn SnapshotProvider>> {
        match self.slot {
            ProviderSlot::Idle(provider) => Some(provider),
            ProviderSlot::Busy(handle) => {
                match timeout(self.settings.snapshot_timeout, handle).await {
                    Ok(Ok((provider, _, _))) => Some(provider),
                    Ok(Err(e)) => {
                        debug!("[{}] snapshot read task failed at shutdown: {e}", self.kind);
                        None
                    }
                    Err(_) => {
                        debug!("[{}] abandoning snapshot read still in flight at shutdown", self.kind);
                        None
                    }
                }
            }
            ProviderSlot::Lost => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::diagnostics::CollectingSink;
    use crate::errors::Error;
    use crate::limits::HostCapacity;
    use crate::sample::Snapshot;
    use std::collections::VecDeque;

    /// Replays canned readings. Each read advances the clock by one second.
    pub(crate) struct ScriptedProvider {
        pub readings: Arc<Mutex<VecDeque<Result<Snapshot>>>>,
        pub quota: Arc<Mutex<Result<Quota>>>,
        pub delay: Option<Duration>,
        /// Panic instead of failing once the readings run out.
        pub crash_when_exhausted: bool,
        pub clock: Arc<ManualClock>,
    }

    impl ScriptedProvider {
        pub(crate) fn new(clock: Arc<ManualClock>, cpu: &[u64]) -> Self {
            let readings = cpu
                .iter()
                .map(|&cpu| {
                    Ok(Snapshot {
                        cpu_time_consumed_nanos: cpu,
                        memory_used_bytes: 1024,
                    })
                })
                .collect();
            Self {
                readings: Arc::new(Mutex::new(readings)),
                quota: Arc::new(Mutex::new(Ok(Quota::unconstrained()))),
                delay: None,
                crash_when_exhausted: false,
                clock,
            }
        }
    }

    impl SnapshotProvider for ScriptedProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Host
        }

        fn read_snapshot(&mut self) -> Result<Snapshot> {
            if let Some(delay) = self.delay.take() {
                std::thread::sleep(delay);
            }
            self.clock.advance(Duration::from_secs(1));
            let next = self.readings.lock().unwrap().pop_front();
            match next {
                Some(reading) => reading,
                None if self.crash_when_exhausted => panic!("scripted provider crashed"),
                None => Err(Error::unavailable("script exhausted")),
            }
        }

        fn read_quota(&mut self) -> Result<Quota> {
            match &*self.quota.lock().unwrap() {
                Ok(quota) => Ok(*quota),
                Err(e) => Err(Error::QuotaResolution {
                    context: e.to_string(),
                }),
            }
        }
    }

    fn host() -> LimitsResolver {
        LimitsResolver::new(HostCapacity {
            logical_cpus: 4.0,
            physical_memory_bytes: 1 << 32,
        })
    }

    struct Harness {
        sampler: Sampler,
        series: Arc<TimeSeries>,
        resources: Arc<ArcSwap<SystemResources>>,
        sink: Arc<CollectingSink>,
    }

    fn harness(provider: ScriptedProvider, settings: SamplerSettings) -> Harness {
        harness_with_guard(provider, settings, Arc::new(Mutex::new(CounterGuard::new())))
    }

    fn harness_with_guard(
        provider: ScriptedProvider,
        settings: SamplerSettings,
        guard: Arc<Mutex<CounterGuard>>,
    ) -> Harness {
        let series = Arc::new(TimeSeries::new(16));
        let resources = Arc::new(ArcSwap::from_pointee(host().host_totals()));
        let sink = Arc::new(CollectingSink::new());
        let clock = provider.clock.clone();
        let sampler = Sampler::new(
            Box::new(provider),
            settings,
            series.clone(),
            guard,
            resources.clone(),
            host(),
            clock,
            sink.clone(),
        );
        Harness {
            sampler,
            series,
            resources,
            sink,
        }
    }

    fn settings() -> SamplerSettings {
        SamplerSettings {
            interval: Duration::from_millis(10),
            snapshot_timeout: Duration::from_secs(5),
            limits_refresh_ticks: 2,
        }
    }

    fn sample(secs: u64, cpu: u64) -> Sample {
        Sample {
            timestamp: Duration::from_secs(secs),
            cpu_time_consumed_nanos: cpu,
            memory_used_bytes: 0,
        }
    }

    #[test]
    fn test_refresh_ticks() {
        let ms = Duration::from_millis;
        assert_eq!(SamplerSettings::refresh_ticks(ms(30_000), ms(1_000)), 30);
        assert_eq!(SamplerSettings::refresh_ticks(ms(2_500), ms(1_000)), 3);
        assert_eq!(SamplerSettings::refresh_ticks(ms(0), ms(1_000)), 1);
        assert_eq!(SamplerSettings::refresh_ticks(ms(10), Duration::ZERO), 10_000_000);
    }

    #[test]
    fn test_counter_guard_rebases_after_reset() {
        let sink = CollectingSink::new();
        let mut guard = CounterGuard::new();

        assert_eq!(guard.admit(sample(1, 100), &sink), sample(1, 100));
        assert_eq!(guard.admit(sample(2, 150), &sink), sample(2, 150));
        // counter restarted from zero
        assert_eq!(guard.admit(sample(3, 20), &sink), sample(3, 170));
        assert_eq!(guard.admit(sample(4, 40), &sink), sample(4, 190));

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            DiagnosticEvent::CounterAnomaly {
                kind: AnomalyKind::Reset,
                start: sample(2, 150),
                end: sample(3, 20),
            }
        );
    }

    #[tokio::test]
    async fn test_shared_guard_keeps_rebasing_across_samplers() {
        let clock = Arc::new(ManualClock::new());
        let guard = Arc::new(Mutex::new(CounterGuard::new()));

        let mut first = harness_with_guard(
            ScriptedProvider::new(clock.clone(), &[5_000, 6_000, 1_000]),
            settings(),
            guard.clone(),
        );
        for _ in 0..3 {
            first.sampler.tick().await;
        }
        assert_eq!(first.series.latest().unwrap().cpu_time_consumed_nanos, 7_000);

        let mut second = harness_with_guard(
            ScriptedProvider::new(clock, &[1_500]),
            settings(),
            guard,
        );
        second.sampler.tick().await;
        assert_eq!(second.series.latest().unwrap().cpu_time_consumed_nanos, 7_500);
        assert_eq!(
            second
                .sink
                .count(|e| matches!(e, DiagnosticEvent::CounterAnomaly { .. })),
            0
        );
    }

    #[tokio::test]
    async fn test_panicking_read_stops_and_reports() {
        let clock = Arc::new(ManualClock::new());
        let mut provider = ScriptedProvider::new(clock, &[1]);
        provider.crash_when_exhausted = true;
        let mut h = harness(provider, settings());

        assert_eq!(h.sampler.tick().await, Step::Continue);
        assert_eq!(h.sampler.tick().await, Step::Stop);
        assert!(matches!(h.sampler.slot, ProviderSlot::Lost));
        assert_eq!(
            h.sink
                .count(|e| matches!(e, DiagnosticEvent::SamplerFailed { .. })),
            1
        );
        assert!(h.sampler.into_provider().await.is_none());
    }

    #[tokio::test]
    async fn test_tick_appends_and_skips_unavailable() {
        let clock = Arc::new(ManualClock::new());
        let provider = ScriptedProvider::new(clock, &[100, 200]);
        provider
            .readings
            .lock()
            .unwrap()
            .insert(1, Err(Error::unavailable("cpu.stat vanished")));
        let mut h = harness(provider, settings());

        assert_eq!(h.sampler.tick().await, Step::Continue);
        assert_eq!(h.sampler.tick().await, Step::Continue);
        assert_eq!(h.series.len(), 1, "failed tick must not append");
        assert_eq!(h.series.latest().unwrap().cpu_time_consumed_nanos, 100);

        assert_eq!(h.sampler.tick().await, Step::Continue);
        let snap = h.series.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[1].cpu_time_consumed_nanos, 200);
        assert_eq!(snap[1].timestamp, Duration::from_secs(3));

        assert_eq!(
            h.sink
                .count(|e| matches!(e, DiagnosticEvent::SnapshotUnavailable { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_quota_refresh_publishes_changes() {
        let clock = Arc::new(ManualClock::new());
        let provider = ScriptedProvider::new(clock, &[1, 2, 3, 4, 5]);
        let quota = provider.quota.clone();
        let mut h = harness(provider, settings());

        *quota.lock().unwrap() = Ok(Quota {
            cpu_limit_units: Some(1.0),
            cpu_request_units: None,
            memory_limit_bytes: Some(1 << 20),
        });

        // tick 0 never refreshes, tick 2 does
        h.sampler.tick().await;
        h.sampler.tick().await;
        assert_eq!(h.resources.load().maximum_cpu_units, 4.0);
        h.sampler.tick().await;
        assert_eq!(h.resources.load().maximum_cpu_units, 1.0);
        assert_eq!(h.resources.load().maximum_memory_bytes, 1 << 20);
        assert_eq!(
            h.sink
                .count(|e| matches!(e, DiagnosticEvent::ResourcesChanged { .. })),
            1
        );

        // unchanged quota is not re-announced; a failing one falls back to host totals
        h.sampler.tick().await;
        *quota.lock().unwrap() = Err(Error::InvalidConfig("boom".into()));
        h.sampler.tick().await;
        assert_eq!(**h.resources.load(), host().host_totals());
        assert_eq!(
            h.sink
                .count(|e| matches!(e, DiagnosticEvent::QuotaResolutionFailure { .. })),
            1
        );
        assert_eq!(
            h.sink
                .count(|e| matches!(e, DiagnosticEvent::ResourcesChanged { .. })),
            2
        );
    }

    #[tokio::test]
    async fn test_slow_read_times_out_and_is_not_overlapped() {
        let clock = Arc::new(ManualClock::new());
        let mut provider = ScriptedProvider::new(clock, &[10, 20, 30]);
        provider.delay = Some(Duration::from_millis(300));
        let mut h = harness(
            provider,
            SamplerSettings {
                snapshot_timeout: Duration::from_millis(20),
                ..settings()
            },
        );

        h.sampler.tick().await;
        assert!(h.series.is_empty());
        assert_eq!(
            h.sink
                .count(|e| matches!(e, DiagnosticEvent::SnapshotTimeout { .. })),
            1
        );

        // still in flight: skipped, no second read started
        h.sampler.tick().await;
        assert!(matches!(h.sampler.slot, ProviderSlot::Busy(_)));

        tokio::time::sleep(Duration::from_millis(400)).await;
        h.sampler.tick().await;
        // the late reading (10) is discarded, the fresh one (20) is kept
        let snap = h.series.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].cpu_time_consumed_nanos, 20);
    }

    #[tokio::test]
    async fn test_run_stops_on_signal_and_returns_provider() {
        let clock = Arc::new(ManualClock::new());
        let provider = ScriptedProvider::new(clock, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let h = harness(provider, settings());
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(h.sampler.run(rx));
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();

        let provider = task.await.unwrap();
        assert!(provider.is_some());
        assert!(h.series.len() >= 2);
    }

    #[tokio::test]
    async fn test_run_exits_when_sender_dropped() {
        let clock = Arc::new(ManualClock::new());
        let provider = ScriptedProvider::new(clock, &[1]);
        let h = harness(provider, settings());
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let provider = h.sampler.run(rx).await;
        assert!(provider.is_some());
    }
}
