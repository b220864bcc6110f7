// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Bounded, lock-free sample history.
//!
//! The series is a fixed ring of slots allocated once at construction. A
//! single writer (the sampler) appends; any number of readers take
//! point-in-time copies without locking. Each slot is guarded by a sequence
//! counter: the writer makes it odd while the slot is being rewritten and
//! even again once the new sample is complete, and readers retry when the
//! counter moved under them. A reader therefore never observes a torn
//! sample, only whole samples that were present at some instant during the
//! copy.

use crate::clock::duration_to_nanos;
use crate::sample::Sample;
use std::hint;
use std::sync::atomic::{AtomicU64, Ordering, fence};
use std::time::Duration;

const MIN_CAPACITY: usize = 2;
const MAX_READ_RETRIES: usize = 64;

#[derive(Debug, Default)]
struct Slot {
    seq: AtomicU64,
    /// 1-based append position of the sample held in this slot, 0 when empty.
    position: AtomicU64,
    timestamp_nanos: AtomicU64,
    cpu_nanos: AtomicU64,
    memory_bytes: AtomicU64,
}

impl Slot {
    /// Single writer only.
    fn write(&self, position: u64, sample: &Sample) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        self.position.store(position, Ordering::Relaxed);
        self.timestamp_nanos
            .store(duration_to_nanos(sample.timestamp), Ordering::Relaxed);
        self.cpu_nanos
            .store(sample.cpu_time_consumed_nanos, Ordering::Relaxed);
        self.memory_bytes
            .store(sample.memory_used_bytes, Ordering::Relaxed);

        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    fn read(&self) -> Option<(u64, Sample)> {
        for _ in 0..MAX_READ_RETRIES {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                hint::spin_loop();
                continue;
            }

            let position = self.position.load(Ordering::Relaxed);
            let timestamp = self.timestamp_nanos.load(Ordering::Relaxed);
            let cpu = self.cpu_nanos.load(Ordering::Relaxed);
            let memory = self.memory_bytes.load(Ordering::Relaxed);

            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return Some((
                    position,
                    Sample {
                        timestamp: Duration::from_nanos(timestamp),
                        cpu_time_consumed_nanos: cpu,
                        memory_used_bytes: memory,
                    },
                ));
            }
            hint::spin_loop();
        }
        None
    }
}

#[derive(Debug)]
pub struct TimeSeries {
    slots: Box<[Slot]>,
    appended: AtomicU64,
}

impl TimeSeries {
    /// Creates a series holding at most `capacity` samples (never fewer than 2).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        let slots = (0..capacity).map(|_| Slot::default()).collect();
        Self {
            slots,
            appended: AtomicU64::new(0),
        }
    }

    pub fn with_retention(retention: Duration, interval: Duration) -> Self {
        Self::new(Self::capacity_for(retention, interval))
    }

    /// `ceil(retention / interval)`, minimum 2.
    pub fn capacity_for(retention: Duration, interval: Duration) -> usize {
        let interval = interval.as_nanos();
        if interval == 0 {
            return MIN_CAPACITY;
        }
        let slots = retention.as_nanos().div_ceil(interval);
        usize::try_from(slots)
            .unwrap_or(usize::MAX)
            .max(MIN_CAPACITY)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        let appended = self.appended.load(Ordering::Acquire);
        usize::try_from(appended)
            .unwrap_or(usize::MAX)
            .min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.appended.load(Ordering::Acquire) == 0
    }

    /// Total number of samples ever appended, including evicted ones.
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Acquire)
    }

    fn slot(&self, position: u64) -> Option<&Slot> {
        let capacity = self.capacity() as u64;
        let index = usize::try_from(position % capacity).ok()?;
        self.slots.get(index)
    }

    pub fn latest(&self) -> Option<Sample> {
        let appended = self.appended.load(Ordering::Acquire);
        let last = appended.checked_sub(1)?;
        match self.slot(last)?.read() {
            Some((position, sample)) if position == appended => Some(sample),
            _ => None,
        }
    }

    /// Appends `sample`, evicting the oldest one when full.
    ///
    /// Must only be called from the single writer. Returns `false` and leaves
    /// the series untouched when `sample` is not strictly newer than the
    /// latest recorded sample.
    pub(crate) fn push(&self, sample: Sample) -> bool {
        let appended = self.appended.load(Ordering::Relaxed);
        if let Some(latest) = self.latest()
            && sample.timestamp <= latest.timestamp
        {
            return false;
        }
        let Some(slot) = self.slot(appended) else {
            return false;
        };
        slot.write(appended + 1, &sample);
        self.appended.store(appended + 1, Ordering::Release);
        true
    }

    /// Point-in-time copy of the retained samples, oldest first.
    ///
    /// Samples overwritten while the copy was in progress are left out, so
    /// the result is always strictly ordered by timestamp.
    pub fn snapshot(&self) -> Vec<Sample> {
        let appended = self.appended.load(Ordering::Acquire);
        let retained = appended.min(self.capacity() as u64);
        let first = appended - retained;

        let mut samples: Vec<Sample> = Vec::with_capacity(self.capacity());
        for position in first..appended {
            let Some((found, sample)) = self.slot(position).and_then(Slot::read) else {
                continue;
            };
            if found != position + 1 {
                // Lapped by the writer while copying.
                continue;
            }
            if samples
                .last()
                .is_none_or(|prev| prev.timestamp < sample.timestamp)
            {
                samples.push(sample);
            }
        }
        samples
    }
}
