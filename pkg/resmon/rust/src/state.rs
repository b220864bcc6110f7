// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplerState {
    /// No background task. Initial state, the state after a stop completes,
    /// and the state after the sampler task failed.
    #[default]
    Stopped,
    /// The sampler task is ticking.
    Running,
    /// Cancellation was signalled; waiting for the in-flight tick.
    Stopping,
}

impl SamplerState {
    pub fn is_running(self) -> bool {
        self == SamplerState::Running
    }

    pub(crate) fn can_transition_to(self, next: SamplerState) -> bool {
        use SamplerState::*;
        matches!(
            (self, next),
            (Stopped, Running) | (Running, Stopping) | (Stopping, Stopped) | (Running, Stopped)
        )
    }
}

impl fmt::Display for SamplerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplerState::Stopped => write!(f, "stopped"),
            SamplerState::Running => write!(f, "running"),
            SamplerState::Stopping => write!(f, "stopping"),
        }
    }
}
