// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A raw counter could not be read for this tick.
    #[error("snapshot unavailable: {context}")]
    SnapshotUnavailable {
        context: String,
        #[source]
        source: Option<io::Error>,
    },
    #[error("snapshot read did not complete within {0:?}")]
    SnapshotTimeout(Duration),
    #[error("insufficient data: {available} sample(s) recorded, at least 2 are required")]
    InsufficientData { available: usize },
    #[error("could not resolve resource quota: {context}")]
    QuotaResolution { context: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("no tokio runtime is available to run the sampler")]
    NoRuntime,
    #[error("the sampler is stopping")]
    Stopping,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn unavailable(context: impl Into<String>) -> Self {
        Error::SnapshotUnavailable {
            context: context.into(),
            source: None,
        }
    }

    pub(crate) fn unavailable_io(context: impl Into<String>, source: io::Error) -> Self {
        Error::SnapshotUnavailable {
            context: context.into(),
            source: Some(source),
        }
    }
}
