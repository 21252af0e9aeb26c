// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Failures raised while turning a finished request tree into metrics.
///
/// A failing converter never prevents the others from recording.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("Required layer not found: {0}")]
    MissingLayer(&'static str),

    #[error("Malformed annotation {key}: {reason}")]
    MalformedAnnotation { key: String, reason: String },

    #[error("Converter panicked: {0}")]
    Panicked(String),
}

/// Rejected user or extra context entries.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ContextError {
    #[error("Invalid context key: {0:?}")]
    InvalidKey(String),

    #[error("Invalid context value for key {0:?}")]
    InvalidValue(String),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store service is closed")]
    Closed,

    #[error("Store flush failed: {0}")]
    Flush(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Logger already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}
