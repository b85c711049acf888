// Copyright 2026 Tandem Contributors
use slog::{o, Drain, Logger};

pub mod block;
pub use block::{BlockRange, ExtentId};

/*
 * Errors shared across the workspace.  Everything a caller can observe
 * through a completion channel is one of these.
 */
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(
    Debug,
    Clone,
    PartialEq,
    thiserror::Error,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TandemError {
    #[error("volume is not connected to a peer")]
    NotConnected,

    #[error("request pool exhausted")]
    AllocationExhausted,

    #[error("transmission to the peer failed")]
    TransmissionFailed,

    #[error("local storage reported an error")]
    LocalStorageFailed,

    #[error("peer did not acknowledge the write")]
    RemoteFailed,

    #[error("fetched data was superseded by a local write")]
    StaleFetch,

    #[error("completion channel disconnected")]
    RecvDisconnected,

    #[error("generic error: {0}")]
    GenericError(String),
}

impl From<anyhow::Error> for TandemError {
    fn from(e: anyhow::Error) -> Self {
        TandemError::GenericError(format!("{e:#}"))
    }
}

/*
 * Construct the default terminal logger used when a caller does not supply
 * their own.
 */
pub fn build_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator)
        .build()
        .filter_level(slog::Level::Info)
        .fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}
