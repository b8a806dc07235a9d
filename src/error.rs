//! Error and result types matched by callers, as opposed to the `anyhow::Result`
//! used internally for setup/teardown plumbing.

use thiserror::Error;

/// Transport-layer errors (C1). Upper layers match on these explicitly.
#[derive(Debug, Error)]
pub enum PipeError {
    #[error("failed to create named pipe: {0}")]
    CreateFailed(#[source] windows::core::Error),
    #[error("operation timed out")]
    Timeout,
    #[error("pipe was broken (peer closed unexpectedly)")]
    BrokenPipe,
    #[error("pipe was disconnected")]
    Disconnected,
    #[error("pipe I/O error: {0}")]
    Io(#[source] windows::core::Error),
}

/// Outcome of a single `receive` call, distinguishing `BrokenPipe` from plain
/// `Error` per spec: upper layers react differently (reinit vs retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeOutcome {
    Success,
    Timeout,
    BrokenPipe,
    Disconnected,
    Error,
}

/// Session-layer errors (C2/C5). Never surfaced as raw OS codes to the encoder.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake with helper process failed")]
    HandshakeFailed,
    #[error("helper config has no adapter LUID; legacy configs are rejected")]
    NoAdapterLuid,
    #[error("shared texture open failed or adapter LUID mismatch: {0}")]
    Fatal(#[source] anyhow::Error),
    #[error("keyed mutex was abandoned by the helper process")]
    Abandoned,
}

/// The six-value capture result the encoder sees, per spec §6/§7. `Copy`,
/// carries no payload the caller matches on — only `Debug`/logging detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureResult {
    Ok,
    Timeout,
    Reinit,
    Error,
    Interrupted,
    SwapCapture,
}
