//! Out-of-process Windows Graphics Capture subsystem: a host process hands a
//! helper process a monitor to capture, the helper publishes frames into a
//! D3D11 shared keyed-mutex texture, and the host consumes them with no
//! per-frame copy across the process boundary.

#![cfg(windows)]

pub mod async_loop;
pub mod backend;
pub mod capture;
pub mod d3d11;
pub mod error;
pub mod handshake;
pub mod helper;
pub mod logging;
pub mod misc;
pub mod pipe;
pub mod process;
pub mod security;
pub mod session;
pub mod wire;

pub use backend::{BackendSelector, CaptureBackend, CaptureSnapshot, DxgiPlaceholderBackend, WgcBackend};
pub use capture::CapturePolicy;
pub use error::{CaptureResult, PipeError, PipeOutcome, SessionError};
pub use session::SharedSurfaceSession;
