//! Error taxonomy for the engine's internal, `Result`-typed code paths.
//!
//! The public API (§6.4 of the design) reports failure by sentinel value
//! (`0`, `null`, or a silent no-op) rather than by `Result`, matching the
//! spec's error-handling design. These types exist so the internal
//! implementation stays `?`-friendly and so rejections can carry a
//! structured reason for `tracing` to log in debug builds.

use std::io;

/// Failures that can occur while constructing or opening a [`crate::sound::Sound`].
#[derive(Debug, thiserror::Error)]
pub enum SoundError {
    /// The format tag has no registered back-end, or autodetection found
    /// no matching magic bytes.
    #[error("unrecognized or unregistered audio format")]
    UnknownFormat,
    /// The back-end rejected the stream header.
    #[error("back-end rejected stream: {0}")]
    FormatError(String),
    /// A filesystem or I/O failure while opening the source.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A caller-supplied argument was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Failures reported internally by a decoder back-end at open time.
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// The stream header did not match the expected format.
    #[error("malformed {format} header: {reason}")]
    BadHeader {
        /// Which back-end rejected the stream.
        format: &'static str,
        /// Human-readable rejection reason.
        reason: String,
    },
    /// An unsupported channel count or sample rate was encountered.
    #[error("unsupported stream parameters: {0}")]
    Unsupported(String),
    /// Underlying I/O error from the window layer.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures from [`crate::filter::flange::Flange::new`] parameter validation.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// A filter parameter fell outside the range the fixed-point pipeline
    /// can represent without overflow (§4.C.2).
    #[error("invalid filter parameters: {0}")]
    InvalidParameters(&'static str),
}

/// Failures from engine-level operations (`open_device`, and friends).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The platform sink could not be opened.
    #[error("failed to open audio device: {0}")]
    DeviceOpen(String),
    /// An API call was made before `open_device` succeeded.
    #[error("engine not ready: device not open")]
    NotReady,
}
