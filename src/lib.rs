//! A portable, low-latency, channel-based audio playback engine.
//!
//! The crate is organized the way the design document lays it out: a
//! decoder framework ([`decoder`]) wrapping per-format back-ends, a filter
//! framework ([`filter`]) with a reference flange implementation, a
//! software [`mixer`], a [`channel`] controller that owns playback
//! lifecycle, and an [`engine`] that ties all of it together behind a
//! single public API. [`sound`] is the playable source type handed to
//! [`engine::Engine::play`].
//!
//! Errors from internal, `Result`-typed code live in [`error`]; the public
//! `Engine` API itself reports failure by sentinel value rather than
//! `Result`, matching this domain's established convention of never
//! letting a bad argument from a game's scripting layer unwind a native
//! call across the FFI boundary.

pub mod channel;
pub mod common;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod filter;
pub mod math;
pub mod mixer;
pub mod platform;
pub mod sound;

pub use engine::Engine;
pub use error::{DecoderError, EngineError, FilterError, SoundError};
pub use sound::{Format, LoopPoints, Sound};
