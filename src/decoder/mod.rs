//! Decoder framework: format dispatch, the window layer, and the
//! resampling/position-tracking wrapper common to every back-end
//! (spec.md §4.A).

#[cfg(feature = "vorbis")]
pub mod vorbis;
pub mod wav;
pub mod window;

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use crate::common::{ChannelCount, SampleRate};
use crate::error::DecoderError;
use crate::sound::{Format, LoopPoints};
use window::Window;

/// Metadata a back-end reports back to the decoder framework at open time.
pub struct DecoderMeta {
    pub native_freq: SampleRate,
    pub bitrate: u32,
    pub stereo: bool,
    /// Loop points detected from the stream itself (`smpl` chunk,
    /// `LOOPSTART`/`LOOPLENGTH` comments); `None` if the format carries none.
    pub loop_start: Option<u32>,
    pub loop_length: Option<u32>,
}

/// Result of a back-end's `open` function (spec.md §6.3).
pub type BackendOpenResult = Result<(Box<dyn FormatBackend>, DecoderMeta), DecoderError>;

/// The format-specific half of a decoder instance (spec.md §4.A.3,
/// GLOSSARY "Back-end").
pub trait FormatBackend: Send {
    /// Fills `buf` with up to `buf.len()` interleaved S16LE samples,
    /// returning the number of frames produced (mono samples or stereo
    /// pairs, per the back-end's `stereo` flag). On crossing its own loop
    /// boundary, the back-end adds the number of frames it rewound to
    /// `loop_offset` so the decoder's position accounting stays correct.
    fn get_pcm(&mut self, buf: &mut [i16], loop_offset: &mut i64) -> std::io::Result<usize>;

    /// Installs (or updates) the loop points this back-end should honour
    /// internally. A back-end with no native looping support may ignore
    /// this; the default does nothing.
    fn set_loop(&mut self, _start: u32, _length: u32, _enabled: bool) {}

    /// Releases any back-end-private resources.
    fn close(&mut self);
}

/// A back-end's `open` function, as registered in the dispatch table.
pub type OpenFn = fn(Window) -> BackendOpenResult;

fn default_table() -> HashMap<Format, OpenFn> {
    let mut table = HashMap::new();
    table.insert(Format::Wav, wav::open as OpenFn);
    #[cfg(feature = "vorbis")]
    table.insert(Format::OggVorbis, vorbis::open as OpenFn);
    table
}

/// The runtime-mutable format -> back-end dispatch table (spec.md §4.A.1).
/// Tests may swap entries via [`register_backend`].
fn dispatch_table() -> &'static RwLock<HashMap<Format, OpenFn>> {
    static TABLE: OnceLock<RwLock<HashMap<Format, OpenFn>>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(default_table()))
}

/// Registers (or replaces) the open function for a format tag.
pub fn register_backend(format: Format, open_fn: OpenFn) {
    dispatch_table().write().unwrap().insert(format, open_fn);
}

fn open_backend(format: Format, window: Window) -> BackendOpenResult {
    let open_fn = *dispatch_table()
        .read()
        .unwrap()
        .get(&format)
        .ok_or(DecoderError::BadHeader {
            format: "unknown",
            reason: "no back-end registered for this format".into(),
        })?;
    open_fn(window)
}

/// Number of frames the resample buffer holds (spec.md §9's scratch buffer
/// note: this also bounds a single `get_pcm` request).
const RESAMPLE_BUF_FRAMES: usize = 1024;

/// A stateful object producing PCM samples on demand from one compressed
/// stream, wrapping a format [`FormatBackend`] with resampling, loop-point
/// overrides, and position tracking (spec.md §3 "DecoderInstance", §4.A).
pub struct Decoder {
    backend: Box<dyn FormatBackend>,
    native_freq: SampleRate,
    bitrate: u32,
    stereo: bool,

    loop_start: u32,
    loop_length: u32,
    loop_enabled: bool,

    decode_freq: SampleRate,
    output_freq: SampleRate,
    decode_freq_overridden: bool,
    do_interpolate: bool,

    resample_buf: Vec<i16>,
    resample_valid: usize,
    resample_pos: usize,
    pos_frac: u32,
    resample_eof: bool,
    eof_pending: bool,
    last: [i16; 2],

    samples_gotten: u64,
}

impl Decoder {
    /// Opens a decoder for `window` as `format`, applying `loop_points` as
    /// an override of whatever loop points the back-end detects itself
    /// (spec.md §4.A.4). `loop_enabled` mirrors `play`'s `loop` argument
    /// (§6.4); it may be toggled later with [`Decoder::enable_loop`].
    pub fn open(
        window: Window,
        format: Format,
        loop_points: LoopPoints,
        loop_enabled: bool,
        do_interpolate: bool,
    ) -> Result<Decoder, DecoderError> {
        let (mut backend, meta) = open_backend(format, window)?;

        let loop_start = loop_points.start.or(meta.loop_start).unwrap_or(0);
        let loop_length = loop_points.length.or(meta.loop_length).unwrap_or(0);
        backend.set_loop(loop_start, loop_length, loop_enabled);

        Ok(Decoder {
            backend,
            native_freq: meta.native_freq,
            bitrate: meta.bitrate,
            stereo: meta.stereo,
            loop_start,
            loop_length,
            loop_enabled,
            decode_freq: meta.native_freq,
            output_freq: meta.native_freq,
            decode_freq_overridden: false,
            do_interpolate,
            resample_buf: Vec::new(),
            resample_valid: 0,
            resample_pos: 0,
            pos_frac: 0,
            resample_eof: false,
            eof_pending: false,
            last: [0, 0],
            samples_gotten: 0,
        })
    }

    pub fn is_stereo(&self) -> bool {
        self.stereo
    }

    pub fn channels(&self) -> ChannelCount {
        if self.stereo {
            2
        } else {
            1
        }
    }

    pub fn native_freq(&self) -> SampleRate {
        self.native_freq
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    /// Caller-supplied loop points, overriding whatever the back-end
    /// detected (spec.md §4.A.4's `set_loop_points`).
    pub fn set_loop_points(&mut self, start: u32, length: u32) {
        self.loop_start = start;
        self.loop_length = length;
        self.backend.set_loop(start, length, self.loop_enabled);
    }

    /// Toggles internal looping without changing the loop points
    /// themselves (spec.md §6.4's `enable_loop`).
    pub fn enable_loop(&mut self, enabled: bool) {
        self.loop_enabled = enabled;
        self.backend
            .set_loop(self.loop_start, self.loop_length, enabled);
    }

    /// Sets the device's fixed output rate (spec.md §4.F: done once, on
    /// `play`).
    pub fn set_output_freq(&mut self, freq: SampleRate) {
        self.output_freq = freq;
    }

    /// Sets the decode (playback) rate. Zero means "hold the current
    /// sample" rather than "use native rate" (spec.md §4.A.5).
    pub fn set_decode_freq(&mut self, freq: SampleRate) {
        self.decode_freq = freq;
        self.decode_freq_overridden = true;
    }

    /// Position in the native-rate domain, in seconds (spec.md §4.A.6).
    pub fn position_seconds(&self) -> f64 {
        if self.native_freq == 0 {
            return 0.0;
        }
        self.samples_gotten as f64 / self.native_freq as f64
    }

    fn needs_resample(&self) -> bool {
        self.decode_freq_overridden || self.decode_freq != self.output_freq
    }

    /// Produces up to `frames_wanted` frames (mono samples or stereo
    /// pairs) into `out`, returning the number actually produced. Zero
    /// means end of stream.
    pub fn get_pcm(&mut self, out: &mut [i16], frames_wanted: usize) -> usize {
        if self.needs_resample() {
            self.get_pcm_resampled(out, frames_wanted)
        } else {
            self.get_pcm_direct(out, frames_wanted)
        }
    }

    fn get_pcm_direct(&mut self, out: &mut [i16], frames_wanted: usize) -> usize {
        let channels = self.channels() as usize;
        let mut loop_offset = 0i64;
        let n = self
            .backend
            .get_pcm(&mut out[..frames_wanted * channels], &mut loop_offset)
            .unwrap_or(0);
        self.samples_gotten += n as u64;
        self.samples_gotten = self.samples_gotten.saturating_sub(loop_offset.max(0) as u64);
        n
    }

    /// Refills the resample buffer from the back-end, folding any loop
    /// rewind it reports back into `samples_gotten` (spec.md §4.A.5).
    fn refill(&mut self) {
        let channels = self.channels() as usize;
        if self.resample_buf.len() < RESAMPLE_BUF_FRAMES * channels {
            self.resample_buf.resize(RESAMPLE_BUF_FRAMES * channels, 0);
        }
        let mut loop_offset = 0i64;
        let n = self
            .backend
            .get_pcm(&mut self.resample_buf, &mut loop_offset)
            .unwrap_or(0);
        self.resample_valid = n;
        self.resample_pos = 0;
        self.samples_gotten = self.samples_gotten.saturating_sub(loop_offset.max(0) as u64);

        if n == 0 {
            if self.eof_pending {
                self.resample_eof = true;
            } else {
                self.eof_pending = true;
            }
        } else {
            self.eof_pending = false;
        }
    }

    fn cur_frame(&self) -> [i16; 2] {
        if self.resample_pos >= self.resample_valid {
            return [0, 0];
        }
        let channels = self.channels() as usize;
        let base = self.resample_pos * channels;
        if channels == 2 {
            [self.resample_buf[base], self.resample_buf[base + 1]]
        } else {
            [self.resample_buf[base], self.resample_buf[base]]
        }
    }

    fn get_pcm_resampled(&mut self, out: &mut [i16], frames_wanted: usize) -> usize {
        let channels = self.channels() as usize;
        let mut produced = 0usize;

        while produced < frames_wanted {
            if self.resample_pos >= self.resample_valid && !self.resample_eof {
                self.refill();
            }
            if self.resample_eof && self.resample_pos >= self.resample_valid && !self.do_interpolate {
                break;
            }

            let cur = self.cur_frame();
            let sample = if self.do_interpolate {
                [
                    crate::math::lerp_i32(
                        self.last[0] as i32,
                        cur[0] as i32,
                        self.pos_frac as i64,
                        self.output_freq.max(1) as i64,
                    ) as i16,
                    crate::math::lerp_i32(
                        self.last[1] as i32,
                        cur[1] as i32,
                        self.pos_frac as i64,
                        self.output_freq.max(1) as i64,
                    ) as i16,
                ]
            } else {
                if self.resample_eof && self.resample_pos >= self.resample_valid {
                    break;
                }
                cur
            };

            let base = produced * channels;
            out[base] = sample[0];
            if channels == 2 {
                out[base + 1] = sample[1];
            }
            produced += 1;

            self.pos_frac += self.decode_freq;
            while self.pos_frac >= self.output_freq.max(1) {
                self.last = cur;
                self.pos_frac -= self.output_freq.max(1);
                self.resample_pos += 1;
                self.samples_gotten += 1;
                if self.resample_pos >= self.resample_valid && !self.resample_eof {
                    self.refill();
                }
                if self.decode_freq == 0 {
                    // "hold the current sample": never actually crosses
                    // the threshold again once caught up.
                    break;
                }
            }

            if self.resample_eof && self.resample_pos >= self.resample_valid && !self.do_interpolate {
                break;
            }
        }

        produced
    }

    pub fn close(&mut self) {
        self.backend.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sound::LoopPoints;

    fn open_square_wave(loop_enabled: bool, loop_points: LoopPoints) -> Decoder {
        let bytes = wav::tests::square_wave_fixture();
        let window = Window::Memory(bytes.into());
        Decoder::open(window, Format::Wav, loop_points, loop_enabled, false).unwrap()
    }

    #[test]
    fn no_resample_needed_when_rates_match() {
        let mut decoder = open_square_wave(false, LoopPoints::default());
        decoder.set_output_freq(4000);
        assert!(!decoder.needs_resample());
        let mut buf = vec![0i16; 40];
        let n = decoder.get_pcm(&mut buf, 40);
        assert_eq!(n, 40);
        assert_eq!(buf[0], 10000);
    }

    #[test]
    fn position_tracks_native_samples_read() {
        let mut decoder = open_square_wave(false, LoopPoints::default());
        decoder.set_output_freq(4000);
        let mut buf = vec![0i16; 20];
        decoder.get_pcm(&mut buf, 20);
        assert_eq!(decoder.position_seconds(), 20.0 / 4000.0);
    }

    #[test]
    fn decode_freq_zero_holds_the_last_sample() {
        let mut decoder = open_square_wave(false, LoopPoints::default());
        decoder.set_output_freq(4000);
        decoder.set_decode_freq(0);
        let mut buf = vec![0i16; 8];
        let n = decoder.get_pcm(&mut buf, 8);
        assert_eq!(n, 8);
        assert!(buf[1..8].iter().all(|&s| s == buf[0]));
    }

    #[test]
    fn matching_rates_pass_samples_through_unchanged_even_with_override() {
        let mut direct = open_square_wave(false, LoopPoints::default());
        direct.set_output_freq(4000);
        let mut resampled = open_square_wave(false, LoopPoints::default());
        resampled.set_output_freq(4000);
        resampled.set_decode_freq(4000);

        let mut direct_buf = vec![0i16; 40];
        let mut resampled_buf = vec![0i16; 40];
        direct.get_pcm(&mut direct_buf, 40);
        resampled.get_pcm(&mut resampled_buf, 40);
        assert_eq!(direct_buf, resampled_buf);
    }
}
