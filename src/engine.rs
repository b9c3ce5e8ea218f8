//! The public core API (spec.md §6.4): wires the channel controller, the
//! mixer, and the platform sink together behind sentinel-based error
//! reporting (spec.md §7) rather than `Result`.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::ChannelController;
use crate::common::SampleRate;
use crate::decoder::window::{FileWindow, Window};
use crate::decoder::Decoder;
use crate::filter::flange::Flange;
use crate::filter::Filter;
use crate::math::VOLUME_MAX;
use crate::mixer::Mixer;
use crate::platform::file::AsyncFile;
use crate::platform::sink::Sink;
use crate::sound::{Format, Sound, Source};

/// Converts a linear volume multiplier (`1.0` = unity) into the mixer's
/// Q0.24 fixed point, clamping to the representable range (spec.md §4.E).
fn volume_to_fixed(volume: f32) -> i32 {
    let clamped = volume.max(0.0).min(VOLUME_MAX as f32);
    (clamped * crate::math::VOLUME_UNITY as f32).round() as i32
}

/// The engine: owns the channel array, the mixer, and (once opened) the
/// platform audio sink. Entry points mirror spec.md §6.4; invalid
/// arguments are logged (via `tracing`, in debug builds) and reported by
/// sentinel rather than `Result`, per spec.md §7.
pub struct Engine {
    controller: ChannelController,
    mixer: Mixer,
    sink: Mutex<Option<Box<dyn Sink>>>,
    interpolate: AtomicBool,
}

impl Engine {
    /// `init` / the part of `open_device` that doesn't yet need a real
    /// device: allocates the channel array and mixer state (spec.md §5's
    /// "opening the device allocates the channels array").
    pub fn new(num_channels: usize) -> Arc<Engine> {
        Arc::new(Engine {
            controller: ChannelController::new(num_channels),
            mixer: Mixer::new(num_channels),
            sink: Mutex::new(None),
            interpolate: AtomicBool::new(true),
        })
    }

    /// Opens the named output device (empty string = host default) and
    /// starts pulling PCM from the mixer on its audio thread (spec.md
    /// §6.1's `sink_init`). Returns `false` on failure; never panics.
    #[cfg(feature = "playback")]
    pub fn open_device(self: &Arc<Engine>, name: &str) -> bool {
        let engine = Arc::clone(self);
        let result = crate::platform::sink::CpalSink::open(name, move |buf: &mut [i16]| {
            let frames = buf.len() / 2;
            engine.pull_pcm(buf, frames);
        });
        match result {
            Ok(sink) => {
                *self.sink.lock().unwrap() = Some(Box::new(sink));
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to open audio device");
                false
            }
        }
    }

    #[cfg(not(feature = "playback"))]
    pub fn open_device(self: &Arc<Engine>, _name: &str) -> bool {
        tracing::warn!("open_device called but the \"playback\" feature is disabled");
        false
    }

    /// Installs an arbitrary [`Sink`] directly, bypassing device
    /// enumeration -- used by tests to drive the mixer against an
    /// in-memory fake (see [`crate::platform::sink::FakeSink`]).
    pub fn open_device_with_sink(&self, sink: Box<dyn Sink>) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    /// Mixes `frames` frames directly, bypassing the platform sink (spec.md
    /// §6.1's `mixer_get_pcm`, which a real sink calls from its own audio
    /// callback). Exposed so a custom [`Sink`] implementation, or a test,
    /// can drive the mixer without opening a real device.
    pub fn pull_pcm(&self, out: &mut [i16], frames: usize) {
        self.mixer.get_pcm(self.controller.channels(), out, frames);
    }

    fn open_window_for_sound(&self, sound: &Sound) -> io::Result<Window> {
        match sound.source()? {
            Source::Buffer(data) => Ok(Window::Memory(data)),
            Source::File {
                handle,
                offset,
                len,
            } => {
                let async_file = AsyncFile::new(handle)?;
                Ok(Window::File(FileWindow::new(async_file, offset, len)))
            }
        }
    }

    fn open_decoder_for_sound(&self, sound: &Sound, loop_enabled: bool) -> Option<Decoder> {
        let window = match self.open_window_for_sound(sound) {
            Ok(window) => window,
            Err(err) => {
                tracing::debug!(error = %err, "failed to open sound source");
                return None;
            }
        };
        let interpolate = self.interpolate.load(Ordering::Relaxed);
        match Decoder::open(
            window,
            sound.format(),
            sound.loop_points(),
            loop_enabled,
            interpolate,
        ) {
            Ok(decoder) => Some(decoder),
            Err(err) => {
                tracing::debug!(error = %err, "decoder failed to open");
                None
            }
        }
    }

    /// Lazily probes a sound's channel count, opening and immediately
    /// closing a throwaway decoder (spec.md §3's "lazily populated audio
    /// parameters").
    fn probe_sound(&self, sound: &Sound) -> Option<(bool, SampleRate)> {
        let mut decoder = self.open_decoder_for_sound(sound, false)?;
        let result = (decoder.is_stereo(), decoder.native_freq());
        decoder.close();
        Some(result)
    }

    pub fn sound_is_stereo(&self, sound: &Sound) -> bool {
        self.probe_sound(sound).map(|(stereo, _)| stereo).unwrap_or(false)
    }

    pub fn sound_native_freq(&self, sound: &Sound) -> SampleRate {
        self.probe_sound(sound).map(|(_, freq)| freq).unwrap_or(0)
    }

    pub fn reserve_channel(&self) -> usize {
        self.controller.reserve_channel()
    }

    pub fn free_channel(&self, channel: usize) {
        self.controller.free_channel(channel);
    }

    /// `play(sound, ch, vol, pan, loop) -> channel` (spec.md §4.F, §6.4).
    /// Returns `0` on failure (device not open, bad source, decoder
    /// rejected the header, or no free channel).
    pub fn play(&self, sound: &Sound, channel: usize, volume: f32, pan: f32, loop_enabled: bool) -> usize {
        let output_freq = self.playback_rate();
        if output_freq == 0 {
            tracing::debug!("play() called before a device is open");
            return 0;
        }

        let Some(mut decoder) = self.open_decoder_for_sound(sound, loop_enabled) else {
            return 0;
        };
        decoder.set_output_freq(output_freq);
        let is_stereo = decoder.is_stereo();

        let index = self.controller.allocate_for_play(&self.mixer, channel);
        if index == 0 {
            decoder.close();
            tracing::debug!("play(): no free channel");
            return 0;
        }

        sound.acquire();
        let volume_fixed = volume_to_fixed(volume);
        let pan = pan.clamp(-1.0, 1.0);
        self.controller.channels()[index].start(Some(sound.clone()), decoder);
        self.mixer.start(index, is_stereo, volume_fixed, pan);
        index
    }

    /// `play_decoder`: attaches an already-open [`Decoder`] directly,
    /// without a backing [`Sound`] (spec.md §6.4).
    pub fn play_decoder(&self, mut decoder: Decoder, channel: usize, volume: f32, pan: f32) -> usize {
        let output_freq = self.playback_rate();
        if output_freq == 0 {
            tracing::debug!("play_decoder() called before a device is open");
            return 0;
        }
        decoder.set_output_freq(output_freq);
        let is_stereo = decoder.is_stereo();

        let index = self.controller.allocate_for_play(&self.mixer, channel);
        if index == 0 {
            decoder.close();
            return 0;
        }

        let volume_fixed = volume_to_fixed(volume);
        let pan = pan.clamp(-1.0, 1.0);
        self.controller.channels()[index].start(None, decoder);
        self.mixer.start(index, is_stereo, volume_fixed, pan);
        index
    }

    pub fn pause(&self, channel: usize) {
        self.controller.pause(&self.mixer, channel);
    }

    pub fn resume(&self, channel: usize) {
        let (is_stereo, volume, pan) = self.mixer.channel_mix_state(channel);
        self.controller.resume(&self.mixer, channel, is_stereo, volume, pan);
    }

    pub fn pause_all(&self) {
        self.controller.pause_all(&self.mixer);
    }

    pub fn resume_all(&self) {
        self.controller
            .resume_all(&self.mixer, |ch| self.mixer.channel_mix_state(ch));
    }

    pub fn cut(&self, channel: usize) {
        self.controller.cut(&self.mixer, channel);
    }

    /// `fade(ch, seconds)`: ramps to silence and stops, per spec.md
    /// §4.D.5.
    pub fn fade(&self, channel: usize, seconds: f32) {
        if seconds < 0.0 {
            tracing::debug!("fade(): negative duration ignored");
            return;
        }
        let samples = (seconds * self.playback_rate() as f32).round() as u64;
        self.mixer.fade(channel, 0, samples, true);
    }

    /// `adjust_volume(ch, new, seconds)`: ramps to `new_volume` without
    /// stopping playback, overriding any fade in progress (spec.md §4.D.5,
    /// §8's boundary test).
    pub fn adjust_volume(&self, channel: usize, new_volume: f32, seconds: f32) {
        if new_volume < 0.0 || seconds < 0.0 {
            tracing::debug!("adjust_volume(): invalid parameters");
            return;
        }
        let samples = (seconds * self.playback_rate() as f32).round() as u64;
        self.mixer.fade(channel, volume_to_fixed(new_volume), samples, false);
    }

    pub fn set_pan(&self, channel: usize, pan: f32) {
        if !(-1.0..=1.0).contains(&pan) {
            tracing::debug!("set_pan(): pan out of range");
            return;
        }
        self.mixer.set_pan(channel, pan);
    }

    /// `set_playback_rate(ch, factor)`: sets the decoder's decode
    /// frequency to `round(factor * native_freq)` (spec.md §4.D.5).
    pub fn set_playback_rate(&self, channel: usize, factor: f32) {
        if factor < 0.0 {
            tracing::debug!("set_playback_rate(): negative factor ignored");
            return;
        }
        self.controller.with_decoder_mut(channel, |decoder| {
            let freq = (factor * decoder.native_freq() as f32).round() as u32;
            decoder.set_decode_freq(freq);
        });
    }

    pub fn enable_loop(&self, channel: usize, enabled: bool) {
        self.controller
            .with_decoder_mut(channel, |decoder| decoder.enable_loop(enabled));
    }

    pub fn set_loop(&self, channel: usize, start: u32, length: u32) {
        self.controller
            .with_decoder_mut(channel, |decoder| decoder.set_loop_points(start, length));
    }

    /// `set_flange(ch, enable, period, depth)` (spec.md §6.4, §4.C.2).
    pub fn set_flange(&self, channel: usize, enable: bool, period_seconds: f32, depth_seconds: f32) {
        let Some(ch) = self.controller.get(channel) else {
            return;
        };
        if !enable {
            ch.filter.set(None);
            return;
        }
        let Some((is_stereo, freq)) = self
            .controller
            .with_decoder_mut(channel, |decoder| (decoder.is_stereo(), decoder.native_freq()))
        else {
            return;
        };
        match Flange::new(is_stereo, freq, period_seconds as f64, depth_seconds as f64) {
            Ok(flange) => ch.filter.set(Some(Box::new(flange))),
            Err(err) => tracing::debug!(error = %err, "set_flange(): rejected parameters"),
        }
    }

    /// `set_filter(ch, filter)`. If `ch` is invalid or not in use, `filter`
    /// is closed immediately rather than leaked (spec.md §4.D.5).
    pub fn set_filter(&self, channel: usize, filter: Option<Box<dyn Filter>>) {
        match self.controller.get(channel) {
            Some(ch) if ch.is_in_use() => ch.filter.set(filter),
            _ => {
                if let Some(mut filter) = filter {
                    filter.close();
                }
            }
        }
    }

    pub fn is_playing(&self, channel: usize) -> bool {
        self.controller
            .get(channel)
            .map(|ch| ch.is_in_use())
            .unwrap_or(false)
            && self.mixer.is_playing(channel)
    }

    /// `playback_pos(ch)`: seconds, in the native-rate domain (spec.md
    /// §4.A.6).
    pub fn playback_pos(&self, channel: usize) -> f64 {
        self.controller
            .with_decoder_mut(channel, |decoder| decoder.position_seconds())
            .unwrap_or(0.0)
    }

    pub fn set_interpolate(&self, enabled: bool) {
        self.interpolate.store(enabled, Ordering::Relaxed);
    }

    /// `set_global_volume(0..=15)`; values outside the range are ignored
    /// (spec.md §8's boundary test).
    pub fn set_global_volume(&self, volume: u32) -> bool {
        self.mixer.set_global_volume(volume)
    }

    /// `update()`: reaps channels that reached end-of-stream (spec.md
    /// §4.D.4). Call periodically from the main thread.
    pub fn update(&self) {
        self.controller.update(&self.mixer);
    }

    /// `check_format`: classifies a buffer's first bytes without opening
    /// a `Sound` (spec.md §4.A.1).
    pub fn check_format(data: &[u8]) -> Option<Format> {
        crate::sound::resolve_format(data, Format::Autodetect).ok()
    }

    pub fn set_latency(&self, seconds: f32) -> f32 {
        self.sink
            .lock()
            .unwrap()
            .as_mut()
            .map(|sink| sink.set_latency(seconds))
            .unwrap_or(0.0)
    }

    pub fn get_latency(&self) -> f32 {
        self.sink
            .lock()
            .unwrap()
            .as_ref()
            .map(|sink| sink.latency())
            .unwrap_or(0.0)
    }

    pub fn playback_rate(&self) -> SampleRate {
        self.sink
            .lock()
            .unwrap()
            .as_ref()
            .map(|sink| sink.playback_rate())
            .unwrap_or(0)
    }

    pub fn num_channels(&self) -> usize {
        self.controller.len()
    }

    /// Tears down every in-use channel and releases the device. A no-op
    /// on the second call (spec.md §5).
    pub fn cleanup(&self) {
        self.controller.cleanup(&self.mixer);
        *self.sink.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sink::FakeSink;

    fn engine_with_fake_sink(num_channels: usize, rate: SampleRate) -> Arc<Engine> {
        let engine = Engine::new(num_channels);
        engine.open_device_with_sink(Box::new(FakeSink::new(rate)));
        engine
    }

    fn square_wave_sound() -> Sound {
        let bytes = crate::decoder::wav::tests::square_wave_fixture();
        Sound::from_buffer(bytes, Format::Wav).unwrap()
    }

    #[test]
    fn play_before_device_open_returns_zero() {
        let engine = Engine::new(2);
        let sound = square_wave_sound();
        assert_eq!(engine.play(&sound, 0, 1.0, 0.0, false), 0);
    }

    #[test]
    fn play_allocates_a_channel_and_reports_playing() {
        let engine = engine_with_fake_sink(2, 4000);
        let sound = square_wave_sound();
        let ch = engine.play(&sound, 0, 1.0, 0.0, false);
        assert_ne!(ch, 0);
        assert!(engine.is_playing(ch));
    }

    #[test]
    fn scenario_1_plays_exactly_forty_samples_then_silence() {
        let engine = engine_with_fake_sink(1, 4000);
        let sound = square_wave_sound();
        let ch = engine.play(&sound, 0, 1.0, 0.0, false);
        assert_ne!(ch, 0);

        let mut out = vec![0i16; 40 * 2];
        engine.pull_pcm(&mut out, 40);
        assert!(out.iter().all(|&s| s != 0));

        let mut tail = vec![1i16; 2];
        engine.pull_pcm(&mut tail, 1);
        assert_eq!(tail, vec![0, 0]);

        engine.update();
        assert!(!engine.is_playing(ch));
    }

    #[test]
    fn cut_stops_output_immediately() {
        let engine = engine_with_fake_sink(1, 4000);
        let sound = square_wave_sound();
        let ch = engine.play(&sound, 0, 1.0, 0.0, false);
        engine.cut(ch);

        let mut out = vec![1i16; 4];
        engine.pull_pcm(&mut out, 2);
        assert_eq!(out, vec![0, 0, 0, 0]);
    }

    #[test]
    fn global_volume_boundary_rejects_out_of_range() {
        let engine = Engine::new(1);
        assert!(!engine.set_global_volume(16));
        assert!(engine.set_global_volume(15));
    }

    #[test]
    fn set_filter_on_unused_channel_closes_it_immediately() {
        let engine = Engine::new(1);
        let closed = Arc::new(AtomicBool::new(false));

        struct MarkOnClose(Arc<AtomicBool>);
        impl Filter for MarkOnClose {
            fn filter(&mut self, _buf: &mut [i16], _len: usize) {}
            fn is_stereo(&self) -> bool {
                false
            }
            fn freq(&self) -> u32 {
                0
            }
            fn close(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        engine.set_filter(1, Some(Box::new(MarkOnClose(closed.clone()))));
        assert!(closed.load(Ordering::SeqCst));
    }
}
