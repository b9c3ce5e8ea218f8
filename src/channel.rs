//! Channel controller (spec.md §4.D): reservation and dynamic allocation,
//! the pause/resume state machine, and the single channel-reset teardown
//! point.

use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Mutex;

use crate::decoder::Decoder;
use crate::filter::FilterSlot;
use crate::mixer::Mixer;
use crate::sound::Sound;

struct ChannelInner {
    sound: Option<Sound>,
    decoder: Option<Decoder>,
}

/// One playback lane, indexed 1..=N (index 0 means "none"/"any"), per
/// spec.md §3's "Channel".
///
/// `decoder`/`sound` live behind a mutex rather than the lock-free
/// discipline the source uses (main thread writes only while `!in_use`,
/// audio thread reads only while playing) because this core has no
/// dedicated audio-thread ownership transfer primitive; the mutex is
/// uncontended in the common case since the two sides don't overlap in
/// practice, so the cost is the same as the source's discipline in the
/// profiled case. The filter slot keeps the true lock-free protocol
/// (spec.md §4.C.1) since that one is explicitly on the decode-callback
/// hot path.
pub struct Channel {
    reserved: AtomicBool,
    in_use: AtomicBool,
    channel_pause: AtomicBool,
    paused: AtomicBool,
    inner: Mutex<ChannelInner>,
    pub(crate) filter: FilterSlot,
}

impl Channel {
    pub fn new() -> Channel {
        Channel {
            reserved: AtomicBool::new(false),
            in_use: AtomicBool::new(false),
            channel_pause: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            inner: Mutex::new(ChannelInner {
                sound: None,
                decoder: None,
            }),
            filter: FilterSlot::new(),
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved.load(Ordering::Acquire)
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn channel_pause(&self) -> bool {
        self.channel_pause.load(Ordering::Acquire)
    }

    pub(crate) fn set_reserved(&self, reserved: bool) {
        self.reserved.store(reserved, Ordering::Release);
    }

    /// Installs `sound`/`decoder` and marks the channel in use. Must only
    /// be called while `!in_use` (spec.md §4.D.1, §4.F).
    pub(crate) fn start(&self, sound: Option<Sound>, decoder: Decoder) {
        let mut inner = self.inner.lock().unwrap();
        inner.sound = sound;
        inner.decoder = Some(decoder);
        drop(inner);
        self.channel_pause.store(false, Ordering::Release);
        self.paused.store(false, Ordering::Release);
        fence(Ordering::SeqCst);
        self.in_use.store(true, Ordering::Release);
    }

    /// Audio-thread entry point: pulls up to `frames` frames through the
    /// decoder and the attached filter. Returns `(frames_produced,
    /// is_stereo)`.
    pub(crate) fn pull_pcm(&self, buf: &mut [i16], frames: usize) -> (usize, bool) {
        let mut inner = self.inner.lock().unwrap();
        let Some(decoder) = inner.decoder.as_mut() else {
            return (0, false);
        };
        let n = decoder.get_pcm(buf, frames);
        let stereo = decoder.is_stereo();
        drop(inner);
        if n > 0 {
            let channels = if stereo { 2 } else { 1 };
            self.filter.apply(buf, n * channels);
        }
        (n, stereo)
    }

    pub(crate) fn with_decoder_mut<R>(&self, f: impl FnOnce(&mut Decoder) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.decoder.as_mut().map(f)
    }

    /// The single point of teardown (spec.md §4.D.3), invoked by `cut`, a
    /// zero-length `fade`, `update` on natural end-of-stream, `play` onto
    /// an already-playing reserved channel, and `cleanup`.
    pub(crate) fn reset(&self, mixer: &Mixer, index: usize) {
        mixer.stop(index);
        self.filter.close();

        let (sound, mut decoder) = {
            let mut inner = self.inner.lock().unwrap();
            (inner.sound.take(), inner.decoder.take())
        };
        if let Some(decoder) = decoder.as_mut() {
            decoder.close();
        }
        drop(decoder);

        if let Some(sound) = sound {
            // `release` reports whether this was the Sound's last
            // reference and it had been marked for deferred free; either
            // way dropping `sound` here releases this channel's clone.
            let _should_free = sound.release();
            drop(sound);
        }

        self.channel_pause.store(false, Ordering::Release);
        self.paused.store(false, Ordering::Release);
        fence(Ordering::SeqCst);
        self.in_use.store(false, Ordering::Release);
    }

    /// `pause(ch)`: spec.md §4.D.2.
    pub(crate) fn pause(&self, mixer: &Mixer, index: usize) {
        self.channel_pause.store(true, Ordering::Release);
        self.paused.store(true, Ordering::Release);
        mixer.stop(index);
    }

    /// `resume(ch)`: spec.md §4.D.2.
    pub(crate) fn resume(&self, mixer: &Mixer, index: usize, global_pause: bool, is_stereo: bool, volume: i32, pan: f32) {
        self.channel_pause.store(false, Ordering::Release);
        if self.paused.load(Ordering::Acquire) && !global_pause {
            mixer.start(index, is_stereo, volume, pan);
            self.paused.store(false, Ordering::Release);
        }
    }

    /// `pause_all`/`resume_all` touch only the derived `paused` flag and
    /// the mixer, per spec.md §4.D.2; they never alter `channel_pause`.
    pub(crate) fn pause_for_global(&self, mixer: &Mixer, index: usize) {
        self.paused.store(true, Ordering::Release);
        mixer.stop(index);
    }

    pub(crate) fn resume_for_global(&self, mixer: &Mixer, index: usize, is_stereo: bool, volume: i32, pan: f32) {
        if self.paused.load(Ordering::Acquire) && !self.channel_pause.load(Ordering::Acquire) {
            mixer.start(index, is_stereo, volume, pan);
            self.paused.store(false, Ordering::Release);
        }
    }
}

impl Default for Channel {
    fn default() -> Channel {
        Channel::new()
    }
}

/// Owns the channel array (index 0 unused) and the allocate-lock guarding
/// reservation and dynamic allocation (spec.md §4.D.1).
pub struct ChannelController {
    channels: Vec<Channel>,
    allocate_lock: Mutex<()>,
    global_pause: AtomicBool,
}

impl ChannelController {
    pub fn new(num_channels: usize) -> ChannelController {
        let mut channels = Vec::with_capacity(num_channels + 1);
        for _ in 0..=num_channels {
            channels.push(Channel::new());
        }
        ChannelController {
            channels,
            allocate_lock: Mutex::new(()),
            global_pause: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len() - 1
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn get(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index)
    }

    pub fn is_global_paused(&self) -> bool {
        self.global_pause.load(Ordering::Acquire)
    }

    /// `reserve_channel()`: the first channel neither reserved nor
    /// in-use; `0` if none (spec.md §4.D.1, §6.4's failure sentinel).
    pub fn reserve_channel(&self) -> usize {
        let _guard = self.allocate_lock.lock().unwrap();
        for (index, channel) in self.channels.iter().enumerate().skip(1) {
            if !channel.is_reserved() && !channel.is_in_use() {
                channel.set_reserved(true);
                return index;
            }
        }
        0
    }

    pub fn free_channel(&self, index: usize) {
        if let Some(channel) = self.channels.get(index) {
            channel.set_reserved(false);
        }
    }

    /// Picks a channel for `play(sound, channel=requested, …)`. `0` means
    /// "dynamically allocate the first free channel"; a positive index
    /// requires that channel to be reserved and resets it first if it was
    /// already in use (spec.md §4.D.1).
    pub fn allocate_for_play(&self, mixer: &Mixer, requested: usize) -> usize {
        let _guard = self.allocate_lock.lock().unwrap();
        if requested == 0 {
            for (index, channel) in self.channels.iter().enumerate().skip(1) {
                if !channel.is_reserved() && !channel.is_in_use() {
                    return index;
                }
            }
            return 0;
        }

        let Some(channel) = self.channels.get(requested) else {
            return 0;
        };
        if !channel.is_reserved() {
            return 0;
        }
        if channel.is_in_use() {
            channel.reset(mixer, requested);
        }
        requested
    }

    pub fn pause(&self, mixer: &Mixer, index: usize) {
        if let Some(channel) = self.channels.get(index) {
            if channel.is_in_use() {
                channel.pause(mixer, index);
            }
        }
    }

    pub fn resume(&self, mixer: &Mixer, index: usize, is_stereo: bool, volume: i32, pan: f32) {
        if let Some(channel) = self.channels.get(index) {
            if channel.is_in_use() {
                channel.resume(mixer, index, self.is_global_paused(), is_stereo, volume, pan);
            }
        }
    }

    /// `pause_all()`: spec.md §4.D.2. Idempotent.
    pub fn pause_all(&self, mixer: &Mixer) {
        for (index, channel) in self.channels.iter().enumerate().skip(1) {
            if channel.is_in_use() {
                channel.pause_for_global(mixer, index);
            }
        }
        self.global_pause.store(true, Ordering::Release);
    }

    /// `resume_all()`: spec.md §4.D.2. Idempotent. Caller supplies each
    /// channel's `(is_stereo, volume, pan)` via `snapshot`, since that
    /// state lives in the mixer rather than the channel.
    pub fn resume_all(&self, mixer: &Mixer, snapshot: impl Fn(usize) -> (bool, i32, f32)) {
        self.global_pause.store(false, Ordering::Release);
        for (index, channel) in self.channels.iter().enumerate().skip(1) {
            if channel.is_in_use() {
                let (is_stereo, volume, pan) = snapshot(index);
                channel.resume_for_global(mixer, index, is_stereo, volume, pan);
            }
        }
    }

    pub fn cut(&self, mixer: &Mixer, index: usize) {
        if let Some(channel) = self.channels.get(index) {
            if channel.is_in_use() {
                channel.reset(mixer, index);
            }
        }
    }

    /// `update()`: reaps channels the mixer reports as finished (spec.md
    /// §4.D.4). Runs on the main thread only.
    pub fn update(&self, mixer: &Mixer) {
        for (index, channel) in self.channels.iter().enumerate().skip(1) {
            if channel.is_in_use() && !channel.is_paused() && !mixer.is_playing(index) {
                channel.reset(mixer, index);
            }
        }
    }

    /// Tears down every in-use channel; called once by `cleanup` (spec.md
    /// §5's "resource lifetime rules").
    pub fn cleanup(&self, mixer: &Mixer) {
        for (index, channel) in self.channels.iter().enumerate().skip(1) {
            if channel.is_in_use() {
                channel.reset(mixer, index);
            }
        }
    }

    pub(crate) fn with_decoder_mut<R>(&self, index: usize, f: impl FnOnce(&mut Decoder) -> R) -> Option<R> {
        self.channels.get(index).and_then(|c| c.with_decoder_mut(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::window::Window;
    use crate::sound::{Format, LoopPoints};

    fn test_decoder() -> Decoder {
        let bytes = crate::decoder::wav::tests::minimal_wav(8, 0, 0);
        let window = Window::Memory(bytes.into());
        Decoder::open(window, Format::Wav, LoopPoints::default(), false, false).unwrap()
    }

    #[test]
    fn reserve_then_release_is_reusable() {
        let controller = ChannelController::new(2);
        let a = controller.reserve_channel();
        assert_ne!(a, 0);
        controller.free_channel(a);
        let b = controller.reserve_channel();
        assert_eq!(a, b);
    }

    #[test]
    fn reserve_skips_reserved_channels() {
        let controller = ChannelController::new(1);
        let a = controller.reserve_channel();
        assert_eq!(a, 1);
        assert_eq!(controller.reserve_channel(), 0);
    }

    #[test]
    fn allocate_for_play_requires_reservation_for_explicit_channel() {
        let controller = ChannelController::new(1);
        let mixer = Mixer::new(1);
        assert_eq!(controller.allocate_for_play(&mixer, 1), 0);
        controller.reserve_channel();
        assert_eq!(controller.allocate_for_play(&mixer, 1), 1);
    }

    #[test]
    fn reset_clears_in_use_and_detaches_decoder() {
        let controller = ChannelController::new(1);
        let mixer = Mixer::new(1);
        let channel = controller.get(1).unwrap();
        channel.start(None, test_decoder());
        assert!(channel.is_in_use());
        channel.reset(&mixer, 1);
        assert!(!channel.is_in_use());
    }

    #[test]
    fn pause_all_then_resume_all_restores_playback() {
        let controller = ChannelController::new(1);
        let mixer = Mixer::new(1);
        let channel = controller.get(1).unwrap();
        channel.start(None, test_decoder());
        mixer.start(1, false, crate::math::VOLUME_UNITY, 0.0);

        controller.pause_all(&mixer);
        assert!(!mixer.is_playing(1));
        controller.resume_all(&mixer, |_| (false, crate::math::VOLUME_UNITY, 0.0));
        assert!(mixer.is_playing(1));
    }

    #[test]
    fn individually_paused_channel_stays_paused_through_resume_all() {
        let controller = ChannelController::new(1);
        let mixer = Mixer::new(1);
        let channel = controller.get(1).unwrap();
        channel.start(None, test_decoder());
        mixer.start(1, false, crate::math::VOLUME_UNITY, 0.0);

        controller.pause(&mixer, 1);
        controller.pause_all(&mixer);
        controller.resume_all(&mixer, |_| (false, crate::math::VOLUME_UNITY, 0.0));
        assert!(!mixer.is_playing(1));
    }
}
