//! The software mixer (spec.md §4.E): per-channel volume/pan/fade
//! integration, accumulation into a 32-bit scratch buffer, and saturating
//! downmix to interleaved S16LE.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use crate::channel::Channel;
use crate::math::{
    pan_multipliers_mono, pan_multipliers_stereo, saturate_to_i16, scale_sample, PAN_BITS,
    VOLUME_BITS, VOLUME_UNITY,
};

/// Maximum samples mixed per call; larger requests are chunked (spec.md
/// §9's scratch buffer note).
pub const MIX_ACCUM_BUFLEN: usize = 1024;

struct MixerChannelState {
    playing: bool,
    is_stereo: bool,
    /// Q0.24 fixed point, unit = [`VOLUME_UNITY`].
    volume: i32,
    /// Per-sample signed delta applied while a fade is active; zero means
    /// no fade in progress.
    fade_rate: i32,
    fade_target: i32,
    fade_cut: bool,
    /// `-1.0..=1.0`.
    pan: f32,
    /// Preallocated scratch buffer, sized for the worst case (stereo,
    /// `MIX_ACCUM_BUFLEN` frames).
    scratch: Vec<i16>,
}

impl MixerChannelState {
    fn idle() -> MixerChannelState {
        MixerChannelState {
            playing: false,
            is_stereo: false,
            volume: VOLUME_UNITY,
            fade_rate: 0,
            fade_target: VOLUME_UNITY,
            fade_cut: false,
            pan: 0.0,
            scratch: vec![0i16; MIX_ACCUM_BUFLEN * 2],
        }
    }
}

/// A per-call, lock-free mirror of one playing channel's state, built
/// under the mixer lock and consumed after it is released (spec.md §4.E
/// step 2, GLOSSARY "Mixer mirror / snapshot").
struct ChannelSnapshot {
    is_stereo: bool,
    volume: i32,
    pan: f32,
    pcm: Vec<i16>,
}

pub struct Mixer {
    state: Mutex<Vec<MixerChannelState>>,
    /// Q0.24 fixed point; clamped to `[0, 15 * VOLUME_UNITY]` by
    /// [`Mixer::set_global_volume`] (spec.md §4.E).
    base_volume: AtomicI32,
}

impl Mixer {
    /// `num_channels` is the number of addressable channels (1..=N);
    /// index 0 is reserved and always idle.
    pub fn new(num_channels: usize) -> Mixer {
        let mut state = Vec::with_capacity(num_channels + 1);
        for _ in 0..=num_channels {
            state.push(MixerChannelState::idle());
        }
        Mixer {
            state: Mutex::new(state),
            base_volume: AtomicI32::new(VOLUME_UNITY),
        }
    }

    /// Starts (or restarts) channel `index` with fresh volume/pan,
    /// clearing any fade, per spec.md §4.F's "install decoder ... start".
    pub fn start(&self, index: usize, is_stereo: bool, volume: i32, pan: f32) {
        let mut state = self.state.lock().unwrap();
        let ch = &mut state[index];
        ch.playing = true;
        ch.is_stereo = is_stereo;
        ch.volume = volume;
        ch.pan = pan;
        ch.fade_rate = 0;
        ch.fade_cut = false;
    }

    /// Marks channel `index` as not playing. Used both by `pause` (the
    /// mixer simply stops pulling from it) and by channel reset's
    /// synchronous stop (spec.md §4.D.2, §4.D.3).
    pub fn stop(&self, index: usize) {
        self.state.lock().unwrap()[index].playing = false;
    }

    pub fn is_playing(&self, index: usize) -> bool {
        self.state.lock().unwrap()[index].playing
    }

    /// Reads back `(is_stereo, volume, pan)` for `index`, used by
    /// `resume_all` to restart a channel with its last-known mix state
    /// (spec.md §4.D.2).
    pub fn channel_mix_state(&self, index: usize) -> (bool, i32, f32) {
        let state = self.state.lock().unwrap();
        let ch = &state[index];
        (ch.is_stereo, ch.volume, ch.pan)
    }

    pub fn set_volume(&self, index: usize, volume: i32) {
        let mut state = self.state.lock().unwrap();
        state[index].volume = volume;
        state[index].fade_rate = 0;
    }

    pub fn set_pan(&self, index: usize, pan: f32) {
        self.state.lock().unwrap()[index].pan = pan.clamp(-1.0, 1.0);
    }

    /// Installs a fade from the channel's current volume to `target` over
    /// `samples_total` samples; `cut` stops playback once volume reaches
    /// zero (spec.md §4.D.5).
    pub fn fade(&self, index: usize, target: i32, samples_total: u64, cut: bool) {
        let mut state = self.state.lock().unwrap();
        let ch = &mut state[index];
        if samples_total == 0 {
            ch.volume = target;
            ch.fade_rate = 0;
            ch.fade_cut = cut && target == 0;
            return;
        }
        let delta = target as i64 - ch.volume as i64;
        ch.fade_rate = (delta / samples_total as i64) as i32;
        ch.fade_target = target;
        ch.fade_cut = cut;
    }

    /// Sets the global volume multiplier; `v` outside `0..=15` is ignored
    /// (spec.md §8's boundary test).
    pub fn set_global_volume(&self, v: u32) -> bool {
        if v > 15 {
            return false;
        }
        self.base_volume
            .store((v as i64 * VOLUME_UNITY as i64) as i32, Ordering::Relaxed);
        true
    }

    /// Mixes `frames` frames into `out` (interleaved stereo S16LE,
    /// `out.len() >= frames * 2`), pulling decoded PCM from `channels`
    /// (index 0 unused). Chunks internally at [`MIX_ACCUM_BUFLEN`].
    pub fn get_pcm(&self, channels: &[Channel], out: &mut [i16], frames: usize) {
        let mut done = 0usize;
        while done < frames {
            let this_chunk = (frames - done).min(MIX_ACCUM_BUFLEN);
            let snapshot = self.mix_step(channels, this_chunk);
            self.accumulate(&snapshot, &mut out[done * 2..(done + this_chunk) * 2], this_chunk);
            done += this_chunk;
        }
    }

    /// Step 1 + 2: advance fades, pull PCM under the mixer lock, and
    /// build the lock-free snapshot for accumulation.
    fn mix_step(&self, channels: &[Channel], this_chunk: usize) -> Vec<ChannelSnapshot> {
        let mut state = self.state.lock().unwrap();
        let mut snapshot = Vec::new();

        for index in 1..state.len().min(channels.len()) {
            let ch_state = &mut state[index];
            if !ch_state.playing {
                continue;
            }

            if ch_state.fade_rate != 0 {
                let remaining = ch_state.fade_target as i64 - ch_state.volume as i64;
                let step = ch_state.fade_rate as i64 * this_chunk as i64;
                let reached = (ch_state.fade_rate > 0 && step >= remaining)
                    || (ch_state.fade_rate < 0 && step <= remaining);
                if reached {
                    ch_state.volume = ch_state.fade_target;
                    ch_state.fade_rate = 0;
                } else {
                    ch_state.volume = (ch_state.volume as i64 + step) as i32;
                }
            }

            if ch_state.volume == 0 && ch_state.fade_cut {
                ch_state.playing = false;
                continue;
            }

            let channel_count = if ch_state.is_stereo { 2 } else { 1 };
            let want = this_chunk * channel_count;
            let (produced, is_stereo) = channels[index].pull_pcm(&mut ch_state.scratch[..want], this_chunk);
            if produced == 0 {
                ch_state.playing = false;
                continue;
            }
            ch_state.is_stereo = is_stereo;

            let produced_len = produced * channel_count;
            snapshot.push(ChannelSnapshot {
                is_stereo: ch_state.is_stereo,
                volume: ch_state.volume,
                pan: ch_state.pan,
                pcm: ch_state.scratch[..produced_len].to_vec(),
            });
        }

        snapshot
    }

    /// Steps 3-5: accumulate the snapshot into a 32-bit buffer and
    /// saturate down to the caller's output slice. Runs without the mixer
    /// lock held.
    fn accumulate(&self, snapshot: &[ChannelSnapshot], out: &mut [i16], this_chunk: usize) {
        let base_volume = self.base_volume.load(Ordering::Relaxed);
        let mut acc = vec![0i64; this_chunk * 2];

        for snap in snapshot {
            let effective_volume =
                ((snap.volume as i64 * base_volume as i64) >> VOLUME_BITS) as i32;
            if effective_volume == 0 {
                continue;
            }

            let (left_mult, right_mult, shift) = if snap.is_stereo {
                let (l, r) = pan_multipliers_stereo(snap.pan);
                (l, r, VOLUME_BITS + PAN_BITS)
            } else {
                let (l, r) = pan_multipliers_mono(snap.pan);
                (l, r, VOLUME_BITS + PAN_BITS - 1)
            };

            let channel_count = if snap.is_stereo { 2 } else { 1 };
            let frames = snap.pcm.len() / channel_count;
            for i in 0..frames {
                if snap.is_stereo {
                    acc[i * 2] += scale_sample(snap.pcm[i * 2], left_mult, effective_volume, shift);
                    acc[i * 2 + 1] +=
                        scale_sample(snap.pcm[i * 2 + 1], right_mult, effective_volume, shift);
                } else {
                    let s = snap.pcm[i];
                    acc[i * 2] += scale_sample(s, left_mult, effective_volume, shift);
                    acc[i * 2 + 1] += scale_sample(s, right_mult, effective_volume, shift);
                }
            }
        }

        for i in 0..this_chunk {
            out[i * 2] = saturate_to_i16(acc[i * 2]);
            out[i * 2 + 1] = saturate_to_i16(acc[i * 2 + 1]);
        }
    }
}
