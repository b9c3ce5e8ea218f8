//! End-to-end scenarios against a 4 kHz mono square wave source, mirroring
//! the reference scenarios used to validate this engine's behaviour.

use chanmix::engine::Engine;
use chanmix::platform::sink::FakeSink;
use chanmix::{Format, Sound};

const SAMPLE_RATE: u32 = 4000;
const TOTAL_SAMPLES: usize = 40;

/// `+10000` x4, `-10000` x4, repeating for 40 samples, packed as a minimal
/// PCM S16LE mono WAV.
fn square_wave_wav() -> Vec<u8> {
    let mut samples = Vec::with_capacity(TOTAL_SAMPLES);
    for i in 0..TOTAL_SAMPLES as i16 {
        samples.push(if (i / 4) % 2 == 0 { 10000i16 } else { -10000 });
    }

    let data_bytes = samples.len() * 2;
    let mut out = Vec::new();
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    out.extend_from_slice(&(SAMPLE_RATE * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());

    out.extend_from_slice(b"data");
    out.extend_from_slice(&(data_bytes as u32).to_le_bytes());
    for s in &samples {
        out.extend_from_slice(&s.to_le_bytes());
    }

    let riff_size = (out.len() - 8) as u32;
    out[4..8].copy_from_slice(&riff_size.to_le_bytes());
    out
}

fn square_wave_sound() -> Sound {
    Sound::from_buffer(square_wave_wav(), Format::Wav).unwrap()
}

fn engine(num_channels: usize) -> std::sync::Arc<Engine> {
    let engine = Engine::new(num_channels);
    engine.open_device_with_sink(Box::new(FakeSink::new(SAMPLE_RATE)));
    engine
}

fn pull(engine: &Engine, frames: usize) -> Vec<i16> {
    let mut out = vec![0i16; frames * 2];
    engine.pull_pcm(&mut out, frames);
    out
}

/// Scenario 1: play once, volume=1 pan=0 loop=false. Exactly 40 non-zero
/// samples, then silence; `is_playing` goes false after `update`.
#[test]
fn scenario_1_plays_exactly_forty_samples_then_silence() {
    let engine = engine(1);
    let sound = square_wave_sound();
    let ch = engine.play(&sound, 0, 1.0, 0.0, false);
    assert_ne!(ch, 0);

    let out = pull(&engine, TOTAL_SAMPLES);
    assert!(out.iter().all(|&s| s != 0));

    let tail = pull(&engine, 1);
    assert_eq!(tail, vec![0, 0]);

    engine.update();
    assert!(!engine.is_playing(ch));
}

/// Scenario 2: a short loop (`loop_start=1, loop_length=2`) keeps
/// producing samples past the natural 40-sample end of the stream,
/// repeating the looped region indefinitely rather than going silent.
#[test]
fn scenario_2_short_loop_repeats_indefinitely() {
    let engine = engine(1);
    let sound = square_wave_sound();
    let ch = engine.play(&sound, 0, 1.0, 0.0, true);
    assert_ne!(ch, 0);
    engine.set_loop(ch, 1, 2);

    // 60 frames is well past the 40-sample stream; without looping this
    // would trail off into silence partway through.
    let out = pull(&engine, 60);
    let left: Vec<i16> = out.iter().step_by(2).copied().collect();
    assert!(left.iter().all(|&s| s == 10000));
}

/// Scenario 3: two copies at volume 1; pausing channel 1 after 2 samples
/// leaves only channel 2 audible for samples 3-4; `resume` brings channel 1
/// back in.
#[test]
fn scenario_3_pause_one_of_two_channels() {
    let engine = engine(2);
    let sound_a = square_wave_sound();
    let sound_b = square_wave_sound();
    let ch1 = engine.play(&sound_a, 0, 1.0, 0.0, false);
    let ch2 = engine.play(&sound_b, 0, 1.0, 0.0, false);
    assert_ne!(ch1, 0);
    assert_ne!(ch2, 0);

    let first_two = pull(&engine, 2);
    assert!(first_two.iter().all(|&s| s != 0));

    engine.pause(ch1);
    let next_two = pull(&engine, 2);
    // samples 3-4 of the square wave are still +10000 on channel 2 alone.
    assert_eq!(next_two, vec![10000, 10000, 10000, 10000]);

    engine.resume(ch1);
    let after_resume = pull(&engine, 1);
    assert!(after_resume.iter().all(|&s| s != 0));
}

/// Scenario 5: pan=-0.5 on a mono +10000 source yields (15000, 5000) per
/// sample.
#[test]
fn scenario_5_pan_half_left() {
    let engine = engine(1);
    let sound = square_wave_sound();
    let ch = engine.play(&sound, 0, 1.0, -0.5, false);
    assert_ne!(ch, 0);

    let out = pull(&engine, 1);
    assert_eq!(out, vec![15000, 5000]);
}

/// `adjust_volume` during an active fade overrides the fade (spec boundary
/// test).
#[test]
fn adjust_volume_overrides_an_active_fade() {
    let engine = engine(1);
    let sound = square_wave_sound();
    let ch = engine.play(&sound, 0, 1.0, 0.0, false);
    engine.fade(ch, 4.0 / SAMPLE_RATE as f32);
    engine.adjust_volume(ch, 1.0, 0.0);

    let out = pull(&engine, 1);
    assert_eq!(out, vec![10000, 10000]);
}

/// `set_global_volume` outside `0..=15` is ignored; `0` silences every
/// channel regardless of its own volume.
#[test]
fn global_volume_scales_or_is_ignored() {
    let engine = engine(1);
    assert!(!engine.set_global_volume(16));

    let sound = square_wave_sound();
    let ch = engine.play(&sound, 0, 1.0, 0.0, false);
    assert_ne!(ch, 0);
    assert!(engine.set_global_volume(0));

    let out = pull(&engine, 1);
    assert_eq!(out, vec![0, 0]);
}
