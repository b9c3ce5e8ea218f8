//! Platform audio sink (spec.md §6.1): opens the device, pulls PCM on
//! demand from the audio thread, and reports the device's sampling rate.
//!
//! `Sink` is a trait rather than a concrete `cpal` type so tests can drive
//! the mixer against an in-memory fake without touching a real device.

use std::sync::{Arc, Mutex};

use crate::common::SampleRate;

/// Something that can pull interleaved stereo S16LE PCM from a callback.
pub trait Sink: Send {
    /// The device's fixed playback sample rate.
    fn playback_rate(&self) -> SampleRate;

    /// Requests a change in output latency; returns the actual latency
    /// applied. Advisory only (spec.md §5).
    fn set_latency(&mut self, seconds: f32) -> f32;

    /// Current output latency.
    fn latency(&self) -> f32;

    /// Whether the output device reports a headphone disconnect since the
    /// last acknowledge.
    fn check_headphone_disconnect(&mut self) -> bool {
        false
    }

    /// Acknowledges a reported headphone disconnect.
    fn acknowledge_headphone_disconnect(&mut self) {}
}

#[cfg(feature = "playback")]
pub use cpal_backend::CpalSink;

#[cfg(feature = "playback")]
mod cpal_backend {
    use super::{SampleRate, Sink};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, Stream, StreamConfig};

    /// A [`Sink`] backed by a real `cpal` output device. The audio
    /// callback invokes the supplied `pull` closure to fill each buffer,
    /// which is expected to call into [`crate::mixer::Mixer::get_pcm`].
    pub struct CpalSink {
        _stream: Stream,
        sample_rate: SampleRate,
        latency: f32,
    }

    impl CpalSink {
        /// Opens the named output device (or the host default if `name`
        /// is empty), per spec.md §6.1's `sink_init`.
        pub fn open(
            name: &str,
            mut pull: impl FnMut(&mut [i16]) + Send + 'static,
        ) -> Result<CpalSink, String> {
            let host = cpal::default_host();
            let device = if name.is_empty() {
                host.default_output_device()
            } else {
                host.output_devices()
                    .map_err(|e| e.to_string())?
                    .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            }
            .ok_or_else(|| "no matching output device".to_string())?;

            let config = device.default_output_config().map_err(|e| e.to_string())?;
            let sample_rate = config.sample_rate().0;
            let channels = config.channels() as usize;
            let stream_config: StreamConfig = config.clone().into();

            let stream = match config.sample_format() {
                SampleFormat::I16 => device
                    .build_output_stream(
                        &stream_config,
                        move |data: &mut [i16], _| pull(data),
                        |err| tracing::warn!(?err, "audio output stream error"),
                        None,
                    )
                    .map_err(|e| e.to_string())?,
                other => {
                    return Err(format!("unsupported sample format {other:?}"));
                }
            };
            let _ = channels;

            stream.play().map_err(|e| e.to_string())?;

            Ok(CpalSink {
                _stream: stream,
                sample_rate,
                latency: 0.0,
            })
        }
    }

    impl Sink for CpalSink {
        fn playback_rate(&self) -> SampleRate {
            self.sample_rate
        }

        fn set_latency(&mut self, seconds: f32) -> f32 {
            // cpal has no standard runtime latency knob; report the
            // requested value back as "actual", matching the advisory
            // nature of `set_latency` (spec.md §5).
            self.latency = seconds;
            self.latency
        }

        fn latency(&self) -> f32 {
            self.latency
        }
    }
}

/// In-memory [`Sink`] used by tests: records every buffer pulled through it
/// instead of writing to a device.
pub struct FakeSink {
    sample_rate: SampleRate,
    latency: f32,
    captured: Arc<Mutex<Vec<i16>>>,
}

impl FakeSink {
    pub fn new(sample_rate: SampleRate) -> FakeSink {
        FakeSink {
            sample_rate,
            latency: 0.0,
            captured: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Pulls `frames` stereo frames through `pull` and records them.
    pub fn pull(&self, frames: usize, mut pull: impl FnMut(&mut [i16])) {
        let mut buf = vec![0i16; frames * 2];
        pull(&mut buf);
        self.captured.lock().unwrap().extend_from_slice(&buf);
    }

    pub fn captured(&self) -> Vec<i16> {
        self.captured.lock().unwrap().clone()
    }
}

impl Sink for FakeSink {
    fn playback_rate(&self) -> SampleRate {
        self.sample_rate
    }

    fn set_latency(&mut self, seconds: f32) -> f32 {
        self.latency = seconds;
        seconds
    }

    fn latency(&self) -> f32 {
        self.latency
    }
}
