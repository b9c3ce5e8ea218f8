//! WAV back-end: PCM S16LE only, read directly from the window layer.
//!
//! Chunk scanning follows spec.md §4.A.4: `fmt `, `smpl`, and `data` are
//! recognised; anything after `data` is ignored by the caller.

use crate::common::{ChannelCount, SampleRate};
use crate::decoder::window::Window;
use crate::decoder::{BackendOpenResult, DecoderMeta, FormatBackend};
use crate::error::DecoderError;

struct FmtChunk {
    format_tag: u16,
    channels: ChannelCount,
    sample_rate: SampleRate,
    byte_rate: u32,
    bits_per_sample: u16,
}

pub struct WavBackend {
    window: Window,
    data_start: u64,
    total_frames: u64,
    pos: u64,
    channels: ChannelCount,
    loop_start_frame: u64,
    loop_length_frame: u64,
    loop_enabled: bool,
}

/// Opens a WAV stream, returning its back-end and detected metadata.
pub fn open(mut window: Window) -> BackendOpenResult {
    let mut fmt: Option<FmtChunk> = None;
    let mut data_range: Option<(u64, u64)> = None;
    let mut loop_start = None;
    let mut loop_length = None;

    let mut pos = 12u64; // past "RIFF____WAVE"
    loop {
        let (header, n) = window.get_data(pos, 8)?;
        if n < 8 {
            break;
        }
        let id = [header[0], header[1], header[2], header[3]];
        let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;
        let body_pos = pos + 8;

        match &id {
            b"fmt " => {
                let (body, n) = window.get_data(body_pos, 16)?;
                if n < 16 {
                    return Err(DecoderError::BadHeader {
                        format: "wav",
                        reason: "truncated fmt chunk".into(),
                    });
                }
                fmt = Some(FmtChunk {
                    format_tag: u16::from_le_bytes([body[0], body[1]]),
                    channels: u16::from_le_bytes([body[2], body[3]]),
                    sample_rate: u32::from_le_bytes([body[4], body[5], body[6], body[7]]),
                    byte_rate: u32::from_le_bytes([body[8], body[9], body[10], body[11]]),
                    bits_per_sample: u16::from_le_bytes([body[14], body[15]]),
                });
            }
            b"smpl" => {
                let (body, n) = window.get_data(body_pos, 36 + 24)?;
                if n >= 36 + 24 {
                    let num_loops = u32::from_le_bytes([body[28], body[29], body[30], body[31]]);
                    if num_loops > 0 {
                        let loop_off = 36;
                        let start = u32::from_le_bytes([
                            body[loop_off + 8],
                            body[loop_off + 9],
                            body[loop_off + 10],
                            body[loop_off + 11],
                        ]);
                        let end = u32::from_le_bytes([
                            body[loop_off + 12],
                            body[loop_off + 13],
                            body[loop_off + 14],
                            body[loop_off + 15],
                        ]);
                        // `loop_end` is inclusive (spec.md §9's "ambiguous
                        // source behaviours" item (c)).
                        if end >= start {
                            loop_start = Some(start);
                            loop_length = Some(end + 1 - start);
                        }
                    }
                }
            }
            b"data" => {
                data_range = Some((body_pos, size));
            }
            _ => {}
        }

        if &id == b"data" {
            break;
        }
        pos = body_pos + size + (size & 1);
    }

    let fmt = fmt.ok_or_else(|| DecoderError::BadHeader {
        format: "wav",
        reason: "missing fmt chunk".into(),
    })?;
    let (data_start, data_len) = data_range.ok_or_else(|| DecoderError::BadHeader {
        format: "wav",
        reason: "missing data chunk".into(),
    })?;

    if fmt.format_tag != 1 {
        return Err(DecoderError::Unsupported(format!(
            "non-PCM format tag {}",
            fmt.format_tag
        )));
    }
    if fmt.channels != 1 && fmt.channels != 2 {
        return Err(DecoderError::Unsupported(format!(
            "{} channels",
            fmt.channels
        )));
    }
    if fmt.bits_per_sample != 16 {
        return Err(DecoderError::Unsupported(format!(
            "{}-bit samples",
            fmt.bits_per_sample
        )));
    }
    if fmt.sample_rate >= (1u32 << 31) {
        return Err(DecoderError::Unsupported("sample rate out of range".into()));
    }
    if fmt.byte_rate >= (1u32 << 28) {
        return Err(DecoderError::Unsupported("byte rate out of range".into()));
    }

    window.set_bitrate(fmt.byte_rate * 8);

    let total_frames = data_len / (fmt.channels as u64 * 2);
    let backend = WavBackend {
        window,
        data_start,
        total_frames,
        pos: 0,
        channels: fmt.channels,
        loop_start_frame: 0,
        loop_length_frame: 0,
        loop_enabled: false,
    };

    Ok((
        Box::new(backend),
        DecoderMeta {
            native_freq: fmt.sample_rate,
            bitrate: fmt.byte_rate * 8,
            stereo: fmt.channels == 2,
            loop_start,
            loop_length,
        },
    ))
}

impl WavBackend {
    /// Reads at most `max_frames` frames starting at `self.pos`, stopping
    /// early at the end of the data chunk. Returns the number of frames
    /// actually read; never wraps.
    fn read_block(&mut self, out: &mut [i16], max_frames: u64) -> std::io::Result<usize> {
        let channels = self.channels as u64;
        let available = self.total_frames.saturating_sub(self.pos);
        let frames = max_frames.min(available).min(out.len() as u64 / channels);
        if frames == 0 {
            return Ok(0);
        }
        let byte_pos = self.data_start + self.pos * channels * 2;
        let bytes_wanted = (frames * channels * 2) as usize;
        let (bytes, n) = self.window.get_data(byte_pos, bytes_wanted)?;
        let bytes = bytes.to_vec();
        let whole_samples = n / 2;
        for (i, chunk) in bytes[..whole_samples * 2].chunks_exact(2).enumerate() {
            out[i] = i16::from_le_bytes([chunk[0], chunk[1]]);
        }
        let frames_read = whole_samples / channels as usize;
        self.pos += frames_read as u64;
        Ok(frames_read)
    }
}

impl FormatBackend for WavBackend {
    fn get_pcm(&mut self, buf: &mut [i16], loop_offset: &mut i64) -> std::io::Result<usize> {
        let channels = self.channels as u64;
        let frames_wanted = buf.len() / channels as usize;
        let loop_end_frame = self.loop_start_frame + self.loop_length_frame;

        let mut frames_done = 0usize;
        while frames_done < frames_wanted {
            // Frames available before either the data ends or (if looping)
            // the loop boundary wraps back to `loop_start_frame`.
            let frames_until_boundary = if self.loop_enabled && self.loop_length_frame > 0 {
                loop_end_frame.saturating_sub(self.pos)
            } else {
                self.total_frames.saturating_sub(self.pos)
            };

            if frames_until_boundary == 0 {
                if self.loop_enabled && self.loop_length_frame > 0 {
                    self.pos = self.loop_start_frame;
                    *loop_offset += self.loop_length_frame as i64;
                    continue;
                }
                break;
            }

            let want = (frames_wanted - frames_done) as u64;
            let this_round = want.min(frames_until_boundary);
            let out = &mut buf[frames_done * channels as usize..];
            let n = self.read_block(out, this_round)?;
            if n == 0 {
                break;
            }
            frames_done += n;
        }

        Ok(frames_done)
    }

    fn set_loop(&mut self, start: u32, length: u32, enabled: bool) {
        self.loop_start_frame = start as u64;
        self.loop_length_frame = if length == 0 && enabled {
            self.total_frames.saturating_sub(start as u64)
        } else {
            length as u64
        };
        self.loop_enabled = enabled;
    }

    fn close(&mut self) {}
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::decoder::window::Window;

    /// Builds a minimal mono/stereo 16-bit WAV buffer with `num_samples`
    /// zeroed frames and an optional `smpl` loop chunk.
    pub(crate) fn minimal_wav(num_samples: u32, loop_start: u32, loop_length: u32) -> Vec<u8> {
        build_wav(4000, 1, num_samples, loop_start, loop_length)
    }

    pub(crate) fn build_wav(
        sample_rate: SampleRate,
        channels: ChannelCount,
        num_samples: u32,
        loop_start: u32,
        loop_length: u32,
    ) -> Vec<u8> {
        let data_bytes = num_samples as usize * channels as usize * 2;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&0u32.to_le_bytes()); // patched below
        out.extend_from_slice(b"WAVE");

        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // PCM
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        let byte_rate = sample_rate * channels as u32 * 2;
        out.extend_from_slice(&byte_rate.to_le_bytes());
        out.extend_from_slice(&((channels * 2) as u16).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());

        if loop_length > 0 {
            out.extend_from_slice(b"smpl");
            out.extend_from_slice(&(36u32 + 24).to_le_bytes());
            out.extend_from_slice(&[0u8; 28]); // manufacturer..smpte_format
            out.extend_from_slice(&1u32.to_le_bytes()); // num_loops = 1
            out.extend_from_slice(&0u32.to_le_bytes()); // sampler data
                                                         // one loop entry (24 bytes)
            out.extend_from_slice(&0u32.to_le_bytes()); // cue point id
            out.extend_from_slice(&0u32.to_le_bytes()); // type: forward
            out.extend_from_slice(&loop_start.to_le_bytes());
            out.extend_from_slice(&(loop_start + loop_length - 1).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // fraction
            out.extend_from_slice(&0u32.to_le_bytes()); // play count
        }

        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data_bytes as u32).to_le_bytes());
        out.extend(std::iter::repeat(0u8).take(data_bytes));

        let riff_size = (out.len() - 8) as u32;
        out[4..8].copy_from_slice(&riff_size.to_le_bytes());
        out
    }

    pub(crate) fn square_wave_fixture() -> Vec<u8> {
        // spec.md §8 end-to-end scenarios: 4kHz mono square wave,
        // +10000 x4, -10000 x4, repeated to 40 samples.
        let mut samples = Vec::new();
        for i in 0..40i16 {
            let v = if (i / 4) % 2 == 0 { 10000 } else { -10000 };
            samples.push(v);
        }
        let mut wav = build_wav(4000, 1, 40, 0, 0);
        let data_start = wav.len() - 80;
        for (i, s) in samples.iter().enumerate() {
            let bytes = s.to_le_bytes();
            wav[data_start + i * 2] = bytes[0];
            wav[data_start + i * 2 + 1] = bytes[1];
        }
        wav
    }

    #[test]
    fn parses_fmt_and_data() {
        let bytes = minimal_wav(8, 0, 0);
        let window = Window::Memory(bytes.into());
        let (_backend, meta) = open(window).unwrap();
        assert_eq!(meta.native_freq, 4000);
        assert!(!meta.stereo);
        assert_eq!(meta.loop_start, None);
    }

    #[test]
    fn parses_smpl_loop_inclusive_end() {
        let bytes = minimal_wav(40, 1, 2);
        let window = Window::Memory(bytes.into());
        let (_backend, meta) = open(window).unwrap();
        assert_eq!(meta.loop_start, Some(1));
        assert_eq!(meta.loop_length, Some(2));
    }

    #[test]
    fn rejects_non_pcm_format_tag() {
        let mut bytes = minimal_wav(4, 0, 0);
        // fmt chunk's format tag sits right after "fmt " + size (8 bytes) + 12 header bytes.
        bytes[20] = 3; // IEEE float tag
        bytes[21] = 0;
        let window = Window::Memory(bytes.into());
        assert!(matches!(open(window), Err(DecoderError::Unsupported(_))));
    }

    #[test]
    fn decodes_square_wave_scenario() {
        let bytes = square_wave_fixture();
        let window = Window::Memory(bytes.into());
        let (mut backend, meta) = open(window).unwrap();
        assert_eq!(meta.native_freq, 4000);
        let mut buf = vec![0i16; 40];
        let mut loop_offset = 0i64;
        let n = backend.get_pcm(&mut buf, &mut loop_offset).unwrap();
        assert_eq!(n, 40);
        assert_eq!(buf[0], 10000);
        assert_eq!(buf[4], -10000);
        let n2 = backend.get_pcm(&mut buf, &mut loop_offset).unwrap();
        assert_eq!(n2, 0);
    }

    #[test]
    fn get_pcm_wraps_short_loop_multiple_times_in_one_call() {
        // Mirrors spec.md §8 scenario 2: a 2-frame loop starting at frame 1,
        // pulled in a single call large enough to force several wraps.
        let bytes = square_wave_fixture();
        let window = Window::Memory(bytes.into());
        let (mut backend, _meta) = open(window).unwrap();
        backend.set_loop(1, 2, true);

        let mut buf = vec![0i16; 11];
        let mut loop_offset = 0i64;
        let n = backend.get_pcm(&mut buf, &mut loop_offset).unwrap();
        assert_eq!(n, 11);
        // frame 0 plays once, then frames 1..=2 repeat forever.
        assert_eq!(buf[0], 10000);
        assert_eq!(buf[1], 10000);
        assert_eq!(buf[2], 10000);
        assert_eq!(buf[3], 10000);
        assert_eq!(buf[4], 10000);
        // four wraps occur by the time 11 frames have been produced: frame 0
        // plays once (3 frames incl. first loop pass), then four more
        // 2-frame loop passes fill the rest, each bumping loop_offset by
        // the 2-frame loop length.
        assert_eq!(loop_offset, 8);
    }

    #[test]
    fn zero_length_enabled_loop_means_loop_to_end_of_stream() {
        let bytes = square_wave_fixture();
        let window = Window::Memory(bytes.into());
        let (mut backend, _meta) = open(window).unwrap();
        backend.set_loop(0, 0, true);

        let mut buf = vec![0i16; 80];
        let mut loop_offset = 0i64;
        let n = backend.get_pcm(&mut buf, &mut loop_offset).unwrap();
        assert_eq!(n, 80);
        assert_eq!(loop_offset, 40);
        assert_eq!(buf[40], buf[0]);
    }
}
