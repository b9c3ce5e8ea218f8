//! Ogg Vorbis back-end, driven through `lewton`'s streaming reader.
//!
//! Per spec.md §4.B, only 1- or 2-channel streams with a sample rate
//! representable in `i32` are accepted; the bitrate reported upstream is
//! the raw-PCM bitrate (channels * native_freq * 2 bytes), not the encoded
//! bitrate, so the window layer's prefetch deadline (§4.A.2) covers the
//! worst case of a fully-decoded buffer's worth of audio.

use std::io::{self, Read};

use lewton::inside_ogg::OggStreamReader;

use crate::common::{ChannelCount, SampleRate};
use crate::decoder::window::Window;
use crate::decoder::{BackendOpenResult, DecoderMeta, FormatBackend};
use crate::error::DecoderError;

/// Adapts the window layer's `get_data` contract to `std::io::Read` for
/// lewton, which only needs forward sequential reads to decode.
struct WindowReader {
    window: Window,
    pos: u64,
}

impl Read for WindowReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (data, n) = self.window.get_data(self.pos, buf.len())?;
        buf[..n].copy_from_slice(data);
        self.pos += n as u64;
        Ok(n)
    }
}

pub struct VorbisBackend {
    reader: OggStreamReader<WindowReader>,
    leftover: Vec<i16>,
    leftover_pos: usize,
    channels: ChannelCount,
    /// Frames produced so far, in the post-loop-rewind frame of reference
    /// (matches `loop_offset`'s bookkeeping, spec.md §4.A.4).
    pos: u64,
    loop_start_frame: u64,
    loop_length_frame: u64,
    loop_enabled: bool,
    /// Interleaved samples captured on the first pass through
    /// `[loop_start_frame, loop_start_frame + loop_length_frame)`, replayed
    /// on every subsequent pass since `reader` only supports forward
    /// sequential reads and can't rewind to `loop_start_frame` itself.
    loop_buf: Vec<i16>,
}

/// Opens an Ogg/Vorbis stream and scans its comment header for
/// `LOOPSTART=`/`LOOPLENGTH=` tags, per spec.md §4.A.4.
pub fn open(window: Window) -> BackendOpenResult {
    let reader = WindowReader { window, pos: 0 };
    let stream = OggStreamReader::new(reader).map_err(|e| DecoderError::BadHeader {
        format: "ogg-vorbis",
        reason: e.to_string(),
    })?;

    let ident = &stream.ident_hdr;
    let channels = ident.audio_channels as ChannelCount;
    if channels != 1 && channels != 2 {
        return Err(DecoderError::Unsupported(format!(
            "{channels} channels"
        )));
    }
    let sample_rate: SampleRate = ident.audio_sample_rate;
    if sample_rate > i32::MAX as u32 {
        return Err(DecoderError::Unsupported("sample rate out of range".into()));
    }

    let (loop_start, loop_length) = scan_loop_tags(&stream.comment_hdr.comment_list);

    let bitrate = sample_rate * channels as u32 * 2 * 8;

    let backend = VorbisBackend {
        reader: stream,
        leftover: Vec::new(),
        leftover_pos: 0,
        channels,
        pos: 0,
        loop_start_frame: 0,
        loop_length_frame: 0,
        loop_enabled: false,
        loop_buf: Vec::new(),
    };

    Ok((
        Box::new(backend),
        DecoderMeta {
            native_freq: sample_rate,
            bitrate,
            stereo: channels == 2,
            loop_start,
            loop_length,
        },
    ))
}

/// Parses `key=value` Vorbis comments for case-exact `LOOPSTART`/
/// `LOOPLENGTH` tags. An empty value is zero; any non-digit character
/// discards the whole pair, per spec.md §4.A.4.
fn scan_loop_tags(comments: &[(String, String)]) -> (Option<u32>, Option<u32>) {
    let mut start = None;
    let mut length = None;
    for (key, value) in comments {
        match key.as_str() {
            "LOOPSTART" => start = parse_loop_value(value),
            "LOOPLENGTH" => length = parse_loop_value(value),
            _ => {}
        }
    }
    (start, length)
}

fn parse_loop_value(value: &str) -> Option<u32> {
    if value.is_empty() {
        return Some(0);
    }
    value.parse::<u32>().ok()
}

impl VorbisBackend {
    /// Pulls one interleaved frame straight from `reader`'s packet stream,
    /// refilling the leftover buffer from further packets as needed.
    /// `None` at genuine end of stream.
    fn next_decoded_frame(&mut self) -> Option<Vec<i16>> {
        let channels = self.channels as usize;
        loop {
            if self.leftover_pos + channels <= self.leftover.len() {
                let frame = self.leftover[self.leftover_pos..self.leftover_pos + channels].to_vec();
                self.leftover_pos += channels;
                return Some(frame);
            }
            match self.reader.read_dec_packet_itl() {
                Ok(Some(packet)) => {
                    self.leftover = packet;
                    self.leftover_pos = 0;
                }
                Ok(None) | Err(_) => return None,
            }
        }
    }
}

impl FormatBackend for VorbisBackend {
    /// Produces frames, honoring an internal loop by buffering the looped
    /// region on its first pass and replaying it on every pass after
    /// (spec.md §4.A.4) -- `reader` can't seek backward to `loop_start_frame`
    /// the way the WAV back-end can index directly into its data chunk.
    fn get_pcm(&mut self, buf: &mut [i16], loop_offset: &mut i64) -> io::Result<usize> {
        let channels = self.channels as usize;
        let frames_wanted = buf.len() / channels;
        let mut frames_done = 0usize;

        while frames_done < frames_wanted {
            if self.loop_enabled && self.loop_length_frame > 0 {
                let loop_end = self.loop_start_frame + self.loop_length_frame;
                if self.pos >= loop_end {
                    self.pos = self.loop_start_frame;
                    *loop_offset += self.loop_length_frame as i64;
                }
                if self.pos >= self.loop_start_frame && self.pos < loop_end {
                    let rel = (self.pos - self.loop_start_frame) as usize;
                    let buffered_frames = self.loop_buf.len() / channels;
                    if rel < buffered_frames {
                        let base = rel * channels;
                        let out_base = frames_done * channels;
                        buf[out_base..out_base + channels]
                            .copy_from_slice(&self.loop_buf[base..base + channels]);
                        frames_done += 1;
                        self.pos += 1;
                        continue;
                    }
                }
            }

            let Some(frame) = self.next_decoded_frame() else {
                break;
            };
            let in_loop_region = self.loop_enabled
                && self.loop_length_frame > 0
                && self.pos >= self.loop_start_frame
                && self.pos < self.loop_start_frame + self.loop_length_frame;
            if in_loop_region {
                self.loop_buf.extend_from_slice(&frame);
            }
            let out_base = frames_done * channels;
            buf[out_base..out_base + channels].copy_from_slice(&frame);
            frames_done += 1;
            self.pos += 1;
        }

        Ok(frames_done)
    }

    /// Installs loop points. A zero `length` ("loop to end of stream", the
    /// WAV back-end's convention) isn't supported here: this back-end
    /// reads forward only and doesn't know the stream's total length
    /// without eagerly decoding all of it, so a zero-length loop is
    /// treated as disabled. A changed region invalidates any previously
    /// buffered replay data.
    fn set_loop(&mut self, start: u32, length: u32, enabled: bool) {
        self.loop_start_frame = start as u64;
        self.loop_length_frame = length as u64;
        self.loop_enabled = enabled && length > 0;
        self.loop_buf.clear();
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_tag_parsing_accepts_empty_as_zero() {
        assert_eq!(parse_loop_value(""), Some(0));
    }

    #[test]
    fn loop_tag_parsing_rejects_garbage() {
        assert_eq!(parse_loop_value("abc"), None);
    }

    #[test]
    fn loop_tag_parsing_accepts_decimal() {
        assert_eq!(parse_loop_value("1234"), Some(1234));
    }

    #[test]
    fn scan_loop_tags_finds_both() {
        let comments = vec![
            ("ARTIST".to_string(), "someone".to_string()),
            ("LOOPSTART".to_string(), "100".to_string()),
            ("LOOPLENGTH".to_string(), "200".to_string()),
        ];
        assert_eq!(scan_loop_tags(&comments), (Some(100), Some(200)));
    }

    #[test]
    fn scan_loop_tags_discards_invalid_pair() {
        let comments = vec![("LOOPSTART".to_string(), "nope".to_string())];
        assert_eq!(scan_loop_tags(&comments), (None, None));
    }
}
