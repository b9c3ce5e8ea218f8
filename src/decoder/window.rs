//! The window layer: a uniform "give me bytes at this offset" view over a
//! memory buffer or a file, per spec.md §4.A.2.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::platform::file::{AsyncFile, SubmitError};

/// Reads up to `buf.len()` bytes at `offset` without disturbing the file's
/// shared seek position assumptions elsewhere (used for a one-shot header
/// peek at `Sound` construction time).
pub(crate) fn peek_at(file: &mut File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Size of the file-backed read-ahead buffer, per spec.md §4.A.2.
const BUFFER_LEN: usize = 16384;

/// A source of raw bytes: either a borrowed in-memory slice, or a
/// file-backed, prefetching ring buffer.
pub enum Window {
    Memory(Arc<[u8]>),
    File(FileWindow),
}

impl Window {
    pub fn len(&self) -> u64 {
        match self {
            Window::Memory(data) => data.len() as u64,
            Window::File(f) => f.total_len,
        }
    }

    /// Returns up to `len` bytes starting at `pos`. The returned length may
    /// be shorter than requested; per spec.md §4.A.2/§7 a short read is the
    /// back-end's signal to treat the request as (or as if at) end of
    /// stream.
    pub fn get_data(&mut self, pos: u64, len: usize) -> io::Result<(&[u8], usize)> {
        match self {
            Window::Memory(data) => {
                if pos >= data.len() as u64 {
                    return Ok((&[], 0));
                }
                let start = pos as usize;
                let actual = len.min(data.len() - start);
                Ok((&data[start..start + actual], actual))
            }
            Window::File(f) => f.get_data(pos, len),
        }
    }

    /// Sets the stream's estimated bitrate, used to schedule prefetch
    /// deadlines (spec.md §4.A.2). No-op for memory windows.
    pub fn set_bitrate(&mut self, bits_per_sec: u32) {
        if let Window::File(f) = self {
            f.bitrate = bits_per_sec;
        }
    }
}

pub struct FileWindow {
    async_file: AsyncFile,
    total_len: u64,
    base_offset: u64,
    buffer: Vec<u8>,
    /// File offset (relative to `base_offset`) that `buffer[0]` holds.
    buffer_start: u64,
    valid_len: usize,
    outstanding: Option<(u64, usize)>,
    bitrate: u32,
}

impl FileWindow {
    pub fn new(async_file: AsyncFile, base_offset: u64, total_len: u64) -> FileWindow {
        FileWindow {
            async_file,
            total_len,
            base_offset,
            buffer: vec![0u8; BUFFER_LEN],
            buffer_start: 0,
            valid_len: 0,
            outstanding: None,
            bitrate: 0,
        }
    }

    fn in_buffer(&self, pos: u64, len: usize) -> bool {
        pos >= self.buffer_start
            && pos + len as u64 <= self.buffer_start + self.valid_len as u64
    }

    fn sync_read(&mut self, pos: u64, want: usize) -> io::Result<()> {
        self.async_file.abort();
        self.outstanding = None;
        let clamped = want.min(BUFFER_LEN);
        let mut tmp = vec![0u8; clamped];
        let n = self
            .async_file
            .read_sync(self.base_offset + pos, &mut tmp)?;
        self.buffer[..n].copy_from_slice(&tmp[..n]);
        self.buffer_start = pos;
        self.valid_len = n;
        Ok(())
    }

    fn shift_tail_if_needed(&mut self, pos: u64) {
        let relative = pos.saturating_sub(self.buffer_start);
        if relative as usize >= self.valid_len / 2 && relative > 0 && relative < self.valid_len as u64 {
            let shift = relative as usize;
            self.buffer.copy_within(shift..self.valid_len, 0);
            self.valid_len -= shift;
            self.buffer_start += shift as u64;
        }
    }

    fn maybe_prefetch(&mut self) {
        if self.outstanding.is_some() {
            return;
        }
        let tail_start = self.buffer_start + self.valid_len as u64;
        let tail_space = BUFFER_LEN.saturating_sub(self.valid_len);
        if tail_space == 0 {
            return;
        }
        if tail_start >= self.total_len {
            return;
        }
        let len = tail_space.min((self.total_len - tail_start) as usize);
        if len == 0 {
            return;
        }
        let deadline = crate::platform::file::prefetch_deadline(self.valid_len, self.bitrate);
        match self
            .async_file
            .submit(self.base_offset + tail_start, len, deadline)
        {
            Ok(()) => self.outstanding = Some((tail_start, len)),
            Err(SubmitError::Transient) | Err(SubmitError::Fatal(_)) => {}
        }
    }

    fn absorb_completed(&mut self) -> io::Result<()> {
        if let Some((start, _)) = self.outstanding {
            let n = self.async_file.wait()?;
            if let Some(buf) = self.async_file.take_buf() {
                let insert_at = (start - self.buffer_start) as usize;
                if insert_at + n <= self.buffer.len() {
                    self.buffer[insert_at..insert_at + n].copy_from_slice(&buf[..n]);
                    self.valid_len = self.valid_len.max(insert_at + n);
                }
            }
            self.outstanding = None;
        }
        Ok(())
    }

    pub fn get_data(&mut self, pos: u64, len: usize) -> io::Result<(&[u8], usize)> {
        // Step 1: wholly satisfied already -> nothing to do.
        // Step 2: an outstanding read overlaps the request, or has already
        // completed -- wait for it (this also covers "has completed": a
        // finished read is picked up on the next `wait()` at no cost).
        if !self.in_buffer(pos, len) && self.outstanding.is_some() {
            self.absorb_completed()?;
        }

        // Step 3: still not satisfied -- abort anything in flight and read
        // synchronously.
        if !self.in_buffer(pos, len) {
            self.sync_read(pos, len)?;
        }

        // Step 4: if the request sits in the upper half of the buffer,
        // compact it down to free tail space.
        self.shift_tail_if_needed(pos);

        // Step 5: with no read in flight and tail space available, kick
        // off the next prefetch.
        self.maybe_prefetch();

        let offset_in_buf = (pos - self.buffer_start) as usize;
        let available = self.valid_len.saturating_sub(offset_in_buf);
        let actual = len
            .min(available)
            .min(self.total_len.saturating_sub(pos) as usize);
        Ok((&self.buffer[offset_in_buf..offset_in_buf + actual], actual))
    }
}
