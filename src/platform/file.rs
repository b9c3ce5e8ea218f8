//! Platform file abstraction (spec.md §6.2): positional reads, a single
//! outstanding asynchronous positional read with a priority deadline, and a
//! synchronous seek+read fallback.
//!
//! `std` has no native asynchronous positional read, so this is realized
//! the way thread handoff is done elsewhere in this codebase
//! (`mixer::mixer`'s `pending_tx`/`pending_rx`, `sink.rs`'s
//! `sleep_until_end: Receiver<()>`): a bounded channel to a single
//! background reader thread owned by the `AsyncFile`.

use std::fs::File;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

/// Outcome of polling an in-flight asynchronous read.
pub enum PollResult {
    /// The read is still running.
    Pending,
    /// The read finished; number of bytes actually read.
    Ready(std::io::Result<usize>),
}

/// Distinguishes a submission failure that's worth retrying from one that
/// never will be, per spec.md §6.2.
#[derive(Debug)]
pub enum SubmitError {
    /// The async request queue is full (at most one outstanding request is
    /// ever issued by the window layer, so this should not occur in
    /// practice, but the contract allows for it).
    Transient,
    /// The file is no longer usable.
    Fatal(std::io::Error),
}

struct Job {
    offset: u64,
    buf: Vec<u8>,
    deadline: Instant,
}

struct JobResult {
    buf: Vec<u8>,
    bytes_read: std::io::Result<usize>,
}

/// A file handle capable of one outstanding asynchronous positional read at
/// a time, matching the window layer's "at most one outstanding async
/// read" policy (spec.md §4.A.2).
pub struct AsyncFile {
    file: File,
    job_tx: Sender<Job>,
    result_rx: Receiver<JobResult>,
    pending: bool,
    last_buf: Option<Vec<u8>>,
}

impl AsyncFile {
    /// Wraps an already-open file handle, spawning its background reader
    /// thread.
    pub fn new(file: File) -> std::io::Result<AsyncFile> {
        let reader = file.try_clone()?;
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (result_tx, result_rx) = mpsc::channel::<JobResult>();

        thread::Builder::new()
            .name("chanmix-file-reader".into())
            .spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    let now = Instant::now();
                    if job.deadline > now {
                        thread::sleep(job.deadline - now);
                    }
                    let mut buf = job.buf;
                    let bytes_read = positional_read(&reader, job.offset, &mut buf);
                    if result_tx.send(JobResult { buf, bytes_read }).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn file reader thread");

        Ok(AsyncFile {
            file,
            job_tx,
            result_rx,
            pending: false,
            last_buf: None,
        })
    }

    /// Performs a synchronous positional read, used as the fallback when
    /// async reads can't satisfy a request in time (spec.md §4.A.2).
    pub fn read_sync(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        positional_read(&self.file, offset, buf)
    }

    /// Submits an asynchronous read with the given scheduling deadline.
    /// Only one request may be outstanding at a time.
    pub fn submit(&mut self, offset: u64, len: usize, deadline: Instant) -> Result<(), SubmitError> {
        if self.pending {
            return Err(SubmitError::Transient);
        }
        self.job_tx
            .send(Job {
                offset,
                buf: vec![0u8; len],
                deadline,
            })
            .map_err(|_| SubmitError::Fatal(std::io::Error::other("reader thread gone")))?;
        self.pending = true;
        Ok(())
    }

    /// Non-blocking poll for the outstanding request.
    pub fn poll(&mut self) -> PollResult {
        if !self.pending {
            return PollResult::Ready(Ok(0));
        }
        match self.result_rx.try_recv() {
            Ok(result) => {
                self.pending = false;
                self.last_buf = Some(result.buf);
                PollResult::Ready(result.bytes_read)
            }
            Err(TryRecvError::Empty) => PollResult::Pending,
            Err(TryRecvError::Disconnected) => {
                self.pending = false;
                PollResult::Ready(Err(std::io::Error::other("reader thread gone")))
            }
        }
    }

    /// Blocks until the outstanding request completes.
    pub fn wait(&mut self) -> std::io::Result<usize> {
        if !self.pending {
            return Ok(0);
        }
        match self.result_rx.recv() {
            Ok(result) => {
                self.pending = false;
                self.last_buf = Some(result.buf);
                result.bytes_read
            }
            Err(_) => {
                self.pending = false;
                Err(std::io::Error::other("reader thread gone"))
            }
        }
    }

    /// Aborts the outstanding request if any. The background thread still
    /// completes the read, but its result is discarded on the next poll.
    pub fn abort(&mut self) {
        // There is no cancellation primitive for a plain positional read;
        // the in-flight read is left to finish, but `pending` is cleared
        // so the caller treats the channel as idle and may issue a
        // synchronous read immediately, per spec.md §4.A.2's "abort any
        // outstanding read, seek, and read synchronously".
        self.pending = false;
    }

    /// Takes the most recently completed request's scratch buffer back, so
    /// the window layer can copy out of it without an extra allocation on
    /// the next `submit`.
    pub fn take_buf(&mut self) -> Option<Vec<u8>> {
        self.last_buf.take()
    }

    /// Duplicates the underlying handle (spec.md §6.2's "duplicate").
    pub fn try_clone(&self) -> std::io::Result<File> {
        self.file.try_clone()
    }
}

#[cfg(unix)]
fn positional_read(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    file.read_at(buf, offset)
}

#[cfg(not(unix))]
fn positional_read(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(offset))?;
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Computes the deadline for a prefetch read given how much audio is
/// already buffered and the stream's bitrate, minus a 10ms head start, per
/// spec.md §4.A.2. Clamps to "now" (never negative).
pub fn prefetch_deadline(buffered_bytes: usize, bitrate_bits_per_sec: u32) -> Instant {
    const HEAD_START: Duration = Duration::from_millis(10);
    if bitrate_bits_per_sec == 0 {
        return Instant::now();
    }
    let buffered_secs = (buffered_bytes as f64 * 8.0) / bitrate_bits_per_sec as f64;
    let buffered = Duration::from_secs_f64(buffered_secs.max(0.0));
    let delay = buffered.saturating_sub(HEAD_START);
    Instant::now() + delay
}
