//! Filter framework: a generic per-channel PCM transform, and the two-flag
//! attach/detach protocol that lets the audio thread read the active
//! filter without a kernel lock in the common case (spec.md §4.C).

pub mod flange;

use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Mutex;

use crate::common::SampleRate;

/// A stateful PCM transformer attached to a channel between decode and
/// mix (spec.md GLOSSARY "Filter").
pub trait Filter: Send {
    /// Transforms `buf[..len]` in place.
    fn filter(&mut self, buf: &mut [i16], len: usize);

    /// Whether this filter operates on interleaved stereo PCM.
    fn is_stereo(&self) -> bool;

    /// The sample rate this filter was configured for.
    fn freq(&self) -> SampleRate;

    /// Releases any filter-private resources. Called with playback already
    /// stopped, so no further `filter` calls will race it (spec.md
    /// §4.D.3).
    fn close(&mut self) {}
}

/// Turn-based mutual exclusion between the main thread and the audio
/// thread's decode callback over a single `Option<Box<dyn Filter>>` slot
/// (spec.md §4.C.1, Peterson's algorithm). Avoided a kernel mutex because
/// a lock entry per decode callback was too costly on the hot path; any
/// scheme preserving the fast-path/stability guarantees is acceptable
/// (spec.md §9).
pub struct FilterSlot {
    want_main: AtomicBool,
    want_decode: AtomicBool,
    turn_is_main: AtomicBool,
    filter: Mutex<Option<Box<dyn Filter>>>,
}

impl FilterSlot {
    pub fn new() -> FilterSlot {
        FilterSlot {
            want_main: AtomicBool::new(false),
            want_decode: AtomicBool::new(false),
            turn_is_main: AtomicBool::new(false),
            filter: Mutex::new(None),
        }
    }

    fn lock_main(&self) {
        self.want_main.store(true, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.turn_is_main.store(false, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        while self.want_decode.load(Ordering::Relaxed) && !self.turn_is_main.load(Ordering::Relaxed)
        {
            std::thread::yield_now();
        }
    }

    fn unlock_main(&self) {
        self.want_main.store(false, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    fn lock_decode(&self) {
        self.want_decode.store(true, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.turn_is_main.store(true, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        while self.want_main.load(Ordering::Relaxed) && self.turn_is_main.load(Ordering::Relaxed) {
            std::thread::yield_now();
        }
    }

    fn unlock_decode(&self) {
        self.want_decode.store(false, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    /// Main-thread side: installs `new_filter` (closing whatever was
    /// attached before, if anything), returning only once the previous
    /// filter is fully closed (spec.md §8's testable property and
    /// §4.D.5's `set_filter`).
    pub fn set(&self, new_filter: Option<Box<dyn Filter>>) {
        self.lock_main();
        let previous = {
            let mut guard = self.filter.lock().unwrap();
            std::mem::replace(&mut *guard, new_filter)
        };
        self.unlock_main();
        if let Some(mut filter) = previous {
            filter.close();
        }
    }

    /// Audio-thread side: the fast, lock-free read for the common case of
    /// no filter attached. Only enters the lock when a filter is present.
    pub fn apply(&self, buf: &mut [i16], len: usize) {
        // Opportunistic unlocked peek: if nothing is attached this *could*
        // still race a concurrent `set`, but a null->non-null transition
        // under the lock only ever follows a decode-side observation of
        // null, so the worst case is skipping one buffer's worth of a
        // filter that just attached -- never applying a filter that was
        // just detached, which is the guarantee §4.C.1 requires.
        if self.filter.try_lock().map(|g| g.is_none()).unwrap_or(false) {
            return;
        }

        self.lock_decode();
        if let Ok(mut guard) = self.filter.try_lock() {
            if let Some(filter) = guard.as_mut() {
                filter.filter(buf, len);
            }
        }
        self.unlock_decode();
    }

    /// Tears down any attached filter immediately, used by channel reset
    /// (spec.md §4.D.3) once playback is already guaranteed stopped (so no
    /// lock is required).
    pub fn close(&self) {
        let previous = self.filter.lock().unwrap().take();
        if let Some(mut filter) = previous {
            filter.close();
        }
    }

    pub fn is_attached(&self) -> bool {
        self.filter.lock().unwrap().is_some()
    }
}

impl Default for FilterSlot {
    fn default() -> FilterSlot {
        FilterSlot::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingFilter {
        closed: std::sync::Arc<AtomicBool>,
    }

    impl Filter for CountingFilter {
        fn filter(&mut self, buf: &mut [i16], len: usize) {
            for s in &mut buf[..len] {
                *s = s.saturating_add(1);
            }
        }
        fn is_stereo(&self) -> bool {
            false
        }
        fn freq(&self) -> u32 {
            4000
        }
        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn no_filter_is_a_no_op() {
        let slot = FilterSlot::new();
        let mut buf = [1i16, 2, 3];
        slot.apply(&mut buf, 3);
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn attached_filter_transforms_buffer() {
        let slot = FilterSlot::new();
        let closed = std::sync::Arc::new(AtomicBool::new(false));
        slot.set(Some(Box::new(CountingFilter {
            closed: closed.clone(),
        })));
        let mut buf = [1i16, 2, 3];
        slot.apply(&mut buf, 3);
        assert_eq!(buf, [2, 3, 4]);
    }

    #[test]
    fn replacing_a_filter_closes_the_old_one() {
        let slot = FilterSlot::new();
        let closed = std::sync::Arc::new(AtomicBool::new(false));
        slot.set(Some(Box::new(CountingFilter {
            closed: closed.clone(),
        })));
        assert!(!closed.load(Ordering::SeqCst));
        slot.set(None);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn close_tears_down_attached_filter() {
        let slot = FilterSlot::new();
        let closed = std::sync::Arc::new(AtomicBool::new(false));
        slot.set(Some(Box::new(CountingFilter {
            closed: closed.clone(),
        })));
        slot.close();
        assert!(!slot.is_attached());
        assert!(closed.load(Ordering::SeqCst));
    }
}
