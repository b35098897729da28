//! Point-to-point buffer handshake
//!
//! Each shared-memory halo buffer embeds one lock word in its alignment
//! pad. Exactly one rank writes the buffer and exactly one rank reads it,
//! so the lock is a two-party state machine:
//!
//! ```text
//!   empty --(writer claims)--> writing --(mark_write_done)--> full
//!   full  --(reader claims)--> reading --(mark_read_done)---> empty
//! ```
//!
//! Waiters spin with bounded backoff and periodically invoke a progress
//! callback so the underlying transport keeps moving while we poll.

use data::pool::RawCell;
use std::sync::atomic::Ordering::{Acquire, Release};

/// Lock states, stored in the low bits of the pad word
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LockState {
    /// Ready for the writer to fill
    Empty = 0,
    /// Writer is filling the buffer
    Writing = 1,
    /// Ready for the reader to drain
    Full = 2,
    /// Reader is draining the buffer
    Reading = 3,
}

impl LockState {
    fn from_bits(b: u64) -> Self {
        match b & 3 {
            0 => LockState::Empty,
            1 => LockState::Writing,
            2 => LockState::Full,
            _ => LockState::Reading,
        }
    }
}

/// Spins between polls before yielding the CPU
const SPINS_PER_YIELD: u32 = 64;

/// Two-party handshake over a shared atomic word
///
/// The writer owns the `empty -> writing -> full` transitions and the
/// reader owns `full -> reading -> empty`; neither side can observe a
/// state that permits concurrent access.
pub struct ShmLock<'cell> {
    cell: &'cell RawCell,
}

impl<'cell> ShmLock<'cell> {
    pub fn new(cell: &'cell RawCell) -> Self {
        Self { cell }
    }

    /// Reset to `Empty`; called once by the buffer owner before first use
    pub fn init(&self) {
        self.cell.store(LockState::Empty as u8 as _, Release);
    }

    pub fn state(&self) -> LockState {
        LockState::from_bits(self.cell.load(Acquire) as u64)
    }

    pub fn is_ok_to_write(&self) -> bool {
        self.state() == LockState::Empty
    }

    pub fn is_ok_to_read(&self) -> bool {
        self.state() == LockState::Full
    }

    /// Spin until the buffer may be written, poking `progress` while waiting
    pub fn wait_for_ok_to_write(&self, mut progress: impl FnMut()) {
        self.wait_for(LockState::Empty, &mut progress);
        self.cell.store(LockState::Writing as u8 as _, Release);
    }

    /// Release the buffer to the reader
    pub fn mark_write_done(&self) {
        debug_assert_eq!(self.state(), LockState::Writing);
        self.cell.store(LockState::Full as u8 as _, Release);
    }

    /// Spin until the buffer may be read, poking `progress` while waiting
    pub fn wait_for_ok_to_read(&self, mut progress: impl FnMut()) {
        self.wait_for(LockState::Full, &mut progress);
        self.cell.store(LockState::Reading as u8 as _, Release);
    }

    /// Hand the buffer back to the writer
    pub fn mark_read_done(&self) {
        debug_assert_eq!(self.state(), LockState::Reading);
        self.cell.store(LockState::Empty as u8 as _, Release);
    }

    fn wait_for(&self, want: LockState, progress: &mut impl FnMut()) {
        let mut spins = 0u32;
        while self.state() != want {
            std::hint::spin_loop();
            spins += 1;
            if spins % SPINS_PER_YIELD == 0 {
                progress();
                std::thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::Relaxed;

    #[test]
    fn handshake_sequence() {
        let cell = RawCell::new(0);
        let lock = ShmLock::new(&cell);
        lock.init();
        assert!(lock.is_ok_to_write());
        lock.wait_for_ok_to_write(|| {});
        assert_eq!(lock.state(), LockState::Writing);
        lock.mark_write_done();
        assert!(lock.is_ok_to_read());
        assert!(!lock.is_ok_to_write());
        lock.wait_for_ok_to_read(|| {});
        lock.mark_read_done();
        assert!(lock.is_ok_to_write());
    }

    #[test]
    fn cross_thread_handoff() {
        let cell = RawCell::new(0);
        let lock = ShmLock::new(&cell);
        lock.init();
        let pokes = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                let w = ShmLock::new(&cell);
                for _ in 0..100 {
                    w.wait_for_ok_to_write(|| {});
                    w.mark_write_done();
                }
            });
            let r = ShmLock::new(&cell);
            for _ in 0..100 {
                r.wait_for_ok_to_read(|| {
                    pokes.fetch_add(1, Relaxed);
                });
                r.mark_read_done();
            }
        });
        assert_eq!(lock.state(), LockState::Empty);
    }
}
