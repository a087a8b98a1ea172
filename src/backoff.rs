//! Backoff between retries of rolled-back operations.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(miri)] {
        // An interpreted run cannot afford a six figure pause.
        const SPIN_LIMIT: u32 = 4;
    } else {
        const SPIN_LIMIT: u32 = 20;
    }
}

/// Doubles the pause after every rollback, up to `2^SPIN_LIMIT` relaxations.
///
/// One value is created per operation call, so a successful operation meets
/// its next conflict starting from the shortest pause again. Progress under
/// contention is probabilistic: two conflicting threads may each roll back a
/// few times, but their growing and desynchronized pauses quickly open a
/// window in which one of them completes.
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Backoff { step: 0 }
    }

    pub(crate) fn spin(&mut self) {
        for _ in 0..1u32 << self.step {
            relax();
        }
        if self.step < SPIN_LIMIT {
            self.step += 1;
        }
    }
}

/// The pause executed inside contention loops. A pure pause: no memory
/// ordering, no yielding to the scheduler.
#[inline]
pub(crate) fn relax() {
    core::hint::spin_loop();
}
