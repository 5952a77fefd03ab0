//! Write Barrier
//!
//! Lets any number of writers run until a checkpoint freezes the table;
//! the freeze returns once in-flight writers have drained, and new writers
//! wait until it is lifted.

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct BarrierState {
    active: usize,
    frozen: bool,
}

#[derive(Default)]
pub(crate) struct WriteBarrier {
    state: Mutex<BarrierState>,
    changed: Condvar,
}

/// Held by a writer for the length of one operation
pub(crate) struct WritePermit<'a> {
    barrier: &'a WriteBarrier,
}

impl WriteBarrier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enter(&self) -> WritePermit<'_> {
        let mut state = self.state.lock();
        while state.frozen {
            self.changed.wait(&mut state);
        }
        state.active += 1;
        WritePermit { barrier: self }
    }

    /// Block new writers and wait for active ones to finish
    pub(crate) fn freeze(&self) {
        let mut state = self.state.lock();
        state.frozen = true;
        while state.active > 0 {
            self.changed.wait(&mut state);
        }
    }

    pub(crate) fn unfreeze(&self) {
        self.state.lock().frozen = false;
        self.changed.notify_all();
    }
}

impl Drop for WritePermit<'_> {
    fn drop(&mut self) {
        let mut state = self.barrier.state.lock();
        state.active -= 1;
        if state.active == 0 {
            self.barrier.changed.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_freeze_waits_for_active_writer() {
        let barrier = Arc::new(WriteBarrier::new());
        let released = Arc::new(AtomicBool::new(false));

        let permit_barrier = Arc::clone(&barrier);
        let permit_released = Arc::clone(&released);
        let writer = thread::spawn(move || {
            let _permit = permit_barrier.enter();
            thread::sleep(Duration::from_millis(50));
            permit_released.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(10));
        barrier.freeze();
        assert!(released.load(Ordering::SeqCst));
        barrier.unfreeze();
        writer.join().unwrap();
    }

    #[test]
    fn test_frozen_barrier_blocks_new_writers() {
        let barrier = Arc::new(WriteBarrier::new());
        barrier.freeze();

        let entered = Arc::new(AtomicBool::new(false));
        let writer_barrier = Arc::clone(&barrier);
        let writer_entered = Arc::clone(&entered);
        let writer = thread::spawn(move || {
            let _permit = writer_barrier.enter();
            writer_entered.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(30));
        assert!(!entered.load(Ordering::SeqCst));
        barrier.unfreeze();
        writer.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }
}
