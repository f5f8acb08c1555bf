//! Counting semaphore used by the blocking queue mode.

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct SemaphoreState {
    permits: usize,
    closed: bool,
}

/// Counting semaphore with blocking acquire and close-to-release-all
#[derive(Debug)]
pub(crate) struct Semaphore {
    state: Mutex<SemaphoreState>,
    available: Condvar,
}

impl Semaphore {
    pub(crate) fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(SemaphoreState {
                permits,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Block until a permit is available; `false` if the semaphore was closed
    pub(crate) fn acquire(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return false;
            }
            if state.permits > 0 {
                state.permits -= 1;
                return true;
            }
            self.available.wait(&mut state);
        }
    }

    pub(crate) fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.permits == 0 {
            return false;
        }
        state.permits -= 1;
        true
    }

    pub(crate) fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.permits += count;
        drop(state);
        self.available.notify_all();
    }

    /// Fail every current and future acquire
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.state.lock().permits
    }
}
