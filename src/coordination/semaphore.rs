//! Counting semaphore bounding global executor concurrency.
//!
//! Differs from `tokio::sync::Semaphore` in two ways the scheduler relies
//! on: a freed permit is handed directly to the oldest waiter, so there is
//! no window where a permit counts as free while a waiter is still parked,
//! and the waiter queue length is observable for diagnostics.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{Error, Result};

struct State {
    available: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Counting concurrency gate with FIFO waiter admission.
pub struct Semaphore {
    state: Mutex<State>,
}

impl Semaphore {
    /// Create a semaphore with `max` permits. Zero is rejected.
    pub fn new(max: usize) -> Result<Self> {
        if max == 0 {
            return Err(Error::InvalidLimit(max));
        }
        Ok(Self {
            state: Mutex::new(State {
                available: max,
                waiters: VecDeque::new(),
            }),
        })
    }

    /// Acquire a permit, suspending in FIFO order when none are free.
    /// The permit is released when the returned guard is dropped.
    pub async fn acquire(&self) -> Permit<'_> {
        let receiver = {
            let mut state = self.state.lock().expect("semaphore state poisoned");
            if state.available > 0 {
                state.available -= 1;
                return Permit { semaphore: self };
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        // The guard covers the window where the handoff already landed in
        // the channel but this future is dropped before taking it; the
        // permit goes back into circulation instead of leaking.
        let mut parked = ParkedWaiter {
            semaphore: self,
            receiver,
            admitted: false,
        };

        // The sender only drops if release() found this waiter abandoned,
        // which cannot happen while we are still awaiting it.
        let _ = (&mut parked.receiver).await;
        parked.admitted = true;
        Permit { semaphore: self }
    }

    /// Run a future while holding a permit. The permit is released on
    /// every exit path.
    pub async fn run<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        fut.await
    }

    /// Number of currently free permits.
    pub fn available(&self) -> usize {
        self.state.lock().expect("semaphore state poisoned").available
    }

    /// Number of callers queued for a permit.
    pub fn waiting(&self) -> usize {
        self.state.lock().expect("semaphore state poisoned").waiters.len()
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("semaphore state poisoned");
        // Hand off directly to the oldest live waiter; an abandoned waiter
        // (dropped acquire future) is skipped.
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
        state.available += 1;
    }
}

struct ParkedWaiter<'a> {
    semaphore: &'a Semaphore,
    receiver: oneshot::Receiver<()>,
    admitted: bool,
}

impl Drop for ParkedWaiter<'_> {
    fn drop(&mut self) {
        if !self.admitted && self.receiver.try_recv().is_ok() {
            self.semaphore.release();
        }
    }
}

/// Guard for one held permit.
pub struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}
