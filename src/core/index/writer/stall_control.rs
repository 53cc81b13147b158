// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::{ErrorKind::ThreadInterrupted, Result};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Upper bound of a single stall wait, callers re-check and re-stall
/// if the writer is still stalled afterwards.
pub const DEFAULT_STALL_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Controls the health status of a `DocumentsWriter` sessions. This struct
/// used to block incoming indexing threads if flushing significantly slower
/// than indexing to ensure the `DocumentsWriter`s healthiness. If flushing
/// is significantly slower than indexing the net memory used within an
/// indexing session can increase very quickly and easily exceed the
/// available memory.
///
/// To prevent running out of memory this struct blocks incoming threads from
/// indexing once the flushing plus active memory exceeds twice the RAM
/// buffer while the active memory alone stays below it. Once flushing catches
/// up the stall flag is reset and threads are released to continue indexing.
pub struct DocumentsWriterStallControl {
    lock: Mutex<StallState>,
    cond: Condvar,
    // written under `lock`, read without it on the fast path
    stalled: AtomicBool,
    wait_timeout: Duration,
}

struct StallState {
    num_waiting: u32,
    // bumped by `interrupt_waiters`
    interrupt_epoch: u64,
    // only with assert
    was_stalled: bool,
    // only with assert
    waiting: HashMap<ThreadId, bool>,
}

impl Default for DocumentsWriterStallControl {
    fn default() -> Self {
        Self::new(DEFAULT_STALL_WAIT_TIMEOUT)
    }
}

impl DocumentsWriterStallControl {
    pub fn new(wait_timeout: Duration) -> Self {
        DocumentsWriterStallControl {
            lock: Mutex::new(StallState {
                num_waiting: 0,
                interrupt_epoch: 0,
                was_stalled: false,
                waiting: HashMap::new(),
            }),
            cond: Condvar::new(),
            stalled: AtomicBool::new(false),
            wait_timeout,
        }
    }

    fn state(&self) -> MutexGuard<'_, StallState> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Update the stalled flag status. This method will set the stalled flag
    /// to `true` iff the net memory of the writer exceeds the stall limit
    /// while the active memory alone does not. Otherwise it will reset the
    /// stall control to healthy and release all threads waiting on
    /// `wait_if_stalled()`.
    pub fn update_stalled(&self, stalled: bool) {
        let mut state = self.state();
        if self.stalled.load(Ordering::Acquire) != stalled {
            self.stalled.store(stalled, Ordering::Release);
            if stalled {
                state.was_stalled = true;
                debug!("DWSC: now stalled");
            } else {
                debug!("DWSC: healthy again, wake {} waiters", state.num_waiting);
            }
            self.cond.notify_all();
        }
    }

    /// Blocks if documents writing is currently in a stalled state.
    ///
    /// Each wake-up re-checks the stalled flag. The wait gives up after the
    /// configured timeout so that the caller can help flushing and re-stall.
    /// Returns `ThreadInterrupted` if `interrupt_waiters` is called while
    /// this thread waits.
    pub fn wait_if_stalled(&self) -> Result<()> {
        if !self.stalled.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut state = self.state();
        if !self.stalled.load(Ordering::Acquire) {
            return Ok(());
        }

        let epoch = state.interrupt_epoch;
        let deadline = Instant::now() + self.wait_timeout;
        Self::inc_waiters(&mut state);
        while self.stalled.load(Ordering::Acquire) && state.interrupt_epoch == epoch {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        Self::decr_waiters(&mut state);

        if state.interrupt_epoch != epoch {
            bail!(ThreadInterrupted);
        }
        Ok(())
    }

    /// Wakes every thread blocked in `wait_if_stalled` with a
    /// `ThreadInterrupted` error.
    pub fn interrupt_waiters(&self) {
        let mut state = self.state();
        state.interrupt_epoch += 1;
        debug!("DWSC: interrupt {} waiters", state.num_waiting);
        self.cond.notify_all();
    }

    fn inc_waiters(state: &mut StallState) {
        state.num_waiting += 1;
        let v = state.waiting.insert(thread::current().id(), true);
        debug_assert!(v.is_none());
    }

    fn decr_waiters(state: &mut StallState) {
        debug_assert!(state.num_waiting > 0);
        let v = state.waiting.remove(&thread::current().id());
        debug_assert!(v.is_some());
        state.num_waiting -= 1;
    }

    pub fn has_blocked(&self) -> bool {
        self.state().num_waiting > 0
    }

    pub fn num_waiting(&self) -> u32 {
        self.state().num_waiting
    }

    pub fn any_stalled_threads(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    // for tests
    pub fn is_healthy(&self) -> bool {
        !self.stalled.load(Ordering::Acquire)
    }

    pub fn is_thread_queued(&self, t: &ThreadId) -> bool {
        self.state().waiting.contains_key(t)
    }

    pub fn was_stalled(&self) -> bool {
        self.state().was_stalled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};

    use std::sync::Arc;

    fn wait_for_blocked(ctrl: &DocumentsWriterStallControl, n: u32) {
        let start = Instant::now();
        while ctrl.num_waiting() < n {
            assert!(start.elapsed() < Duration::from_secs(10), "waiters never blocked");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_healthy_does_not_block() {
        let ctrl = DocumentsWriterStallControl::default();
        assert!(ctrl.is_healthy());
        ctrl.wait_if_stalled().unwrap();
        assert!(!ctrl.has_blocked());
        assert!(!ctrl.was_stalled());

        ctrl.update_stalled(true);
        ctrl.update_stalled(true);
        assert!(ctrl.was_stalled());
        assert!(ctrl.any_stalled_threads());
        ctrl.update_stalled(false);
        assert!(ctrl.is_healthy());
        ctrl.wait_if_stalled().unwrap();
    }

    #[test]
    fn test_stalled_threads_are_released() {
        let ctrl = Arc::new(DocumentsWriterStallControl::new(Duration::from_secs(60)));
        ctrl.update_stalled(true);

        let mut handles = vec![];
        for _ in 0..3 {
            let ctrl = Arc::clone(&ctrl);
            handles.push(thread::spawn(move || {
                let start = Instant::now();
                ctrl.wait_if_stalled().unwrap();
                start.elapsed()
            }));
        }
        wait_for_blocked(&ctrl, 3);
        for h in &handles {
            assert!(ctrl.is_thread_queued(&h.thread().id()));
        }

        ctrl.update_stalled(false);
        for h in handles {
            assert!(h.join().unwrap() < Duration::from_secs(60));
        }
        assert!(!ctrl.has_blocked());
    }

    #[test]
    fn test_wait_times_out_while_still_stalled() {
        let ctrl = DocumentsWriterStallControl::new(Duration::from_millis(20));
        ctrl.update_stalled(true);
        ctrl.wait_if_stalled().unwrap();
        assert!(ctrl.any_stalled_threads());
        assert_eq!(ctrl.num_waiting(), 0);
    }

    #[test]
    fn test_interrupt_waiters() {
        let ctrl = Arc::new(DocumentsWriterStallControl::new(Duration::from_secs(60)));
        ctrl.update_stalled(true);

        let waiter = {
            let ctrl = Arc::clone(&ctrl);
            thread::spawn(move || ctrl.wait_if_stalled())
        };
        wait_for_blocked(&ctrl, 1);
        ctrl.interrupt_waiters();

        match waiter.join().unwrap() {
            Err(Error(ErrorKind::ThreadInterrupted, _)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!ctrl.has_blocked());
        // still stalled, interruption only releases the waiters
        assert!(ctrl.any_stalled_threads());
    }
}
