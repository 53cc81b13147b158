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

use crate::core::index::writer::{
    BufferedUpdatesStream, DocConsumer, DocumentsWriterDeleteQueue, DocumentsWriterPerThread,
    DocumentsWriterPerThreadPool, DocumentsWriterStallControl, FlushPolicy, IndexWriterConfig,
    LockedThreadState, ThreadState, WriterId,
};
use crate::error::Result;

use std::cmp;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// This struct controls `DocumentsWriterPerThread` flushing during
/// indexing. It tracks the memory consumption per
/// `DocumentsWriterPerThread` and uses a configured `FlushPolicy` to
/// decide if a `DocumentsWriterPerThread` must flush.
///
/// In addition to the `FlushPolicy` the flush control might set certain
/// `DocumentsWriterPerThread` as flush pending iff a
/// `DocumentsWriterPerThread` exceeds the
/// `IndexWriterConfig::ram_per_thread_hard_limit_mb` to prevent address
/// space exhaustion.
///
/// All accounting lives in `FlushControlState` behind one mutex. Methods
/// that need a `ThreadState` locked take a `LockedThreadState`, the
/// control itself only ever uses `try_lock` on thread states while it holds
/// its own lock, so the lock order is thread state first, then this
/// control, then the stall control.
pub struct DocumentsWriterFlushControl<C: DocConsumer> {
    lock: Mutex<FlushControlState<C>>,
    cond: Condvar,
    hard_max_bytes_per_dwpt: u64,
    flush_deletes: AtomicBool,
    stall_control: DocumentsWriterStallControl,
    per_thread_pool: Arc<DocumentsWriterPerThreadPool<C>>,
    flush_policy: Arc<dyn FlushPolicy<C>>,
    config: Arc<IndexWriterConfig>,
    buffered_updates_stream: Arc<BufferedUpdatesStream>,
    // documents buffered by all writers, owned by the documents writer
    num_docs_in_ram: Arc<AtomicU32>,
}

/// The accounting guarded by the flush control lock. A `&mut` to it is the
/// proof that the lock is held.
pub struct FlushControlState<C: DocConsumer> {
    active_bytes: u64,
    flush_bytes: u64,
    num_pending: usize,
    num_docs_since_stalled: u64,
    full_flush: bool,
    closed: bool,
    flush_queue: VecDeque<DocumentsWriterPerThread<C>>,
    // only for safety reasons if a DWPT is close to the RAM limit
    blocked_flushes: VecDeque<BlockedFlush<C>>,
    flushing_writers: HashMap<WriterId, u64>,
    full_flush_buffer: Vec<DocumentsWriterPerThread<C>>,
    // only with assert
    peak_active_bytes: u64,
    peak_flush_bytes: u64,
    peak_net_bytes: u64,
    peak_delta: u64,
}

impl<C: DocConsumer> FlushControlState<C> {
    fn new() -> Self {
        FlushControlState {
            active_bytes: 0,
            flush_bytes: 0,
            num_pending: 0,
            num_docs_since_stalled: 0,
            full_flush: false,
            closed: false,
            flush_queue: VecDeque::new(),
            blocked_flushes: VecDeque::new(),
            flushing_writers: HashMap::new(),
            full_flush_buffer: vec![],
            peak_active_bytes: 0,
            peak_flush_bytes: 0,
            peak_net_bytes: 0,
            peak_delta: 0,
        }
    }

    pub fn active_bytes(&self) -> u64 {
        self.active_bytes
    }

    pub fn flush_bytes(&self) -> u64 {
        self.flush_bytes
    }

    pub fn net_bytes(&self) -> u64 {
        self.active_bytes + self.flush_bytes
    }

    pub fn num_pending(&self) -> usize {
        self.num_pending
    }

    pub fn is_full_flush(&self) -> bool {
        self.full_flush
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

struct BlockedFlush<C: DocConsumer> {
    dwpt: DocumentsWriterPerThread<C>,
    bytes: u64,
}

/// A consistent snapshot of the flush accounting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlushControlStats {
    pub active_bytes: u64,
    pub flush_bytes: u64,
    pub num_pending: usize,
    pub num_queued_flushes: usize,
    pub num_blocked_flushes: usize,
    pub num_flushing_writers: usize,
    pub num_thread_states: usize,
    pub full_flush: bool,
    pub closed: bool,
    pub stalled: bool,
    /// Peaks are only tracked in debug builds.
    pub peak_active_bytes: u64,
    pub peak_flush_bytes: u64,
    pub peak_net_bytes: u64,
    pub peak_delta: u64,
}

impl FlushControlStats {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<C: DocConsumer> DocumentsWriterFlushControl<C> {
    pub fn new(
        config: Arc<IndexWriterConfig>,
        per_thread_pool: Arc<DocumentsWriterPerThreadPool<C>>,
        flush_policy: Arc<dyn FlushPolicy<C>>,
        buffered_updates_stream: Arc<BufferedUpdatesStream>,
        num_docs_in_ram: Arc<AtomicU32>,
    ) -> Self {
        DocumentsWriterFlushControl {
            lock: Mutex::new(FlushControlState::new()),
            cond: Condvar::new(),
            hard_max_bytes_per_dwpt: config.per_thread_hard_limit(),
            flush_deletes: AtomicBool::new(false),
            stall_control: DocumentsWriterStallControl::new(config.stall_wait_timeout()),
            per_thread_pool,
            flush_policy,
            config,
            buffered_updates_stream,
            num_docs_in_ram,
        }
    }

    // the accounting stays consistent across a panicking holder, every
    // mutation is completed before anything that may panic
    fn lock_state(&self) -> MutexGuard<'_, FlushControlState<C>> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn per_thread_pool(&self) -> &Arc<DocumentsWriterPerThreadPool<C>> {
        &self.per_thread_pool
    }

    pub fn config(&self) -> &Arc<IndexWriterConfig> {
        &self.config
    }

    pub fn stall_control(&self) -> &DocumentsWriterStallControl {
        &self.stall_control
    }

    pub fn active_bytes(&self) -> u64 {
        self.lock_state().active_bytes
    }

    pub fn flush_bytes(&self) -> u64 {
        self.lock_state().flush_bytes
    }

    pub fn net_bytes(&self) -> u64 {
        self.lock_state().net_bytes()
    }

    fn stall_limit_bytes(&self) -> u64 {
        if self.config.flush_on_ram() {
            2 * self.config.ram_buffer_size()
        } else {
            u64::max_value()
        }
    }

    fn assert_memory(&self, lg: &FlushControlState<C>) -> bool {
        if self.config.flush_on_ram() {
            let ram_buffer_bytes = self.config.ram_buffer_size();
            // the worst case is that every DWPT that is out of the active set
            // had crossed the buffer by one peak document, and that every
            // thread that passed the stall check before we stalled brings
            // one more peak document on top of twice the buffer
            if lg.peak_delta < (ram_buffer_bytes >> 1) {
                let out_of_loop = (lg.num_pending
                    + lg.flushing_writers.len()
                    + lg.blocked_flushes.len()) as u64;
                let expected = 2 * ram_buffer_bytes
                    + out_of_loop * lg.peak_delta
                    + lg.num_docs_since_stalled * lg.peak_delta;
                let ram = lg.net_bytes();
                assert!(
                    ram <= expected,
                    "actual mem: {} byte, expected mem: {} byte, flush mem: {}, active mem: {}, \
                     pending DWPT: {}, flushing DWPT: {}, blocked DWPT: {}, peak_delta mem: {} \
                     bytes, ram_buffer_bytes={}",
                    ram,
                    expected,
                    lg.flush_bytes,
                    lg.active_bytes,
                    lg.num_pending,
                    lg.flushing_writers.len(),
                    lg.blocked_flushes.len(),
                    lg.peak_delta,
                    ram_buffer_bytes
                );
            }
        }
        true
    }

    fn assert_conservation(&self, lg: &FlushControlState<C>) -> bool {
        let live = self.internal_live_writer_bytes(lg);
        assert_eq!(
            lg.net_bytes(),
            live,
            "net bytes {} do not match the bytes of live writers {}",
            lg.net_bytes(),
            live
        );
        true
    }

    fn internal_live_writer_bytes(&self, lg: &FlushControlState<C>) -> u64 {
        let in_states: u64 = self
            .per_thread_pool
            .thread_states()
            .map(|s| s.bytes_used())
            .sum();
        let flushing: u64 = lg.flushing_writers.values().sum();
        let blocked: u64 = lg.blocked_flushes.iter().map(|b| b.bytes).sum();
        in_states + flushing + blocked
    }

    /// Sum of the bytes accounted to thread states, flushing writers and
    /// blocked flushes. Always equal to `net_bytes`.
    pub fn live_writer_bytes(&self) -> u64 {
        let lg = self.lock_state();
        self.internal_live_writer_bytes(&lg)
    }

    fn commit_per_thread_bytes(
        &self,
        lg: &mut FlushControlState<C>,
        per_thread: &LockedThreadState<'_, C>,
    ) {
        let (bytes, num_docs) = match per_thread.dwpt() {
            Some(dwpt) => (dwpt.bytes_used(), dwpt.num_docs_in_ram),
            None => (0, 0),
        };
        let old_bytes = per_thread.bytes_used();
        per_thread.set_bytes_used(bytes);
        per_thread.set_num_docs_in_ram(num_docs);
        // a writer only grows while it is buffering, the pending flag
        // decides which counter it is accounted to
        if per_thread.flush_pending() {
            debug_assert!(lg.flush_bytes >= old_bytes);
            lg.flush_bytes = lg.flush_bytes - old_bytes + bytes;
        } else {
            debug_assert!(lg.active_bytes >= old_bytes);
            lg.active_bytes = lg.active_bytes - old_bytes + bytes;
        }
        debug_assert!(self.update_peaks(lg, bytes.saturating_sub(old_bytes)));
    }

    // only for asserts
    fn update_peaks(&self, lg: &mut FlushControlState<C>, delta: u64) -> bool {
        lg.peak_active_bytes = cmp::max(lg.peak_active_bytes, lg.active_bytes);
        lg.peak_flush_bytes = cmp::max(lg.peak_flush_bytes, lg.flush_bytes);
        lg.peak_net_bytes = cmp::max(lg.peak_net_bytes, lg.net_bytes());
        lg.peak_delta = cmp::max(lg.peak_delta, delta);
        true
    }

    /// Accounts the document just indexed on `per_thread`, consults the
    /// flush policy and returns a writer the caller must flush, if any.
    pub fn do_after_document(
        &self,
        per_thread: &mut LockedThreadState<'_, C>,
        is_update: bool,
    ) -> Option<DocumentsWriterPerThread<C>> {
        let mut lg = self.lock_state();
        self.commit_per_thread_bytes(&mut lg, per_thread);
        if !per_thread.flush_pending() {
            if is_update {
                self.flush_policy
                    .on_update(self, &mut lg, per_thread.state());
            } else {
                self.flush_policy
                    .on_insert(self, &mut lg, per_thread.state());
            }
            if !per_thread.flush_pending() && per_thread.bytes_used() > self.hard_max_bytes_per_dwpt
            {
                // a single DWPT must never grow past its hard limit
                debug!(
                    "DWFC: thread state {} crossed the per thread hard limit: {} bytes",
                    per_thread.index(),
                    per_thread.bytes_used()
                );
                self.set_flush_pending(&mut lg, per_thread.state());
            }
        }
        let flushing_dwpt = if lg.full_flush {
            if per_thread.flush_pending() {
                self.checkout_and_block(&mut lg, per_thread);
                self.internal_next_pending_flush(&mut lg)
            } else {
                None
            }
        } else {
            self.try_checkout_for_flush(&mut lg, per_thread)
        };
        let stalled = self.internal_update_stall_state(&mut lg);
        debug_assert!(self.assert_num_docs_since_stalled(&mut lg, stalled));
        debug_assert!(self.assert_memory(&lg));
        debug_assert!(self.assert_conservation(&lg));
        flushing_dwpt
    }

    // updates the number of documents "finished" while we are in a stalled
    // state. this bounds the in flight documents in `assert_memory`
    fn assert_num_docs_since_stalled(&self, lg: &mut FlushControlState<C>, stalled: bool) -> bool {
        if stalled {
            lg.num_docs_since_stalled += 1;
        } else {
            lg.num_docs_since_stalled = 0;
        }
        true
    }

    fn checkout_and_block(&self, lg: &mut FlushControlState<C>, per_thread: &mut LockedThreadState<'_, C>) {
        debug_assert!(
            per_thread.flush_pending(),
            "can not block non-pending thread state"
        );
        debug_assert!(lg.full_flush, "can not block if full_flush == false");
        let bytes = per_thread.bytes_used();
        if let Some(dwpt) = self.per_thread_pool.reset(per_thread, lg.closed) {
            debug!(
                "DWFC: block flush of {} until the full flush finishes",
                dwpt.segment_name()
            );
            lg.num_pending -= 1;
            lg.blocked_flushes.push_back(BlockedFlush { dwpt, bytes });
        }
    }

    /// Removes a flushed (or aborted) writer from the flushing set and
    /// wakes threads waiting in `wait_for_flush`.
    pub fn do_after_flush(&self, dwpt: DocumentsWriterPerThread<C>) {
        let mut lg = self.lock_state();
        self.internal_after_flush(&mut lg, dwpt);
    }

    fn internal_after_flush(&self, lg: &mut FlushControlState<C>, dwpt: DocumentsWriterPerThread<C>) {
        debug_assert!(lg.flushing_writers.contains_key(&dwpt.id()));
        if let Some(bytes) = lg.flushing_writers.remove(&dwpt.id()) {
            debug_assert!(lg.flush_bytes >= bytes);
            lg.flush_bytes -= bytes;
        }
        debug!("DWFC: {} left the flushing set", dwpt.segment_name());
        debug_assert!(self.assert_memory(lg));
        self.internal_update_stall_state(lg);
        self.cond.notify_all();
    }

    /// Blocks until no writer is flushing anymore.
    pub fn wait_for_flush(&self) -> Result<()> {
        let mut lg = self.lock_state();
        while !lg.flushing_writers.is_empty() {
            lg = self.cond.wait(lg).unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }

    /// Recomputes the stall flag from the current accounting. Idempotent.
    pub fn update_stall_state(&self) -> bool {
        let mut lg = self.lock_state();
        self.internal_update_stall_state(&mut lg)
    }

    fn internal_update_stall_state(&self, lg: &mut FlushControlState<C>) -> bool {
        // Indexing threads are stalled once flushes fall behind so much that
        // the net bytes cross twice the RAM buffer. Small buffers and large
        // documents can reach that limit with active bytes alone, flushing
        // can not free enough memory then, so active bytes must stay below
        // the limit for a stall.
        let limit = self.stall_limit_bytes();
        let stall = lg.active_bytes.saturating_add(lg.flush_bytes) > limit
            && lg.active_bytes < limit
            && !lg.closed;
        self.stall_control.update_stalled(stall);
        stall
    }

    /// Sets flush pending state on the given `ThreadState`. A state with no
    /// buffered documents is left as is. The state must not be pending.
    pub fn set_flush_pending(&self, lg: &mut FlushControlState<C>, per_thread: &ThreadState<C>) {
        debug_assert!(
            !per_thread.flush_pending(),
            "thread state {} is already pending",
            per_thread.index()
        );
        if per_thread.num_docs_in_ram() > 0 && per_thread.mark_flush_pending() {
            // write access synced
            let bytes = per_thread.bytes_used();
            debug_assert!(lg.active_bytes >= bytes);
            lg.flush_bytes += bytes;
            lg.active_bytes -= bytes;
            lg.num_pending += 1;
            debug_assert!(self.assert_memory(lg));
        }
    }

    /// Takes the writer of an aborting thread state out of the accounting.
    /// The caller aborts the returned writer.
    pub fn do_on_abort(
        &self,
        state: &mut LockedThreadState<'_, C>,
    ) -> Option<DocumentsWriterPerThread<C>> {
        let mut lg = self.lock_state();
        let bytes = state.bytes_used();
        if state.flush_pending() {
            lg.flush_bytes -= bytes;
            lg.num_pending -= 1;
        } else {
            lg.active_bytes -= bytes;
        }
        debug_assert!(self.assert_memory(&lg));
        // Take it out of the loop this DWPT is stale
        let dwpt = self.per_thread_pool.reset(state, lg.closed);
        self.internal_update_stall_state(&mut lg);
        dwpt
    }

    fn try_checkout_for_flush(
        &self,
        lg: &mut FlushControlState<C>,
        per_thread: &mut LockedThreadState<'_, C>,
    ) -> Option<DocumentsWriterPerThread<C>> {
        if per_thread.flush_pending() {
            self.internal_try_checkout_for_flush(lg, per_thread)
        } else {
            None
        }
    }

    // checks out a pending state this thread does not hold, without blocking
    fn try_checkout_unlocked(
        &self,
        lg: &mut FlushControlState<C>,
        per_thread: &ThreadState<C>,
    ) -> Option<DocumentsWriterPerThread<C>> {
        let res = match per_thread.try_lock() {
            Some(mut locked) => {
                // check again, the state may have been checked out meanwhile
                if locked.flush_pending() {
                    self.internal_try_checkout_for_flush(lg, &mut locked)
                } else {
                    None
                }
            }
            None => None,
        };
        self.internal_update_stall_state(lg);
        res
    }

    fn internal_try_checkout_for_flush(
        &self,
        lg: &mut FlushControlState<C>,
        per_thread: &mut LockedThreadState<'_, C>,
    ) -> Option<DocumentsWriterPerThread<C>> {
        debug_assert!(per_thread.flush_pending());
        let res = if per_thread.inited() {
            let bytes = per_thread.bytes_used();
            match self.per_thread_pool.reset(per_thread, lg.closed) {
                Some(dwpt) => {
                    debug_assert!(
                        !lg.flushing_writers.contains_key(&dwpt.id()),
                        "DWPT is already flushing"
                    );
                    // record the flushing DWPT to reduce flush_bytes in do_after_flush
                    lg.flushing_writers.insert(dwpt.id(), bytes);
                    lg.num_pending -= 1;
                    Some(dwpt)
                }
                None => None,
            }
        } else {
            None
        };
        self.internal_update_stall_state(lg);
        res
    }

    /// Returns the next writer to flush: queued flushes first, otherwise a
    /// pending thread state that is not held by another thread.
    pub fn next_pending_flush(&self) -> Option<DocumentsWriterPerThread<C>> {
        let mut lg = self.lock_state();
        self.internal_next_pending_flush(&mut lg)
    }

    fn internal_next_pending_flush(
        &self,
        lg: &mut FlushControlState<C>,
    ) -> Option<DocumentsWriterPerThread<C>> {
        if let Some(dwpt) = lg.flush_queue.pop_front() {
            self.internal_update_stall_state(lg);
            return Some(dwpt);
        }
        // don't check if we are doing a full flush
        if lg.num_pending == 0 || lg.full_flush {
            return None;
        }
        for next in self.per_thread_pool.thread_states() {
            if lg.num_pending == 0 {
                break;
            }
            if next.flush_pending() {
                if let Some(dwpt) = self.try_checkout_unlocked(lg, &next) {
                    return Some(dwpt);
                }
            }
        }
        None
    }

    /// Signals that the writer is closing. No thread is stalled from now on
    /// and thread states are deactivated once they hold no writer.
    pub fn set_closed(&self) {
        let mut lg = self.lock_state();
        lg.closed = true;
        self.per_thread_pool.deactivate_unreleased_states();
        self.internal_update_stall_state(&mut lg);
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Returns an iterator that provides access to all currently active
    /// `ThreadState`s
    pub fn all_active_thread_states(&self) -> impl Iterator<Item = Arc<ThreadState<C>>> + '_ {
        self.per_thread_pool
            .thread_states()
            .filter(|s| s.is_active())
    }

    pub fn do_on_delete(&self) {
        let mut lg = self.lock_state();
        // pass None this is a global delete no update
        self.flush_policy.on_delete(self, &mut lg, None);
    }

    /// Returns the number of delete terms in the global pool
    pub fn num_global_term_deletes(&self) -> usize {
        self.per_thread_pool.delete_queue().num_global_term_deletes()
            + self.buffered_updates_stream.num_terms()
    }

    pub fn delete_bytes_used(&self) -> u64 {
        self.per_thread_pool.delete_queue().bytes_used() + self.buffered_updates_stream.bytes_used()
    }

    pub fn get_and_reset_apply_all_deletes(&self) -> bool {
        self.flush_deletes.swap(false, Ordering::AcqRel)
    }

    pub fn set_apply_all_deletes(&self) {
        self.flush_deletes.store(true, Ordering::Release)
    }

    pub fn num_pending(&self) -> usize {
        self.lock_state().num_pending
    }

    pub fn num_queued_flushes(&self) -> usize {
        self.lock_state().flush_queue.len()
    }

    pub fn num_blocked_flushes(&self) -> usize {
        self.lock_state().blocked_flushes.len()
    }

    pub fn num_flushing_dwpt(&self) -> usize {
        self.lock_state().flushing_writers.len()
    }

    pub fn num_active_dwpt(&self) -> usize {
        self.per_thread_pool.active_thread_state_count()
    }

    pub fn is_full_flush(&self) -> bool {
        self.lock_state().full_flush
    }

    pub fn stats(&self) -> FlushControlStats {
        let lg = self.lock_state();
        FlushControlStats {
            active_bytes: lg.active_bytes,
            flush_bytes: lg.flush_bytes,
            num_pending: lg.num_pending,
            num_queued_flushes: lg.flush_queue.len(),
            num_blocked_flushes: lg.blocked_flushes.len(),
            num_flushing_writers: lg.flushing_writers.len(),
            num_thread_states: self.per_thread_pool.active_thread_state_count(),
            full_flush: lg.full_flush,
            closed: lg.closed,
            stalled: self.stall_control.any_stalled_threads(),
            peak_active_bytes: lg.peak_active_bytes,
            peak_flush_bytes: lg.peak_flush_bytes,
            peak_net_bytes: lg.peak_net_bytes,
            peak_delta: lg.peak_delta,
        }
    }

    /// Locks the given thread state. A writer that still belongs to the
    /// delete queue of a running full flush is enrolled for that flush
    /// first, the caller then gets the state without a writer.
    pub fn obtain_and_lock<'a>(
        &self,
        per_thread: &'a ThreadState<C>,
    ) -> Result<LockedThreadState<'a, C>> {
        let mut locked = per_thread.lock()?;
        self.enroll_if_stale(&mut locked);
        Ok(locked)
    }

    fn enroll_if_stale(&self, per_thread: &mut LockedThreadState<'_, C>) {
        let current = self.per_thread_pool.delete_queue();
        let is_stale = per_thread.is_active()
            && per_thread
                .dwpt()
                .map_or(false, |dwpt| !Arc::ptr_eq(&dwpt.delete_queue, &current));
        if is_stale {
            // There is a full flush in process and this DWPT is now stale,
            // enroll it for flush and hand out the state without a writer
            self.add_flushable_state(per_thread);
        }
    }

    /// Starts a full flush: swaps in a new delete queue and enrolls every
    /// writer of the old generation for flushing. Returns the highest
    /// sequence number of the old generation and the old delete queue.
    pub fn mark_for_full_flush(&self) -> Result<(u64, Arc<DocumentsWriterDeleteQueue>)> {
        let (seq_no, flushing_queue) = {
            let mut lg = self.lock_state();
            debug_assert!(
                !lg.full_flush,
                "called mark_for_full_flush() while full flush is still running"
            );
            debug_assert!(
                lg.full_flush_buffer.is_empty(),
                "full flush buffer should be empty: {:?}",
                lg.full_flush_buffer
            );
            lg.full_flush = true;
            let flushing_queue = self.per_thread_pool.delete_queue();
            // Insert a gap in seq_no of current active thread count, in the
            // worst case each of those threads now have one operation in
            // flight. It's fine if we have some sequence numbers that were
            // never assigned.
            let seq_no = flushing_queue.last_sequence_number()
                + self.per_thread_pool.active_thread_state_count() as u64
                + 2;
            flushing_queue.set_max_seq_no(seq_no + 1);
            // all subsequent DWPT use this queue until the next full flush
            let new_queue = Arc::new(DocumentsWriterDeleteQueue::with_generation(
                flushing_queue.generation + 1,
                seq_no + 1,
            ));
            self.per_thread_pool.set_delete_queue(new_queue);
            debug!(
                "DWFC: mark for full flush, generation {} max_seq_no {}",
                flushing_queue.generation,
                seq_no + 1
            );
            (seq_no, flushing_queue)
        };

        for next in self.per_thread_pool.thread_states() {
            let mut locked = next.lock()?;
            if !locked.inited() {
                let closed = self.lock_state().closed;
                if closed && locked.is_active() {
                    self.per_thread_pool.deactivate_thread_state(&mut locked);
                }
                continue;
            }
            let is_stale = match locked.dwpt() {
                Some(dwpt) => {
                    debug_assert!(
                        dwpt.delete_queue.generation == flushing_queue.generation
                            || dwpt.delete_queue.generation == flushing_queue.generation + 1
                    );
                    Arc::ptr_eq(&dwpt.delete_queue, &flushing_queue)
                }
                None => false,
            };
            if is_stale {
                self.add_flushable_state(&mut locked);
            }
        }

        {
            let mut lg = self.lock_state();
            // Writers concurrently marked pending and blocked after the queue
            // swap but before the sweep must join the flush queue too, since
            // we mark for full flush without blocking indexing.
            self.prune_blocked_queue(&mut lg, &flushing_queue);
            debug_assert!(self.assert_blocked_flushes(&lg, &self.per_thread_pool.delete_queue()));
            let buffer = mem::replace(&mut lg.full_flush_buffer, vec![]);
            lg.flush_queue.extend(buffer);
            self.internal_update_stall_state(&mut lg);
        }
        debug_assert!(self.assert_active_delete_queue(&self.per_thread_pool.delete_queue()));
        Ok((seq_no, flushing_queue))
    }

    fn assert_active_delete_queue(&self, queue: &Arc<DocumentsWriterDeleteQueue>) -> bool {
        for next in self.per_thread_pool.thread_states() {
            if let Ok(locked) = next.lock() {
                if let Some(dwpt) = locked.dwpt() {
                    assert!(
                        Arc::ptr_eq(&dwpt.delete_queue, queue),
                        "stale writer {} left after full flush sweep, num_docs: {}",
                        dwpt.segment_name(),
                        dwpt.num_docs_in_ram
                    );
                }
            }
        }
        true
    }

    fn assert_blocked_flushes(
        &self,
        lg: &FlushControlState<C>,
        queue: &Arc<DocumentsWriterDeleteQueue>,
    ) -> bool {
        for blocked in &lg.blocked_flushes {
            assert!(Arc::ptr_eq(&blocked.dwpt.delete_queue, queue));
        }
        true
    }

    /// Enrolls the writer of a locked state into the running full flush.
    /// A writer without documents is dropped and its bytes released.
    fn add_flushable_state(&self, per_thread: &mut LockedThreadState<'_, C>) {
        let mut lg = self.lock_state();
        debug_assert!(lg.full_flush);
        self.commit_per_thread_bytes(&mut lg, per_thread);
        let num_docs = per_thread.dwpt().map_or(0, |dwpt| dwpt.num_docs_in_ram);
        if num_docs > 0 {
            if !per_thread.flush_pending() {
                self.set_flush_pending(&mut lg, per_thread.state());
            }
            let flushing_dwpt = self.internal_try_checkout_for_flush(&mut lg, per_thread);
            debug_assert!(
                flushing_dwpt.is_some(),
                "DWPT must never be None here since we hold the lock and it holds documents"
            );
            if let Some(dwpt) = flushing_dwpt {
                debug!("DWFC: enroll {} for full flush", dwpt.segment_name());
                lg.full_flush_buffer.push(dwpt);
            }
        } else {
            let bytes = per_thread.bytes_used();
            if per_thread.flush_pending() {
                lg.flush_bytes -= bytes;
                lg.num_pending -= 1;
            } else {
                lg.active_bytes -= bytes;
            }
            // an empty writer has nothing to flush, it is dropped
            self.per_thread_pool.reset(per_thread, lg.closed);
            self.internal_update_stall_state(&mut lg);
        }
    }

    // moves the blocked writers of the given delete queue to the flush queue
    fn prune_blocked_queue(
        &self,
        lg: &mut FlushControlState<C>,
        flushing_queue: &Arc<DocumentsWriterDeleteQueue>,
    ) {
        self.release_blocked_flushes(lg, |dwpt| {
            Arc::ptr_eq(&dwpt.delete_queue, flushing_queue)
        });
    }

    fn release_blocked_flushes<F>(&self, lg: &mut FlushControlState<C>, select: F)
    where
        F: Fn(&DocumentsWriterPerThread<C>) -> bool,
    {
        let blocked = mem::replace(&mut lg.blocked_flushes, VecDeque::new());
        for blocked_flush in blocked {
            if select(&blocked_flush.dwpt) {
                debug_assert!(
                    !lg.flushing_writers.contains_key(&blocked_flush.dwpt.id()),
                    "DWPT is already flushing"
                );
                // record the flushing DWPT to reduce flush_bytes in do_after_flush
                lg.flushing_writers
                    .insert(blocked_flush.dwpt.id(), blocked_flush.bytes);
                // don't decr pending here - it's already done when DWPT is blocked
                lg.flush_queue.push_back(blocked_flush.dwpt);
            } else {
                lg.blocked_flushes.push_back(blocked_flush);
            }
        }
    }

    /// Ends a full flush once every queued writer is flushed. Writers blocked
    /// during the full flush become regular queued flushes.
    pub fn finish_full_flush(&self) {
        let mut lg = self.lock_state();
        debug_assert!(lg.full_flush);
        debug_assert!(lg.flush_queue.is_empty());
        debug_assert!(lg.flushing_writers.is_empty());
        if !lg.blocked_flushes.is_empty() {
            debug_assert!(self.assert_blocked_flushes(&lg, &self.per_thread_pool.delete_queue()));
            self.release_blocked_flushes(&mut lg, |_| true);
            debug_assert!(lg.blocked_flushes.is_empty());
        }
        lg.full_flush = false;
        self.internal_update_stall_state(&mut lg);
    }

    /// Aborts every queued, enrolled and blocked writer. Files the aborted
    /// writers leave behind are added to `new_files`.
    pub fn abort_pending_flushes(&self, new_files: &mut HashSet<String>) {
        let mut lg = self.lock_state();
        self.internal_abort_pending_flushes(&mut lg, new_files);
    }

    fn internal_abort_pending_flushes(
        &self,
        lg: &mut FlushControlState<C>,
        new_files: &mut HashSet<String>,
    ) {
        let mut queued: Vec<_> = mem::replace(&mut lg.flush_queue, VecDeque::new())
            .into_iter()
            .collect();
        queued.extend(mem::replace(&mut lg.full_flush_buffer, vec![]));
        for mut dwpt in queued {
            self.subtract_flushed_num_docs(dwpt.num_docs_in_ram);
            if let Err(e) = dwpt.abort(new_files) {
                warn!(
                    "DWFC: abort of pending flush {} failed: {:?}",
                    dwpt.segment_name(),
                    e
                );
            }
            self.internal_after_flush(lg, dwpt);
        }
        let blocked = mem::replace(&mut lg.blocked_flushes, VecDeque::new());
        for mut blocked_flush in blocked {
            lg.flushing_writers
                .insert(blocked_flush.dwpt.id(), blocked_flush.bytes);
            self.subtract_flushed_num_docs(blocked_flush.dwpt.num_docs_in_ram);
            if let Err(e) = blocked_flush.dwpt.abort(new_files) {
                warn!(
                    "DWFC: abort of blocked flush {} failed: {:?}",
                    blocked_flush.dwpt.segment_name(),
                    e
                );
            }
            self.internal_after_flush(lg, blocked_flush.dwpt);
        }
        self.internal_update_stall_state(lg);
    }

    /// Aborts the pending flushes of a failed full flush and ends it.
    pub fn abort_full_flushes(&self, new_files: &mut HashSet<String>) {
        let mut lg = self.lock_state();
        self.internal_abort_pending_flushes(&mut lg, new_files);
        lg.full_flush = false;
        self.internal_update_stall_state(&mut lg);
    }

    fn subtract_flushed_num_docs(&self, num_flushed: u32) {
        let old = self.num_docs_in_ram.fetch_sub(num_flushed, Ordering::AcqRel);
        debug_assert!(old >= num_flushed);
    }

    pub fn wait_if_stalled(&self) -> Result<()> {
        if log_enabled!(log::Level::Debug) && self.stall_control.any_stalled_threads() {
            let lg = self.lock_state();
            debug!(
                "DWFC: wait_if_stalled: num_flushes_pending={} net_bytes={} flush_bytes={} \
                 full_flush={}",
                lg.flush_queue.len(),
                lg.net_bytes(),
                lg.flush_bytes,
                lg.full_flush
            );
        }
        self.stall_control.wait_if_stalled()
    }

    pub fn any_stalled_threads(&self) -> bool {
        self.stall_control.any_stalled_threads()
    }

    /// Wakes every stalled thread with a `ThreadInterrupted` error.
    pub fn interrupt_stalled_threads(&self) {
        self.stall_control.interrupt_waiters();
    }
}

impl<C: DocConsumer> fmt::Display for DocumentsWriterFlushControl<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let lg = self.lock_state();
        write!(
            f,
            "DocumentsWriterFlushControl [active_bytes={}, flush_bytes={}, num_pending={}, \
             queued={}, blocked={}, flushing={}, full_flush={}]",
            lg.active_bytes,
            lg.flush_bytes,
            lg.num_pending,
            lg.flush_queue.len(),
            lg.blocked_flushes.len(),
            lg.flushing_writers.len(),
            lg.full_flush
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::index::writer::mock::{Harness, MockDoc, MB};
    use crate::error::ErrorKind;

    use std::thread;
    use std::time::Duration;

    fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..10_000 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("condition not reached in time");
    }

    fn assert_balanced(h: &Harness) {
        assert_eq!(h.control.net_bytes(), h.control.live_writer_bytes());
    }

    #[test]
    fn test_hard_limit_forces_flush() {
        let mut conf = IndexWriterConfig::default();
        conf.ram_buffer_size_mb = None;
        conf.max_buffered_docs = Some(1000);
        conf.ram_per_thread_hard_limit_mb = 1;
        let h = Harness::new(conf);
        let big = h.new_state();
        let other = h.new_state();

        assert!(h.add_doc(&other, 100 * 1024).is_none());
        assert!(h.add_doc(&big, 400 * 1024).is_none());
        assert!(h.add_doc(&big, 400 * 1024).is_none());
        let flushing = h
            .add_doc(&big, 400 * 1024)
            .expect("crossing the hard limit flushes");
        assert_eq!(flushing.num_docs_in_ram, 3);
        assert_eq!(h.control.flush_bytes(), 1200 * 1024);
        assert_eq!(h.control.active_bytes(), 100 * 1024);
        assert!(!other.flush_pending());
        assert_balanced(&h);

        h.control.do_after_flush(flushing);
        assert_eq!(h.control.net_bytes(), 100 * 1024);
        assert_balanced(&h);
    }

    #[test]
    fn test_hard_limit_writer_flushed_before_unrelated_pending() {
        let mut conf = IndexWriterConfig::default();
        conf.ram_buffer_size_mb = None;
        conf.max_buffered_docs = Some(1000);
        conf.ram_per_thread_hard_limit_mb = 1;
        let h = Harness::new(conf);
        let unrelated = h.new_state();
        let big = h.new_state();
        let idle = h.new_state();

        assert!(h.add_doc(&unrelated, 200 * 1024).is_none());
        assert!(h.add_doc(&idle, 100 * 1024).is_none());
        {
            let mut lg = h.control.lock_state();
            h.control.set_flush_pending(&mut lg, &unrelated);
        }
        assert_eq!(h.control.num_pending(), 1);

        assert!(h.add_doc(&big, 600 * 1024).is_none());
        let flushing = h
            .add_doc(&big, 600 * 1024)
            .expect("the writer over the hard limit goes first");
        assert_eq!(flushing.consumer().bytes_used(), 1200 * 1024);
        assert!(unrelated.flush_pending());
        assert_eq!(h.control.num_pending(), 1);
        assert_balanced(&h);

        let next = h.control.next_pending_flush().expect("unrelated writer");
        assert_eq!(next.consumer().bytes_used(), 200 * 1024);
        assert!(h.control.next_pending_flush().is_none());
        assert!(!idle.flush_pending());
        h.control.do_after_flush(flushing);
        h.control.do_after_flush(next);
        assert_eq!(h.control.net_bytes(), 100 * 1024);
        assert_balanced(&h);
    }

    #[test]
    fn test_hard_limit_writer_queued_ahead_of_scanned_pending() {
        let mut conf = IndexWriterConfig::default();
        conf.ram_buffer_size_mb = None;
        conf.max_buffered_docs = Some(1000);
        conf.ram_per_thread_hard_limit_mb = 1;
        let h = Harness::new(conf);
        let unrelated = h.new_state();
        let big = h.new_state();
        let old = h.new_state();
        assert!(h.add_doc(&old, 100 * 1024).is_none());

        h.control.mark_for_full_flush().unwrap();
        let enrolled = h.control.next_pending_flush().expect("old generation writer");

        assert!(h.add_doc(&unrelated, 200 * 1024).is_none());
        {
            let mut lg = h.control.lock_state();
            h.control.set_flush_pending(&mut lg, &unrelated);
        }
        // pending states are not scanned while the full flush runs
        assert!(h.control.next_pending_flush().is_none());

        assert!(h.add_doc(&big, 600 * 1024).is_none());
        // crossing the hard limit during the full flush blocks the writer
        assert!(h.add_doc(&big, 600 * 1024).is_none());
        assert_eq!(h.control.num_blocked_flushes(), 1);
        assert_balanced(&h);

        h.control.do_after_flush(enrolled);
        h.control.finish_full_flush();
        assert_eq!(h.control.num_queued_flushes(), 1);

        let first = h.control.next_pending_flush().unwrap();
        assert_eq!(first.consumer().bytes_used(), 1200 * 1024);
        let second = h.control.next_pending_flush().unwrap();
        assert_eq!(second.consumer().bytes_used(), 200 * 1024);
        assert!(h.control.next_pending_flush().is_none());
        h.control.do_after_flush(first);
        h.control.do_after_flush(second);
        assert_eq!(h.control.net_bytes(), 0);
        assert_balanced(&h);
    }

    #[test]
    fn test_next_pending_flush_skips_locked_state() {
        let mut conf = IndexWriterConfig::default();
        conf.ram_buffer_size_mb = Some(1.0);
        let h = Harness::new(conf);
        let first = h.new_state();
        let second = h.new_state();
        let third = h.new_state();
        let fourth = h.new_state();

        assert!(h.add_doc(&first, 600 * 1024).is_none());
        // crossing the buffer marks the larger first writer
        assert!(h.add_doc(&second, 450 * 1024).is_none());
        assert!(h.add_doc(&third, 500 * 1024).is_none());
        // and again, now the third writer is the largest active one
        assert!(h.add_doc(&fourth, 100 * 1024).is_none());
        assert!(first.flush_pending());
        assert!(third.flush_pending());
        assert_eq!(h.control.num_pending(), 2);
        assert_balanced(&h);

        let held = first.lock().unwrap();
        let flushing = h
            .control
            .next_pending_flush()
            .expect("the scan moves past the held state");
        assert_eq!(flushing.consumer().bytes_used(), 500 * 1024);
        assert!(h.control.next_pending_flush().is_none());
        assert_eq!(h.control.num_pending(), 1);
        drop(held);

        let released = h.control.next_pending_flush().expect("state is free again");
        assert_eq!(released.consumer().bytes_used(), 600 * 1024);
        assert_eq!(h.control.num_pending(), 0);
        h.control.do_after_flush(flushing);
        h.control.do_after_flush(released);
        assert_eq!(h.control.net_bytes(), 550 * 1024);
        assert_balanced(&h);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "is already pending")]
    fn test_set_flush_pending_twice_panics() {
        let h = Harness::new(IndexWriterConfig::default());
        let state = h.new_state();
        assert!(h.add_doc(&state, 10).is_none());
        let mut lg = h.control.lock_state();
        h.control.set_flush_pending(&mut lg, &state);
        h.control.set_flush_pending(&mut lg, &state);
    }

    #[test]
    fn test_wait_for_flush_after_poisoned_lock() {
        let h = Arc::new(Harness::new(IndexWriterConfig::default()));
        let state = h.new_state();
        assert!(h.add_doc(&state, 10).is_none());
        let poisoner = Arc::clone(&h);
        let _ = thread::spawn(move || {
            let _lg = poisoner.control.lock.lock().unwrap();
            panic!("poison the flush control lock");
        })
        .join();
        assert!(h.control.lock.is_poisoned());

        assert!(h.control.wait_for_flush().is_ok());
        assert_eq!(h.control.net_bytes(), 10);
        assert_balanced(&h);
    }

    #[test]
    fn test_stall_and_wake() {
        let mut conf = IndexWriterConfig::default();
        conf.ram_buffer_size_mb = Some(1.0);
        conf.ram_per_thread_hard_limit_mb = 1;
        conf.stall_wait_timeout_ms = 60_000;
        let h = Arc::new(Harness::new(conf));
        let first = h.new_state();
        let second = h.new_state();

        let flushing = h
            .add_doc(&first, 1536 * 1024)
            .expect("first writer crosses the buffer");
        assert!(!h.control.any_stalled_threads());
        assert!(h.add_doc(&second, 900 * 1024).is_none());
        // 2.4MB net with 0.9MB active crosses the 2MB stall limit
        assert!(h.control.any_stalled_threads());
        assert_balanced(&h);

        let waiter = {
            let h = Arc::clone(&h);
            thread::spawn(move || h.control.wait_if_stalled())
        };
        wait_until(|| h.control.stall_control().has_blocked());

        h.control.do_after_flush(flushing);
        assert!(!h.control.any_stalled_threads());
        assert!(waiter.join().unwrap().is_ok());
        assert!(!h.control.stall_control().has_blocked());
        assert!(h.control.stall_control().was_stalled());
    }

    #[test]
    fn test_interrupt_stalled_threads() {
        let mut conf = IndexWriterConfig::default();
        conf.ram_buffer_size_mb = Some(1.0);
        conf.ram_per_thread_hard_limit_mb = 1;
        conf.stall_wait_timeout_ms = 60_000;
        let h = Arc::new(Harness::new(conf));
        let first = h.new_state();
        let second = h.new_state();
        let flushing = h.add_doc(&first, 1536 * 1024).unwrap();
        assert!(h.add_doc(&second, 900 * 1024).is_none());
        assert!(h.control.any_stalled_threads());

        let waiter = {
            let h = Arc::clone(&h);
            thread::spawn(move || h.control.wait_if_stalled())
        };
        wait_until(|| h.control.stall_control().has_blocked());
        h.control.interrupt_stalled_threads();
        match waiter.join().unwrap() {
            Err(e) => match e.kind() {
                ErrorKind::ThreadInterrupted => {}
                k => panic!("unexpected error {:?}", k),
            },
            Ok(()) => panic!("waiter must be interrupted"),
        }
        h.control.do_after_flush(flushing);
    }

    #[test]
    fn test_update_stall_state_is_idempotent() {
        let h = Harness::new(IndexWriterConfig::default());
        let state = h.new_state();
        assert!(h.add_doc(&state, 1024).is_none());
        assert!(!h.control.update_stall_state());
        assert!(!h.control.update_stall_state());
        assert!(!h.control.stall_control().was_stalled());
        assert_eq!(h.control.net_bytes(), 1024);
    }

    #[test]
    fn test_closed_never_stalls() {
        let mut conf = IndexWriterConfig::default();
        conf.ram_buffer_size_mb = Some(1.0);
        conf.ram_per_thread_hard_limit_mb = 1;
        let h = Harness::new(conf);
        let first = h.new_state();
        let second = h.new_state();
        let flushing = h.add_doc(&first, 1536 * 1024).unwrap();
        assert!(h.add_doc(&second, 900 * 1024).is_none());
        assert!(h.control.any_stalled_threads());

        h.control.set_closed();
        assert!(!h.control.any_stalled_threads());
        assert!(!h.control.update_stall_state());
        h.control.do_after_flush(flushing);
    }

    #[test]
    fn test_full_flush() {
        let h = Harness::new(IndexWriterConfig::default());
        let full = h.new_state();
        let empty = h.new_state();
        for _ in 0..5 {
            assert!(h.add_doc(&full, 1024).is_none());
        }
        h.init_writer(&empty);

        let (seq_no, flushing_queue) = h.control.mark_for_full_flush().unwrap();
        // five documents, two states and a gap of two
        assert_eq!(seq_no, 9);
        assert_eq!(flushing_queue.generation, 0);
        assert_eq!(flushing_queue.max_seq_no(), 10);
        let current = h.pool.delete_queue();
        assert_eq!(current.generation, 1);
        assert_eq!(current.last_sequence_number(), 9);
        assert!(h.control.is_full_flush());
        assert_eq!(h.control.num_queued_flushes(), 1);
        assert!(!empty.lock().unwrap().inited());
        assert!(!full.lock().unwrap().inited());
        assert_balanced(&h);

        let dwpt = h.control.next_pending_flush().expect("queued full flush");
        assert_eq!(dwpt.num_docs_in_ram, 5);
        assert!(h.control.next_pending_flush().is_none());
        h.control.do_after_flush(dwpt);
        h.control.wait_for_flush().unwrap();
        h.control.finish_full_flush();

        assert!(!h.control.is_full_flush());
        assert_eq!(h.control.net_bytes(), 0);
        assert_eq!(h.control.num_queued_flushes(), 0);
        assert_eq!(h.control.num_blocked_flushes(), 0);
        assert!(full.is_active());
        assert!(empty.is_active());
    }

    #[test]
    fn test_full_flush_after_close_deactivates_states() {
        let h = Harness::new(IndexWriterConfig::default());
        let idle = h.new_state();
        let busy = h.new_state();
        assert!(h.add_doc(&busy, 10).is_none());

        h.control.set_closed();
        h.control.mark_for_full_flush().unwrap();
        assert!(!idle.is_active());
        assert!(!busy.is_active());
        let dwpt = h.control.next_pending_flush().unwrap();
        h.control.do_after_flush(dwpt);
        h.control.finish_full_flush();
        assert!(h.pool.get_and_lock().is_err());
    }

    #[test]
    fn test_pending_writer_blocked_during_full_flush() {
        let mut conf = IndexWriterConfig::default();
        conf.ram_buffer_size_mb = None;
        conf.max_buffered_docs = Some(2);
        let h = Harness::new(conf);
        let old = h.new_state();
        assert!(h.add_doc(&old, 10).is_none());

        h.control.mark_for_full_flush().unwrap();
        assert_eq!(h.control.num_queued_flushes(), 1);

        let fresh = h.new_state();
        assert!(h.add_doc(&fresh, 10).is_none());
        // the second document makes the new generation writer pending, it is
        // blocked and the caller helps with the queued full flush instead
        let helped = h.add_doc(&fresh, 10).expect("queued writer");
        assert_eq!(helped.num_docs_in_ram, 1);
        assert_eq!(helped.delete_queue.generation, 0);
        assert_eq!(h.control.num_blocked_flushes(), 1);
        assert_eq!(h.control.num_queued_flushes(), 0);
        assert_eq!(h.control.num_pending(), 0);
        assert_balanced(&h);

        h.control.do_after_flush(helped);
        h.control.finish_full_flush();
        assert_eq!(h.control.num_blocked_flushes(), 0);
        assert_eq!(h.control.num_queued_flushes(), 1);
        assert_balanced(&h);

        let unblocked = h.control.next_pending_flush().unwrap();
        assert_eq!(unblocked.num_docs_in_ram, 2);
        assert_eq!(unblocked.delete_queue.generation, 1);
        h.control.do_after_flush(unblocked);
        assert_eq!(h.control.net_bytes(), 0);
    }

    #[test]
    fn test_abort_full_flush_with_failing_writer() {
        let h = Harness::new(IndexWriterConfig::default());
        let good = h.new_state();
        let bad = h.new_state();
        assert!(h.add_doc(&good, 100).is_none());
        assert!(h
            .add_doc_with(&bad, MockDoc::new(100).failing_abort())
            .is_none());
        assert_eq!(h.num_docs.load(Ordering::Acquire), 2);

        h.control.mark_for_full_flush().unwrap();
        assert_eq!(h.control.num_queued_flushes(), 2);

        let mut files = HashSet::new();
        h.control.abort_full_flushes(&mut files);
        assert!(!h.control.is_full_flush());
        assert_eq!(h.control.num_queued_flushes(), 0);
        assert_eq!(h.control.num_flushing_dwpt(), 0);
        assert_eq!(h.control.net_bytes(), 0);
        assert!(!h.control.any_stalled_threads());
        assert_eq!(files.len(), 1);
        assert_eq!(h.num_docs.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_abort_pending_flushes_includes_blocked() {
        let mut conf = IndexWriterConfig::default();
        conf.ram_buffer_size_mb = None;
        conf.max_buffered_docs = Some(2);
        let h = Harness::new(conf);
        let old = h.new_state();
        h.init_writer(&old);
        h.control.mark_for_full_flush().unwrap();
        assert_eq!(h.control.num_queued_flushes(), 0);

        let fresh = h.new_state();
        assert!(h.add_doc(&fresh, 10).is_none());
        assert!(h.add_doc(&fresh, 10).is_none());
        assert_eq!(h.control.num_blocked_flushes(), 1);
        assert_balanced(&h);

        let mut files = HashSet::new();
        h.control.abort_pending_flushes(&mut files);
        assert_eq!(h.control.num_blocked_flushes(), 0);
        assert_eq!(h.control.num_flushing_dwpt(), 0);
        assert_eq!(h.control.net_bytes(), 0);
        assert_eq!(files.len(), 1);
        h.control.finish_full_flush();
    }

    #[test]
    fn test_abort_pending_state() {
        let mut conf = IndexWriterConfig::default();
        conf.ram_buffer_size_mb = Some(1.0);
        let h = Harness::new(conf);
        let large = h.new_state();
        let small = h.new_state();
        assert!(h.add_doc(&large, 600 * 1024).is_none());
        assert!(h.add_doc(&small, 500 * 1024).is_none());
        assert!(large.flush_pending());
        assert_eq!(h.control.num_pending(), 1);

        let mut locked = large.lock().unwrap();
        let mut dwpt = h.control.do_on_abort(&mut locked).expect("writer");
        drop(locked);
        let mut files = HashSet::new();
        dwpt.abort(&mut files).unwrap();
        assert_eq!(h.control.num_pending(), 0);
        assert_eq!(h.control.flush_bytes(), 0);
        assert_eq!(h.control.active_bytes(), 500 * 1024);
        assert!(!large.flush_pending());
        assert!(h.control.next_pending_flush().is_none());
        assert_balanced(&h);
    }

    #[test]
    fn test_stale_writer_enrolled_on_obtain() {
        let h = Arc::new(Harness::new(IndexWriterConfig::default()));
        let state = h.new_state();
        assert!(h.add_doc(&state, 10).is_none());

        let mut locked = state.lock().unwrap();
        let marker = {
            let h = Arc::clone(&h);
            thread::spawn(move || h.control.mark_for_full_flush().map(|(seq_no, _)| seq_no))
        };
        // the sweep waits for our lock, the queue is swapped already
        wait_until(|| h.pool.delete_queue().generation == 1);
        h.control.enroll_if_stale(&mut locked);
        assert!(!locked.inited());
        drop(locked);

        assert!(marker.join().unwrap().is_ok());
        assert_eq!(h.control.num_queued_flushes(), 1);
        let dwpt = h.control.next_pending_flush().unwrap();
        assert_eq!(dwpt.delete_queue.generation, 0);
        h.control.do_after_flush(dwpt);
        h.control.finish_full_flush();
        assert_eq!(h.control.net_bytes(), 0);
    }

    #[test]
    fn test_small_documents_keep_memory_bounded() {
        let mut conf = IndexWriterConfig::default();
        conf.ram_buffer_size_mb = Some(1.0);
        let h = Harness::new(conf);
        let state = h.new_state();
        let mut flushes = 0;
        for _ in 0..100 {
            if let Some(dwpt) = h.add_doc(&state, 100 * 1024) {
                assert_eq!(dwpt.num_docs_in_ram, 11);
                h.control.do_after_flush(dwpt);
                flushes += 1;
            }
            assert!(h.control.net_bytes() < 2 * MB);
            assert_balanced(&h);
        }
        assert_eq!(flushes, 9);
        assert!(!h.control.stall_control().was_stalled());
    }

    #[test]
    fn test_stats() {
        let h = Harness::new(IndexWriterConfig::default());
        let state = h.new_state();
        assert!(h.add_doc(&state, 2048).is_none());
        let stats = h.control.stats();
        assert_eq!(stats.active_bytes, 2048);
        assert_eq!(stats.flush_bytes, 0);
        assert_eq!(stats.num_thread_states, 1);
        assert!(!stats.stalled);
        let json = stats.to_json().unwrap();
        let parsed: FlushControlStats = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, stats);
        assert!(format!("{}", h.control).contains("active_bytes=2048"));
    }
}
