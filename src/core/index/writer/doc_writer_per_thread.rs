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

use crate::core::doc::Term;
use crate::core::index::writer::{
    BufferedUpdates, DeleteSlice, DocumentsWriterDeleteQueue, FrozenBufferedUpdates,
};
use crate::core::util::DocId;
use crate::error::{
    ErrorKind::{AlreadyClosed, IllegalArgument},
    Result,
};

use thread_local::ThreadLocal;

use std::cell::Cell;
use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError,
};

/// Hard limit on maximum number of documents that may be added to the
/// index.  If you try to add more than this you'll hit `IllegalArgument`
pub const INDEX_MAX_DOCS: i32 = i32::max_value() - 128;

static NEXT_WRITER_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a `DocumentsWriterPerThread`, used to track it while
/// it is flushing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriterId(u64);

impl WriterId {
    fn next() -> WriterId {
        WriterId(NEXT_WRITER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "dwpt-{}", self.0)
    }
}

/// What a per-thread writer needs to know when its buffered documents are
/// written out as a new segment.
pub struct SegmentWriteState<'a> {
    pub segment_name: &'a str,
    pub num_docs: u32,
    /// Deletes buffered against this segment, resolved by the consumer.
    pub seg_updates: &'a BufferedUpdates,
}

/// The in-memory indexing chain of a single `DocumentsWriterPerThread`.
///
/// Implementations own all buffered postings of one segment to be. They
/// report the memory they hold so the flush control can decide when to
/// flush, write the segment on `flush` and drop everything on `abort`.
pub trait DocConsumer: Send + 'static {
    type Doc;

    fn process_document(&mut self, doc_id: DocId, doc: Self::Doc) -> Result<()>;

    /// RAM currently held by the buffered documents, never decreasing
    /// until the consumer is flushed or aborted.
    fn bytes_used(&self) -> u64;

    /// Writes the segment and returns the names of the files created.
    fn flush(&mut self, state: &SegmentWriteState) -> Result<HashSet<String>>;

    /// Discards all buffered documents, the names of partially written files
    /// are added to `new_files`.
    fn abort(&mut self, new_files: &mut HashSet<String>) -> Result<()>;
}

pub struct DocumentsWriterPerThread<C: DocConsumer> {
    id: WriterId,
    segment_name: String,
    consumer: C,
    pending_updates: BufferedUpdates,
    // true if we aborted
    aborted: bool,
    pub num_docs_in_ram: u32,
    // pointer to DocumentsWriter.delete_queue
    pub delete_queue: Arc<DocumentsWriterDeleteQueue>,
    delete_slice: DeleteSlice,
    pending_num_docs: Arc<AtomicI64>,
    pub files_to_delete: HashSet<String>,
}

impl<C: DocConsumer> DocumentsWriterPerThread<C> {
    pub fn new(
        segment_name: String,
        consumer: C,
        delete_queue: Arc<DocumentsWriterDeleteQueue>,
        pending_num_docs: Arc<AtomicI64>,
    ) -> Self {
        let delete_slice = delete_queue.new_slice();
        DocumentsWriterPerThread {
            id: WriterId::next(),
            pending_updates: BufferedUpdates::new(segment_name.clone()),
            segment_name,
            consumer,
            aborted: false,
            num_docs_in_ram: 0,
            delete_queue,
            delete_slice,
            pending_num_docs,
            files_to_delete: HashSet::new(),
        }
    }

    pub fn id(&self) -> WriterId {
        self.id
    }

    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn pending_updates(&self) -> &BufferedUpdates {
        &self.pending_updates
    }

    // Anything that will add N docs to the index should reserve first to make sure it's allowed
    fn reserve_one_doc(&mut self) -> Result<()> {
        self.pending_num_docs.fetch_add(1, Ordering::AcqRel);
        if self.pending_num_docs.load(Ordering::Acquire) > INDEX_MAX_DOCS as i64 {
            // Reserve failed: put the one doc back and throw exc:
            self.pending_num_docs.fetch_sub(1, Ordering::AcqRel);
            bail!(IllegalArgument(format!(
                "number of documents in the index cannot exceed {}",
                INDEX_MAX_DOCS
            )));
        }
        Ok(())
    }

    pub fn update_document(&mut self, doc: C::Doc, del_term: Option<Term>) -> Result<u64> {
        self.reserve_one_doc()?;
        let doc_id = self.num_docs_in_ram as DocId;

        // Even on error, the document is still added (but marked
        // deleted), so we don't need to un-reserve at that point.
        if let Err(e) = self.consumer.process_document(doc_id, doc) {
            error!("DWPT: process document {} failed: {:?}", doc_id, e);
            self.delete_doc_id(doc_id);
            self.num_docs_in_ram += 1;
            return Err(e);
        }
        Ok(self.finish_document(del_term))
    }

    pub fn update_documents(&mut self, docs: Vec<C::Doc>, del_term: Option<Term>) -> Result<u64> {
        let mut doc_count = 0;
        let mut all_docs_indexed = false;

        let res = self.do_update_documents(docs, del_term, &mut doc_count, &mut all_docs_indexed);
        if !all_docs_indexed && !self.aborted {
            // go and mark all docs from this block as deleted
            let mut doc_id = self.num_docs_in_ram as i32 - 1;
            let end_doc_id = doc_id - doc_count;
            while doc_id > end_doc_id {
                self.delete_doc_id(doc_id);
                doc_id -= 1;
            }
        }
        res
    }

    fn do_update_documents(
        &mut self,
        docs: Vec<C::Doc>,
        del_term: Option<Term>,
        doc_count: &mut i32,
        all_docs_indexed: &mut bool,
    ) -> Result<u64> {
        for doc in docs {
            self.reserve_one_doc()?;
            let doc_id = self.num_docs_in_ram as DocId;
            *doc_count += 1;

            // Incr before checking the result because finish_document will
            // not be called on error
            let res = self.consumer.process_document(doc_id, doc);
            self.num_docs_in_ram += 1;
            res?;
        }

        *all_docs_indexed = true;

        // Apply delTerm only after all indexing has
        // succeeded, but apply it only to docs prior to when
        // this batch started:
        let seq_no = if let Some(del_term) = del_term {
            let seq = self
                .delete_queue
                .add_term_to_slice(del_term, &mut self.delete_slice);
            self.delete_slice.apply(
                &mut self.pending_updates,
                self.num_docs_in_ram as i32 - *doc_count,
            );
            seq
        } else {
            let (seq, changed) = self.delete_queue.update_slice(&mut self.delete_slice);
            if changed {
                self.delete_slice.apply(
                    &mut self.pending_updates,
                    self.num_docs_in_ram as i32 - *doc_count,
                );
            } else {
                self.delete_slice.reset();
            }
            seq
        };
        Ok(seq_no)
    }

    // Buffer a specific docID for deletion. Currently only
    // used when we hit an error when adding a document
    fn delete_doc_id(&mut self, doc_id_upto: DocId) {
        self.pending_updates.add_doc_id(doc_id_upto);
    }

    fn finish_document(&mut self, del_term: Option<Term>) -> u64 {
        // here we actually finish the document in two steps:
        // 1. push the delete into the queue and update our slice
        // 2. increment the DWPT private document id.
        //
        // the updated slice we get from 1. holds all the deletes that have
        // occurred since we updated the slice the last time.
        let mut apply_slice = self.num_docs_in_ram > 0;
        let seq_no = if let Some(del_term) = del_term {
            self.delete_queue
                .add_term_to_slice(del_term, &mut self.delete_slice)
        } else {
            let (seq, changed) = self.delete_queue.update_slice(&mut self.delete_slice);
            apply_slice &= changed;
            seq
        };
        if apply_slice {
            self.delete_slice
                .apply(&mut self.pending_updates, self.num_docs_in_ram as i32);
        } else {
            self.delete_slice.reset();
        }
        self.num_docs_in_ram += 1;
        seq_no
    }

    /// RAM held by the buffered documents and the private deletes.
    pub fn bytes_used(&self) -> u64 {
        self.consumer.bytes_used() + self.pending_updates.bytes_used() as u64
    }

    // Prepares this DWPT for flushing. This method will freeze and return the
    // `DocumentsWriterDeleteQueue`s global buffer and apply all pending deletes
    // to this DWPT
    pub fn prepare_flush(&mut self) -> FrozenBufferedUpdates {
        debug_assert!(self.num_docs_in_ram > 0);

        let frozen_updates = self
            .delete_queue
            .freeze_global_buffer(Some(&mut self.delete_slice));
        // apply all deletes before we flush and release the delete slice
        self.delete_slice
            .apply(&mut self.pending_updates, self.num_docs_in_ram as i32);
        debug_assert!(self.delete_slice.is_empty());
        self.delete_slice.reset();
        frozen_updates
    }

    /// Flush all pending docs to a new segment
    pub fn flush(&mut self) -> Result<FlushedSegment> {
        debug_assert!(self.num_docs_in_ram > 0);
        debug_assert!(self.delete_slice.is_empty(), "all deletes must be applied in prepare_flush");
        debug_assert!(!self.aborted);

        debug!(
            "DWPT: flush postings as segment {} num_docs={}",
            &self.segment_name, self.num_docs_in_ram
        );
        let files = {
            let state = SegmentWriteState {
                segment_name: &self.segment_name,
                num_docs: self.num_docs_in_ram,
                seg_updates: &self.pending_updates,
            };
            self.consumer.flush(&state)?
        };

        let del_count = self.pending_updates.deleted_doc_ids.len() as u32;
        let segment_updates = if self.pending_updates.any() {
            Some(FrozenBufferedUpdates::new(&mut self.pending_updates, true))
        } else {
            None
        };
        debug!(
            "DWPT: flushed segment {} files={} del_count={}",
            &self.segment_name,
            files.len(),
            del_count
        );
        Ok(FlushedSegment {
            writer_id: self.id,
            segment_name: self.segment_name.clone(),
            num_docs: self.num_docs_in_ram,
            del_count,
            files,
            segment_updates,
        })
    }

    /// Called if we hit an error at a bad time (when
    /// updating the index files) and must discard all
    /// currently buffered docs.  This resets our state,
    /// discarding any docs added since last flush.
    pub fn abort(&mut self, new_files: &mut HashSet<String>) -> Result<()> {
        self.aborted = true;
        self.pending_num_docs
            .fetch_sub(self.num_docs_in_ram as i64, Ordering::AcqRel);
        debug!("DWPT: now abort {}", &self.segment_name);

        let res = self.consumer.abort(new_files);
        self.pending_updates.clear();
        new_files.extend(self.files_to_delete.drain());
        debug!("DWPT: done abort");
        res
    }
}

impl<C: DocConsumer> fmt::Debug for DocumentsWriterPerThread<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DocumentsWriterPerThread")
            .field("id", &self.id)
            .field("segment", &self.segment_name)
            .field("num_docs_in_ram", &self.num_docs_in_ram)
            .field("delete_queue_gen", &self.delete_queue.generation)
            .field("aborted", &self.aborted)
            .finish()
    }
}

pub struct FlushedSegment {
    pub writer_id: WriterId,
    pub segment_name: String,
    pub num_docs: u32,
    pub del_count: u32,
    pub files: HashSet<String>,
    pub segment_updates: Option<FrozenBufferedUpdates>,
}

impl fmt::Debug for FlushedSegment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FlushedSegment")
            .field("writer_id", &self.writer_id)
            .field("segment_name", &self.segment_name)
            .field("num_docs", &self.num_docs)
            .field("del_count", &self.del_count)
            .field("files", &self.files)
            .finish()
    }
}

/// `DocumentsWriterPerThreadPool` controls `ThreadState` instances
/// and their thread assignments during indexing. Each `ThreadState` holds
/// a reference to a `DocumentsWriterPerThread` that is once a
/// `ThreadState` is obtained from the pool exclusively used for indexing a
/// single document by the obtaining thread. Each indexing thread must obtain
/// such a `ThreadState` to make progress. A thread gets back the
/// `ThreadState` it used last if that one is free, so a writer tends to
/// stay with one thread.
///
/// Once a `DocumentsWriterPerThread` is selected for flush the thread pool
/// is reusing the flushing `DocumentsWriterPerThread`s ThreadState with a
/// new `DocumentsWriterPerThread` instance.
pub struct DocumentsWriterPerThreadPool<C: DocConsumer> {
    inner: RwLock<DWPTPoolInner<C>>,
    // current delete queue, only swapped by the flush control
    delete_queue: RwLock<Arc<DocumentsWriterDeleteQueue>>,
    // slot index each thread used last
    affinity: ThreadLocal<Cell<Option<usize>>>,
}

struct DWPTPoolInner<C: DocConsumer> {
    thread_states: Vec<Arc<ThreadState<C>>>,
    // valid thread_state index in `self.thread_states`
    free_list: Vec<usize>,
    closed: bool,
}

impl<C: DocConsumer> Default for DocumentsWriterPerThreadPool<C> {
    fn default() -> Self {
        Self::new(Arc::new(DocumentsWriterDeleteQueue::default()))
    }
}

impl<C: DocConsumer> DocumentsWriterPerThreadPool<C> {
    pub fn new(delete_queue: Arc<DocumentsWriterDeleteQueue>) -> Self {
        let inner = DWPTPoolInner {
            thread_states: vec![],
            free_list: Vec::with_capacity(64),
            closed: false,
        };
        DocumentsWriterPerThreadPool {
            inner: RwLock::new(inner),
            delete_queue: RwLock::new(delete_queue),
            affinity: ThreadLocal::new(),
        }
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, DWPTPoolInner<C>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, DWPTPoolInner<C>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the number of `ThreadState` instances created so far.
    pub fn active_thread_state_count(&self) -> usize {
        self.read_inner().thread_states.len()
    }

    pub fn get_thread_state(&self, i: usize) -> Arc<ThreadState<C>> {
        let guard = self.read_inner();
        debug_assert!(i < guard.thread_states.len());
        Arc::clone(&guard.thread_states[i])
    }

    /// Iterates the states created so far. The bound is fixed when the
    /// iterator is created, states added later are not visited.
    pub fn thread_states(&self) -> ThreadStateIter<'_, C> {
        ThreadStateIter {
            pool: self,
            upto: self.active_thread_state_count(),
            next: 0,
        }
    }

    pub fn delete_queue(&self) -> Arc<DocumentsWriterDeleteQueue> {
        Arc::clone(
            &self
                .delete_queue
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn set_delete_queue(&self, delete_queue: Arc<DocumentsWriterDeleteQueue>) {
        *self
            .delete_queue
            .write()
            .unwrap_or_else(PoisonError::into_inner) = delete_queue;
    }

    /// Takes a free `ThreadState` out of the pool, preferring the one the
    /// calling thread used last, and creates a new one if none is free.
    /// The returned state is used exclusively by the caller until it is
    /// handed back through `release`.
    pub fn get_and_lock(&self) -> Result<Arc<ThreadState<C>>> {
        let mut guard = self.inner.write()?;
        if guard.closed {
            bail!(AlreadyClosed(
                "thread states were deactivated, no new states are handed out".into()
            ));
        }
        let last_used = self.affinity.get_or(|| Cell::new(None));
        let preferred = last_used
            .get()
            .and_then(|idx| guard.free_list.iter().position(|&i| i == idx));
        let idx = match preferred {
            Some(pos) => Some(guard.free_list.swap_remove(pos)),
            None => guard.free_list.pop(),
        };
        let idx = match idx {
            Some(idx) => idx,
            None => {
                let idx = guard.thread_states.len();
                guard.thread_states.push(Arc::new(ThreadState::new(idx)));
                idx
            }
        };
        last_used.set(Some(idx));
        Ok(Arc::clone(&guard.thread_states[idx]))
    }

    pub fn release(&self, state: Arc<ThreadState<C>>) {
        let mut guard = self.write_inner();
        debug_assert!(!guard.free_list.contains(&state.index));
        if state.is_active() {
            guard.free_list.push(state.index);
        }
    }

    /// Detaches the writer of the given state, deactivating the slot when
    /// the writer is closing.
    pub fn reset(
        &self,
        state: &mut LockedThreadState<'_, C>,
        closing: bool,
    ) -> Option<DocumentsWriterPerThread<C>> {
        let dwpt = state.reset();
        if closing {
            state.deactivate();
        }
        dwpt
    }

    /// Deactivates a state that holds no writer.
    pub fn deactivate_thread_state(&self, state: &mut LockedThreadState<'_, C>) {
        debug_assert!(state.is_active());
        debug_assert!(!state.inited());
        state.deactivate();
    }

    /// Stops handing out thread states and deactivates the released ones
    /// that hold no writer. States that still buffer documents are
    /// deactivated once their writer is flushed or aborted.
    pub fn deactivate_unreleased_states(&self) {
        let free: Vec<Arc<ThreadState<C>>> = {
            let mut guard = self.write_inner();
            guard.closed = true;
            guard
                .free_list
                .iter()
                .map(|&i| Arc::clone(&guard.thread_states[i]))
                .collect()
        };
        for state in free {
            if let Some(mut locked) = state.try_lock() {
                if locked.is_active() && !locked.inited() {
                    self.deactivate_thread_state(&mut locked);
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.read_inner().closed
    }
}

/// Iterator over a snapshot of the pool's slots.
pub struct ThreadStateIter<'a, C: DocConsumer> {
    pool: &'a DocumentsWriterPerThreadPool<C>,
    upto: usize,
    next: usize,
}

impl<'a, C: DocConsumer> Iterator for ThreadStateIter<'a, C> {
    type Item = Arc<ThreadState<C>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next < self.upto {
            let state = self.pool.get_thread_state(self.next);
            self.next += 1;
            Some(state)
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.upto - self.next;
        (remaining, Some(remaining))
    }
}

impl<'a, C: DocConsumer> ExactSizeIterator for ThreadStateIter<'a, C> {}

/// `ThreadState` references and guards a `DocumentsWriterPerThread`
/// instance that is used during indexing to build a in-memory index
/// segment. `ThreadState` also holds all flush related per-thread
/// data controlled by `DocumentsWriterFlushControl`.
///
/// The writer is only reachable through `lock()` / `try_lock()`, holding
/// the returned `LockedThreadState` is the exclusive right to use it.
pub struct ThreadState<C: DocConsumer> {
    inner: Mutex<ThreadStateInner<C>>,
    // write access guarded by DocumentsWriterFlushControl
    flush_pending: AtomicBool,
    // write access guarded by DocumentsWriterFlushControl
    bytes_used: AtomicU64,
    // write access guarded by DocumentsWriterFlushControl
    num_docs_in_ram: AtomicU32,
    active: AtomicBool,
    // index in DocumentsWriterPerThreadPool
    index: usize,
}

struct ThreadStateInner<C: DocConsumer> {
    dwpt: Option<DocumentsWriterPerThread<C>>,
    // set by DocumentsWriter after each indexing op finishes
    last_seq_no: u64,
}

impl<C: DocConsumer> ThreadState<C> {
    fn new(index: usize) -> Self {
        ThreadState {
            inner: Mutex::new(ThreadStateInner {
                dwpt: None,
                last_seq_no: 0,
            }),
            flush_pending: AtomicBool::new(false),
            bytes_used: AtomicU64::new(0),
            num_docs_in_ram: AtomicU32::new(0),
            active: AtomicBool::new(true),
            index,
        }
    }

    pub fn lock(&self) -> Result<LockedThreadState<'_, C>> {
        let guard = self.inner.lock()?;
        Ok(LockedThreadState { state: self, guard })
    }

    /// Returns `None` if another thread holds the state, or if a thread
    /// panicked while holding it.
    pub fn try_lock(&self) -> Option<LockedThreadState<'_, C>> {
        match self.inner.try_lock() {
            Ok(guard) => Some(LockedThreadState { state: self, guard }),
            Err(TryLockError::WouldBlock) | Err(TryLockError::Poisoned(_)) => None,
        }
    }

    pub fn flush_pending(&self) -> bool {
        self.flush_pending.load(Ordering::Acquire)
    }

    /// Bytes of the writer at the last accounting pass.
    pub fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Acquire)
    }

    /// Buffered documents of the writer at the last accounting pass.
    pub fn num_docs_in_ram(&self) -> u32 {
        self.num_docs_in_ram.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    // returns false if the state was pending already
    pub(crate) fn mark_flush_pending(&self) -> bool {
        self.flush_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_bytes_used(&self, bytes: u64) {
        self.bytes_used.store(bytes, Ordering::Release);
    }

    pub(crate) fn set_num_docs_in_ram(&self, num_docs: u32) {
        self.num_docs_in_ram.store(num_docs, Ordering::Release);
    }
}

impl<C: DocConsumer> fmt::Debug for ThreadState<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadState")
            .field("index", &self.index)
            .field("active", &self.is_active())
            .field("flush_pending", &self.flush_pending())
            .field("bytes_used", &self.bytes_used())
            .field("num_docs_in_ram", &self.num_docs_in_ram())
            .finish()
    }
}

/// A `ThreadState` locked by the current thread.
pub struct LockedThreadState<'a, C: DocConsumer> {
    state: &'a ThreadState<C>,
    guard: MutexGuard<'a, ThreadStateInner<C>>,
}

impl<'a, C: DocConsumer> LockedThreadState<'a, C> {
    pub fn state(&self) -> &'a ThreadState<C> {
        self.state
    }

    pub fn inited(&self) -> bool {
        self.guard.dwpt.is_some()
    }

    pub fn dwpt(&self) -> Option<&DocumentsWriterPerThread<C>> {
        self.guard.dwpt.as_ref()
    }

    pub fn dwpt_mut(&mut self) -> Option<&mut DocumentsWriterPerThread<C>> {
        self.guard.dwpt.as_mut()
    }

    pub fn set_dwpt(&mut self, dwpt: DocumentsWriterPerThread<C>) {
        debug_assert!(!self.inited());
        debug_assert!(self.state.is_active());
        self.guard.dwpt = Some(dwpt);
    }

    pub fn last_seq_no(&self) -> u64 {
        self.guard.last_seq_no
    }

    pub fn set_last_seq_no(&mut self, seq_no: u64) {
        self.guard.last_seq_no = seq_no;
    }

    fn reset(&mut self) -> Option<DocumentsWriterPerThread<C>> {
        let dwpt = self.guard.dwpt.take();
        self.state.bytes_used.store(0, Ordering::Release);
        self.state.num_docs_in_ram.store(0, Ordering::Release);
        self.state.flush_pending.store(false, Ordering::Release);
        dwpt
    }

    fn deactivate(&mut self) {
        debug_assert!(!self.inited());
        self.state.active.store(false, Ordering::Release);
    }
}

impl<'a, C: DocConsumer> Deref for LockedThreadState<'a, C> {
    type Target = ThreadState<C>;

    fn deref(&self) -> &ThreadState<C> {
        self.state
    }
}
