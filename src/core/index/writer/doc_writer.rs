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
    BufferedUpdatesStream, DocConsumer, DocumentsWriterFlushControl, DocumentsWriterPerThread,
    DocumentsWriterPerThreadPool, FlushByRamOrCountsPolicy, FlushedSegment, IndexWriterConfig,
    LockedThreadState, ThreadState,
};
use crate::error::{
    ErrorKind::{AlreadyClosed, IllegalState},
    Result,
};

use crossbeam::queue::SegQueue;
use crossbeam::utils::Backoff;

use std::collections::HashSet;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Builds the document consumer of a new per-thread writer from the
/// segment name the writer was assigned.
pub type ConsumerFactory<C> = dyn Fn(&str) -> Result<C> + Send + Sync;

// This struct accepts multiple added documents and hands them to the
// per-thread writers.
//
// Each added document is passed to the `DocConsumer` of the writer of the
// calling thread, which buffers it in memory until the writer is flushed
// into a segment of its own.
//
// Once we have used our allowed RAM buffer, or the number of added docs is
// large enough (in the case we are flushing by doc count instead of RAM
// usage), the flush control checks a writer out and a thread flushes it.
//
// Threads:
//
// Multiple threads are allowed into update_document at once. Each takes a
// ThreadState out of the pool, the same thread tends to get the same
// ThreadState over time (thread affinity). The document is processed while
// only that ThreadState is locked, the flush control is consulted after.
//
// Producers help flushing: before they index they flush queued writers and
// wait while indexing is stalled, after they index they flush the writer
// the flush control handed back. Background flush threads do the same if
// configured.
//
// When flush_all_threads is called all writers of the current delete queue
// generation are flushed, threads keep indexing into writers of the next
// generation meanwhile.
//
// Errors:
//
// A document that fails in the consumer is still counted and marked
// deleted, so documents are added atomically ("all or none"). A writer
// whose flush fails is aborted, the files it left behind are reported
// through `WriterEvent::DeleteNewFiles`.
pub struct DocumentsWriter<C: DocConsumer> {
    lock: Mutex<()>,
    full_flush_lock: Mutex<()>,
    closed: AtomicBool,
    num_docs_in_ram: Arc<AtomicU32>,
    pending_num_docs: Arc<AtomicI64>,
    segment_counter: AtomicU64,
    last_seq_no: AtomicU64,
    // we preserve changes during a full flush since the owner might not
    // pick them up before we release all changes, see any_changes()
    pending_changes_in_current_full_flush: AtomicBool,
    per_thread_pool: Arc<DocumentsWriterPerThreadPool<C>>,
    flush_control: DocumentsWriterFlushControl<C>,
    buffered_updates_stream: Arc<BufferedUpdatesStream>,
    config: Arc<IndexWriterConfig>,
    consumer_factory: Box<ConsumerFactory<C>>,
    events: SegQueue<WriterEvent>,
    flush_daemons: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: DocConsumer> DocumentsWriter<C> {
    pub fn new<F>(config: IndexWriterConfig, consumer_factory: F) -> Result<Arc<Self>>
    where
        F: Fn(&str) -> Result<C> + Send + Sync + 'static,
    {
        config.validate()?;
        let config = Arc::new(config);
        let per_thread_pool = Arc::new(DocumentsWriterPerThreadPool::default());
        let buffered_updates_stream = Arc::new(BufferedUpdatesStream::default());
        let num_docs_in_ram = Arc::new(AtomicU32::new(0));
        let flush_policy = Arc::new(FlushByRamOrCountsPolicy::new(Arc::clone(&config)));
        let flush_control = DocumentsWriterFlushControl::new(
            Arc::clone(&config),
            Arc::clone(&per_thread_pool),
            flush_policy,
            Arc::clone(&buffered_updates_stream),
            Arc::clone(&num_docs_in_ram),
        );
        let flush_threads = config.flush_threads;
        let writer = Arc::new(DocumentsWriter {
            lock: Mutex::new(()),
            full_flush_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            num_docs_in_ram,
            pending_num_docs: Arc::new(AtomicI64::new(0)),
            segment_counter: AtomicU64::new(0),
            last_seq_no: AtomicU64::new(0),
            pending_changes_in_current_full_flush: AtomicBool::new(false),
            per_thread_pool,
            flush_control,
            buffered_updates_stream,
            config,
            consumer_factory: Box::new(consumer_factory),
            events: SegQueue::new(),
            flush_daemons: Mutex::new(vec![]),
        });
        if flush_threads > 0 {
            writer.start_flush_daemon(flush_threads);
        }
        Ok(writer)
    }

    pub fn flush_control(&self) -> &DocumentsWriterFlushControl<C> {
        &self.flush_control
    }

    pub fn buffered_updates_stream(&self) -> &Arc<BufferedUpdatesStream> {
        &self.buffered_updates_stream
    }

    pub fn config(&self) -> &Arc<IndexWriterConfig> {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!(AlreadyClosed("this DocumentsWriter is closed".into()));
        }
        Ok(())
    }

    fn new_segment_name(&self) -> String {
        let gen = self.segment_counter.fetch_add(1, Ordering::AcqRel);
        format!("_{}", to_base36(gen))
    }

    pub fn update_document(&self, doc: C::Doc, del_term: Option<Term>) -> Result<(u64, bool)> {
        let has_events = self.pre_update()?;
        let per_thread = self.per_thread_pool.get_and_lock()?;
        let res = self.do_update(&per_thread, del_term.is_some(), |dwpt| {
            dwpt.update_document(doc, del_term)
        });
        self.per_thread_pool.release(per_thread);
        let (seq_no, flushing_dwpt) = res?;
        let has_events = self.post_update(flushing_dwpt, has_events)?;
        Ok((seq_no, has_events))
    }

    /// Adds a block of documents atomically: either all are visible or all
    /// are marked deleted. The delete term only applies to documents added
    /// before the block.
    pub fn update_documents(
        &self,
        docs: Vec<C::Doc>,
        del_term: Option<Term>,
    ) -> Result<(u64, bool)> {
        let has_events = self.pre_update()?;
        let per_thread = self.per_thread_pool.get_and_lock()?;
        let res = self.do_update(&per_thread, del_term.is_some(), |dwpt| {
            dwpt.update_documents(docs, del_term)
        });
        self.per_thread_pool.release(per_thread);
        let (seq_no, flushing_dwpt) = res?;
        let has_events = self.post_update(flushing_dwpt, has_events)?;
        Ok((seq_no, has_events))
    }

    fn do_update<F>(
        &self,
        per_thread: &ThreadState<C>,
        is_update: bool,
        update: F,
    ) -> Result<(u64, Option<DocumentsWriterPerThread<C>>)>
    where
        F: FnOnce(&mut DocumentsWriterPerThread<C>) -> Result<u64>,
    {
        let mut locked = self.flush_control.obtain_and_lock(per_thread)?;
        // This must happen after we've pulled the ThreadState because close
        // deactivates all ThreadStates that are not in use
        self.ensure_open()?;
        self.ensure_inited(&mut locked)?;
        let (dwpt_num_docs, res, num_docs_after) = match locked.dwpt_mut() {
            Some(dwpt) => {
                let before = dwpt.num_docs_in_ram;
                let res = update(dwpt);
                (before, res, dwpt.num_docs_in_ram)
            }
            None => bail!(IllegalState("thread state holds no writer".into())),
        };
        // We don't know whether the document actually counted as being
        // indexed, so we must subtract here to accumulate our separate
        // counter
        self.num_docs_in_ram
            .fetch_add(num_docs_after - dwpt_num_docs, Ordering::AcqRel);
        let seq_no = res?;

        let flushing_dwpt = self.flush_control.do_after_document(&mut locked, is_update);
        debug_assert!(seq_no > locked.last_seq_no());
        locked.set_last_seq_no(seq_no);
        self.last_seq_no.fetch_max(seq_no, Ordering::AcqRel);
        Ok((seq_no, flushing_dwpt))
    }

    fn ensure_inited(&self, per_thread: &mut LockedThreadState<'_, C>) -> Result<()> {
        if !per_thread.inited() {
            let segment_name = self.new_segment_name();
            let consumer = (self.consumer_factory)(&segment_name)?;
            trace!("DW: new writer for segment {}", segment_name);
            let dwpt = DocumentsWriterPerThread::new(
                segment_name,
                consumer,
                self.per_thread_pool.delete_queue(),
                Arc::clone(&self.pending_num_docs),
            );
            per_thread.set_dwpt(dwpt);
        }
        Ok(())
    }

    fn pre_update(&self) -> Result<bool> {
        self.ensure_open()?;
        let mut has_events = false;
        if self.flush_control.any_stalled_threads() || self.flush_control.num_queued_flushes() > 0
        {
            // Help out flushing any queued DWPTs so we can un-stall:
            debug!("DW: has queued dwpt; will hijack this thread to flush pending segment(s)");
            loop {
                // Try pick up pending threads here if possible
                while let Some(flushing_dwpt) = self.flush_control.next_pending_flush() {
                    // Don't push the delete here since the update could fail!
                    has_events |= self.do_flush(flushing_dwpt)?;
                }
                // block if stalled
                self.flush_control.wait_if_stalled()?;
                // still queued DWPTs try help flushing
                if self.flush_control.num_queued_flushes() == 0 {
                    break;
                }
            }
            debug!("DW: continue indexing after helping out flushing");
        }
        Ok(has_events)
    }

    fn post_update(
        &self,
        flushing_dwpt: Option<DocumentsWriterPerThread<C>>,
        mut has_events: bool,
    ) -> Result<bool> {
        has_events |= self.apply_all_deletes_local()?;
        if let Some(dwpt) = flushing_dwpt {
            has_events |= self.do_flush(dwpt)?;
        } else if let Some(next_pending_flush) = self.flush_control.next_pending_flush() {
            has_events |= self.do_flush(next_pending_flush)?;
        }
        Ok(has_events)
    }

    pub fn delete_terms(&self, terms: Vec<Term>) -> Result<(u64, bool)> {
        let _l = self.lock.lock()?;
        let delete_queue = self.per_thread_pool.delete_queue();
        let seq_no = delete_queue.add_delete_terms(terms);
        self.flush_control.do_on_delete();
        self.last_seq_no.fetch_max(seq_no, Ordering::AcqRel);
        let applied = self.apply_all_deletes_local()?;
        Ok((seq_no, applied))
    }

    // freezes the global deletes into the buffered updates stream once the
    // flush policy asked for it
    fn apply_all_deletes_local(&self) -> Result<bool> {
        if self.flush_control.get_and_reset_apply_all_deletes() {
            // a running full flush freezes the deletes of its generation itself
            if !self.flush_control.is_full_flush() {
                let frozen = self
                    .per_thread_pool
                    .delete_queue()
                    .freeze_global_buffer(None);
                if frozen.any() {
                    self.buffered_updates_stream.push(frozen)?;
                }
            }
            self.put_event(WriterEvent::ApplyDeletes);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn put_event(&self, event: WriterEvent) {
        self.events.push(event);
    }

    /// Takes the oldest event not yet processed by the owner of this writer.
    pub fn poll_event(&self) -> Option<WriterEvent> {
        self.events.pop()
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs_in_ram.load(Ordering::Acquire)
    }

    /// Documents reserved by all writers so far, flushed ones included.
    pub fn pending_num_docs(&self) -> i64 {
        self.pending_num_docs.load(Ordering::Acquire)
    }

    pub fn last_seq_no(&self) -> u64 {
        self.last_seq_no.load(Ordering::Acquire)
    }

    fn subtract_flushed_num_docs(&self, num_flushed: u32) {
        let old = self
            .num_docs_in_ram
            .fetch_sub(num_flushed, Ordering::AcqRel);
        debug_assert!(old >= num_flushed);
    }

    pub fn any_changes(&self) -> bool {
        // changes are either in a DWPT or in the delete queue. During a full
        // flush the changes of the flushing generation are already out of
        // both, the flag keeps them visible until the flush finished.
        self.num_docs_in_ram.load(Ordering::Acquire) > 0
            || self.per_thread_pool.delete_queue().any_changes()
            || self
                .pending_changes_in_current_full_flush
                .load(Ordering::Acquire)
    }

    fn do_flush(&self, mut dwpt: DocumentsWriterPerThread<C>) -> Result<bool> {
        let mut has_events = false;
        loop {
            let res = self.flush_dwpt(&mut dwpt, &mut has_events);
            self.flush_control.do_after_flush(dwpt);
            res?;
            match self.flush_control.next_pending_flush() {
                Some(writer) => dwpt = writer,
                None => break,
            }
        }

        // If deletes alone are consuming > 1/2 our RAM buffer, force them all
        // to apply now. This is to prevent too-frequent flushing of a long
        // tail of tiny segments.
        if self.config.flush_on_ram()
            && self.flush_control.delete_bytes_used() > self.config.ram_buffer_size() / 2
        {
            has_events = true;
            if !self.apply_all_deletes_local()? {
                debug!(
                    "DW: force apply deletes bytes_used={} vs ram_buffer={}",
                    self.flush_control.delete_bytes_used(),
                    self.config.ram_buffer_size()
                );
                self.put_event(WriterEvent::ApplyDeletes);
            }
        }
        Ok(has_events)
    }

    fn flush_dwpt(
        &self,
        dwpt: &mut DocumentsWriterPerThread<C>,
        has_events: &mut bool,
    ) -> Result<()> {
        // The global deletes frozen here mark the point in time this writer
        // was taken out of rotation. They are published whether or not the
        // segment flush succeeds, they hold deletes for other segments too.
        let global_updates = dwpt.prepare_flush();
        let published = if global_updates.any() {
            self.buffered_updates_stream.push(global_updates).map(|_| ())
        } else {
            Ok(())
        };
        let res = published.and_then(|_| dwpt.flush());

        let flushing_docs_in_ram = dwpt.num_docs_in_ram;
        let res = match res {
            Ok(segment) => {
                self.put_event(WriterEvent::SegmentFlushed(segment));
                Ok(())
            }
            Err(e) => {
                error!("DW: flush of segment {} failed: {:?}", dwpt.segment_name(), e);
                let mut new_files = HashSet::new();
                if let Err(abort_err) = dwpt.abort(&mut new_files) {
                    warn!(
                        "DW: abort of failed segment {} failed: {:?}",
                        dwpt.segment_name(),
                        abort_err
                    );
                }
                if !new_files.is_empty() {
                    self.put_event(WriterEvent::DeleteNewFiles(new_files));
                }
                self.put_event(WriterEvent::FlushFailed(dwpt.segment_name().to_string()));
                Err(e)
            }
        };
        self.subtract_flushed_num_docs(flushing_docs_in_ram);
        *has_events = true;
        res
    }

    /// Flushing all threads is a two stage operation; the caller must ensure
    /// `finish_full_flush` is called after this method, to release the flush
    /// lock in the flush control. Callers are serialized by the full flush
    /// lock, see `full_flush`.
    pub fn flush_all_threads(&self) -> Result<(bool, u64)> {
        debug!("DW: start full flush");
        let (seq_no, flushing_queue) = {
            let _l = self.lock.lock()?;
            self.pending_changes_in_current_full_flush
                .store(self.any_changes(), Ordering::Release);
            self.flush_control.mark_for_full_flush()?
        };

        let mut anything_flushed = false;
        while let Some(flushing_dwpt) = self.flush_control.next_pending_flush() {
            // Help out with flushing:
            anything_flushed |= self.do_flush(flushing_dwpt)?;
        }
        // If a concurrent flush is still in flight wait for it
        self.flush_control.wait_for_flush()?;
        if !anything_flushed && flushing_queue.any_changes() {
            // apply deletes if we did not flush any document
            debug!("DW: flush naked frozen global deletes");
            let frozen = flushing_queue.freeze_global_buffer(None);
            if frozen.any() {
                self.buffered_updates_stream.push(frozen)?;
            }
            self.put_event(WriterEvent::ApplyDeletes);
        }
        self.last_seq_no.fetch_max(seq_no, Ordering::AcqRel);
        Ok((anything_flushed, seq_no))
    }

    pub fn finish_full_flush(&self, success: bool) {
        debug!("DW: finish full flush, success={}", success);
        if success {
            self.flush_control.finish_full_flush();
        } else {
            let mut new_files = HashSet::new();
            self.flush_control.abort_full_flushes(&mut new_files);
            if !new_files.is_empty() {
                self.put_event(WriterEvent::DeleteNewFiles(new_files));
            }
        }
        self.pending_changes_in_current_full_flush
            .store(false, Ordering::Release);
    }

    /// Flushes every buffered document, including the writers that were
    /// blocked while the full flush ran.
    pub fn full_flush(&self) -> Result<(bool, u64)> {
        let _l = self.full_flush_lock.lock()?;
        let res = self.flush_all_threads();
        self.finish_full_flush(res.is_ok());
        let (mut anything_flushed, seq_no) = res?;
        while let Some(dwpt) = self.flush_control.next_pending_flush() {
            anything_flushed |= self.do_flush(dwpt)?;
        }
        Ok((anything_flushed, seq_no))
    }

    /// Discards all buffered documents and deletes. Returns how many
    /// documents were aborted.
    pub fn abort(&self) -> Result<u32> {
        let _ff = self.full_flush_lock.lock()?;
        let _l = self.lock.lock()?;
        debug!("DW: start to abort");
        let delete_queue = self.per_thread_pool.delete_queue();
        delete_queue.clear();
        // frozen deletes not yet applied by the owner are discarded as well
        self.buffered_updates_stream.clear()?;
        self.flush_control.get_and_reset_apply_all_deletes();

        let mut new_files = HashSet::new();
        let mut aborted_doc_count = 0;
        for per_thread in self.per_thread_pool.thread_states() {
            let mut locked = per_thread.lock()?;
            aborted_doc_count += self.abort_thread_state(&mut locked, &mut new_files);
        }
        // jump over any possible in flight ops
        let jump = self.per_thread_pool.active_thread_state_count() as u64 + 1;
        delete_queue.skip_sequence_number(jump);

        self.flush_control.abort_pending_flushes(&mut new_files);
        self.flush_control.wait_for_flush()?;
        if !new_files.is_empty() {
            self.put_event(WriterEvent::DeleteNewFiles(new_files));
        }
        debug!("DW: done abort, aborted {} docs", aborted_doc_count);
        Ok(aborted_doc_count)
    }

    // returns how many documents were aborted
    fn abort_thread_state(
        &self,
        per_thread: &mut LockedThreadState<'_, C>,
        new_files: &mut HashSet<String>,
    ) -> u32 {
        let aborted_doc_count = per_thread.dwpt().map_or(0, |dwpt| dwpt.num_docs_in_ram);
        if let Some(mut dwpt) = self.flush_control.do_on_abort(per_thread) {
            self.subtract_flushed_num_docs(aborted_doc_count);
            if let Err(e) = dwpt.abort(new_files) {
                warn!("DW: abort of {} failed: {:?}", dwpt.segment_name(), e);
            }
        }
        aborted_doc_count
    }

    /// Starts `threads` background threads that flush pending writers. The
    /// threads stop once the writer is closed or dropped.
    pub fn start_flush_daemon(self: &Arc<Self>, threads: usize) {
        let mut daemons = self
            .flush_daemons
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for _ in 0..threads {
            let writer = Arc::downgrade(self);
            let idx = daemons.len();
            let spawned = thread::Builder::new()
                .name(format!("flush-daemon-{}", idx))
                .spawn(move || flush_daemon_loop(writer));
            match spawned {
                Ok(handle) => daemons.push(handle),
                Err(e) => error!("DW: failed to start flush daemon {}: {:?}", idx, e),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Rejects further updates, releases stalled producers and waits for the
    /// background flush threads. Buffered documents are not flushed.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.flush_control.set_closed();
        let daemons = mem::replace(
            &mut *self
                .flush_daemons
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            vec![],
        );
        let current = thread::current().id();
        for handle in daemons {
            // the last handle may be dropped by a flush thread itself
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("DW: flush daemon panicked");
            }
        }
    }
}

impl<C: DocConsumer> Drop for DocumentsWriter<C> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.flush_control.set_closed();
    }
}

fn flush_daemon_loop<C: DocConsumer>(writer: Weak<DocumentsWriter<C>>) {
    let backoff = Backoff::new();
    loop {
        let doc_writer = match writer.upgrade() {
            Some(w) => w,
            None => return,
        };
        if doc_writer.is_closed() {
            return;
        }
        match doc_writer.flush_control.next_pending_flush() {
            Some(dwpt) => {
                backoff.reset();
                if let Err(e) = doc_writer.do_flush(dwpt) {
                    error!("DW: background flush failed: {:?}", e);
                }
            }
            None => {
                drop(doc_writer);
                if backoff.is_completed() {
                    thread::sleep(Duration::from_millis(10));
                } else {
                    backoff.snooze();
                }
            }
        }
    }
}

fn to_base36(mut v: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if v == 0 {
        return "0".into();
    }
    let mut buf = Vec::with_capacity(13);
    while v > 0 {
        buf.push(DIGITS[(v % 36) as usize]);
        v /= 36;
    }
    buf.reverse();
    String::from_utf8_lossy(&buf).into_owned()
}

/// Events the documents writer leaves for its owner, who applies deletes,
/// publishes flushed segments and removes files of failed ones.
#[derive(Debug)]
pub enum WriterEvent {
    ApplyDeletes,
    SegmentFlushed(FlushedSegment),
    FlushFailed(String),
    DeleteNewFiles(HashSet<String>),
}
