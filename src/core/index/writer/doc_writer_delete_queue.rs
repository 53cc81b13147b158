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
use crate::core::index::writer::{BufferedUpdates, FrozenBufferedUpdates, MAX_DOC_ID_UPTO};
use crate::core::util::DocId;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// `DocumentsWriterDeleteQueue` is a linked pending deletes queue. In
/// contrast to other queue implementation we only maintain the tail of the
/// queue. A delete queue is always used in a context of a set of DWPTs and a
/// global delete pool. Each of the DWPT and the global pool need to maintain
/// their 'own' head of the queue (as a DeleteSlice instance per
/// `DocumentsWriterPerThread`).
/// The difference between the DWPT and the global pool is that the DWPT starts
/// maintaining a head once it has added its first document since for its segments
/// private deletes only the deletes after that document are relevant. The global
/// pool instead starts maintaining the head once this instance is created by
/// taking the sentinel instance as its initial head.
///
/// Since each `DeleteSlice` maintains its own head and the list is only
/// single linked, dropping the last slice that references a node prunes the
/// list for us. All nodes in the list that are still relevant should be either
/// directly or indirectly referenced by one of the DWPT's private `DeleteSlice`
/// or by the global `BufferedUpdates` slice.
///
/// Each DWPT as well as the global delete pool maintain their private
/// DeleteSlice instance. In the DWPT case updating a slice is equivalent to
/// atomically finishing the document. The slice update guarantees a "happens
/// before" relationship to all other updates in the same indexing session. When a
/// DWPT updates a document it:
///
/// - consumes a document and finishes its processing
/// - updates its private `DeleteSlice` either by calling `update_slice(DeleteSlice)` or
///   `add_term_to_slice(Term, DeleteSlice)` (if the document has a delTerm)
/// - applies all deletes in the slice to its private `BufferedUpdates` and resets it
/// - increments its internal document id
///
/// The DWPT also doesn't apply its current documents delete term until it has
/// updated its delete slice which ensures the consistency of the update. If the
/// update fails before the DeleteSlice could have been updated the deleteTerm
/// will also not be added to its private deletes neither to the global deletes.
///
/// A full flush swaps the queue of the pool for a fresh one with
/// `generation + 1`; writers still bound to the old generation are flushed as
/// part of that full flush.
pub struct DocumentsWriterDeleteQueue {
    // current end(latest delete operation) in the delete queue:
    tail: Mutex<Arc<DeleteListNode>>,
    // Used to record deletes against all prior (already written to disk) segments.
    // Whenever any segment flushes, we bundle up this set of deletes and insert
    // into the buffered updates stream before the newly flushed segment(s).
    global_data: Mutex<GlobalData>,
    pub generation: u64,
    next_seq_no: AtomicU64,
    max_seq_no: AtomicU64,
}

struct GlobalData {
    global_slice: DeleteSlice,
    global_buffered_updates: BufferedUpdates,
}

impl GlobalData {
    fn apply_global_updates(&mut self, doc_upto: DocId) {
        self.global_slice
            .apply(&mut self.global_buffered_updates, doc_upto);
    }
}

impl Default for DocumentsWriterDeleteQueue {
    fn default() -> Self {
        // seq_no must start at 1 because some APIs negate this to also return a boolean
        Self::with_generation(0, 1)
    }
}

impl DocumentsWriterDeleteQueue {
    pub fn with_generation(generation: u64, start_seq_no: u64) -> Self {
        Self::new(
            BufferedUpdates::new("global".into()),
            generation,
            start_seq_no,
        )
    }

    pub fn new(global_buffered_updates: BufferedUpdates, generation: u64, start_seq_no: u64) -> Self {
        // we use a sentinel instance as our initial tail. No slice will ever try to
        // apply this tail since the head is always omitted
        let tail = Arc::new(DeleteListNode::default());
        let global_slice = DeleteSlice::new(&tail);
        let global_data = GlobalData {
            global_buffered_updates,
            global_slice,
        };
        Self {
            tail: Mutex::new(tail),
            global_data: Mutex::new(global_data),
            generation,
            next_seq_no: AtomicU64::new(start_seq_no),
            max_seq_no: AtomicU64::new(i64::max_value() as u64),
        }
    }

    fn tail(&self) -> MutexGuard<'_, Arc<DeleteListNode>> {
        self.tail.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn global_data(&self) -> MutexGuard<'_, GlobalData> {
        self.global_data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_delete_terms(&self, terms: Vec<Term>) -> u64 {
        let node = Arc::new(DeleteListNode::new(DeleteNode::TermArray(terms)));
        let seq_no = self.add_node(node);
        self.try_apply_global_slice();
        seq_no
    }

    /// invariant for document update
    pub fn add_term_to_slice(&self, term: Term, slice: &mut DeleteSlice) -> u64 {
        let del_node = Arc::new(DeleteListNode::new(DeleteNode::Term(term)));
        let seq_no = self.add_node(Arc::clone(&del_node));
        // this is an update request where the term is the updated documents
        // delTerm. in that case we need to guarantee that this insert is atomic
        // with regards to the given delete slice. This means if two threads try to
        // update the same document with in turn the same delTerm one of them must
        // win. By taking the node we have created for our del term as the new tail
        // it is guaranteed that if another thread adds the same right after us we
        // will apply this delete next time we update our slice and one of the two
        // competing updates wins!
        slice.slice_tail = del_node;
        debug_assert!(!same_node(&slice.slice_head, &slice.slice_tail));
        self.try_apply_global_slice();
        seq_no
    }

    // the next pointer is linked while the tail lock is held, so every node
    // reachable from an observed tail has its successor linked as well
    fn add_node(&self, node: Arc<DeleteListNode>) -> u64 {
        let mut tail = self.tail();
        {
            let mut next = tail.next_slot();
            debug_assert!(next.is_none());
            *next = Some(Arc::clone(&node));
        }
        *tail = node;
        self.next_sequence_number()
    }

    pub fn any_changes(&self) -> bool {
        let guard = self.global_data();
        let tail_node = self.tail();
        guard.global_buffered_updates.any()
            || !guard.global_slice.is_empty()
            || !same_node(&guard.global_slice.slice_tail, &tail_node)
            || tail_node.get_next().is_some()
    }

    pub fn next_sequence_number(&self) -> u64 {
        let no = self.next_seq_no.fetch_add(1, Ordering::AcqRel);
        debug_assert!(no < self.max_seq_no.load(Ordering::Acquire));
        no
    }

    fn try_apply_global_slice(&self) {
        if let Ok(mut guard) = self.global_data.try_lock() {
            // The global buffer must be locked but we don't need to update them if
            // there is an update going on right now. It is sufficient to apply the
            // deletes that have been added after the current in-flight global slices
            // tail the next time we can get the lock!
            if self.update_slice_without_seq_no(&mut guard.global_slice) {
                guard.apply_global_updates(MAX_DOC_ID_UPTO);
            }
        }
    }

    fn update_slice_without_seq_no(&self, slice: &mut DeleteSlice) -> bool {
        let tail = self.tail();
        if !same_node(&slice.slice_tail, &tail) {
            slice.slice_tail = Arc::clone(&tail);
            true
        } else {
            false
        }
    }

    pub fn freeze_global_buffer(&self, caller_slice: Option<&mut DeleteSlice>) -> FrozenBufferedUpdates {
        let mut global_guard = self.global_data();
        // Here we freeze the global buffer so we need to lock it, apply all deletes in the
        // queue and reset the global slice to let the list be pruned
        let current_tail = Arc::clone(&self.tail());

        if let Some(slice) = caller_slice {
            if !same_node(&current_tail, &slice.slice_tail) {
                slice.slice_tail = Arc::clone(&current_tail);
            }
        }

        if !same_node(&global_guard.global_slice.slice_tail, &current_tail) {
            global_guard.global_slice.slice_tail = current_tail;
            global_guard.apply_global_updates(MAX_DOC_ID_UPTO);
        }
        FrozenBufferedUpdates::new(&mut global_guard.global_buffered_updates, false)
    }

    pub fn new_slice(&self) -> DeleteSlice {
        DeleteSlice::new(&self.tail())
    }

    pub fn update_slice(&self, slice: &mut DeleteSlice) -> (u64, bool) {
        let seq_no = self.next_sequence_number();
        let tail = self.tail();
        if !same_node(&tail, &slice.slice_tail) {
            // new deletes arrived since we last checked
            slice.slice_tail = Arc::clone(&tail);
            (seq_no, true)
        } else {
            (seq_no, false)
        }
    }

    pub fn num_global_term_deletes(&self) -> usize {
        self.global_data().global_buffered_updates.num_term_deletes
    }

    /// RAM used by the global buffered deletes of this queue.
    pub fn bytes_used(&self) -> u64 {
        self.global_data().global_buffered_updates.bytes_used() as u64
    }

    pub fn clear(&self) {
        let mut guard = self.global_data();
        let current_tail = Arc::clone(&self.tail());
        guard.global_slice.slice_head = Arc::clone(&current_tail);
        guard.global_slice.slice_tail = current_tail;
        guard.global_buffered_updates.clear();
    }

    pub fn last_sequence_number(&self) -> u64 {
        self.next_seq_no.load(Ordering::Acquire) - 1
    }

    pub fn skip_sequence_number(&self, jump: u64) {
        self.next_seq_no.fetch_add(jump, Ordering::AcqRel);
    }

    pub fn max_seq_no(&self) -> u64 {
        self.max_seq_no.load(Ordering::Acquire)
    }

    /// Caps the sequence numbers this queue may still hand out, used once a
    /// full flush has replaced it.
    pub fn set_max_seq_no(&self, max_seq_no: u64) {
        self.max_seq_no.store(max_seq_no, Ordering::Release);
    }
}

enum DeleteNode {
    Term(Term),
    TermArray(Vec<Term>),
    // used for sentinel head
    None,
}

impl DeleteNode {
    fn apply(&self, buffered_deletes: &mut BufferedUpdates, doc_id_upto: DocId) {
        match self {
            DeleteNode::Term(t) => {
                buffered_deletes.add_term(t.clone(), doc_id_upto);
            }
            DeleteNode::TermArray(terms) => {
                for t in terms {
                    buffered_deletes.add_term(t.clone(), doc_id_upto);
                }
            }
            DeleteNode::None => {
                unreachable!();
            }
        }
    }
}

struct DeleteListNode {
    data: DeleteNode,
    next: Mutex<Option<Arc<DeleteListNode>>>,
}

impl Default for DeleteListNode {
    fn default() -> Self {
        Self::new(DeleteNode::None)
    }
}

#[inline]
fn same_node(n1: &Arc<DeleteListNode>, n2: &Arc<DeleteListNode>) -> bool {
    Arc::ptr_eq(n1, n2)
}

impl DeleteListNode {
    fn new(data: DeleteNode) -> Self {
        DeleteListNode {
            data,
            next: Mutex::new(None),
        }
    }

    fn next_slot(&self) -> MutexGuard<'_, Option<Arc<DeleteListNode>>> {
        self.next.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_next(&self) -> Option<Arc<DeleteListNode>> {
        self.next_slot().clone()
    }
}

impl Drop for DeleteListNode {
    // unlink iteratively, a long queue would otherwise overflow the stack
    fn drop(&mut self) {
        let mut next = take_next(&mut self.next);
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = take_next(&mut node.next),
                Err(_) => break,
            }
        }
    }
}

fn take_next(slot: &mut Mutex<Option<Arc<DeleteListNode>>>) -> Option<Arc<DeleteListNode>> {
    slot.get_mut()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
}

pub struct DeleteSlice {
    // slices are thread captive (only accessed by the owning DWPT)
    slice_head: Arc<DeleteListNode>,
    slice_tail: Arc<DeleteListNode>,
}

impl DeleteSlice {
    fn new(tail: &Arc<DeleteListNode>) -> Self {
        DeleteSlice {
            slice_head: Arc::clone(tail),
            slice_tail: Arc::clone(tail),
        }
    }

    pub fn apply(&mut self, buffered_deletes: &mut BufferedUpdates, doc_id_upto: DocId) {
        if same_node(&self.slice_head, &self.slice_tail) {
            // 0 length slice
            return;
        }

        // When we apply a slice we take the head and get its next as our first
        // item to apply and continue until we applied the tail. If the head and
        // tail in this slice are not equal then there will be at least one more
        // linked node in the slice!
        let mut current = Arc::clone(&self.slice_head);
        while let Some(next) = current.get_next() {
            next.data.apply(buffered_deletes, doc_id_upto);
            if same_node(&next, &self.slice_tail) {
                break;
            }
            current = next;
        }
        self.reset();
    }

    pub fn reset(&mut self) {
        // Reset to a 0 length slice
        self.slice_head = Arc::clone(&self.slice_tail);
    }

    pub fn is_empty(&self) -> bool {
        same_node(&self.slice_head, &self.slice_tail)
    }
}
