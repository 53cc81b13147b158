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
    DocConsumer, DocumentsWriterFlushControl, FlushControlState, IndexWriterConfig, ThreadState,
};

use std::sync::Arc;

/// `FlushPolicy` controls when segments are flushed from a RAM resident
/// internal data-structure to disk.
///
/// Segments are traditionally flushed by:
/// - RAM consumption - configured via `IndexWriterConfig::ram_buffer_size_mb`
/// - Number of RAM resident documents - configured via
///   `IndexWriterConfig::max_buffered_docs`
///
/// The policy also applies pending delete operations (by term), given the
/// threshold set in `IndexWriterConfig::max_buffered_delete_terms`.
///
/// `DocumentsWriterFlushControl` consults the provided `FlushPolicy` to
/// control the flushing process. The policy is informed for each added or
/// updated document as well as for each delete term. Based on the
/// `FlushPolicy`, the information provided via `ThreadState` and
/// `DocumentsWriterFlushControl`, the `FlushPolicy` decides if a
/// `DocumentsWriterPerThread` needs flushing and mark it as flush-pending
/// via `DocumentsWriterFlushControl::set_flush_pending`, or if deletes need
/// to be applied.
///
/// Every callback runs while the flush control lock is held, `lg` is the
/// proof of that. A policy must never try to take the lock itself.
pub trait FlushPolicy<C: DocConsumer>: Send + Sync {
    /// Called for each delete term. If this is a delete triggered due to an update
    /// the given `ThreadState` is non-null.
    ///
    /// Note: it is guaranteed that the calling thread holds the lock on the
    /// given `ThreadState`
    fn on_delete(
        &self,
        control: &DocumentsWriterFlushControl<C>,
        lg: &mut FlushControlState<C>,
        state: Option<&ThreadState<C>>,
    );

    /// Called for each document update on the given `ThreadState`'s
    /// `DocumentsWriterPerThread`.
    fn on_update(
        &self,
        control: &DocumentsWriterFlushControl<C>,
        lg: &mut FlushControlState<C>,
        state: &ThreadState<C>,
    ) {
        self.on_insert(control, lg, state);
        self.on_delete(control, lg, Some(state));
    }

    /// Called for each document addition on the given `ThreadState`s
    /// `DocumentsWriterPerThread`.
    fn on_insert(
        &self,
        control: &DocumentsWriterFlushControl<C>,
        lg: &mut FlushControlState<C>,
        state: &ThreadState<C>,
    );
}

/// Default `FlushPolicy` implementation that flushes new segments based on
/// RAM used and document count depending on the writer's
/// `IndexWriterConfig`. It also applies pending deletes based on the
/// number of buffered delete terms.
///
/// - `on_delete` applies pending delete operations based on the global
///   number of buffered delete terms iff `max_buffered_delete_terms` is
///   enabled, or once the buffered deletes alone exceed the RAM buffer
/// - `on_insert` flushes either on the number of documents per
///   `DocumentsWriterPerThread` or on the global active memory consumption
///   in the current indexing session iff `max_buffered_docs` or
///   `ram_buffer_size_mb` is enabled respectively
/// - `on_update` calls `on_insert` and `on_delete` in order
///
/// If `ram_buffer_size_mb` is enabled, the largest ram consuming
/// `DocumentsWriterPerThread` will be marked as pending iff the global
/// active RAM consumption is `>=` the configured max RAM buffer.
pub struct FlushByRamOrCountsPolicy {
    index_write_config: Arc<IndexWriterConfig>,
}

impl FlushByRamOrCountsPolicy {
    pub fn new(index_write_config: Arc<IndexWriterConfig>) -> Self {
        FlushByRamOrCountsPolicy { index_write_config }
    }

    /// Marks the most ram consuming active `DocumentsWriterPerThread` flush
    /// pending
    fn mark_largest_writer_pending<C: DocConsumer>(
        &self,
        control: &DocumentsWriterFlushControl<C>,
        lg: &mut FlushControlState<C>,
        state: &ThreadState<C>,
        current_bytes_used: u64,
    ) {
        let largest = self.find_largest_non_pending_writer(control, state);
        let target = largest.as_ref().map_or(state, |s| s.as_ref());
        debug!(
            "FP: force flush thread state {} active_bytes={} delete_bytes={} total={}",
            target.index(),
            lg.active_bytes(),
            control.delete_bytes_used(),
            current_bytes_used
        );
        control.set_flush_pending(lg, target);
    }

    /// Returns the largest non-pending writer other than `state`, if one
    /// is larger than `state`.
    fn find_largest_non_pending_writer<C: DocConsumer>(
        &self,
        control: &DocumentsWriterFlushControl<C>,
        state: &ThreadState<C>,
    ) -> Option<Arc<ThreadState<C>>> {
        debug_assert!(!state.flush_pending(), "DWPT should have flushed");
        let mut max_ram_so_far = state.bytes_used();
        let mut largest = None;
        for next in control.all_active_thread_states() {
            if next.index() == state.index() || next.flush_pending() {
                continue;
            }
            let next_ram = next.bytes_used();
            if next_ram > max_ram_so_far && next.num_docs_in_ram() > 0 {
                max_ram_so_far = next_ram;
                largest = Some(next);
            }
        }
        largest
    }
}

impl<C: DocConsumer> FlushPolicy<C> for FlushByRamOrCountsPolicy {
    fn on_delete(
        &self,
        control: &DocumentsWriterFlushControl<C>,
        _lg: &mut FlushControlState<C>,
        _state: Option<&ThreadState<C>>,
    ) {
        let config = &self.index_write_config;
        if config.flush_on_delete_terms() {
            // flush this state by num del terms
            if control.num_global_term_deletes() >= config.max_buffered_delete_terms() as usize {
                control.set_apply_all_deletes();
            }
        }
        if config.flush_on_ram() && control.delete_bytes_used() > config.ram_buffer_size() {
            control.set_apply_all_deletes();
            debug!(
                "FP: force apply deletes bytes_used={} vs ram_buffer={}",
                control.delete_bytes_used(),
                config.ram_buffer_size()
            );
        }
    }

    fn on_insert(
        &self,
        control: &DocumentsWriterFlushControl<C>,
        lg: &mut FlushControlState<C>,
        state: &ThreadState<C>,
    ) {
        let config = &self.index_write_config;
        if config.flush_on_doc_count() && state.num_docs_in_ram() >= config.max_buffered_docs() {
            // Flush this state by num docs
            control.set_flush_pending(lg, state);
        } else if config.flush_on_ram() {
            // flush by RAM
            let limit = config.ram_buffer_size();
            let total_ram = lg.active_bytes() + control.delete_bytes_used();
            if total_ram >= limit {
                self.mark_largest_writer_pending(control, lg, state, total_ram);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::doc::Term;
    use crate::core::index::writer::mock::{Harness, MB};

    #[test]
    fn test_flush_by_doc_count() {
        let mut conf = IndexWriterConfig::default();
        conf.ram_buffer_size_mb = None;
        conf.max_buffered_docs = Some(3);
        let h = Harness::new(conf);
        let state = h.new_state();

        assert!(h.add_doc(&state, 10).is_none());
        assert!(h.add_doc(&state, 10).is_none());
        let flushing = h.add_doc(&state, 10).expect("third doc triggers a flush");
        assert_eq!(flushing.num_docs_in_ram, 3);
        assert_eq!(flushing.consumer().num_docs(), 3);
        assert_eq!(h.control.num_pending(), 0);
        assert_eq!(h.control.num_flushing_dwpt(), 1);
        assert_eq!(h.control.flush_bytes(), 30);
        assert_eq!(h.control.active_bytes(), 0);
        h.control.do_after_flush(flushing);
        assert_eq!(h.control.net_bytes(), 0);
    }

    #[test]
    fn test_flush_by_ram_marks_largest_writer() {
        let mut conf = IndexWriterConfig::default();
        conf.ram_buffer_size_mb = Some(1.0);
        let h = Harness::new(conf);
        let large = h.new_state();
        let small = h.new_state();

        assert!(h.add_doc(&large, 600 * 1024).is_none());
        // crossing the buffer with the smaller writer flags the larger one
        assert!(h.add_doc(&small, 500 * 1024).is_none());
        assert!(large.flush_pending());
        assert!(!small.flush_pending());
        assert_eq!(h.control.num_pending(), 1);
        assert_eq!(h.control.flush_bytes(), 600 * 1024);
        assert_eq!(h.control.active_bytes(), 500 * 1024);

        let flushing = h.control.next_pending_flush().expect("pending writer");
        assert_eq!(flushing.consumer().bytes_used(), 600 * 1024);
        assert!(!large.flush_pending());
        assert_eq!(h.control.num_pending(), 0);
        h.control.do_after_flush(flushing);
        assert_eq!(h.control.net_bytes(), 500 * 1024);
        assert!(h.control.next_pending_flush().is_none());
    }

    #[test]
    fn test_flush_by_ram_marks_caller_when_largest() {
        let mut conf = IndexWriterConfig::default();
        conf.ram_buffer_size_mb = Some(1.0);
        let h = Harness::new(conf);
        let small = h.new_state();
        let large = h.new_state();

        assert!(h.add_doc(&small, 100 * 1024).is_none());
        let flushing = h.add_doc(&large, MB).expect("caller is the largest writer");
        assert_eq!(flushing.consumer().bytes_used(), MB);
        assert!(!small.flush_pending());
        h.control.do_after_flush(flushing);
        assert_eq!(h.control.net_bytes(), 100 * 1024);
    }

    #[test]
    fn test_on_delete_sets_apply_all_deletes() {
        let mut conf = IndexWriterConfig::default();
        conf.max_buffered_delete_terms = Some(2);
        let h = Harness::new(conf);
        let queue = h.pool.delete_queue();

        queue.add_delete_terms(vec![Term::new("id".into(), b"1".to_vec())]);
        h.control.do_on_delete();
        assert!(!h.control.get_and_reset_apply_all_deletes());

        queue.add_delete_terms(vec![Term::new("id".into(), b"2".to_vec())]);
        h.control.do_on_delete();
        assert_eq!(h.control.num_global_term_deletes(), 2);
        assert!(h.control.get_and_reset_apply_all_deletes());
        assert!(!h.control.get_and_reset_apply_all_deletes());

        // frozen deletes still count until the stream is pruned
        h.stream.push(queue.freeze_global_buffer(None)).unwrap();
        assert_eq!(h.stream.num_terms(), 2);
        assert_eq!(h.control.num_global_term_deletes(), 2);
        h.control.do_on_delete();
        assert!(h.control.get_and_reset_apply_all_deletes());

        h.stream.prune(u64::max_value()).unwrap();
        assert_eq!(h.control.num_global_term_deletes(), 0);
        h.control.do_on_delete();
        assert!(!h.control.get_and_reset_apply_all_deletes());
    }

    #[test]
    fn test_on_delete_by_ram() {
        let mut conf = IndexWriterConfig::default();
        conf.ram_buffer_size_mb = Some(0.001);
        let h = Harness::new(conf);
        let queue = h.pool.delete_queue();
        let terms: Vec<Term> = (0..100)
            .map(|i| Term::new("id".into(), format!("{}", i).into_bytes()))
            .collect();
        queue.add_delete_terms(terms);
        assert!(h.control.delete_bytes_used() > h.config.ram_buffer_size());
        h.control.do_on_delete();
        assert!(h.control.get_and_reset_apply_all_deletes());
    }
}
