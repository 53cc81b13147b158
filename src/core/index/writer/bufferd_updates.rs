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
use crate::core::util::DocId;
use crate::error::Result;

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

// Rough logic: del docIDs are List<i32>.  Say list allocates ~2X size (2 * i32),
pub const BYTES_PER_DEL_DOCID: usize = 2 * mem::size_of::<DocId>();

/// Rough logic: hash-map has an array<index> varying load factor (say 2 * usize).
/// Term is object with two Vec(String is actual a Vec), each Vec cost 2 * usize (cap/size) +
/// vec.capasity * byte
pub const BYTES_PER_DEL_TERM: usize = 6 * mem::size_of::<usize>();

/// doc id limit used by deletes that apply to every document of a segment.
pub const MAX_DOC_ID_UPTO: DocId = i32::max_value();

/// Holds buffered deletes, by docID or term, for a single segment. This is
/// used to hold buffered pending deletes against the to-be-flushed segment.
/// Once the deletes are pushed (on flush in DocumentsWriter), they are
/// converted to a FrozenBufferedUpdates instance.
///
/// NOTE: instances of this struct are accessed either via a private
/// instance on DocumentWriterPerThread, or via the global lock of
/// DocumentsWriterDeleteQueue
pub struct BufferedUpdates {
    pub num_term_deletes: usize,
    pub deleted_terms: HashMap<Term, DocId>,
    pub deleted_doc_ids: Vec<DocId>,
    bytes_used: usize,
    pub segment_name: String,
}

impl BufferedUpdates {
    pub fn new(name: String) -> Self {
        BufferedUpdates {
            num_term_deletes: 0,
            deleted_terms: HashMap::new(),
            deleted_doc_ids: vec![],
            bytes_used: 0,
            segment_name: name,
        }
    }

    pub fn add_doc_id(&mut self, doc_id: DocId) {
        self.deleted_doc_ids.push(doc_id);
        self.bytes_used += BYTES_PER_DEL_DOCID;
    }

    pub fn add_term(&mut self, term: Term, doc_id_upto: DocId) {
        let current = self.deleted_terms.get(&term).cloned();
        if let Some(current) = current {
            if doc_id_upto < current {
                // Only record the new number if it's greater than the
                // current one.  This is important because if multiple
                // threads are replacing the same doc at nearly the
                // same time, it's possible that one thread that got a
                // higher docID is scheduled before the other
                // threads.  If we blindly replace than we can
                // incorrectly get both docs indexed.
                return;
            }
        }

        if current.is_none() {
            self.bytes_used += BYTES_PER_DEL_TERM + term.bytes.len() + term.field.len();
        }
        self.deleted_terms.insert(term, doc_id_upto);
        // repeats still count towards the term-count trigger
        self.num_term_deletes += 1;
    }

    pub fn clear(&mut self) {
        self.deleted_terms.clear();
        self.deleted_doc_ids.clear();
        self.num_term_deletes = 0;
        self.bytes_used = 0;
    }

    pub fn any(&self) -> bool {
        !self.deleted_terms.is_empty() || !self.deleted_doc_ids.is_empty()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }
}

impl fmt::Display for BufferedUpdates {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "gen={}", self.segment_name)?;
        if self.num_term_deletes > 0 {
            write!(
                f,
                " {} deleted terms (unique count={})",
                self.num_term_deletes,
                self.deleted_terms.len()
            )?;
        }
        if !self.deleted_doc_ids.is_empty() {
            write!(f, " {} deleted docIDs", self.deleted_doc_ids.len())?;
        }
        if self.bytes_used > 0 {
            write!(f, " bytes_used={}", self.bytes_used)?;
        }
        Ok(())
    }
}

/// Holds buffered deletes by term, once pushed. Pushed deletes are
/// write-once, so we shift to a sorted vector to hold them.
pub struct FrozenBufferedUpdates {
    // sorted by term, each with the doc id limit it applies below
    terms: Vec<(Term, DocId)>,
    pub deleted_doc_ids: Vec<DocId>,
    pub num_term_deletes: usize,
    pub bytes_used: usize,
    // assigned by BufferedUpdatesStream once pushed
    pub gen: u64,
    // set to true iff this frozen packet represents a segment private delete.
    is_segment_private: bool,
}

impl fmt::Display for FrozenBufferedUpdates {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.num_term_deletes > 0 {
            write!(
                f,
                " {} deleted terms (unique count={})",
                self.num_term_deletes,
                self.terms.len()
            )?;
        }
        if !self.deleted_doc_ids.is_empty() {
            write!(f, " {} deleted docIDs", self.deleted_doc_ids.len())?;
        }
        Ok(())
    }
}

impl FrozenBufferedUpdates {
    pub fn new(deletes: &mut BufferedUpdates, is_segment_private: bool) -> Self {
        let mut terms: Vec<(Term, DocId)> = deletes.deleted_terms.drain().collect();
        terms.sort();

        let frozen = FrozenBufferedUpdates {
            terms,
            deleted_doc_ids: mem::replace(&mut deletes.deleted_doc_ids, vec![]),
            num_term_deletes: deletes.num_term_deletes,
            bytes_used: deletes.bytes_used,
            // used as a sentinel of invalid
            gen: u64::max_value(),
            is_segment_private,
        };
        deletes.clear();
        frozen
    }

    pub fn set_del_gen(&mut self, gen: u64) {
        debug_assert_eq!(self.gen, u64::max_value());
        self.gen = gen;
    }

    pub fn terms(&self) -> &[(Term, DocId)] {
        &self.terms
    }

    pub fn is_segment_private(&self) -> bool {
        self.is_segment_private
    }

    pub fn any(&self) -> bool {
        !self.terms.is_empty() || !self.deleted_doc_ids.is_empty()
    }
}

/// Tracks the stream of `FrozenBufferedUpdates`.
/// When DocumentsWriterPerThread flushes, its global deletes are appended
/// to this stream.  The owner of the index later applies them (resolve
/// them to the actual docIDs, per segment) and prunes the packets every
/// segment has seen.
///
/// Each packet is assigned a generation, so we can track which packets
/// still have to be applied to any given segment.
pub struct BufferedUpdatesStream {
    lock: Mutex<()>,
    updates: Mutex<Vec<FrozenBufferedUpdates>>,
    // Starts at 1 so that segments that have never had
    // deletes applied (whose del gen defaults to 0)
    // will be correct:
    next_gen: AtomicU64,
    num_terms: AtomicUsize,
    bytes_used: AtomicU64,
}

impl Default for BufferedUpdatesStream {
    fn default() -> Self {
        BufferedUpdatesStream {
            lock: Mutex::new(()),
            updates: Mutex::new(vec![]),
            next_gen: AtomicU64::new(1),
            num_terms: AtomicUsize::new(0),
            bytes_used: AtomicU64::new(0),
        }
    }
}

impl BufferedUpdatesStream {
    // Append a new packet of buffered deletes to the stream:
    // setting its generation:
    pub fn push(&self, mut packet: FrozenBufferedUpdates) -> Result<u64> {
        // The insert operation must be atomic. If we let threads increment the gen
        // and push the packet afterwards we risk that packets are out of order.
        // With DWPT this is possible if two or more flushes are racing for pushing
        // updates. If the pushed packets get our of order would loose documents
        // since deletes are applied to the wrong segments.
        let _l = self.lock.lock()?;
        packet.set_del_gen(self.next_gen.fetch_add(1, Ordering::AcqRel));
        let mut updates = self.updates.lock()?;
        debug_assert!(packet.any());
        debug_assert!(self.check_delete_stats(&updates));
        debug_assert!(updates.last().map_or(true, |last| last.gen < packet.gen));
        let del_gen = packet.gen;
        self.num_terms
            .fetch_add(packet.num_term_deletes, Ordering::AcqRel);
        self.bytes_used
            .fetch_add(packet.bytes_used as u64, Ordering::AcqRel);
        debug!(
            "BD: push deletes {} del_gen={} packet_count={} bytes_used={}",
            packet,
            del_gen,
            updates.len() + 1,
            self.bytes_used.load(Ordering::Acquire)
        );
        updates.push(packet);
        debug_assert!(self.check_delete_stats(&updates));
        Ok(del_gen)
    }

    pub fn clear(&self) -> Result<()> {
        let _l = self.lock.lock()?;
        self.updates.lock()?.clear();
        self.next_gen.store(1, Ordering::Release);
        self.num_terms.store(0, Ordering::Release);
        self.bytes_used.store(0, Ordering::Release);
        Ok(())
    }

    pub fn any(&self) -> bool {
        self.bytes_used.load(Ordering::Acquire) != 0
    }

    pub fn num_terms(&self) -> usize {
        self.num_terms.load(Ordering::Acquire)
    }

    pub fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Acquire)
    }

    pub fn packet_count(&self) -> Result<usize> {
        Ok(self.updates.lock()?.len())
    }

    pub fn get_next_gen(&self) -> Result<u64> {
        let _l = self.lock.lock()?;
        Ok(self.next_gen.fetch_add(1, Ordering::AcqRel))
    }

    /// Remove any packets that we no longer need to store because every
    /// segment has seen deletes up to `min_gen` (exclusive).
    pub fn prune(&self, min_gen: u64) -> Result<()> {
        let _l = self.lock.lock()?;
        let mut updates = self.updates.lock()?;
        debug_assert!(self.check_delete_stats(&updates));

        let idx = updates
            .iter()
            .position(|p| p.gen >= min_gen)
            .unwrap_or_else(|| updates.len());
        if idx > 0 {
            debug!(
                "BD: prune_deletes: prune {} packets; {} packets remain.",
                idx,
                updates.len() - idx
            );
        }
        for packet in updates.drain(..idx) {
            debug_assert!(self.num_terms.load(Ordering::Acquire) >= packet.num_term_deletes);
            self.num_terms
                .fetch_sub(packet.num_term_deletes, Ordering::AcqRel);
            self.bytes_used
                .fetch_sub(packet.bytes_used as u64, Ordering::AcqRel);
        }
        debug_assert!(self.check_delete_stats(&updates));
        Ok(())
    }

    // only used for assert
    fn check_delete_stats(&self, updates: &[FrozenBufferedUpdates]) -> bool {
        let num_terms: usize = updates.iter().map(|u| u.num_term_deletes).sum();
        let bytes: u64 = updates.iter().map(|u| u.bytes_used as u64).sum();
        assert_eq!(num_terms, self.num_terms.load(Ordering::Acquire));
        assert_eq!(bytes, self.bytes_used.load(Ordering::Acquire));
        true
    }
}
