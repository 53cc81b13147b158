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

//! In-memory doc consumer and a flush control harness shared by the writer
//! tests.

use crate::core::index::writer::{
    BufferedUpdatesStream, DocConsumer, DocumentsWriterFlushControl, DocumentsWriterPerThread,
    DocumentsWriterPerThreadPool, FlushByRamOrCountsPolicy, FlushPolicy, IndexWriterConfig,
    SegmentWriteState, ThreadState,
};
use crate::core::util::DocId;
use crate::error::ErrorKind::RuntimeError;
use crate::error::Result;

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

pub const MB: u64 = 1024 * 1024;

/// A document that only has a size. It can be made to fail indexing, or to
/// make the consumer that buffered it fail on flush or abort.
#[derive(Clone, Debug)]
pub struct MockDoc {
    pub bytes: u64,
    pub fail: bool,
    pub fail_flush: bool,
    pub fail_abort: bool,
}

impl MockDoc {
    pub fn new(bytes: u64) -> Self {
        MockDoc {
            bytes,
            fail: false,
            fail_flush: false,
            fail_abort: false,
        }
    }

    pub fn failing() -> Self {
        MockDoc {
            fail: true,
            ..MockDoc::new(0)
        }
    }

    pub fn failing_flush(mut self) -> Self {
        self.fail_flush = true;
        self
    }

    pub fn failing_abort(mut self) -> Self {
        self.fail_abort = true;
        self
    }
}

pub struct MockConsumer {
    segment: String,
    bytes: u64,
    docs: Vec<DocId>,
    fail_flush: bool,
    fail_abort: bool,
}

impl MockConsumer {
    pub fn new(segment: &str) -> Self {
        MockConsumer {
            segment: segment.to_string(),
            bytes: 0,
            docs: vec![],
            fail_flush: false,
            fail_abort: false,
        }
    }

    pub fn num_docs(&self) -> usize {
        self.docs.len()
    }
}

impl DocConsumer for MockConsumer {
    type Doc = MockDoc;

    fn process_document(&mut self, doc_id: DocId, doc: MockDoc) -> Result<()> {
        if doc.fail {
            bail!(RuntimeError(format!("doc {} can not be indexed", doc_id)));
        }
        self.bytes += doc.bytes;
        self.docs.push(doc_id);
        self.fail_flush |= doc.fail_flush;
        self.fail_abort |= doc.fail_abort;
        Ok(())
    }

    fn bytes_used(&self) -> u64 {
        self.bytes
    }

    fn flush(&mut self, state: &SegmentWriteState) -> Result<HashSet<String>> {
        if self.fail_flush {
            bail!(RuntimeError(format!(
                "segment {} can not be written",
                state.segment_name
            )));
        }
        let mut files = HashSet::new();
        files.insert(format!("{}.seg", state.segment_name));
        Ok(files)
    }

    fn abort(&mut self, new_files: &mut HashSet<String>) -> Result<()> {
        self.bytes = 0;
        self.docs.clear();
        if self.fail_abort {
            bail!(RuntimeError(format!("abort of {} failed", self.segment)));
        }
        new_files.insert(format!("{}.tmp", self.segment));
        Ok(())
    }
}

/// A flush control wired to its pool the way the documents writer does it,
/// with helpers that index one document the way a producer thread would.
pub struct Harness {
    pub config: Arc<IndexWriterConfig>,
    pub pool: Arc<DocumentsWriterPerThreadPool<MockConsumer>>,
    pub control: DocumentsWriterFlushControl<MockConsumer>,
    pub stream: Arc<BufferedUpdatesStream>,
    pub num_docs: Arc<AtomicU32>,
    pub pending_num_docs: Arc<AtomicI64>,
    segments: AtomicU32,
}

impl Harness {
    pub fn new(config: IndexWriterConfig) -> Self {
        let config = Arc::new(config);
        let policy = Arc::new(FlushByRamOrCountsPolicy::new(Arc::clone(&config)));
        Self::with_policy(config, policy)
    }

    pub fn with_policy(
        config: Arc<IndexWriterConfig>,
        policy: Arc<dyn FlushPolicy<MockConsumer>>,
    ) -> Self {
        config.validate().unwrap();
        let pool = Arc::new(DocumentsWriterPerThreadPool::default());
        let stream = Arc::new(BufferedUpdatesStream::default());
        let num_docs = Arc::new(AtomicU32::new(0));
        let control = DocumentsWriterFlushControl::new(
            Arc::clone(&config),
            Arc::clone(&pool),
            policy,
            Arc::clone(&stream),
            Arc::clone(&num_docs),
        );
        Harness {
            config,
            pool,
            control,
            stream,
            num_docs,
            pending_num_docs: Arc::new(AtomicI64::new(0)),
            segments: AtomicU32::new(0),
        }
    }

    pub fn new_state(&self) -> Arc<ThreadState<MockConsumer>> {
        self.pool.get_and_lock().unwrap()
    }

    fn new_writer(&self) -> DocumentsWriterPerThread<MockConsumer> {
        let name = format!("_{}", self.segments.fetch_add(1, Ordering::AcqRel));
        DocumentsWriterPerThread::new(
            name.clone(),
            MockConsumer::new(&name),
            self.pool.delete_queue(),
            Arc::clone(&self.pending_num_docs),
        )
    }

    /// Gives the state a writer without documents.
    pub fn init_writer(&self, state: &ThreadState<MockConsumer>) {
        let mut locked = self.control.obtain_and_lock(state).unwrap();
        if !locked.inited() {
            locked.set_dwpt(self.new_writer());
        }
    }

    pub fn add_doc(
        &self,
        state: &ThreadState<MockConsumer>,
        bytes: u64,
    ) -> Option<DocumentsWriterPerThread<MockConsumer>> {
        self.add_doc_with(state, MockDoc::new(bytes))
    }

    pub fn add_doc_with(
        &self,
        state: &ThreadState<MockConsumer>,
        doc: MockDoc,
    ) -> Option<DocumentsWriterPerThread<MockConsumer>> {
        let mut locked = self.control.obtain_and_lock(state).unwrap();
        if !locked.inited() {
            locked.set_dwpt(self.new_writer());
        }
        locked
            .dwpt_mut()
            .unwrap()
            .update_document(doc, None)
            .unwrap();
        self.num_docs.fetch_add(1, Ordering::AcqRel);
        self.control.do_after_document(&mut locked, false)
    }
}
