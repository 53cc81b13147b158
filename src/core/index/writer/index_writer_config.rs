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

use crate::error::{ErrorKind::IllegalArgument, Result};

use std::cmp;
use std::time::Duration;

/// Default value is 16 MB (which means flush when buffered docs consume
/// approximately 16 MB RAM).
pub const DEFAULT_RAM_BUFFER_SIZE_MB: f64 = 16.0;

/// Default value for the per-thread hard RAM limit. A single per-thread
/// writer is forced to flush once it consumes more than this.
pub const DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB: u32 = 1945;

/// Default upper bound of a single wait of a stalled producer.
pub const DEFAULT_STALL_WAIT_TIMEOUT_MS: u64 = 1000;

/// Upper bound (exclusive) of the per-thread hard RAM limit.
pub const MAX_RAM_PER_THREAD_HARD_LIMIT_MB: u32 = 2048;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Holds all the configuration that drives flushing of the in-memory
/// per-thread writers.
///
/// The config is usually built by setting the public fields, or loaded from
/// json through `IndexWriterConfig::from_json`. Either way it must pass
/// `validate` before a `DocumentsWriter` accepts it:
///
/// ```
/// use segflush::core::index::writer::IndexWriterConfig;
///
/// let mut conf = IndexWriterConfig::default();
/// conf.ram_buffer_size_mb = Some(64.0);
/// conf.max_buffered_docs = Some(10_000);
/// assert!(conf.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexWriterConfig {
    /// Amount of RAM that may be used for buffering added documents and
    /// deletions before they are flushed, `None` disables flushing by RAM.
    pub ram_buffer_size_mb: Option<f64>,
    /// Minimal number of documents required before the buffered in-memory
    /// documents are flushed as a new segment, `None` disables it.
    pub max_buffered_docs: Option<u32>,
    /// Number of buffered delete terms that trigger applying all deletes,
    /// `None` disables it.
    pub max_buffered_delete_terms: Option<u32>,
    pub ram_per_thread_hard_limit_mb: u32,
    /// Number of background flush threads, 0 means producer threads flush.
    pub flush_threads: usize,
    /// A stalled producer waits at most this long before it re-checks and
    /// helps flushing.
    pub stall_wait_timeout_ms: u64,
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            ram_buffer_size_mb: Some(DEFAULT_RAM_BUFFER_SIZE_MB),
            max_buffered_docs: None,
            max_buffered_delete_terms: None,
            ram_per_thread_hard_limit_mb: DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB,
            flush_threads: 0,
            stall_wait_timeout_ms: DEFAULT_STALL_WAIT_TIMEOUT_MS,
        }
    }
}

impl IndexWriterConfig {
    /// Parses a config from json, missing fields take their default value.
    pub fn from_json(json: &str) -> Result<IndexWriterConfig> {
        let conf: IndexWriterConfig = serde_json::from_str(json)?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(mb) = self.ram_buffer_size_mb {
            if !(mb > 0.0) {
                bail!(IllegalArgument(
                    "ram_buffer_size_mb should be > 0.0 MB when enabled".into()
                ));
            }
        }
        if let Some(docs) = self.max_buffered_docs {
            if docs < 2 {
                bail!(IllegalArgument(
                    "max_buffered_docs must at least be 2 when enabled".into()
                ));
            }
        }
        if let Some(terms) = self.max_buffered_delete_terms {
            if terms < 1 {
                bail!(IllegalArgument(
                    "max_buffered_delete_terms must at least be 1 when enabled".into()
                ));
            }
        }
        if self.ram_per_thread_hard_limit_mb == 0
            || self.ram_per_thread_hard_limit_mb >= MAX_RAM_PER_THREAD_HARD_LIMIT_MB
        {
            bail!(IllegalArgument(format!(
                "ram_per_thread_hard_limit_mb must be greater than 0 and less than {}MB",
                MAX_RAM_PER_THREAD_HARD_LIMIT_MB
            )));
        }
        if self.stall_wait_timeout_ms == 0 {
            bail!(IllegalArgument(
                "stall_wait_timeout_ms must be greater than 0".into()
            ));
        }
        if !self.flush_on_ram() && !self.flush_on_doc_count() {
            bail!(IllegalArgument(
                "at least one of ram_buffer_size_mb and max_buffered_docs must be enabled".into()
            ));
        }
        Ok(())
    }

    pub fn max_buffered_delete_terms(&self) -> u32 {
        self.max_buffered_delete_terms.unwrap_or(0)
    }

    pub fn max_buffered_docs(&self) -> u32 {
        self.max_buffered_docs.unwrap_or(0)
    }

    pub fn flush_on_delete_terms(&self) -> bool {
        self.max_buffered_delete_terms.is_some()
    }

    pub fn flush_on_doc_count(&self) -> bool {
        self.max_buffered_docs.is_some()
    }

    pub fn flush_on_ram(&self) -> bool {
        self.ram_buffer_size_mb.is_some()
    }

    /// RAM buffer size in bytes, 0 when flushing by RAM is disabled.
    pub fn ram_buffer_size(&self) -> u64 {
        self.ram_buffer_size_mb
            .map(|mb| (mb * BYTES_PER_MB) as u64)
            .unwrap_or(0)
    }

    pub fn stall_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_wait_timeout_ms)
    }

    /// Per-thread hard limit in bytes.
    pub fn per_thread_hard_limit(&self) -> u64 {
        self.ram_per_thread_hard_limit_mb as u64 * 1024 * 1024
    }
}

/// Number of background flush threads to use when the caller asks for
/// automatic sizing.
pub fn default_flush_threads() -> usize {
    cmp::max(1, cmp::min(8, num_cpus::get() / 2))
}
