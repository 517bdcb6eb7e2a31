//! Bounded, masked, checksummed log sink
//!
//! The per-job log buffer backing a trace. Writes pass through the masking
//! chain (phrase maskers, sensitive URL masker, UTF-8 normalizer), then
//! through the limit writer into an unlinked temp file and a running CRC32.
//!
//! Reads may happen at any time from the trace uploader; they flush buffered
//! bytes to the backing file first. A failed flush is sticky: the next write
//! retries it and surfaces the error to the caller.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use parking_lot::RwLock;

use crate::trace::mask::{FilterChain, PhraseFilter, StreamFilter, Utf8Filter};
use crate::trace::url::SensitiveUrlFilter;
use crate::trace::{ANSI_BOLD_RED, ANSI_RESET};

/// Default log limit when the runner config does not set one.
pub const DEFAULT_BYTES_LIMIT: usize = 4 * 1024 * 1024;

/// Buffered bytes kept in memory before being flushed to the backing file.
const FLUSH_THRESHOLD: usize = 8 * 1024;

/// Append-only log sink with masking, a byte limit, and a CRC32 checksum
pub struct Buffer {
    inner: RwLock<Inner>,
}

struct Inner {
    chain: FilterChain,
    url_param_masking: bool,
    limit: LimitWriter,
    sink: FileSink,
}

impl Buffer {
    /// Create a buffer with URL parameter masking enabled.
    pub fn new() -> io::Result<Self> {
        Self::with_url_param_masking(true)
    }

    pub fn with_url_param_masking(enabled: bool) -> io::Result<Self> {
        let file = tempfile::tempfile()?;

        let mut inner = Inner {
            chain: FilterChain::new(Vec::new()),
            url_param_masking: enabled,
            limit: LimitWriter {
                written: 0,
                limit: DEFAULT_BYTES_LIMIT as u64,
            },
            sink: FileSink {
                file,
                pending: Vec::new(),
                flushed: 0,
                checksum: crc32fast::Hasher::new(),
                failed_flush: false,
            },
        };
        inner.rebuild_chain(&[]);

        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Register the set of masked values, replacing any previous set.
    ///
    /// The existing chain is flushed first, so masking applies to writes made
    /// after registration; earlier output is not retroactively masked.
    /// Registering the same set twice is a no-op beyond the first call.
    pub fn set_masked(&self, values: &[String]) {
        let mut inner = self.inner.write();
        inner.flush_chain();
        inner.rebuild_chain(values);
    }

    /// Set the byte limit. Applies to bytes written from now on.
    pub fn set_limit(&self, size: usize) {
        self.inner.write().limit.limit = size as u64;
    }

    /// Bytes accepted into the log, overflow notice included.
    pub fn size(&self) -> usize {
        self.inner.read().limit.written as usize
    }

    /// `crc32:<8-hex>` over everything written to the backing file.
    pub fn checksum(&self) -> String {
        let inner = self.inner.read();
        format!("crc32:{:08x}", inner.sink.checksum.clone().finalize())
    }

    /// Read up to `n` bytes starting at `offset`. Short reads past the end.
    pub fn bytes(&self, offset: usize, n: usize) -> io::Result<Vec<u8>> {
        let mut inner = self.inner.write();
        if let Err(e) = inner.sink.flush() {
            inner.sink.failed_flush = true;
            return Err(e);
        }
        inner.sink.read_at(offset as u64, n)
    }

    /// Append bytes. The log limit is not an error: once exceeded, writes are
    /// accepted and discarded.
    pub fn write(&self, p: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.write();
        let Inner {
            chain, limit, sink, ..
        } = &mut *inner;

        let mut staging = Vec::with_capacity(p.len());
        chain.write(p, &mut staging);
        limit.write(&staging, sink);

        if sink.failed_flush || sink.pending.len() >= FLUSH_THRESHOLD {
            sink.failed_flush = false;
            if let Err(e) = sink.flush() {
                sink.failed_flush = true;
                return Err(e);
            }
        }

        Ok(p.len())
    }

    /// End of stream: flush withheld partial matches through the chain.
    pub fn finish(&self) {
        self.inner.write().flush_chain();
    }
}

impl Inner {
    fn flush_chain(&mut self) {
        let Inner {
            chain, limit, sink, ..
        } = self;
        let mut staging = Vec::new();
        chain.finish(&mut staging);
        if !staging.is_empty() {
            limit.write(&staging, sink);
        }
    }

    fn rebuild_chain(&mut self, values: &[String]) {
        // longest first, so a shorter secret that is a substring of a longer
        // one cannot leak its tail; duplicates dropped
        let mut values: Vec<&String> = values.iter().filter(|v| !v.is_empty()).collect();
        values.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        values.dedup();

        let mut filters: Vec<Box<dyn StreamFilter>> = Vec::with_capacity(values.len() + 2);
        for value in values {
            filters.push(Box::new(PhraseFilter::new(value.as_bytes())));
        }
        if self.url_param_masking {
            filters.push(Box::new(SensitiveUrlFilter::new()));
        }
        filters.push(Box::new(Utf8Filter::new()));

        self.chain = FilterChain::new(filters);
    }
}

/// Enforces the byte limit and emits the overflow notice once per crossing
struct LimitWriter {
    written: u64,
    limit: u64,
}

impl LimitWriter {
    fn write(&mut self, p: &[u8], sink: &mut FileSink) {
        let capacity = self.limit.saturating_sub(self.written) as usize;
        if capacity == 0 {
            return;
        }

        if p.len() >= capacity {
            let truncated = truncate_safe_utf8(p, capacity);
            sink.write(truncated);
            self.written += truncated.len() as u64;
            self.write_limit_exceeded_notice(sink);
            return;
        }

        sink.write(p);
        self.written += p.len() as u64;
    }

    fn write_limit_exceeded_notice(&mut self, sink: &mut FileSink) {
        let notice = format!(
            "\n{}Job's log exceeded limit of {} bytes.{}\n",
            ANSI_BOLD_RED, self.limit, ANSI_RESET,
        );
        sink.write(notice.as_bytes());
        self.written += notice.len() as u64;
    }
}

/// Backing file plus write buffer and running checksum
struct FileSink {
    file: File,
    pending: Vec<u8>,
    flushed: u64,
    checksum: crc32fast::Hasher,
    failed_flush: bool,
}

impl FileSink {
    /// The checksum covers bytes at accept time, buffered or not.
    fn write(&mut self, p: &[u8]) {
        self.checksum.update(p);
        self.pending.extend_from_slice(p);
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.flushed))?;
        self.file.write_all(&self.pending)?;
        self.flushed += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }

    /// Read from the flushed portion of the file. Call after `flush`.
    fn read_at(&mut self, offset: u64, n: usize) -> io::Result<Vec<u8>> {
        if offset >= self.flushed {
            return Ok(Vec::new());
        }
        let len = ((self.flushed - offset) as usize).min(n);
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Truncate at `capacity` without splitting a multi-byte UTF-8 character.
fn truncate_safe_utf8(p: &[u8], capacity: usize) -> &[u8] {
    let mut capacity = capacity.min(p.len());
    for _ in 0..4 {
        if capacity == 0 || capacity == p.len() || (p[capacity] & 0b1100_0000) != 0b1000_0000 {
            break;
        }
        capacity -= 1;
    }
    &p[..capacity]
}
