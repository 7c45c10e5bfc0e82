//! Key spans and the fragmenter.
//!
//! A span covers `[start, end)` with one or more keys (trailer, optional
//! suffix, optional value). The fragmenter accepts possibly-overlapping
//! spans in start-key order and emits fragmented spans: overlapping output
//! spans always have identical bounds, which is the invariant the range-key
//! and range-del blocks require.

use std::sync::Arc;

use crate::error::Result;
use crate::errkeyorder;
use crate::key::Comparer;

/// One key within a span.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpanKey {
    pub trailer: u64,
    pub suffix: Vec<u8>,
    pub value: Vec<u8>,
}

/// A set of keys over the user-key range `[start, end)`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Span {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    pub keys: Vec<SpanKey>,
}

/// Receives fragmented spans as the fragmenter produces them.
pub type SpanEmitter<'a> = &'a mut dyn FnMut(Span) -> Result<()>;

/// Fragments overlapping spans.
///
/// All pending spans share one start key. When a span with a later start
/// arrives, the pending spans are split at that start: the portions before
/// it are emitted (grouped by distinct end key, shorter fragments carrying
/// the keys of every longer span that covers them), and the remainders stay
/// pending with the new start.
pub struct Fragmenter {
    cmp: Arc<dyn Comparer>,
    pending: Vec<Span>,
    /// End key of the last emitted fragment group; nothing at or before it
    /// may be added again.
    flushed_key: Option<Vec<u8>>,
    finished: bool,
}

impl Fragmenter {
    pub fn new(cmp: Arc<dyn Comparer>) -> Self {
        Self {
            cmp,
            pending: Vec::new(),
            flushed_key: None,
            finished: false,
        }
    }

    /// Start key of the pending spans, if any. Callers use this to enforce
    /// start-key ordering before handing a span over.
    pub fn start(&self) -> Option<&[u8]> {
        self.pending.first().map(|s| s.start.as_slice())
    }

    /// Adds a span. Spans must arrive ordered by start key.
    pub fn add(&mut self, span: Span, emit: SpanEmitter) -> Result<()> {
        if self.finished {
            return Err(errkeyorder!("span added to a finished fragmenter"));
        }
        if let Some(flushed) = &self.flushed_key {
            if self.cmp.compare(&span.start, flushed) == std::cmp::Ordering::Less {
                return Err(errkeyorder!(
                    "span start behind already-emitted fragments"
                ));
            }
        }
        if let Some(first) = self.pending.first() {
            match self.cmp.compare(&first.start, &span.start) {
                std::cmp::Ordering::Greater => {
                    return Err(errkeyorder!("spans must be added in order of start key"));
                }
                std::cmp::Ordering::Equal => {
                    self.pending.push(span);
                    return Ok(());
                }
                std::cmp::Ordering::Less => {
                    let split = span.start.clone();
                    self.truncate_and_flush(&split, emit)?;
                }
            }
        }
        self.pending.push(span);
        Ok(())
    }

    /// Emits everything still pending. The fragmenter is unusable after.
    pub fn finish(&mut self, emit: SpanEmitter) -> Result<()> {
        self.finished = true;
        let pending = std::mem::take(&mut self.pending);
        self.flush(pending, emit)
    }

    fn truncate_and_flush(&mut self, split: &[u8], emit: SpanEmitter) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let mut done = Vec::new();
        for span in pending {
            if self.cmp.compare(split, &span.end) == std::cmp::Ordering::Less {
                // The span extends past the split point; keep the remainder
                // pending under the new start.
                self.pending.push(Span {
                    start: split.to_vec(),
                    end: span.end.clone(),
                    keys: span.keys.clone(),
                });
                done.push(Span {
                    start: span.start,
                    end: split.to_vec(),
                    keys: span.keys,
                });
            } else {
                done.push(span);
            }
        }
        self.flushed_key = Some(split.to_vec());
        self.flush(done, emit)
    }

    /// Emits a group of spans sharing a start key as aligned fragments: one
    /// fragment per distinct end key, each carrying the keys of every span
    /// that covers it, sorted by sequence number then kind, descending.
    fn flush(&self, mut spans: Vec<Span>, emit: SpanEmitter) -> Result<()> {
        if spans.is_empty() {
            return Ok(());
        }
        let cmp = &self.cmp;
        spans.sort_by(|a, b| cmp.compare(&a.end, &b.end));

        let mut x = 0;
        let mut start = spans[0].start.clone();
        while x < spans.len() {
            let end = spans[x].end.clone();
            let mut keys: Vec<SpanKey> = Vec::new();
            for span in &spans[x..] {
                keys.extend(span.keys.iter().cloned());
            }
            keys.sort_by(|a, b| b.trailer.cmp(&a.trailer));
            if cmp.compare(&start, &end) == std::cmp::Ordering::Less {
                emit(Span {
                    start: start.clone(),
                    end: end.clone(),
                    keys,
                })?;
            }
            while x < spans.len() && cmp.compare(&spans[x].end, &end) == std::cmp::Ordering::Equal {
                x += 1;
            }
            start = end;
        }
        Ok(())
    }
}
