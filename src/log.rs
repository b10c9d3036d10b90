//! The replicated log (§4.1): a growable ring buffer over owned entry slots.
//!
//! Indices are 1-based and contiguous: the log holds entries with index in
//! `(base, base + count]`. `base`/`base_term` describe the last entry folded
//! into the latest snapshot prefix. The log never reorders or mutates
//! entries in place once appended — only `append`, `truncate_from` (tail),
//! and `poll_to` (head, for compaction) change its contents.
//!
//! Host callbacks (`log_offer`/`log_pop`/`log_poll`) must see *contiguous*
//! entry slices. Because the underlying storage is a `VecDeque` (itself a
//! ring buffer that doubles capacity on growth, matching §4.1's
//! representation requirement), an append/truncate/poll can straddle the
//! wrap point internally even though the affected indices are logically
//! contiguous. The `*_with_*` methods below split such a span into at most
//! two physically-contiguous batches and invoke the supplied callback once
//! per batch, in the order §5 requires (`log_offer`/`log_poll` low-to-high
//! index, `log_pop` high-to-low).

use std::collections::VecDeque;

use crate::entry::{Entry, EntryType, LogIndex, Term};
use crate::error::{Error, Result};

/// The replicated log.
#[derive(Debug, Default)]
pub struct Log {
    entries: VecDeque<Entry>,
    /// Index of the last entry covered by the latest snapshot prefix. Zero
    /// if no snapshot has ever been installed.
    base: LogIndex,
    /// Term of the entry at `base` (or 0 if `base == 0`).
    base_term: Term,
}

impl Log {
    pub fn new() -> Self {
        Log { entries: VecDeque::new(), base: 0, base_term: 0 }
    }

    pub fn base(&self) -> LogIndex {
        self.base
    }

    pub fn base_term(&self) -> Term {
        self.base_term
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn current_idx(&self) -> LogIndex {
        self.base + self.entries.len() as LogIndex
    }

    /// The term at `current_idx()`, or `base_term()` if the log is empty.
    pub fn current_term(&self) -> Term {
        self.entries.back().map(|e| e.term).unwrap_or(self.base_term)
    }

    pub fn is_in_window(&self, idx: LogIndex) -> bool {
        idx > self.base && idx <= self.current_idx()
    }

    fn offset(&self, idx: LogIndex) -> Option<usize> {
        if !self.is_in_window(idx) {
            return None;
        }
        Some((idx - self.base - 1) as usize)
    }

    pub fn get_at(&self, idx: LogIndex) -> Option<&Entry> {
        self.offset(idx).and_then(|o| self.entries.get(o))
    }

    pub fn term_at(&self, idx: LogIndex) -> Option<Term> {
        if idx == self.base {
            return Some(self.base_term);
        }
        self.get_at(idx).map(|e| e.term)
    }

    /// Returns a contiguous slice starting at `idx` and how many entries it
    /// covers. Callers that need more than the returned count must call
    /// again with `idx + returned_count`. Out-of-window reads return an
    /// empty slice.
    pub fn get_from(&self, idx: LogIndex) -> (&[Entry], usize) {
        let Some(start) = self.offset(idx) else { return (&[], 0) };
        let (front, back) = self.entries.as_slices();
        if start < front.len() {
            let slice = &front[start..];
            (slice, slice.len())
        } else {
            let slice = &back[start - front.len()..];
            (slice, slice.len())
        }
    }

    pub fn peek_tail(&self) -> Option<&Entry> {
        self.entries.back()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.base = 0;
        self.base_term = 0;
    }

    /// Resets the log to hold nothing but a snapshot marker at `(idx, term)`
    /// (§4.3's `begin_load_snapshot`/`end_load_snapshot`, §8's round-trip
    /// law: afterwards `current_idx() == idx`, `base() == idx - 1`... unless
    /// `idx == 0`, in which case the log is simply empty).
    pub fn load_from_snapshot(&mut self, idx: LogIndex, term: Term) {
        self.entries.clear();
        if idx == 0 {
            self.base = 0;
            self.base_term = 0;
            return;
        }
        self.entries.push_back(Entry { term, id: 0, entry_type: EntryType::NoopSnapshot, node_id: None, data: Vec::new() });
        self.base = idx - 1;
        self.base_term = term;
    }

    /// Splits the logical range `[start, start + n)` (relative to the
    /// current, post-mutation state of `entries`) into at most two physically
    /// contiguous batches, in increasing-index order.
    fn batches(entries: &VecDeque<Entry>, start: usize, n: usize) -> Vec<(usize, usize)> {
        if n == 0 {
            return Vec::new();
        }
        let (front, back) = entries.as_slices();
        let end = start + n;
        let mut out = Vec::with_capacity(2);
        if start < front.len() {
            let front_end = end.min(front.len());
            out.push((start, front_end - start));
            if end > front.len() {
                out.push((front.len(), end - front.len()));
            }
        } else {
            out.push((start, n));
        }
        out
    }

    /// Appends `new_entries` to the tail, reserving the next contiguous
    /// indices. Calls `offer(batch, first_index_of_batch)` once per
    /// physically-contiguous batch (low-to-high index order); `offer` may
    /// return fewer than `batch.len()` to partial-accept, in which case the
    /// remainder of this batch and any later batch are rolled back and not
    /// offered. Returns the number of entries actually retained.
    pub fn append_with_offer<F>(&mut self, new_entries: Vec<Entry>, mut offer: F) -> Result<usize>
    where
        F: FnMut(&[Entry], LogIndex) -> Result<usize>,
    {
        if new_entries.is_empty() {
            return Ok(0);
        }
        let start = self.entries.len();
        let n = new_entries.len();
        self.entries.extend(new_entries);

        let mut accepted_total = 0usize;
        let mut short_circuited = false;
        for (batch_start, batch_len) in Self::batches(&self.entries, start, n) {
            if short_circuited {
                break;
            }
            let (front, back) = self.entries.as_slices();
            let batch: &[Entry] = if batch_start < front.len() {
                &front[batch_start..batch_start + batch_len]
            } else {
                &back[batch_start - front.len()..batch_start - front.len() + batch_len]
            };
            let first_index = self.base + batch_start as LogIndex + 1;
            let accepted = offer(batch, first_index)?;
            accepted_total += accepted;
            if accepted < batch_len {
                short_circuited = true;
            }
        }

        let keep = start + accepted_total;
        self.entries.truncate(keep);
        Ok(accepted_total)
    }

    /// Removes entries with index `>= idx` from the tail, calling
    /// `pop(batch, first_index_of_batch)` once per physically-contiguous
    /// batch in *decreasing*-index order (highest index first), matching §5's
    /// "`log_pop` always called in reverse order of `log_offer`". Refuses if
    /// `idx <= base()` or `idx > current_idx() + 1`.
    pub fn truncate_from_with_pop<F>(&mut self, idx: LogIndex, mut pop: F) -> Result<()>
    where
        F: FnMut(&[Entry], LogIndex) -> Result<()>,
    {
        if idx <= self.base || idx > self.current_idx() {
            return Err(Error::InvalidCfgChange("truncate index out of window"));
        }
        let new_len = (idx - self.base - 1) as usize;
        let removed = self.entries.len() - new_len;
        if removed == 0 {
            return Ok(());
        }

        for (batch_start, batch_len) in Self::batches(&self.entries, new_len, removed).into_iter().rev() {
            let (front, back) = self.entries.as_slices();
            let batch: &[Entry] = if batch_start < front.len() {
                &front[batch_start..batch_start + batch_len]
            } else {
                &back[batch_start - front.len()..batch_start - front.len() + batch_len]
            };
            let first_index = self.base + batch_start as LogIndex + 1;
            pop(batch, first_index)?;
        }

        self.entries.truncate(new_len);
        Ok(())
    }

    /// Removes the prefix up to and including `idx` from the head, calling
    /// `poll(batch, first_index_of_batch)` once per physically-contiguous
    /// batch in increasing-index order. Advances `base`/`base_term` by the
    /// number removed. Refuses if `idx` is not within the current window.
    pub fn poll_to_with_poll<F>(&mut self, idx: LogIndex, mut poll: F) -> Result<()>
    where
        F: FnMut(&[Entry], LogIndex) -> Result<()>,
    {
        if !self.is_in_window(idx) {
            return Err(Error::InvalidCfgChange("poll index out of window"));
        }
        let count = (idx - self.base) as usize;
        let new_term = self.entries[count - 1].term;

        for (batch_start, batch_len) in Self::batches(&self.entries, 0, count) {
            let (front, back) = self.entries.as_slices();
            let batch: &[Entry] = if batch_start < front.len() {
                &front[batch_start..batch_start + batch_len]
            } else {
                &back[batch_start - front.len()..batch_start - front.len() + batch_len]
            };
            let first_index = self.base + batch_start as LogIndex + 1;
            poll(batch, first_index)?;
        }

        self.entries.drain(..count);
        self.base = idx;
        self.base_term = new_term;
        Ok(())
    }
}
