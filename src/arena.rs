//! Shared response-assembly arena.
//!
//! One bounded byte region shared by every in-flight request. Responses
//! that arrive fragmented across several socket reads are accumulated here
//! until complete. The arena is a compacting bump allocator, not a ring
//! buffer: `alloc` reserves at the high-water `pointer`, and `release`
//! shifts everything above the freed span down so live spans always form a
//! contiguous prefix `[0, pointer)`.
//!
//! Invariants
//! - live spans never overlap;
//! - `pointer` equals the sum of live reserved lengths;
//! - `alloc` fails with [`DubboError::BufferExhausted`], it never panics.

use std::collections::HashMap;

use crate::error::{DubboError, Result};

/// A reserved region of the arena, tracked per sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Start offset within the arena.
    pub offset: usize,
    /// Reserved length (the full expected body length).
    pub reserved: usize,
    /// Bytes written so far.
    pub filled: usize,
}

/// Bounded, compacting assembly buffer for response bodies.
pub struct ResponseArena {
    buffer: Vec<u8>,
    pointer: usize,
    spans: HashMap<u64, Span>,
}

impl ResponseArena {
    /// Create an arena with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity],
            pointer: 0,
            spans: HashMap::new(),
        }
    }

    /// Reserve `size` bytes for the request with the given sequence number.
    ///
    /// Fails without side effects when the remaining capacity is too small.
    pub fn alloc(&mut self, sequence: u64, size: usize) -> Result<()> {
        if self.pointer + size > self.buffer.len() {
            return Err(DubboError::BufferExhausted {
                needed: size,
                available: self.buffer.len() - self.pointer,
            });
        }
        debug_assert!(!self.spans.contains_key(&sequence), "span already allocated");
        self.spans.insert(
            sequence,
            Span {
                offset: self.pointer,
                reserved: size,
                filled: 0,
            },
        );
        self.pointer += size;
        tracing::trace!(
            sequence,
            size,
            pointer = self.pointer,
            capacity = self.buffer.len(),
            "arena alloc"
        );
        Ok(())
    }

    /// Append bytes into the request's reserved span.
    ///
    /// Writing past the reservation is a protocol error: the peer delivered
    /// more body bytes than the header declared.
    pub fn write(&mut self, sequence: u64, data: &[u8]) -> Result<()> {
        let span = self
            .spans
            .get_mut(&sequence)
            .ok_or_else(|| DubboError::Protocol(format!("no span for sequence {sequence}")))?;
        if span.filled + data.len() > span.reserved {
            return Err(DubboError::Protocol(format!(
                "span overflow for sequence {}: {} + {} > {}",
                sequence,
                span.filled,
                data.len(),
                span.reserved
            )));
        }
        let start = span.offset + span.filled;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        span.filled += data.len();
        Ok(())
    }

    /// Read the filled prefix of the request's span.
    pub fn read(&self, sequence: u64) -> Option<&[u8]> {
        self.spans
            .get(&sequence)
            .map(|span| &self.buffer[span.offset..span.offset + span.filled])
    }

    /// Check whether the span has received its full reserved length.
    pub fn is_complete(&self, sequence: u64) -> bool {
        self.spans
            .get(&sequence)
            .is_some_and(|span| span.filled == span.reserved)
    }

    /// Remaining bytes the span still expects.
    pub fn remaining(&self, sequence: u64) -> Option<usize> {
        self.spans.get(&sequence).map(|span| span.reserved - span.filled)
    }

    /// Release the request's span, compacting the arena.
    ///
    /// All bytes above the freed span shift down by its reserved length and
    /// later spans are rebased, keeping the arena defragmented. Releasing
    /// an unknown sequence is a no-op, so release is idempotent.
    pub fn release(&mut self, sequence: u64) {
        let Some(span) = self.spans.remove(&sequence) else {
            return;
        };
        let end = span.offset + span.reserved;
        self.buffer.copy_within(end..self.pointer, span.offset);
        self.pointer -= span.reserved;
        for other in self.spans.values_mut() {
            if other.offset > span.offset {
                other.offset -= span.reserved;
            }
        }
    }

    /// Current high-water pointer (total live reserved bytes).
    pub fn len(&self) -> usize {
        self.pointer
    }

    /// Check whether no span is live.
    pub fn is_empty(&self) -> bool {
        self.pointer == 0
    }

    /// Arena capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Number of live spans.
    pub fn live_spans(&self) -> usize {
        self.spans.len()
    }

    #[cfg(test)]
    fn span(&self, sequence: u64) -> Option<Span> {
        self.spans.get(&sequence).copied()
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let mut spans: Vec<Span> = self.spans.values().copied().collect();
        spans.sort_by_key(|s| s.offset);
        let mut expected_offset = 0;
        for span in &spans {
            assert_eq!(span.offset, expected_offset, "spans must be contiguous");
            expected_offset += span.reserved;
        }
        assert_eq!(self.pointer, expected_offset, "pointer must equal sum of spans");
    }
}
