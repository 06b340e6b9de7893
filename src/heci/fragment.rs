//! Fragmentation and reassembly of logical client messages.
//!
//! A logical message is a chain of byte segments. On the way out it is
//! packed into successive packets of at most `MAX_PAYLOAD_SIZE` bytes,
//! segment boundaries ignored, `last_frag` set on the final packet:
//!
//! ```text
//! segments:  [ 100 B ][ 60 B ][ 90 B ]
//! packets:   [ 124 B      ][ 124 B     ][2]
//!            last=0        last=0       last=1
//! ```
//!
//! On the way in, each client owns a single receive buffer that one
//! connection at a time may fill.

extern crate alloc;
use alloc::vec::Vec;

use super::wire::{BusPayload, MAX_PAYLOAD_SIZE};

/// Total byte length of a segment chain.
pub fn total_len(segments: &[&[u8]]) -> usize {
    segments.iter().map(|s| s.len()).sum()
}

/// One outbound packet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub payload: BusPayload,
    pub last: bool,
}

/// Iterator packing a segment chain into packet-sized fragments.
///
/// An empty chain yields nothing; callers reject it before fragmenting.
pub struct Fragments<'a> {
    segments: &'a [&'a [u8]],
    seg: usize,
    offset: usize,
    remaining: usize,
}

impl<'a> Fragments<'a> {
    pub fn new(segments: &'a [&'a [u8]]) -> Self {
        Self {
            segments,
            seg: 0,
            offset: 0,
            remaining: total_len(segments),
        }
    }
}

impl Iterator for Fragments<'_> {
    type Item = Fragment;

    fn next(&mut self) -> Option<Fragment> {
        if self.remaining == 0 {
            return None;
        }
        let mut payload = BusPayload::new();
        while payload.len() < MAX_PAYLOAD_SIZE && self.seg < self.segments.len() {
            let segment = self.segments[self.seg];
            let room = MAX_PAYLOAD_SIZE - payload.len();
            let take = room.min(segment.len() - self.offset);
            // `take` never exceeds the free capacity.
            let _ = payload.extend_from_slice(&segment[self.offset..self.offset + take]);
            self.offset += take;
            if self.offset == segment.len() {
                self.seg += 1;
                self.offset = 0;
            }
        }
        self.remaining -= payload.len();
        Some(Fragment {
            payload,
            last: self.remaining == 0,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining.div_ceil(MAX_PAYLOAD_SIZE);
        (n, Some(n))
    }
}

/// The receive buffer would exceed its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow;

/// A client's single receive buffer.
///
/// `locked` is set from the first fragment of a message until the client
/// returns the buffer with a flow-control grant or the connection is
/// torn down.
pub struct RxBuffer {
    data: Vec<u8>,
    limit: usize,
    locked: bool,
}

impl RxBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::with_capacity(limit),
            limit,
            locked: false,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Claim the buffer for a new message. Returns `false` if it is in use.
    pub fn lock(&mut self) -> bool {
        if self.locked {
            return false;
        }
        self.locked = true;
        self.data.clear();
        true
    }

    pub fn unlock(&mut self) {
        self.locked = false;
        self.data.clear();
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
        if self.data.len() + bytes.len() > self.limit {
            return Err(Overflow);
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Hand over the assembled bytes. The buffer stays locked.
    pub fn take(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

// ── Tests ────────────────────────────────────────────────────
