//! Chunk planning and reassembly for slice pulls.
//!
//! A pull of `total` bytes is split into `ceil(total / cap)` requests at
//! offsets `i * cap`. Replies may arrive in any order; the reassembly buffer
//! keys them by offset and completes once every byte has arrived.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use scopelink_core::wire::ChunkRequest;

/// Requests covering `[0, total)` of slice `slice_id` in `cap`-sized pieces.
/// An empty slice needs no requests.
pub fn plan_requests(slice_id: i32, total: usize, cap: usize) -> Vec<ChunkRequest> {
    if total == 0 || cap == 0 {
        return Vec::new();
    }
    (0..total.div_ceil(cap))
        .map(|i| {
            let offset = i * cap;
            let size = cap.min(total - offset);
            ChunkRequest::new(slice_id, offset as i32, size as i32)
        })
        .collect()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("chunk {offset}+{len} outside slice of {expected} bytes")]
    OutOfRange {
        offset: usize,
        len: usize,
        expected: usize,
    },

    #[error("chunk {offset}+{len} overlaps a received chunk")]
    Overlap { offset: usize, len: usize },
}

/// Collects the chunks of one slice until its announced size is reached.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    slice_id: i32,
    expected_total: usize,
    chunks: BTreeMap<usize, Bytes>,
    received_bytes: usize,
}

impl ReassemblyBuffer {
    pub fn new(slice_id: i32, expected_total: usize) -> Self {
        Self {
            slice_id,
            expected_total,
            chunks: BTreeMap::new(),
            received_bytes: 0,
        }
    }

    pub fn slice_id(&self) -> i32 {
        self.slice_id
    }

    pub fn expected_total(&self) -> usize {
        self.expected_total
    }

    pub fn received_bytes(&self) -> usize {
        self.received_bytes
    }

    pub fn is_complete(&self) -> bool {
        self.received_bytes == self.expected_total
    }

    /// Add one chunk. A repeated offset is ignored.
    /// Returns whether the slice is now complete.
    pub fn insert(&mut self, offset: usize, data: Bytes) -> Result<bool, ReassemblyError> {
        let len = data.len();
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.expected_total)
            .ok_or(ReassemblyError::OutOfRange {
                offset,
                len,
                expected: self.expected_total,
            })?;

        if self.chunks.contains_key(&offset) {
            return Ok(self.is_complete());
        }

        let overlaps_prev = self
            .chunks
            .range(..offset)
            .next_back()
            .is_some_and(|(&o, d)| o + d.len() > offset);
        let overlaps_next = self
            .chunks
            .range(offset + 1..)
            .next()
            .is_some_and(|(&o, _)| o < end);
        if overlaps_prev || overlaps_next {
            return Err(ReassemblyError::Overlap { offset, len });
        }

        self.received_bytes += len;
        self.chunks.insert(offset, data);
        Ok(self.is_complete())
    }

    /// Concatenate the chunks in offset order.
    pub fn into_bytes(self) -> Bytes {
        if self.chunks.len() == 1 {
            if let Some((_, only)) = self.chunks.into_iter().next() {
                return only;
            }
            return Bytes::new();
        }
        let mut out = BytesMut::with_capacity(self.received_bytes);
        for chunk in self.chunks.values() {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }
}
