//! Multipart payload (C7, spec §3, §4.3 step 3+5): an ordered, gap-tracked
//! collection of byte ranges that re-enters the pipeline as one logical
//! packet once complete.

use bytes::Bytes;

/// One inserted byte range. `bytes` is a zero-copy slice of the source
/// packet's buffer — the source stays alive exactly as long as the last
/// chunk referencing it (spec §3: packets "may be shared ... only while
/// participating in a reassembly buffer").
#[derive(Clone)]
pub struct Chunk {
    pub offset: usize,
    pub bytes: Bytes,
}

impl Chunk {
    fn end(&self) -> usize {
        self.offset + self.bytes.len()
    }
}

/// Ordered reconstruction buffer. Chunks are always kept sorted by offset
/// and non-overlapping; [`Multipart::insert`] enforces both invariants
/// from spec §3: duplicate ranges are discarded, partial overlaps are
/// truncated to their non-overlapping suffix.
pub struct Multipart {
    pub next_proto: &'static str,
    chunks: Vec<Chunk>,
    got_last: bool,
    final_len: Option<usize>,
}

impl Multipart {
    pub fn new(next_proto: &'static str) -> Self {
        Multipart {
            next_proto,
            chunks: Vec::new(),
            got_last: false,
            final_len: None,
        }
    }

    /// Insert `bytes` (already the exact slice to store) at `offset`.
    /// Returns the number of bytes actually kept after overlap trimming
    /// (0 if the whole range was a duplicate).
    pub fn insert(&mut self, offset: usize, bytes: Bytes) -> usize {
        if bytes.is_empty() {
            return 0;
        }

        let mut start = offset;
        let mut end = offset + bytes.len();
        let mut i = 0;
        while i < self.chunks.len() {
            let c = &self.chunks[i];
            if c.end() <= start {
                i += 1;
                continue;
            }
            if c.offset >= end {
                break;
            }
            // Overlap with an existing chunk.
            if c.offset <= start && c.end() >= end {
                // Fully covered by an existing chunk: duplicate, discard.
                return 0;
            }
            if c.offset <= start {
                // Existing chunk covers the head of the new range.
                start = c.end();
            } else {
                // Existing chunk starts inside the new range: keep only
                // the head of the new range, up to where it starts.
                end = c.offset;
                break;
            }
            i += 1;
        }

        if start >= end {
            return 0;
        }

        let trimmed = bytes.slice((start - offset)..(end - offset));
        let kept = trimmed.len();
        let pos = self.chunks.partition_point(|c| c.offset < start);
        self.chunks.insert(pos, Chunk { offset: start, bytes: trimmed });
        kept
    }

    /// Mark that the fragment/segment carrying the final byte of this
    /// logical payload has been seen, with `total_len` its end offset.
    pub fn mark_got_last(&mut self, total_len: usize) {
        self.got_last = true;
        self.final_len = Some(total_len);
    }

    pub fn got_last(&self) -> bool {
        self.got_last
    }

    /// Number of gaps in coverage, counting a trailing gap once the final
    /// length is known (spec §3 invariant: `gaps == 0 ∧ got_last ⇒
    /// deliverable exactly once`).
    pub fn gaps(&self) -> usize {
        let mut gaps = 0;
        let mut expected = 0usize;
        for c in &self.chunks {
            if c.offset > expected {
                gaps += 1;
            }
            expected = c.end();
        }
        if let Some(total) = self.final_len {
            if expected < total {
                gaps += 1;
            }
        }
        gaps
    }

    pub fn is_deliverable(&self) -> bool {
        self.got_last && self.gaps() == 0
    }

    /// Concatenates all chunks into one contiguous buffer. Only meaningful
    /// once [`Multipart::is_deliverable`] is true; callers are expected to
    /// check that and to call this at most once per multipart (spec §8
    /// invariant 4).
    pub fn assemble(&self) -> Bytes {
        let total: usize = self.chunks.iter().map(|c| c.bytes.len()).sum();
        let mut out = Vec::with_capacity(total);
        for c in &self.chunks {
            out.extend_from_slice(&c.bytes);
        }
        Bytes::from(out)
    }
}
