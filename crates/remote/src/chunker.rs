//! Splits a blob into offset-tagged chunks for ByteStream writes
//!
//! A [`Chunker`] is a lazy iterator: chunks are cheap `Bytes` slices of the
//! blob, produced in increasing offset order with no gaps or overlaps. It can
//! be positioned at any offset to resume a write the server has partially
//! committed.

use bytes::Bytes;

/// One piece of a blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset of `data` within the blob
    pub offset: u64,
    /// Chunk payload
    pub data: Bytes,
    /// Set on the chunk that completes the blob
    pub last: bool,
}

/// Lazy, finite chunk sequence over a blob
#[derive(Debug, Clone)]
pub struct Chunker {
    blob: Bytes,
    chunk_size: usize,
    offset: usize,
    done: bool,
}

impl Chunker {
    /// Create a chunker starting at offset 0
    ///
    /// A `chunk_size` of 0 is treated as 1.
    pub fn new(blob: Bytes, chunk_size: usize) -> Self {
        Self {
            blob,
            chunk_size: chunk_size.max(1),
            offset: 0,
            done: false,
        }
    }

    /// Create a chunker that starts at `offset` (clamped to the blob size)
    pub fn starting_at(blob: Bytes, chunk_size: usize, offset: u64) -> Self {
        let mut chunker = Self::new(blob, chunk_size);
        chunker.offset = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(chunker.blob.len());
        chunker
    }

    /// Total blob size
    pub fn size(&self) -> u64 {
        self.blob.len() as u64
    }

    /// Offset of the next chunk
    pub fn offset(&self) -> u64 {
        self.offset as u64
    }

    /// Whether another chunk will be produced
    pub fn has_next(&self) -> bool {
        !self.done
    }
}

impl Iterator for Chunker {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.done {
            return None;
        }
        let start = self.offset;
        let end = start.saturating_add(self.chunk_size).min(self.blob.len());
        let last = end == self.blob.len();
        self.offset = end;
        self.done = last;

        // An empty blob still yields one (empty, final) chunk so the write completes
        Some(Chunk {
            offset: start as u64,
            data: self.blob.slice(start..end),
            last,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            return (0, Some(0));
        }
        let remaining = self.blob.len() - self.offset;
        let n = remaining.div_ceil(self.chunk_size).max(1);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Chunker {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exact_multiple() {
        let chunks: Vec<_> = Chunker::new(Bytes::from_static(b"abcdef"), 3).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[0].data, Bytes::from_static(b"abc"));
        assert!(!chunks[0].last);
        assert_eq!(chunks[1].offset, 3);
        assert!(chunks[1].last);
    }

    #[test]
    fn test_short_tail() {
        let chunks: Vec<_> = Chunker::new(Bytes::from_static(b"1234567"), 3).collect();
        let offsets: Vec<_> = chunks.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 3, 6]);
        assert_eq!(chunks[2].data, Bytes::from_static(b"7"));
    }

    #[test]
    fn test_resume_at_offset() {
        let mut chunker = Chunker::starting_at(Bytes::from_static(b"1234567"), 16, 3);
        let chunk = chunker.next().unwrap();
        assert_eq!(chunk.offset, 3);
        assert_eq!(chunk.data, Bytes::from_static(b"4567"));
        assert!(chunk.last);
        assert!(chunker.next().is_none());
    }

    #[test]
    fn test_empty_blob_single_final_chunk() {
        let chunks: Vec<_> = Chunker::new(Bytes::new(), 8).collect();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].data.is_empty());
        assert!(chunks[0].last);
    }

    #[test]
    fn test_not_restartable() {
        let mut chunker = Chunker::new(Bytes::from_static(b"ab"), 1);
        assert_eq!(chunker.len(), 2);
        assert!(chunker.next().is_some());
        assert!(chunker.next().is_some());
        assert!(!chunker.has_next());
        assert!(chunker.next().is_none());
    }

    proptest! {
        #[test]
        fn prop_chunks_cover_blob(
            data in proptest::collection::vec(any::<u8>(), 1..2048),
            chunk_size in 1usize..300,
        ) {
            let chunks: Vec<_> = Chunker::new(Bytes::from(data.clone()), chunk_size).collect();
            prop_assert_eq!(chunks.len(), data.len().div_ceil(chunk_size));

            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.offset, (i * chunk_size) as u64);
                prop_assert_eq!(chunk.last, i == chunks.len() - 1);
            }

            let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
            prop_assert_eq!(joined, data);
        }

        #[test]
        fn prop_resume_matches_tail(
            data in proptest::collection::vec(any::<u8>(), 1..1024),
            chunk_size in 1usize..128,
            k in 0usize..1024,
        ) {
            let k = k % data.len();
            let resumed: Vec<u8> = Chunker::starting_at(Bytes::from(data.clone()), chunk_size, k as u64)
                .flat_map(|c| c.data.to_vec())
                .collect();
            prop_assert_eq!(&resumed[..], &data[k..]);
        }
    }
}
