//! Fixed-size block splitting.

use std::io::{self, Read};

use rayon::prelude::*;

use crate::{digest, BlockDigest, CasError, Result};

/// One block of a source stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Byte offset of the block within its source.
    pub offset: u64,
    pub data: Vec<u8>,
}

/// A block together with its digest.
#[derive(Debug, Clone)]
pub struct DigestedBlock {
    pub offset: u64,
    pub digest: BlockDigest,
    pub data: Vec<u8>,
}

/// Deterministic fixed-size splitter.
///
/// Every block except the last is exactly `block_size` bytes. An empty
/// stream yields no blocks at all.
#[derive(Debug, Clone, Copy)]
pub struct BlockSplitter {
    block_size: usize,
}

impl BlockSplitter {
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(CasError::InvalidBlockSize(block_size));
        }
        Ok(Self { block_size })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Iterate over the blocks of `reader`.
    pub fn split<R: Read>(&self, reader: R) -> Blocks<R> {
        Blocks {
            reader,
            block_size: self.block_size,
            offset: 0,
            done: false,
        }
    }

    /// Read up to `batch` blocks and digest them in parallel, keeping order.
    ///
    /// Returns an empty vector once the stream is exhausted.
    pub fn next_digested_batch<R: Read>(
        &self,
        blocks: &mut Blocks<R>,
        batch: usize,
    ) -> Result<Vec<DigestedBlock>> {
        let mut raw = Vec::with_capacity(batch);
        for block in blocks.by_ref().take(batch.max(1)) {
            raw.push(block?);
        }
        Ok(raw
            .into_par_iter()
            .map(|b| DigestedBlock {
                offset: b.offset,
                digest: digest(&b.data),
                data: b.data,
            })
            .collect())
    }
}

/// Iterator returned by [`BlockSplitter::split`].
pub struct Blocks<R> {
    reader: R,
    block_size: usize,
    offset: u64,
    done: bool,
}

impl<R: Read> Blocks<R> {
    fn fill(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size];
        let mut filled = 0;
        while filled < self.block_size {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

impl<R: Read> Iterator for Blocks<R> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fill() {
            Ok(data) if data.is_empty() => {
                self.done = true;
                None
            }
            Ok(data) => {
                if data.len() < self.block_size {
                    self.done = true;
                }
                let offset = self.offset;
                self.offset += data.len() as u64;
                Some(Ok(Block { offset, data }))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that hands out at most 7 bytes per call.
    struct Trickle(Cursor<Vec<u8>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(7);
            self.0.read(&mut buf[..n])
        }
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(matches!(
            BlockSplitter::new(0),
            Err(CasError::InvalidBlockSize(0))
        ));
    }

    #[test]
    fn test_split_boundaries() {
        let data: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let splitter = BlockSplitter::new(1024).unwrap();
        let blocks: Vec<Block> = splitter
            .split(Cursor::new(data.clone()))
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].data.len(), 1024);
        assert_eq!(blocks[1].offset, 1024);
        assert_eq!(blocks[2].data.len(), 2500 - 2048);

        let joined: Vec<u8> = blocks.into_iter().flat_map(|b| b.data).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let splitter = BlockSplitter::new(100).unwrap();
        let blocks: Vec<Block> = splitter
            .split(Cursor::new(vec![1u8; 300]))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(blocks.len(), 3);
        assert!(blocks.iter().all(|b| b.data.len() == 100));
    }

    #[test]
    fn test_empty_stream() {
        let splitter = BlockSplitter::new(16).unwrap();
        assert_eq!(splitter.split(Cursor::new(Vec::new())).count(), 0);
    }

    #[test]
    fn test_short_reads_do_not_move_boundaries() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
        let splitter = BlockSplitter::new(64).unwrap();

        let direct: Vec<Block> = splitter
            .split(Cursor::new(data.clone()))
            .collect::<Result<_>>()
            .unwrap();
        let trickled: Vec<Block> = splitter
            .split(Trickle(Cursor::new(data)))
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(direct, trickled);
    }

    #[test]
    fn test_digested_batches_preserve_order() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 13) as u8).collect();
        let splitter = BlockSplitter::new(512).unwrap();
        let mut blocks = splitter.split(Cursor::new(data.clone()));

        let mut all = Vec::new();
        loop {
            let batch = splitter.next_digested_batch(&mut blocks, 4).unwrap();
            if batch.is_empty() {
                break;
            }
            all.extend(batch);
        }

        assert_eq!(all.len(), 20);
        for (i, b) in all.iter().enumerate() {
            assert_eq!(b.offset, (i * 512) as u64);
            assert_eq!(b.digest, digest(&b.data));
        }
    }
}
