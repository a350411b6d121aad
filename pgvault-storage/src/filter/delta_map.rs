//! Per-block hash list.
//!
//! Splits the stream into fixed-size blocks and hashes each one, emitting
//! the concatenated digests. Restore compares this list against a block map
//! to decide which blocks of an existing file are already correct.

use openssl::hash::{Hasher, MessageDigest};

use pgvault_api_types::{Error, Result};
use pgvault_protocol::Value;

use super::Filter;

pub const DELTA_MAP_FILTER: &str = "delta-map";

/// Size of one raw SHA-1 digest in the list.
pub const BLOCK_DIGEST_SIZE: usize = 20;

/// Split a concatenated digest list back into digests.
pub fn digest_list(data: &[u8]) -> Result<Vec<[u8; BLOCK_DIGEST_SIZE]>> {
    if data.len() % BLOCK_DIGEST_SIZE != 0 {
        return Err(Error::format("block digest list is misaligned"));
    }

    Ok(data
        .chunks_exact(BLOCK_DIGEST_SIZE)
        .map(|chunk| chunk.try_into().unwrap())
        .collect())
}

pub fn block_digest(block: &[u8]) -> Result<[u8; BLOCK_DIGEST_SIZE]> {
    let mut hasher = Hasher::new(MessageDigest::sha1())?;
    hasher.update(block)?;
    Ok(hasher.finish()?.as_ref().try_into().unwrap())
}

pub struct DeltaMapFilter {
    block_size: usize,
    pending: Vec<u8>,
    digests: Vec<u8>,
}

impl DeltaMapFilter {
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0);

        Self {
            block_size,
            pending: Vec::new(),
            digests: Vec::new(),
        }
    }
}

impl Filter for DeltaMapFilter {
    fn name(&self) -> &'static str {
        DELTA_MAP_FILTER
    }

    fn process(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(input);
        self.pending.extend_from_slice(input);

        let mut offset = 0;

        while self.pending.len() - offset >= self.block_size {
            let digest = block_digest(&self.pending[offset..offset + self.block_size])?;
            self.digests.extend_from_slice(&digest);
            offset += self.block_size;
        }

        self.pending.drain(..offset);
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<Value> {
        if !self.pending.is_empty() {
            let digest = block_digest(&self.pending)?;
            self.digests.extend_from_slice(&digest);
            self.pending.clear();
        }

        Ok(Value::Bytes(std::mem::take(&mut self.digests)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn digests_for(len: usize, block_size: usize, chunk: usize) -> Vec<[u8; 20]> {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

        let mut filter = DeltaMapFilter::new(block_size);
        let mut out = Vec::new();

        for part in data.chunks(chunk.max(1)) {
            filter.process(part, &mut out).unwrap();
        }

        let result = filter.finish(&mut out).unwrap();
        digest_list(result.as_bytes().unwrap()).unwrap()
    }

    #[test]
    fn digest_count_is_ceil_of_size_over_block() {
        // Identical results no matter how the input is chunked.
        for chunk in [1, 7, 4096, 100_000] {
            assert_eq!(digests_for(0, 4096, chunk).len(), 0);
            assert_eq!(digests_for(1, 4096, chunk).len(), 1);
            assert_eq!(digests_for(4096, 4096, chunk).len(), 1);
            assert_eq!(digests_for(4097, 4096, chunk).len(), 2);
            assert_eq!(digests_for(12_288, 4096, chunk).len(), 3);
        }
    }

    #[test]
    fn chunking_does_not_change_digests() {
        assert_eq!(digests_for(10_000, 4096, 1), digests_for(10_000, 4096, 9999));
    }

    #[test]
    fn digests_match_whole_block_hash() {
        let digests = digests_for(4096, 4096, 512);
        let data: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        assert_eq!(digests[0], block_digest(&data).unwrap());
    }
}
