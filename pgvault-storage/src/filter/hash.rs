//! Cryptographic hash filter. Passes data through unchanged and reports the
//! hex digest as its result.

use openssl::hash::{Hasher, MessageDigest};

use pgvault_api_types::Result;
use pgvault_protocol::Value;

use super::Filter;

pub const HASH_FILTER: &str = "hash";

/// Length of a hex-encoded SHA-1 digest.
pub const SHA1_HEX_SIZE: usize = 40;

/// Hex SHA-1 of zero bytes, the checksum recorded for empty files.
pub const SHA1_EMPTY: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";

pub struct HashFilter {
    hasher: Hasher,
}

impl HashFilter {
    pub fn sha1() -> Result<Self> {
        Ok(Self {
            hasher: Hasher::new(MessageDigest::sha1())?,
        })
    }

    /// One-shot helper for in-memory data.
    pub fn digest(data: &[u8]) -> Result<String> {
        let mut hasher = Hasher::new(MessageDigest::sha1())?;
        hasher.update(data)?;
        Ok(hex::encode(hasher.finish()?))
    }
}

impl Filter for HashFilter {
    fn name(&self) -> &'static str {
        HASH_FILTER
    }

    fn process(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.hasher.update(input)?;
        out.extend_from_slice(input);
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<Value> {
        Ok(Value::Str(hex::encode(self.hasher.finish()?)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sha1_known_value() {
        let mut filter = HashFilter::sha1().unwrap();
        let mut out = Vec::new();

        filter.process(b"abc", &mut out).unwrap();
        assert_eq!(out, b"abc");

        let result = filter.finish(&mut out).unwrap();
        assert_eq!(
            result.as_str().unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn empty_digest_constant() {
        let mut filter = HashFilter::sha1().unwrap();
        let mut out = Vec::new();
        let result = filter.finish(&mut out).unwrap();
        assert_eq!(result.as_str().unwrap(), SHA1_EMPTY);
    }
}
