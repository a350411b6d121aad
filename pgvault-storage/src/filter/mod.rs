//! Composable streaming filters.
//!
//! A filter consumes input blocks and produces output blocks plus, once the
//! stream ends, a result value. Filters compose into an ordered group that
//! backs every repository read and write: data pushed into the group flows
//! through each filter in turn.

use pgvault_api_types::{Error, Result};
use pgvault_protocol::Value;

mod block_map;
mod cipher;
mod compress;
mod delta_map;
mod hash;
mod page_checksum;
mod size;

pub use block_map::{BlockMap, BlockMapEntry, BlockMapFilter, BLOCK_MAP_FILTER};
pub use cipher::{CipherFilter, CipherMode, CIPHER_FILTER, CIPHER_MAGIC};
pub use compress::{default_level, CompressFilter, DecompressFilter, COMPRESS_FILTER, DECOMPRESS_FILTER};
pub use delta_map::{block_digest, digest_list, DeltaMapFilter, BLOCK_DIGEST_SIZE, DELTA_MAP_FILTER};
pub use hash::{HashFilter, HASH_FILTER, SHA1_EMPTY, SHA1_HEX_SIZE};
pub use page_checksum::{page_checksum, PageChecksumFilter, PAGE_CHECKSUM_FILTER, PG_PAGE_SIZE};
pub use size::{SizeFilter, SIZE_FILTER};

pub trait Filter: Send {
    /// Name used to look the result up after the stream closes.
    fn name(&self) -> &'static str;

    /// Process one input block, appending any output to `out`.
    fn process(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()>;

    /// Flush buffered state and return the filter result.
    fn finish(&mut self, out: &mut Vec<u8>) -> Result<Value>;
}

/// An ordered filter pipeline. After [`FilterGroup::finish`] the per-filter
/// results are retained and can be looked up by name.
///
/// Composition order is checked as filters attach: compressing after
/// encryption is always a mistake (ciphertext does not compress), as is
/// decrypting after decompression. A violating chain fails on first use.
#[derive(Default)]
pub struct FilterGroup {
    filters: Vec<Box<dyn Filter>>,
    results: Vec<(&'static str, Value)>,
    finished: bool,
    order_error: Option<Error>,
}

impl FilterGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, filter: Box<dyn Filter>) -> &mut Self {
        let has = |name: &str| self.filters.iter().any(|have| have.name() == name);

        if filter.name() == COMPRESS_FILTER && has(CIPHER_FILTER) {
            self.order_error =
                Some(Error::assert("compression must be applied before encryption"));
        }

        if filter.name() == CIPHER_FILTER && has(DECOMPRESS_FILTER) {
            self.order_error =
                Some(Error::assert("decryption must be applied before decompression"));
        }

        self.filters.push(filter);
        self
    }

    fn check_order(&self) -> Result<()> {
        match &self.order_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Push one block through the whole chain, appending the final output
    /// to `out`.
    pub fn process(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.check_order()?;

        if self.finished {
            return Err(Error::assert("filter group already finished"));
        }

        if self.filters.is_empty() {
            out.extend_from_slice(input);
            return Ok(());
        }

        let mut current = Vec::new();
        self.filters[0].process(input, &mut current)?;

        for filter in &mut self.filters[1..] {
            if current.is_empty() {
                break;
            }

            let mut next = Vec::new();
            filter.process(&current, &mut next)?;
            current = next;
        }

        out.extend_from_slice(&current);
        Ok(())
    }

    /// Finish every filter in order, cascading tail output down the chain,
    /// and capture the results.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        self.check_order()?;

        if self.finished {
            return Err(Error::assert("filter group already finished"));
        }

        self.finished = true;

        for idx in 0..self.filters.len() {
            let mut tail = Vec::new();
            let result = self.filters[idx].finish(&mut tail)?;
            self.results.push((self.filters[idx].name(), result));

            // Tail output must still pass through the downstream filters.
            if !tail.is_empty() {
                let mut current = tail;

                for filter in &mut self.filters[idx + 1..] {
                    let mut next = Vec::new();
                    filter.process(&current, &mut next)?;
                    current = next;
                }

                out.extend_from_slice(&current);
            }
        }

        Ok(())
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Result of the last filter with the given name. Only valid after
    /// finish.
    pub fn result(&self, name: &str) -> Option<&Value> {
        self.results
            .iter()
            .rev()
            .find(|(filter, _)| *filter == name)
            .map(|(_, value)| value)
    }

    /// Required-result variant for filters the caller knows are present.
    pub fn result_required(&self, name: &str) -> Result<&Value> {
        self.result(name)
            .ok_or_else(|| Error::assert(format!("no result for filter '{name}'")))
    }

    /// All results for filters with the given name, in chain order, for
    /// groups that use the same filter type twice.
    pub fn results(&self, name: &str) -> Vec<&Value> {
        self.results
            .iter()
            .filter(|(filter, _)| *filter == name)
            .map(|(_, value)| value)
            .collect()
    }
}
