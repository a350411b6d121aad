//! Streaming read with an attached filter group.

use std::io::Read;

use pgvault_api_types::{Error, ErrorKind, Result};

use crate::filter::FilterGroup;
use crate::BUFFER_SIZE;

pub struct StorageRead {
    inner: Box<dyn Read + Send>,
    path: String,
    filters: FilterGroup,
    scratch: Vec<u8>,
    eof: bool,
}

impl std::fmt::Debug for StorageRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRead")
            .field("path", &self.path)
            .field("eof", &self.eof)
            .finish()
    }
}

impl StorageRead {
    pub(crate) fn new(inner: Box<dyn Read + Send>, path: String) -> Self {
        Self {
            inner,
            path,
            filters: FilterGroup::new(),
            scratch: vec![0u8; BUFFER_SIZE],
            eof: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Filters must be attached before the first read.
    pub fn filters_mut(&mut self) -> &mut FilterGroup {
        &mut self.filters
    }

    /// Next filtered output block, `None` once the source and all filter
    /// tails are drained.
    pub fn read_block(&mut self) -> Result<Option<Vec<u8>>> {
        while !self.eof {
            let len = self.inner.read(&mut self.scratch).map_err(|err| {
                Error::from_io(
                    err,
                    ErrorKind::FileRead,
                    &format!("unable to read '{}'", self.path),
                )
            })?;

            let mut out = Vec::new();

            if len == 0 {
                self.eof = true;
                self.filters.finish(&mut out)?;
            } else {
                self.filters.process(&self.scratch[..len], &mut out)?;
            }

            if !out.is_empty() {
                return Ok(Some(out));
            }
        }

        Ok(None)
    }

    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();

        while let Some(block) = self.read_block()? {
            data.extend_from_slice(&block);
        }

        Ok(data)
    }

    /// Drain the source without keeping the output, for callers that only
    /// want the filter results.
    pub fn drain(&mut self) -> Result<()> {
        while self.read_block()?.is_some() {}
        Ok(())
    }

    /// Filter results, valid once the stream is drained.
    pub fn filters(&self) -> &FilterGroup {
        &self.filters
    }

    pub fn into_filters(self) -> FilterGroup {
        self.filters
    }
}
