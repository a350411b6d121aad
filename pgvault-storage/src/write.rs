//! Streaming write with an attached filter group.

use pgvault_api_types::{Error, ErrorKind, Result};

use crate::filter::FilterGroup;
use crate::storage::DriverWrite;

pub struct StorageWrite {
    inner: Box<dyn DriverWrite>,
    path: String,
    filters: FilterGroup,
}

impl StorageWrite {
    pub(crate) fn new(inner: Box<dyn DriverWrite>, path: String) -> Self {
        Self {
            inner,
            path,
            filters: FilterGroup::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Filters must be attached before the first write.
    pub fn filters_mut(&mut self) -> &mut FilterGroup {
        &mut self.filters
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut out = Vec::new();
        self.filters.process(data, &mut out)?;
        self.write_raw(&out)
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        std::io::Write::write_all(&mut self.inner, data).map_err(|err| {
            Error::from_io(
                err,
                ErrorKind::FileWrite,
                &format!("unable to write '{}'", self.path),
            )
        })
    }

    /// Finish the filters, flush their tails and finalize the write. For
    /// atomic writes this is the rename point; content is not visible under
    /// the final name until close returns.
    pub fn close(mut self) -> Result<FilterGroup> {
        let mut out = Vec::new();
        self.filters.finish(&mut out)?;
        self.write_raw(&out)?;
        self.inner.close()?;
        Ok(self.filters)
    }
}
