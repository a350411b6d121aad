//! Byte counter filter.

use pgvault_api_types::Result;
use pgvault_protocol::Value;

use super::Filter;

pub const SIZE_FILTER: &str = "size";

#[derive(Default)]
pub struct SizeFilter {
    size: u64,
}

impl SizeFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Filter for SizeFilter {
    fn name(&self) -> &'static str {
        SIZE_FILTER
    }

    fn process(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.size += input.len() as u64;
        out.extend_from_slice(input);
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<Value> {
        Ok(Value::UInt(self.size))
    }
}
