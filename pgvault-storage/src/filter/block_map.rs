//! Block map for block-incremental files.
//!
//! The map records, for every block of the source file, where the current
//! content of that block lives in the repository: which backup label, at
//! what offset and size within that backup's copy of the file, and the
//! block's hash. Reconstructing the file is a walk over the entries in
//! order, reading each block from its reference. The map is appended to the
//! repository file it describes; the manifest records its size so readers
//! can fetch it from the tail with a ranged read.

use pgvault_api_types::{Error, Result};
use pgvault_protocol::Value;

use super::delta_map::BLOCK_DIGEST_SIZE;
use super::Filter;

pub const BLOCK_MAP_FILTER: &str = "block-map";

const BLOCK_MAP_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct BlockMapEntry {
    /// Index into the map's label table.
    pub reference: u32,
    /// Offset of the block within the referenced repository file.
    pub offset: u64,
    /// Stored size of the block (the last block may be short).
    pub size: u64,
    pub checksum: [u8; BLOCK_DIGEST_SIZE],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockMap {
    pub block_size: u64,
    /// Backup labels referenced by the entries.
    pub labels: Vec<String>,
    /// One entry per block, in block order.
    pub entries: Vec<BlockMapEntry>,
}

impl BlockMap {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            ..Default::default()
        }
    }

    /// Intern a label and return its table index.
    pub fn label_idx(&mut self, label: &str) -> u32 {
        if let Some(idx) = self.labels.iter().position(|have| have == label) {
            return idx as u32;
        }

        self.labels.push(label.to_string());
        (self.labels.len() - 1) as u32
    }

    pub fn label(&self, reference: u32) -> Result<&str> {
        self.labels
            .get(reference as usize)
            .map(String::as_str)
            .ok_or_else(|| Error::format(format!("block map references unknown label {reference}")))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();

        out.extend_from_slice(&BLOCK_MAP_VERSION.to_le_bytes());
        out.extend_from_slice(&self.block_size.to_le_bytes());

        out.extend_from_slice(&(self.labels.len() as u32).to_le_bytes());
        for label in &self.labels {
            out.extend_from_slice(&(label.len() as u32).to_le_bytes());
            out.extend_from_slice(label.as_bytes());
        }

        out.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&entry.reference.to_le_bytes());
            out.extend_from_slice(&entry.offset.to_le_bytes());
            out.extend_from_slice(&entry.size.to_le_bytes());
            out.extend_from_slice(&entry.checksum);
        }

        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut pos = 0usize;

        let take = |pos: &mut usize, len: usize| -> Result<&[u8]> {
            if data.len() - *pos < len {
                return Err(Error::format("block map is truncated"));
            }

            let slice = &data[*pos..*pos + len];
            *pos += len;
            Ok(slice)
        };

        let version = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap());
        if version != BLOCK_MAP_VERSION {
            return Err(Error::format(format!("unknown block map version {version}")));
        }

        let block_size = u64::from_le_bytes(take(&mut pos, 8)?.try_into().unwrap());
        if block_size == 0 {
            return Err(Error::format("block map block size is zero"));
        }

        let label_total = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap());
        let mut labels = Vec::with_capacity(label_total.min(4096) as usize);

        for _ in 0..label_total {
            let len = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap()) as usize;
            let raw = take(&mut pos, len)?;
            labels.push(
                String::from_utf8(raw.to_vec())
                    .map_err(|_| Error::format("block map label is not utf-8"))?,
            );
        }

        let entry_total = u64::from_le_bytes(take(&mut pos, 8)?.try_into().unwrap());
        let mut entries = Vec::with_capacity(entry_total.min(1 << 20) as usize);

        for _ in 0..entry_total {
            let reference = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap());

            if reference as usize >= labels.len() {
                return Err(Error::format(format!(
                    "block map references unknown label {reference}"
                )));
            }

            entries.push(BlockMapEntry {
                reference,
                offset: u64::from_le_bytes(take(&mut pos, 8)?.try_into().unwrap()),
                size: u64::from_le_bytes(take(&mut pos, 8)?.try_into().unwrap()),
                checksum: take(&mut pos, BLOCK_DIGEST_SIZE)?.try_into().unwrap(),
            });
        }

        if pos != data.len() {
            return Err(Error::format("trailing bytes after block map"));
        }

        Ok(Self {
            block_size,
            labels,
            entries,
        })
    }
}

/// Collects and validates a serialized block map read from the repository.
/// The raw bytes are the result; content does not pass through.
#[derive(Default)]
pub struct BlockMapFilter {
    raw: Vec<u8>,
}

impl BlockMapFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Filter for BlockMapFilter {
    fn name(&self) -> &'static str {
        BLOCK_MAP_FILTER
    }

    fn process(&mut self, input: &[u8], _out: &mut Vec<u8>) -> Result<()> {
        self.raw.extend_from_slice(input);
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<Value> {
        // Parse to validate before handing the raw bytes back.
        BlockMap::from_bytes(&self.raw)?;
        Ok(Value::Bytes(std::mem::take(&mut self.raw)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_map() -> BlockMap {
        let mut map = BlockMap::new(8192);
        let full = map.label_idx("20240101-000000F");
        let incr = map.label_idx("20240101-000000F_20240102-000000I");
        assert_eq!(map.label_idx("20240101-000000F"), full);

        map.entries.push(BlockMapEntry {
            reference: full,
            offset: 0,
            size: 8192,
            checksum: [1; 20],
        });
        map.entries.push(BlockMapEntry {
            reference: incr,
            offset: 0,
            size: 8192,
            checksum: [2; 20],
        });
        map.entries.push(BlockMapEntry {
            reference: incr,
            offset: 8192,
            size: 100,
            checksum: [3; 20],
        });
        map
    }

    #[test]
    fn map_round_trip() {
        let map = sample_map();
        let bytes = map.to_bytes();
        assert_eq!(BlockMap::from_bytes(&bytes).unwrap(), map);
    }

    #[test]
    fn truncated_map_fails() {
        let bytes = sample_map().to_bytes();
        assert!(BlockMap::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(BlockMap::from_bytes(&[]).is_err());
    }

    #[test]
    fn bad_reference_fails() {
        let mut map = sample_map();
        map.entries[0].reference = 9;
        assert!(BlockMap::from_bytes(&map.to_bytes()).is_err());
    }

    #[test]
    fn filter_validates_and_returns_raw() {
        let bytes = sample_map().to_bytes();

        let mut filter = BlockMapFilter::new();
        let mut out = Vec::new();

        for chunk in bytes.chunks(7) {
            filter.process(chunk, &mut out).unwrap();
        }

        let result = filter.finish(&mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(result.as_bytes().unwrap(), &bytes[..]);
    }
}
