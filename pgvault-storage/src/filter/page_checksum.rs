//! Data page validation.
//!
//! Recomputes the PostgreSQL page checksum (FNV-1a derived, folded to 16
//! bits and mixed with the block number) for every page flowing through and
//! collects the numbers of pages that fail. Pages whose LSN is at or past
//! the backup start LSN are skipped: they may be torn by concurrent writes
//! and will be fixed during WAL replay. New pages (pd_upper == 0) are
//! skipped as well.

use pgvault_api_types::Result;
use pgvault_protocol::Value;

use super::Filter;

pub const PAGE_CHECKSUM_FILTER: &str = "page-checksum";

/// PostgreSQL block size. Relation files are a whole number of these.
pub const PG_PAGE_SIZE: usize = 8192;

const N_SUMS: usize = 32;
const FNV_PRIME: u32 = 16777619;

const CHECKSUM_BASE_OFFSETS: [u32; N_SUMS] = [
    0x5B1F36E9, 0xB8525960, 0x02AB50AA, 0x1DE66D2A, 0x79FF467A, 0x9BB9F8A3, 0x217E7CD2, 0x83E13D2C,
    0xF8D4474F, 0xE39EB970, 0x42C6AE16, 0x993216FA, 0x7B093B5D, 0x98DAFF3C, 0xF718902A, 0x0B1C9CDB,
    0xE58F764B, 0x187636BC, 0x5D7B3BB1, 0xE73DE7DE, 0x92BEC979, 0xCCA6C0B2, 0x304A0979, 0x85AA43D4,
    0x783125BB, 0x6CA8EAA2, 0xE407EAC6, 0x4B5CFC3E, 0x9FBF8C76, 0x15CA20BE, 0xF2CA9FD3, 0x959BD756,
];

#[inline]
fn checksum_comp(checksum: u32, value: u32) -> u32 {
    let tmp = checksum ^ value;
    tmp.wrapping_mul(FNV_PRIME) ^ (tmp >> 17)
}

fn checksum_block(page: &[u8]) -> u32 {
    debug_assert_eq!(page.len(), PG_PAGE_SIZE);

    let mut sums = CHECKSUM_BASE_OFFSETS;
    let rows = PG_PAGE_SIZE / (N_SUMS * 4);

    for row in 0..rows {
        for (col, sum) in sums.iter_mut().enumerate() {
            let off = (row * N_SUMS + col) * 4;
            let value = u32::from_le_bytes(page[off..off + 4].try_into().unwrap());
            *sum = checksum_comp(*sum, value);
        }
    }

    // Two rounds of zeroes for extra mixing of the last inputs.
    for _ in 0..2 {
        for sum in sums.iter_mut() {
            *sum = checksum_comp(*sum, 0);
        }
    }

    sums.iter().fold(0, |acc, sum| acc ^ sum)
}

/// Checksum for one page, computed with the stored checksum field masked.
pub fn page_checksum(page: &[u8], block_no: u32) -> u16 {
    let mut copy = [0u8; PG_PAGE_SIZE];
    copy.copy_from_slice(page);
    copy[8] = 0;
    copy[9] = 0;

    let mut checksum = checksum_block(&copy);
    checksum ^= block_no;

    ((checksum % 65535) + 1) as u16
}

fn page_lsn(page: &[u8]) -> u64 {
    let hi = u32::from_le_bytes(page[0..4].try_into().unwrap());
    let lo = u32::from_le_bytes(page[4..8].try_into().unwrap());
    (u64::from(hi) << 32) | u64::from(lo)
}

fn page_is_new(page: &[u8]) -> bool {
    // pd_upper of an initialized page is never zero.
    u16::from_le_bytes(page[14..16].try_into().unwrap()) == 0
}

pub struct PageChecksumFilter {
    page_size: usize,
    next_page_no: u64,
    lsn_limit: u64,
    pending: Vec<u8>,
    error: Vec<u64>,
    align: bool,
}

impl PageChecksumFilter {
    pub fn new(page_no_first: u64, lsn_limit: u64) -> Self {
        Self {
            page_size: PG_PAGE_SIZE,
            next_page_no: page_no_first,
            lsn_limit,
            pending: Vec::new(),
            error: Vec::new(),
            align: true,
        }
    }

    fn check_page(&mut self, page: &[u8]) {
        let page_no = self.next_page_no;
        self.next_page_no += 1;

        if page_is_new(page) || page_lsn(page) >= self.lsn_limit {
            return;
        }

        let stored = u16::from_le_bytes(page[8..10].try_into().unwrap());

        if stored != page_checksum(page, page_no as u32) {
            self.error.push(page_no);
        }
    }
}

impl Filter for PageChecksumFilter {
    fn name(&self) -> &'static str {
        PAGE_CHECKSUM_FILTER
    }

    fn process(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(input);

        self.pending.extend_from_slice(input);

        let mut offset = 0;

        while self.pending.len() - offset >= self.page_size {
            let page = self.pending[offset..offset + self.page_size].to_vec();
            self.check_page(&page);
            offset += self.page_size;
        }

        self.pending.drain(..offset);
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<Value> {
        if !self.pending.is_empty() {
            // A relation file that is not a whole number of pages cannot be
            // validated.
            self.align = false;
        }

        let valid = self.align && self.error.is_empty();

        Ok(Value::obj([
            ("valid", Value::Bool(valid)),
            ("align", Value::Bool(self.align)),
            (
                "error",
                Value::Array(self.error.iter().map(|page| Value::UInt(*page)).collect()),
            ),
        ]))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_page(block_no: u32, lsn: u64) -> Vec<u8> {
        let mut page = vec![0u8; PG_PAGE_SIZE];

        page[0..4].copy_from_slice(&((lsn >> 32) as u32).to_le_bytes());
        page[4..8].copy_from_slice(&(lsn as u32).to_le_bytes());
        // pd_lower / pd_upper for an initialized page
        page[12..14].copy_from_slice(&24u16.to_le_bytes());
        page[14..16].copy_from_slice(&8192u16.to_le_bytes());
        // some tuple data
        for (idx, byte) in page.iter_mut().enumerate().skip(24) {
            *byte = (idx % 253) as u8;
        }

        let checksum = page_checksum(&page, block_no);
        page[8..10].copy_from_slice(&checksum.to_le_bytes());
        page
    }

    fn run(filter: &mut PageChecksumFilter, data: &[u8]) -> Value {
        let mut out = Vec::new();

        // Deliberately odd chunking, unrelated to page boundaries.
        for chunk in data.chunks(3000) {
            filter.process(chunk, &mut out).unwrap();
        }

        assert_eq!(out, data);
        filter.finish(&mut out).unwrap()
    }

    #[test]
    fn valid_pages_pass() {
        let mut data = Vec::new();
        for block_no in 0..4 {
            data.extend(make_page(block_no, 0x1_0000_0000));
        }

        let mut filter = PageChecksumFilter::new(0, 0x2_0000_0000);
        let result = run(&mut filter, &data);

        assert!(result.get("valid").as_bool().unwrap());
        assert!(result.get("align").as_bool().unwrap());
        assert!(result.get("error").as_array().unwrap().is_empty());
    }

    #[test]
    fn corrupt_page_is_reported() {
        let mut data = Vec::new();
        for block_no in 0..4 {
            data.extend(make_page(block_no, 0x1_0000_0000));
        }

        // Flip one byte in page 2.
        data[2 * PG_PAGE_SIZE + 100] ^= 0xff;

        let mut filter = PageChecksumFilter::new(0, 0x2_0000_0000);
        let result = run(&mut filter, &data);

        assert!(!result.get("valid").as_bool().unwrap());
        let errors = result.get("error").as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].as_u64().unwrap(), 2);
    }

    #[test]
    fn page_past_lsn_limit_is_skipped() {
        let mut page = make_page(0, 0x9_0000_0000);
        // Corrupt it; the LSN limit must still suppress the report.
        page[200] ^= 0xff;

        let mut filter = PageChecksumFilter::new(0, 0x2_0000_0000);
        let result = run(&mut filter, &page);

        assert!(result.get("valid").as_bool().unwrap());
    }

    #[test]
    fn new_page_is_skipped() {
        let page = vec![0u8; PG_PAGE_SIZE];

        let mut filter = PageChecksumFilter::new(0, u64::MAX);
        let result = run(&mut filter, &page);

        assert!(result.get("valid").as_bool().unwrap());
    }

    #[test]
    fn misaligned_file_is_invalid() {
        let mut data = make_page(0, 0x1_0000_0000);
        data.extend_from_slice(&[0u8; 100]);

        let mut filter = PageChecksumFilter::new(0, 0x2_0000_0000);
        let result = run(&mut filter, &data);

        assert!(!result.get("valid").as_bool().unwrap());
        assert!(!result.get("align").as_bool().unwrap());
    }

    #[test]
    fn first_page_number_offsets_blocks() {
        // The same page content validates only with the right block number.
        let page = make_page(5, 0x1_0000_0000);

        let mut filter = PageChecksumFilter::new(5, 0x2_0000_0000);
        assert!(run(&mut filter, &page).get("valid").as_bool().unwrap());

        let mut filter = PageChecksumFilter::new(6, 0x2_0000_0000);
        assert!(!run(&mut filter, &page).get("valid").as_bool().unwrap());
    }
}
