//! WAL segment names and arithmetic.
//!
//! A segment name is 24 hex characters: timeline, log (the high 32 bits of
//! the LSN) and segment number within the log. The number of segments per
//! log depends on the cluster's WAL segment size, so all arithmetic takes
//! the size as a parameter.

use std::fmt;

use pgvault_api_types::{Error, ErrorKind, Result};

/// Default WAL segment size; overridable per cluster at initdb time.
pub const WAL_SEGMENT_SIZE_DEFAULT: u64 = 16 * 1024 * 1024;

/// Parsed segment name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalSegment {
    pub timeline: u32,
    pub log: u32,
    pub seg: u32,
}

impl WalSegment {
    pub fn new(timeline: u32, log: u32, seg: u32) -> Self {
        Self { timeline, log, seg }
    }

    pub fn parse(name: &str) -> Result<Self> {
        if name.len() != 24 || !name.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            return Err(Error::format(format!("'{name}' is not a wal segment name")));
        }

        Ok(Self {
            timeline: u32::from_str_radix(&name[0..8], 16).unwrap(),
            log: u32::from_str_radix(&name[8..16], 16).unwrap(),
            seg: u32::from_str_radix(&name[16..24], 16).unwrap(),
        })
    }

    /// Is this a well-formed segment file name (possibly with checksum and
    /// compression decoration)?
    pub fn is_segment_name(name: &str) -> bool {
        name.len() >= 24 && Self::parse(&name[..24]).is_ok()
    }

    fn segments_per_log(segment_size: u64) -> u64 {
        0x1_0000_0000 / segment_size
    }

    /// Absolute segment number on this timeline.
    fn segno(&self, segment_size: u64) -> u64 {
        u64::from(self.log) * Self::segments_per_log(segment_size) + u64::from(self.seg)
    }

    fn from_segno(timeline: u32, segno: u64, segment_size: u64) -> Self {
        let per_log = Self::segments_per_log(segment_size);

        Self {
            timeline,
            log: (segno / per_log) as u32,
            seg: (segno % per_log) as u32,
        }
    }

    /// The segment that follows this one on the same timeline.
    pub fn next(&self, segment_size: u64) -> Self {
        Self::from_segno(self.timeline, self.segno(segment_size) + 1, segment_size)
    }

    pub fn add(&self, count: u64, segment_size: u64) -> Self {
        Self::from_segno(self.timeline, self.segno(segment_size) + count, segment_size)
    }

    /// Number of segments from `self` up to but not including `other`.
    /// Zero when `other` is not ahead or is on another timeline.
    pub fn distance(&self, other: &WalSegment, segment_size: u64) -> u64 {
        if self.timeline != other.timeline {
            return 0;
        }

        other
            .segno(segment_size)
            .saturating_sub(self.segno(segment_size))
    }

    /// Segment containing an LSN.
    pub fn from_lsn(timeline: u32, lsn: u64, segment_size: u64) -> Self {
        Self {
            timeline,
            log: (lsn >> 32) as u32,
            seg: ((lsn & 0xFFFF_FFFF) / segment_size) as u32,
        }
    }
}

impl fmt::Display for WalSegment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:08X}{:08X}{:08X}", self.timeline, self.log, self.seg)
    }
}

/// Parse an LSN in the `X/X` text form.
pub fn parse_lsn(text: &str) -> Result<u64> {
    let (high, low) = text
        .split_once('/')
        .ok_or_else(|| Error::format(format!("'{text}' is not an lsn")))?;

    let high = u64::from_str_radix(high, 16)
        .map_err(|_| Error::format(format!("'{text}' is not an lsn")))?;
    let low = u64::from_str_radix(low, 16)
        .map_err(|_| Error::format(format!("'{text}' is not an lsn")))?;

    if high > u64::from(u32::MAX) || low > u64::from(u32::MAX) {
        return Err(Error::format(format!("'{text}' is not an lsn")));
    }

    Ok((high << 32) | low)
}

pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

/// A run of segments present continuously on one timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRange {
    pub start: WalSegment,
    pub stop: WalSegment,
}

impl WalRange {
    /// Does `[start, stop]` cover the segment?
    pub fn contains(&self, segment: &WalSegment, segment_size: u64) -> bool {
        segment.timeline == self.start.timeline
            && self.start.segno(segment_size) <= segment.segno(segment_size)
            && segment.segno(segment_size) <= self.stop.segno(segment_size)
    }
}

/// Build continuity ranges from an ascending, de-duplicated segment list. A
/// new range starts whenever the expected next segment is not the observed
/// next, or the timeline changes.
pub fn wal_ranges(segments: &[WalSegment], segment_size: u64) -> Vec<WalRange> {
    let mut ranges: Vec<WalRange> = Vec::new();

    for segment in segments {
        match ranges.last_mut() {
            Some(range)
                if range.stop.timeline == segment.timeline
                    && range.stop.next(segment_size) == *segment =>
            {
                range.stop = *segment;
            }
            _ => ranges.push(WalRange {
                start: *segment,
                stop: *segment,
            }),
        }
    }

    ranges
}

/// Segment file names look like `<segment>-<40-hex-sha1>[.<ext>]`; extract
/// the parts.
pub fn segment_file_split(file_name: &str) -> Result<(WalSegment, String)> {
    let (base, _) = pgvault_api_types::CompressType::from_name(file_name);

    if base.len() != 24 + 1 + 40 || base.as_bytes().get(24) != Some(&b'-') {
        return Err(Error::new(
            ErrorKind::Format,
            format!("'{file_name}' is not a wal segment file"),
        ));
    }

    let segment = WalSegment::parse(&base[..24])?;
    let checksum = base[25..].to_string();

    if !checksum.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return Err(Error::new(
            ErrorKind::Format,
            format!("'{file_name}' has an invalid checksum"),
        ));
    }

    Ok((segment, checksum))
}
