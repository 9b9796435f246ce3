//! Data-file page header parsing and the page checksum algorithm.
//!
//! A data file is an array of BLCKSZ-sized pages. Each starts with a 24-byte
//! `PageHeaderData`. The region between `pd_lower` and `pd_upper` is the
//! "hole": free space that contains no data and may be dropped when the page
//! is copied into a backup.

use byteorder::{ByteOrder, LittleEndian};
use utils::lsn::Lsn;

use crate::BLCKSZ;

pub const SIZE_OF_PAGE_HEADER_DATA: usize = 24;

/// Page layout versions this tool understands well enough to compact holes.
/// Anything else is copied verbatim.
pub const SUPPORTED_LAYOUT_VERSIONS: [u8; 2] = [4, 5];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeaderData {
    pub pd_lsn: Lsn,
    pub pd_checksum: u16,
    pub pd_flags: u16,
    pub pd_lower: u16,
    pub pd_upper: u16,
    pub pd_special: u16,
    pub pd_pagesize_version: u16,
    pub pd_prune_xid: u32,
}

impl PageHeaderData {
    /// Decode the header from the start of a page. The buffer must hold at
    /// least [`SIZE_OF_PAGE_HEADER_DATA`] bytes.
    pub fn decode(page: &[u8]) -> PageHeaderData {
        // pd_lsn is stored as {xlogid, xrecoff}, both little-endian.
        let xlogid = LittleEndian::read_u32(&page[0..4]);
        let xrecoff = LittleEndian::read_u32(&page[4..8]);
        PageHeaderData {
            pd_lsn: Lsn(((xlogid as u64) << 32) | xrecoff as u64),
            pd_checksum: LittleEndian::read_u16(&page[8..10]),
            pd_flags: LittleEndian::read_u16(&page[10..12]),
            pd_lower: LittleEndian::read_u16(&page[12..14]),
            pd_upper: LittleEndian::read_u16(&page[14..16]),
            pd_special: LittleEndian::read_u16(&page[16..18]),
            pd_pagesize_version: LittleEndian::read_u16(&page[18..20]),
            pd_prune_xid: LittleEndian::read_u32(&page[20..24]),
        }
    }

    pub fn page_size(&self) -> u16 {
        self.pd_pagesize_version & 0xFF00
    }

    pub fn layout_version(&self) -> u8 {
        (self.pd_pagesize_version & 0x00FF) as u8
    }

    /// A page entirely of zeroes is "new": legitimate in a file that was
    /// extended but never written, and always copied verbatim.
    pub fn is_new(&self) -> bool {
        self.pd_upper == 0
    }
}

/// The verdict on one page read from a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageVerdict {
    /// Header is sane; the hole between `lower` and `upper` may be dropped.
    Valid { hole_offset: u16, hole_length: u16 },
    /// All-zero page.
    New,
    /// Layout version we do not know; copy verbatim, do not compact.
    UnknownLayout,
    /// Header fails sanity checks (torn write, garbage). Copy verbatim.
    Invalid,
}

/// Classify a page. `blcksz` is the cluster's block size from pg_control.
pub fn classify_page(page: &[u8], blcksz: u16) -> PageVerdict {
    debug_assert_eq!(page.len(), blcksz as usize);

    if page.iter().all(|b| *b == 0) {
        return PageVerdict::New;
    }

    let header = PageHeaderData::decode(page);

    if header.page_size() != blcksz & 0xFF00 {
        return PageVerdict::Invalid;
    }
    if !SUPPORTED_LAYOUT_VERSIONS.contains(&header.layout_version()) {
        return PageVerdict::UnknownLayout;
    }

    let lower = header.pd_lower;
    let upper = header.pd_upper;
    let special = header.pd_special;

    let sane = lower >= SIZE_OF_PAGE_HEADER_DATA as u16
        && lower <= upper
        && upper <= special
        && special <= blcksz
        && special % 8 == 0
        && header.pd_lsn.is_valid();

    if !sane {
        return PageVerdict::Invalid;
    }

    PageVerdict::Valid {
        hole_offset: lower,
        hole_length: upper - lower,
    }
}

pub const N_SUMS: usize = 32;
const FNV_PRIME: u32 = 16777619;

/// Base offsets to initialize each of the parallel FNV hashes, from
/// `checksum_impl.h`.
const CHECKSUM_BASE_OFFSETS: [u32; N_SUMS] = [
    0x5B1F36E9, 0xB8525960, 0x02AB50AA, 0x1DE66D2A, 0x79FF467A, 0x9BB9F8A3, 0x217E7CD2, 0x83E13D2C,
    0xF8D4474F, 0xE39EB970, 0x42C6AE16, 0x993216FA, 0x7B093B5D, 0x98DAFF3C, 0xF718902A, 0x0B1C9CDB,
    0xE58F764B, 0x187636BC, 0x5D7B3BB1, 0xE73DE7DE, 0x92BEC979, 0xCCA6C0B2, 0x304A0979, 0x85AA43D4,
    0x783125BB, 0x6CA8EAA2, 0xE407EAC6, 0x4B5CFC3E, 0x9160BFB9, 0xA2F653D2, 0x12E346A7, 0x8B2E366B,
];

#[inline]
fn checksum_comp(checksum: u32, value: u32) -> u32 {
    let tmp = checksum ^ value;
    tmp.wrapping_mul(FNV_PRIME) ^ (tmp >> 17)
}

/// The block checksum, `pg_checksum_block` from `checksum_impl.h`: 32
/// interleaved FNV-1a-style sums over the page, xor-folded together.
fn checksum_block(page: &[u8]) -> u32 {
    let mut sums = CHECKSUM_BASE_OFFSETS;
    let words_per_row = N_SUMS;
    let rows = page.len() / (4 * words_per_row);

    for row in 0..rows {
        for (j, sum) in sums.iter_mut().enumerate() {
            let off = (row * words_per_row + j) * 4;
            let value = LittleEndian::read_u32(&page[off..off + 4]);
            *sum = checksum_comp(*sum, value);
        }
    }
    // Two rounds of zeroes to spread the last input bits into every sum.
    for _ in 0..2 {
        for sum in sums.iter_mut() {
            *sum = checksum_comp(*sum, 0);
        }
    }

    sums.iter().fold(0u32, |acc, s| acc ^ s)
}

/// Compute the checksum of one page, `pg_checksum_page`. The stored
/// `pd_checksum` field is treated as zero for the computation, and the block
/// number is mixed in so swapped pages are detected.
pub fn checksum_page(page: &[u8], blkno: u32) -> u16 {
    debug_assert_eq!(page.len(), BLCKSZ as usize);

    let mut copy: Vec<u8> = page.to_vec();
    // zero out pd_checksum (bytes 8..10)
    copy[8] = 0;
    copy[9] = 0;

    let checksum = checksum_block(&copy) ^ blkno;
    ((checksum % 65535) + 1) as u16
}

/// Verify a page's stored checksum. Returns true when checksums are not in
/// use on the page (stored value zero never occurs with checksums enabled).
pub fn verify_page_checksum(page: &[u8], blkno: u32) -> bool {
    let stored = LittleEndian::read_u16(&page[8..10]);
    stored == checksum_page(page, blkno)
}

/// Build a page with a well-formed header, a hole between `lower` and
/// `upper`, and fake tuple data after it. Test fixture for this crate and
/// its dependents.
#[doc(hidden)]
pub fn make_valid_page(lsn: u64, lower: u16, upper: u16) -> Vec<u8> {
    use byteorder::WriteBytesExt;
    let mut page = vec![0u8; BLCKSZ as usize];
    let mut cur = &mut page[..];
    cur.write_u32::<LittleEndian>((lsn >> 32) as u32).unwrap();
    cur.write_u32::<LittleEndian>(lsn as u32).unwrap();
    cur.write_u16::<LittleEndian>(0).unwrap(); // pd_checksum
    cur.write_u16::<LittleEndian>(0).unwrap(); // pd_flags
    cur.write_u16::<LittleEndian>(lower).unwrap();
    cur.write_u16::<LittleEndian>(upper).unwrap();
    cur.write_u16::<LittleEndian>(BLCKSZ).unwrap(); // pd_special == page end
    cur.write_u16::<LittleEndian>(BLCKSZ | 4).unwrap();
    // leave pd_prune_xid zero; fill some fake tuple data after the hole
    for b in page[upper as usize..].iter_mut() {
        *b = 0xAB;
    }
    page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_valid() {
        let page = make_valid_page(0x1_0000_0000, 64, 8000);
        match classify_page(&page, BLCKSZ) {
            PageVerdict::Valid {
                hole_offset,
                hole_length,
            } => {
                assert_eq!(hole_offset, 64);
                assert_eq!(hole_length, 8000 - 64);
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn classify_zero_page() {
        let page = vec![0u8; BLCKSZ as usize];
        assert_eq!(classify_page(&page, BLCKSZ), PageVerdict::New);
    }

    #[test]
    fn classify_garbage() {
        let mut page = vec![0xFFu8; BLCKSZ as usize];
        // bogus pagesize/version
        page[18] = 0x34;
        page[19] = 0x12;
        assert_eq!(classify_page(&page, BLCKSZ), PageVerdict::Invalid);
    }

    #[test]
    fn classify_unknown_layout() {
        let mut page = make_valid_page(0x1000, 64, 8000);
        let psv = BLCKSZ | 9; // unknown layout version 9
        page[18] = (psv & 0xFF) as u8;
        page[19] = (psv >> 8) as u8;
        assert_eq!(classify_page(&page, BLCKSZ), PageVerdict::UnknownLayout);
    }

    #[test]
    fn checksum_detects_change_and_blkno_swap() {
        let mut page = make_valid_page(0x1000, 64, 8000);
        let sum = checksum_page(&page, 7);
        page[8] = (sum & 0xFF) as u8;
        page[9] = (sum >> 8) as u8;
        assert!(verify_page_checksum(&page, 7));
        // a different block number must not verify
        assert!(!verify_page_checksum(&page, 8));
        // a flipped data byte must not verify
        page[5000] ^= 0x01;
        assert!(!verify_page_checksum(&page, 7));
    }
}
