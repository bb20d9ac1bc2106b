//! WAL page headers.
//!
//! Every WAL page starts with a header; the first page of each segment
//! carries the long form, which also identifies the cluster and the layout
//! sizes so that a segment file can be validated on its own.
//!
//! ```text
//! short: | magic (2) | info (2) | tli (4) | page_addr (8) |
//! long:  | short header | system_id (8) | segment_size (4) | page_size (4) |
//! ```
//!
//! A page whose first bytes continue a record from the previous page has
//! `FIRST_IS_CONTRECORD` set and a continuation header (bytes remaining,
//! padded to the alignment) right after the page header.

use crate::codec::ByteReader;
use crate::config::Geometry;
use crate::types::{maxalign, Lsn, TimeLineId};

/// Magic number identifying a WAL page of this format.
pub const XLOG_PAGE_MAGIC: u16 = 0xD066;

/// Size of a short page header.
pub const SHORT_PAGE_HEADER_SIZE: usize = 16;

/// Size of a long page header.
pub const LONG_PAGE_HEADER_SIZE: usize = 32;

/// Size of a continuation header, including alignment padding.
pub const CONT_RECORD_HEADER_SIZE: usize = 8;

/// The first data on the page continues a record from an earlier page.
pub const XLP_FIRST_IS_CONTRECORD: u16 = 0x0001;

/// The page carries a long header.
pub const XLP_LONG_HEADER: u16 = 0x0002;

/// All defined page flags.
pub const XLP_ALL_FLAGS: u16 = 0x0003;

/// Extra fields of a long page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongHeader {
    /// Cluster identity.
    pub system_id: u64,
    /// Segment size the file was written with.
    pub segment_size: u32,
    /// Page size the file was written with.
    pub page_size: u32,
}

/// A decoded WAL page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Magic number.
    pub magic: u16,
    /// Flags.
    pub info: u16,
    /// Timeline the page was written on.
    pub tli: TimeLineId,
    /// LSN of the first byte of the page.
    pub page_addr: Lsn,
    /// Present on the first page of a segment.
    pub long: Option<LongHeader>,
}

impl PageHeader {
    /// Returns the header a fresh page at `page_addr` gets.
    #[must_use]
    pub fn new(page_addr: Lsn, tli: TimeLineId, system_id: u64, geometry: &Geometry) -> Self {
        let long = (page_addr.segment_offset(geometry.segment_size) == 0).then_some(LongHeader {
            system_id,
            segment_size: geometry.segment_size as u32,
            page_size: geometry.page_size as u32,
        });
        Self {
            magic: XLOG_PAGE_MAGIC,
            info: if long.is_some() { XLP_LONG_HEADER } else { 0 },
            tli,
            page_addr,
            long,
        }
    }

    /// Size of this header on the page.
    #[must_use]
    pub const fn size(&self) -> usize {
        if self.long.is_some() {
            LONG_PAGE_HEADER_SIZE
        } else {
            SHORT_PAGE_HEADER_SIZE
        }
    }

    /// Returns true if the first data continues an earlier record.
    #[must_use]
    pub const fn is_contrecord(&self) -> bool {
        self.info & XLP_FIRST_IS_CONTRECORD != 0
    }

    /// Writes the header to the start of `page`.
    pub fn encode_into(&self, page: &mut [u8]) {
        page[0..2].copy_from_slice(&self.magic.to_le_bytes());
        page[2..4].copy_from_slice(&self.info.to_le_bytes());
        page[4..8].copy_from_slice(&self.tli.to_le_bytes());
        page[8..16].copy_from_slice(&self.page_addr.as_u64().to_le_bytes());
        if let Some(long) = self.long {
            page[16..24].copy_from_slice(&long.system_id.to_le_bytes());
            page[24..28].copy_from_slice(&long.segment_size.to_le_bytes());
            page[28..32].copy_from_slice(&long.page_size.to_le_bytes());
        }
    }

    /// Decodes the header at the start of `page`. Field values are not
    /// validated here.
    #[must_use]
    pub fn decode(page: &[u8]) -> Option<Self> {
        let mut r = ByteReader::new(page);
        let magic = r.u16()?;
        let info = r.u16()?;
        let tli = r.u32()?;
        let page_addr = Lsn::new(r.u64()?);
        let long = if info & XLP_LONG_HEADER != 0 {
            Some(LongHeader {
                system_id: r.u64()?,
                segment_size: r.u32()?,
                page_size: r.u32()?,
            })
        } else {
            None
        };
        Some(Self {
            magic,
            info,
            tli,
            page_addr,
            long,
        })
    }
}

/// Size of the page header a page at `page_addr` carries.
#[must_use]
pub const fn header_size_at(page_addr: Lsn, segment_size: u64) -> usize {
    if page_addr.segment_offset(segment_size) == 0 {
        LONG_PAGE_HEADER_SIZE
    } else {
        SHORT_PAGE_HEADER_SIZE
    }
}

/// Writes a continuation header at `offset` on `page`.
pub fn encode_cont_header(page: &mut [u8], offset: usize, rem_len: u32) {
    page[offset..offset + 4].copy_from_slice(&rem_len.to_le_bytes());
    page[offset + 4..offset + CONT_RECORD_HEADER_SIZE].fill(0);
}

/// Reads a continuation header at `offset` on `page`.
#[must_use]
pub fn decode_cont_header(page: &[u8], offset: usize) -> Option<u32> {
    let bytes = page.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

/// Bytes of data that fit on a page after its headers.
#[must_use]
pub const fn usable_bytes(page_size: u64, header: usize, contrecord: bool) -> u64 {
    let cont = if contrecord {
        CONT_RECORD_HEADER_SIZE
    } else {
        0
    };
    page_size - maxalign((header + cont) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            page_size: 8192,
            segment_size: 64 * 1024,
            data_page_size: 8192,
        }
    }

    #[test]
    fn first_page_of_segment_is_long() {
        let g = geometry();
        let first = PageHeader::new(Lsn::new(64 * 1024), 1, 42, &g);
        assert_eq!(first.size(), LONG_PAGE_HEADER_SIZE);
        assert_eq!(first.info, XLP_LONG_HEADER);

        let second = PageHeader::new(Lsn::new(64 * 1024 + 8192), 1, 42, &g);
        assert_eq!(second.size(), SHORT_PAGE_HEADER_SIZE);
        assert!(second.long.is_none());
        assert_eq!(header_size_at(Lsn::new(64 * 1024 + 8192), g.segment_size), 16);
    }

    #[test]
    fn header_round_trip() {
        let g = geometry();
        let mut page = vec![0u8; 8192];
        let mut header = PageHeader::new(Lsn::new(128 * 1024), 3, 0xFEED, &g);
        header.info |= XLP_FIRST_IS_CONTRECORD;
        header.encode_into(&mut page);

        let decoded = PageHeader::decode(&page).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_contrecord());
        assert_eq!(decoded.long.unwrap().system_id, 0xFEED);
    }

    #[test]
    fn cont_header_round_trip() {
        let mut page = vec![0xFFu8; 64];
        encode_cont_header(&mut page, 16, 12345);
        assert_eq!(decode_cont_header(&page, 16), Some(12345));
        assert_eq!(&page[20..24], &[0, 0, 0, 0]);
    }

    #[test]
    fn usable_space() {
        assert_eq!(usable_bytes(8192, 16, false), 8176);
        assert_eq!(usable_bytes(8192, 16, true), 8168);
        assert_eq!(usable_bytes(8192, 32, true), 8152);
    }
}
