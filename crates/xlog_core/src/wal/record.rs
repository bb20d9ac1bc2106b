//! WAL record format and codec.
//!
//! ## Record Format
//!
//! ```text
//! | crc (4) | prev (8) | xid (4) | tot_len (4) | len (4) | rmid (1) | info (1) | pad (6) |
//! | payload (len) | backup block 0 | ... | backup block n |
//! ```
//!
//! A backup block is a 20-byte header (relation, block, hole offset, hole
//! length) followed by the data page minus its hole. The high nibble of
//! `info` belongs to the resource manager; bits `0x08 >> i` flag backup
//! block `i`.
//!
//! The CRC covers the payload, then each backup block, then the header
//! bytes after the CRC field.

use crate::codec::ByteReader;
use crate::error::{WalError, WalResult};
use crate::records::{RM_MAX_ID, RM_XLOG_ID, XLOG_SWITCH};
use crate::types::{Lsn, PageTag, RelFileNode, RmgrId, TransactionId};

/// Size of a record header.
pub const RECORD_HEADER_SIZE: usize = 32;

/// Maximum number of full-page images in one record.
pub const MAX_BKP_BLOCKS: usize = 3;

/// Size of a backup block header.
pub const BKP_BLOCK_HEADER_SIZE: usize = 20;

/// Bits of `info` reserved for the log itself.
pub const XLR_INFO_MASK: u8 = 0x0F;

/// Mask of the backup block flags within `info`.
pub const XLR_BKP_BLOCK_MASK: u8 = 0x0E;

/// Flag bit for backup block `i`.
#[must_use]
pub const fn xlr_bkp_block(i: usize) -> u8 {
    0x08 >> i
}

/// Fixed-size header preceding every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordHeader {
    /// CRC of the record.
    pub crc: u32,
    /// Start of the previous record.
    pub prev: Lsn,
    /// Owning transaction.
    pub xid: TransactionId,
    /// Total length including header and backup blocks.
    pub tot_len: u32,
    /// Payload length.
    pub len: u32,
    /// Resource manager.
    pub rmid: RmgrId,
    /// Op code (high nibble) and backup block flags.
    pub info: u8,
}

impl RecordHeader {
    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut out = [0u8; RECORD_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.crc.to_le_bytes());
        out[4..12].copy_from_slice(&self.prev.as_u64().to_le_bytes());
        out[12..16].copy_from_slice(&self.xid.to_le_bytes());
        out[16..20].copy_from_slice(&self.tot_len.to_le_bytes());
        out[20..24].copy_from_slice(&self.len.to_le_bytes());
        out[24] = self.rmid;
        out[25] = self.info;
        out
    }

    /// Decodes a header from the first [`RECORD_HEADER_SIZE`] bytes.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = ByteReader::new(bytes.get(..RECORD_HEADER_SIZE)?);
        Some(Self {
            crc: r.u32()?,
            prev: Lsn::new(r.u64()?),
            xid: r.u32()?,
            tot_len: r.u32()?,
            len: r.u32()?,
            rmid: r.u8()?,
            info: r.u8()?,
        })
    }

    /// Resource manager op code (the high nibble of `info`).
    #[must_use]
    pub const fn op(&self) -> u8 {
        self.info & !XLR_INFO_MASK
    }

    /// Number of backup blocks flagged in `info`.
    #[must_use]
    pub fn backup_block_count(&self) -> usize {
        (0..MAX_BKP_BLOCKS)
            .filter(|&i| self.info & xlr_bkp_block(i) != 0)
            .count()
    }

    /// Returns true for a segment switch record.
    #[must_use]
    pub const fn is_switch(&self) -> bool {
        self.rmid == RM_XLOG_ID && self.op() == XLOG_SWITCH
    }

    /// Checks the header fields that can be validated before the rest of
    /// the record is read.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` describing the problem.
    pub fn check(&self, lsn: Lsn, data_page_size: u64) -> WalResult<()> {
        if self.tot_len == 0 {
            return Err(WalError::invalid_record(lsn, "record with zero length"));
        }
        if self.rmid > RM_MAX_ID {
            return Err(WalError::invalid_record(
                lsn,
                format!("invalid resource manager ID {}", self.rmid),
            ));
        }
        if self.info & XLR_INFO_MASK & !XLR_BKP_BLOCK_MASK != 0 {
            return Err(WalError::invalid_record(
                lsn,
                format!("invalid info bits {:#04x}", self.info),
            ));
        }
        if self.len == 0 && !self.is_switch() {
            return Err(WalError::invalid_record(lsn, "record with zero payload length"));
        }
        let min = RECORD_HEADER_SIZE as u64 + u64::from(self.len);
        let max = min
            + (self.backup_block_count() as u64) * (BKP_BLOCK_HEADER_SIZE as u64 + data_page_size);
        let tot = u64::from(self.tot_len);
        if tot < min || tot > max {
            return Err(WalError::invalid_record(
                lsn,
                format!("invalid record length {}", self.tot_len),
            ));
        }
        Ok(())
    }
}

/// A hole in a data page that is left out of its backup image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hole {
    /// Offset of the first unused byte.
    pub offset: u16,
    /// Number of unused bytes.
    pub length: u16,
}

/// A data page touched by a record being inserted.
#[derive(Debug, Clone, Copy)]
pub struct TouchedPage<'a> {
    /// Page identity.
    pub tag: PageTag,
    /// LSN of the last record that modified the page.
    pub lsn: Lsn,
    /// Full page contents.
    pub image: &'a [u8],
    /// Unused range that need not be logged.
    pub hole: Hole,
}

impl<'a> TouchedPage<'a> {
    /// Creates a touched page without a hole.
    #[must_use]
    pub const fn new(tag: PageTag, lsn: Lsn, image: &'a [u8]) -> Self {
        Self {
            tag,
            lsn,
            image,
            hole: Hole {
                offset: 0,
                length: 0,
            },
        }
    }

    /// Sets the unused range of the page.
    #[must_use]
    pub const fn with_hole(mut self, offset: u16, length: u16) -> Self {
        self.hole = Hole { offset, length };
        self
    }
}

/// One chunk of record payload.
///
/// A chunk tied to a touched page is dropped from the record when that
/// page is logged as a full image, because the image supersedes it.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    /// Payload bytes.
    pub data: &'a [u8],
    /// Index into the request's touched pages.
    pub page: Option<usize>,
}

/// A record to insert.
#[derive(Debug, Clone)]
pub struct RecordRequest<'a> {
    /// Resource manager.
    pub rmid: RmgrId,
    /// Op code; the low nibble must be zero.
    pub info: u8,
    /// Owning transaction.
    pub xid: TransactionId,
    /// Payload chunks in order.
    pub chunks: Vec<Chunk<'a>>,
    /// Pages the change applies to.
    pub pages: Vec<TouchedPage<'a>>,
}

impl<'a> RecordRequest<'a> {
    /// Starts a request for `rmid` with op code `info`.
    #[must_use]
    pub fn new(rmid: RmgrId, info: u8) -> Self {
        Self {
            rmid,
            info,
            xid: 0,
            chunks: Vec::new(),
            pages: Vec::new(),
        }
    }

    /// Sets the owning transaction.
    #[must_use]
    pub fn xid(mut self, xid: TransactionId) -> Self {
        self.xid = xid;
        self
    }

    /// Appends a payload chunk.
    #[must_use]
    pub fn data(mut self, data: &'a [u8]) -> Self {
        self.chunks.push(Chunk { data, page: None });
        self
    }

    /// Adds a touched page; its index is the number of pages added before.
    #[must_use]
    pub fn page(mut self, page: TouchedPage<'a>) -> Self {
        self.pages.push(page);
        self
    }

    /// Appends a payload chunk superseded by a full image of page `page`.
    #[must_use]
    pub fn page_data(mut self, page: usize, data: &'a [u8]) -> Self {
        self.chunks.push(Chunk {
            data,
            page: Some(page),
        });
        self
    }

    /// Returns true for a segment switch request.
    #[must_use]
    pub fn is_switch(&self) -> bool {
        self.rmid == RM_XLOG_ID && self.info == XLOG_SWITCH
    }

    /// Checks the structural rules every request must satisfy.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest`; these indicate a caller bug.
    pub fn validate(&self, data_page_size: u64) -> WalResult<()> {
        if self.rmid > RM_MAX_ID {
            return Err(WalError::invalid_request(format!(
                "invalid resource manager ID {}",
                self.rmid
            )));
        }
        if self.info & XLR_INFO_MASK != 0 {
            return Err(WalError::invalid_request(format!(
                "invalid xlog info mask {:#04x}",
                self.info
            )));
        }
        if self.pages.len() > MAX_BKP_BLOCKS {
            return Err(WalError::invalid_request(format!(
                "too many backup blocks: {} exceeds {MAX_BKP_BLOCKS}",
                self.pages.len()
            )));
        }
        for (i, page) in self.pages.iter().enumerate() {
            if page.image.len() as u64 != data_page_size {
                return Err(WalError::invalid_request(format!(
                    "page image {i} is {} bytes, expected {data_page_size}",
                    page.image.len()
                )));
            }
            let hole_end = u64::from(page.hole.offset) + u64::from(page.hole.length);
            if hole_end > data_page_size {
                return Err(WalError::invalid_request(format!(
                    "page image {i} hole ends past the page"
                )));
            }
            if self.pages[..i].iter().any(|p| p.tag == page.tag) {
                return Err(WalError::invalid_request(format!(
                    "page {} registered twice",
                    page.tag
                )));
            }
        }
        for chunk in &self.chunks {
            if let Some(p) = chunk.page {
                if p >= self.pages.len() {
                    return Err(WalError::invalid_request(format!(
                        "chunk refers to unregistered page {p}"
                    )));
                }
            }
        }
        let plain: usize = self
            .chunks
            .iter()
            .filter(|c| c.page.is_none())
            .map(|c| c.data.len())
            .sum();
        if self.is_switch() {
            if !self.chunks.is_empty() || !self.pages.is_empty() {
                return Err(WalError::invalid_request("switch record carries no data"));
            }
        } else if plain == 0 {
            return Err(WalError::invalid_request("invalid xlog record length 0"));
        }
        Ok(())
    }
}

/// Record body assembled for insertion, with its partial CRC.
#[derive(Clone)]
pub(crate) struct AssembledBody {
    /// Payload followed by backup blocks.
    pub(crate) bytes: Vec<u8>,
    /// Payload length.
    pub(crate) len: u32,
    /// Backup block flags for `info`.
    pub(crate) bkp_bits: u8,
    /// Which pages were logged as images.
    pub(crate) backed_up: [bool; MAX_BKP_BLOCKS],
    /// CRC state after the body.
    pub(crate) crc: crc32fast::Hasher,
}

impl AssembledBody {
    /// Builds the body given which pages get full images.
    pub(crate) fn assemble(req: &RecordRequest<'_>, backed_up: [bool; MAX_BKP_BLOCKS]) -> Self {
        let mut bytes = Vec::new();
        for chunk in &req.chunks {
            let superseded = chunk.page.is_some_and(|p| backed_up[p]);
            if !superseded {
                bytes.extend_from_slice(chunk.data);
            }
        }
        let len = bytes.len() as u32;

        let mut bkp_bits = 0u8;
        for (i, page) in req.pages.iter().enumerate() {
            if !backed_up[i] {
                continue;
            }
            bkp_bits |= xlr_bkp_block(i);
            let hole = page.hole;
            bytes.extend_from_slice(&page.tag.rel.spc_node.to_le_bytes());
            bytes.extend_from_slice(&page.tag.rel.db_node.to_le_bytes());
            bytes.extend_from_slice(&page.tag.rel.rel_node.to_le_bytes());
            bytes.extend_from_slice(&page.tag.block.to_le_bytes());
            bytes.extend_from_slice(&hole.offset.to_le_bytes());
            bytes.extend_from_slice(&hole.length.to_le_bytes());
            let start = usize::from(hole.offset);
            let end = start + usize::from(hole.length);
            bytes.extend_from_slice(&page.image[..start]);
            bytes.extend_from_slice(&page.image[end..]);
        }

        let mut crc = crc32fast::Hasher::new();
        crc.update(&bytes);
        Self {
            bytes,
            len,
            bkp_bits,
            backed_up,
            crc,
        }
    }

    /// Finishes the record: fills in the CRC and returns the full bytes.
    pub(crate) fn finish(&self, mut header: RecordHeader) -> Vec<u8> {
        header.tot_len = (RECORD_HEADER_SIZE + self.bytes.len()) as u32;
        header.len = self.len;
        header.info |= self.bkp_bits;
        header.crc = 0;
        let encoded = header.encode();
        let mut crc = self.crc.clone();
        crc.update(&encoded[4..]);
        header.crc = crc.finalize();

        let mut out = Vec::with_capacity(header.tot_len as usize);
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&self.bytes);
        out
    }
}

/// A full-page image restored from a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupBlock {
    /// Page identity.
    pub tag: PageTag,
    /// Hole left out of the image.
    pub hole: Hole,
    /// Page bytes without the hole.
    pub image: Vec<u8>,
}

impl BackupBlock {
    /// Rebuilds the full page, zero-filling the hole.
    #[must_use]
    pub fn restore_page(&self) -> Vec<u8> {
        let start = usize::from(self.hole.offset);
        let mut page = Vec::with_capacity(self.image.len() + usize::from(self.hole.length));
        page.extend_from_slice(&self.image[..start]);
        page.resize(start + usize::from(self.hole.length), 0);
        page.extend_from_slice(&self.image[start..]);
        page
    }
}

/// A record read back from the log and validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    /// Where the record starts.
    pub lsn: Lsn,
    /// Where the next record may start.
    pub end_lsn: Lsn,
    /// Record header.
    pub header: RecordHeader,
    /// Payload.
    pub data: Vec<u8>,
    /// Full-page images.
    pub backup_blocks: Vec<BackupBlock>,
}

impl DecodedRecord {
    /// Validates and decodes a complete record image starting at `lsn`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` or `ChecksumMismatch`.
    pub fn decode(lsn: Lsn, end_lsn: Lsn, bytes: &[u8], data_page_size: u64) -> WalResult<Self> {
        let header = RecordHeader::decode(bytes)
            .ok_or_else(|| WalError::invalid_record(lsn, "truncated record header"))?;
        header.check(lsn, data_page_size)?;
        if bytes.len() != header.tot_len as usize {
            return Err(WalError::invalid_record(
                lsn,
                format!(
                    "record length {} does not match {} bytes read",
                    header.tot_len,
                    bytes.len()
                ),
            ));
        }

        let actual = compute_record_crc(bytes);
        if actual != header.crc {
            return Err(WalError::ChecksumMismatch {
                lsn,
                expected: header.crc,
                actual,
            });
        }

        let mut r = ByteReader::new(&bytes[RECORD_HEADER_SIZE..]);
        let data = r
            .bytes(header.len as usize)
            .ok_or_else(|| WalError::invalid_record(lsn, "payload overruns record"))?
            .to_vec();

        let mut backup_blocks = Vec::new();
        for i in 0..MAX_BKP_BLOCKS {
            if header.info & xlr_bkp_block(i) == 0 {
                continue;
            }
            let bad = || WalError::invalid_record(lsn, format!("truncated backup block {i}"));
            let rel = RelFileNode {
                spc_node: r.u32().ok_or_else(bad)?,
                db_node: r.u32().ok_or_else(bad)?,
                rel_node: r.u32().ok_or_else(bad)?,
            };
            let block = r.u32().ok_or_else(bad)?;
            let hole = Hole {
                offset: r.u16().ok_or_else(bad)?,
                length: r.u16().ok_or_else(bad)?,
            };
            if u64::from(hole.offset) + u64::from(hole.length) > data_page_size {
                return Err(WalError::invalid_record(
                    lsn,
                    format!("incorrect hole size in backup block {i}"),
                ));
            }
            let image_len = data_page_size as usize - usize::from(hole.length);
            let image = r.bytes(image_len).ok_or_else(bad)?.to_vec();
            backup_blocks.push(BackupBlock {
                tag: PageTag::new(rel, block),
                hole,
                image,
            });
        }
        if r.remaining() != 0 {
            return Err(WalError::invalid_record(
                lsn,
                "incorrect total length in record",
            ));
        }

        Ok(Self {
            lsn,
            end_lsn,
            header,
            data,
            backup_blocks,
        })
    }

    /// Resource manager of the record.
    #[must_use]
    pub const fn rmid(&self) -> RmgrId {
        self.header.rmid
    }

    /// Op code of the record.
    #[must_use]
    pub const fn op(&self) -> u8 {
        self.header.op()
    }

    /// Owning transaction.
    #[must_use]
    pub const fn xid(&self) -> TransactionId {
        self.header.xid
    }
}

/// Computes a record's CRC from its full image.
#[must_use]
pub fn compute_record_crc(record: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&record[RECORD_HEADER_SIZE..]);
    hasher.update(&record[4..RECORD_HEADER_SIZE]);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RelFileNode;
    use proptest::prelude::*;

    const PAGE: u64 = 8192;

    fn tag(block: u32) -> PageTag {
        PageTag::new(
            RelFileNode {
                spc_node: 1663,
                db_node: 1,
                rel_node: 16384,
            },
            block,
        )
    }

    fn build(req: &RecordRequest<'_>, backed_up: [bool; 3]) -> Vec<u8> {
        let body = AssembledBody::assemble(req, backed_up);
        body.finish(RecordHeader {
            prev: Lsn::new(0x1000),
            xid: req.xid,
            rmid: req.rmid,
            info: req.info,
            ..RecordHeader::default()
        })
    }

    #[test]
    fn header_round_trip() {
        let header = RecordHeader {
            crc: 0xABCD_EF01,
            prev: Lsn::new(0x0100_0028),
            xid: 77,
            tot_len: 64,
            len: 32,
            rmid: 5,
            info: 0x30 | xlr_bkp_block(1),
        };
        let decoded = RecordHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.op(), 0x30);
        assert_eq!(decoded.backup_block_count(), 1);
    }

    #[test]
    fn plain_record_decodes() {
        let req = RecordRequest::new(5, 0x10).xid(9).data(b"hello").data(b" world");
        let bytes = build(&req, [false; 3]);
        let rec = DecodedRecord::decode(Lsn::new(0x2000), Lsn::new(0x2030), &bytes, PAGE).unwrap();
        assert_eq!(rec.data, b"hello world");
        assert_eq!(rec.rmid(), 5);
        assert_eq!(rec.op(), 0x10);
        assert_eq!(rec.xid(), 9);
        assert!(rec.backup_blocks.is_empty());
    }

    #[test]
    fn backup_image_replaces_page_chunk() {
        let mut image = vec![0xAAu8; PAGE as usize];
        image[100..200].fill(0);
        let req = RecordRequest::new(5, 0x20)
            .data(b"header")
            .page(TouchedPage::new(tag(3), Lsn::new(1), &image).with_hole(100, 100))
            .page_data(0, b"tuple delta");

        let bytes = build(&req, [true, false, false]);
        let rec = DecodedRecord::decode(Lsn::new(0x2000), Lsn::new(0x4000), &bytes, PAGE).unwrap();
        assert_eq!(rec.data, b"header");
        assert_eq!(rec.backup_blocks.len(), 1);
        let block = &rec.backup_blocks[0];
        assert_eq!(block.tag, tag(3));
        assert_eq!(block.image.len(), PAGE as usize - 100);
        assert_eq!(block.restore_page(), image);

        let without = build(&req, [false; 3]);
        let rec = DecodedRecord::decode(Lsn::new(0x2000), Lsn::new(0x2040), &without, PAGE).unwrap();
        assert_eq!(rec.data, b"headertuple delta");
    }

    #[test]
    fn crc_detects_any_flip() {
        let req = RecordRequest::new(2, 0).data(b"payload bytes");
        let bytes = build(&req, [false; 3]);
        for i in [0usize, 5, 13, 26, 33, bytes.len() - 1] {
            let mut bad = bytes.clone();
            bad[i] ^= 0x01;
            assert!(
                DecodedRecord::decode(Lsn::new(0x2000), Lsn::new(0x2040), &bad, PAGE).is_err(),
                "flip at {i} went unnoticed"
            );
        }
    }

    #[test]
    fn zero_length_only_for_switch() {
        let switch = RecordRequest::new(RM_XLOG_ID, XLOG_SWITCH);
        assert!(switch.validate(PAGE).is_ok());
        let bytes = build(&switch, [false; 3]);
        let rec = DecodedRecord::decode(Lsn::new(0x2000), Lsn::new(0x4000), &bytes, PAGE).unwrap();
        assert!(rec.header.is_switch());

        let empty = RecordRequest::new(5, 0);
        assert!(matches!(
            empty.validate(PAGE),
            Err(WalError::InvalidRequest { .. })
        ));

        let mut header = RecordHeader::decode(&build(&RecordRequest::new(5, 0).data(b"x"), [false; 3])).unwrap();
        header.len = 0;
        assert!(header.check(Lsn::new(8), PAGE).is_err());
    }

    #[test]
    fn request_validation() {
        let image = vec![0u8; PAGE as usize];
        let short = vec![0u8; 100];
        let too_many = RecordRequest::new(5, 0)
            .data(b"x")
            .page(TouchedPage::new(tag(1), Lsn::INVALID, &image))
            .page(TouchedPage::new(tag(2), Lsn::INVALID, &image))
            .page(TouchedPage::new(tag(3), Lsn::INVALID, &image))
            .page(TouchedPage::new(tag(4), Lsn::INVALID, &image));
        assert!(too_many.validate(PAGE).is_err());

        let wrong_size = RecordRequest::new(5, 0)
            .data(b"x")
            .page(TouchedPage::new(tag(1), Lsn::INVALID, &short));
        assert!(wrong_size.validate(PAGE).is_err());

        let bad_info = RecordRequest::new(5, 0x03).data(b"x");
        assert!(bad_info.validate(PAGE).is_err());

        let bad_rmid = RecordRequest::new(40, 0).data(b"x");
        assert!(bad_rmid.validate(PAGE).is_err());

        let dangling = RecordRequest::new(5, 0).data(b"x").page_data(2, b"y");
        assert!(dangling.validate(PAGE).is_err());
    }

    #[test]
    fn header_check_bounds_total_length() {
        let header = RecordHeader {
            tot_len: 40,
            len: 16,
            rmid: 3,
            ..RecordHeader::default()
        };
        assert!(header.check(Lsn::new(8), PAGE).is_err());
        let header = RecordHeader {
            tot_len: 48,
            len: 16,
            rmid: 3,
            ..RecordHeader::default()
        };
        assert!(header.check(Lsn::new(8), PAGE).is_ok());
    }

    proptest! {
        #[test]
        fn payload_round_trip(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..200), 1..5),
            rmid in 2u8..=31,
            op in 0u8..16,
        ) {
            let mut req = RecordRequest::new(rmid, op << 4);
            for c in &chunks {
                req = req.data(c);
            }
            let bytes = build(&req, [false; 3]);
            let rec = DecodedRecord::decode(Lsn::new(0x2000), Lsn::new(0x9000), &bytes, PAGE).unwrap();
            prop_assert_eq!(&rec.data, &chunks.concat());
            prop_assert_eq!(rec.op(), op << 4);
        }
    }
}
