//! Reading and validating records from segment files.
//!
//! [`WalReader`] walks the log one record at a time, reassembling records
//! that continue across pages and segments. Every page header is checked
//! before its contents are used: magic number, flags, the long header's
//! system identifier and sizes, the page address, and the page's timeline
//! against the history being followed. A record must link back to the one
//! before it. Validation failures end the scan at the last good record;
//! the [`PageSource`] decides whether to try again first.

use crate::config::Geometry;
use crate::error::{WalError, WalResult};
use crate::timeline::TimelineHistory;
use crate::types::{maxalign, Lsn, Outcome, TimeLineId};
use crate::wal::page::{
    decode_cont_header, header_size_at, PageHeader, CONT_RECORD_HEADER_SIZE, XLOG_PAGE_MAGIC,
    XLP_ALL_FLAGS,
};
use crate::wal::record::{DecodedRecord, RecordHeader, RECORD_HEADER_SIZE};
use crate::wal::segment::{open_read_only, segment_file_name};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use xlog_storage::{SegmentOpener, StorageBackend};

/// Supplies log pages to a [`WalReader`].
pub trait PageSource {
    /// Fills `buf` with the page starting at `page_addr`. On success the
    /// page content is valid at least up to `needed_upto`. Returns false
    /// when no more log is available.
    ///
    /// # Errors
    ///
    /// I/O errors, or `Shutdown` while waiting for more log.
    fn read_page(&mut self, page_addr: Lsn, needed_upto: Lsn, buf: &mut [u8]) -> WalResult<bool>;

    /// Told about an invalid record or page at `lsn`. Returning true makes
    /// the reader try the same position again.
    ///
    /// # Errors
    ///
    /// `Shutdown` while waiting for a better copy.
    fn report_invalid(&mut self, _lsn: Lsn, _err: &WalError) -> WalResult<bool> {
        Ok(false)
    }

    /// Called before a read at an explicit position.
    fn reposition(&mut self) {}
}

/// Reads records through a [`PageSource`].
pub struct WalReader<S> {
    source: S,
    geometry: Geometry,
    system_id: Option<u64>,
    history: Option<TimelineHistory>,
    page: Vec<u8>,
    page_addr: Option<Lsn>,
    valid_upto: Lsn,
    last_seen_tli: Option<TimeLineId>,
    read_rec: Lsn,
    end_rec: Lsn,
    end_reason: Option<String>,
}

impl<S: PageSource> WalReader<S> {
    /// Creates a reader. Timelines and the system identifier are not
    /// checked until configured.
    pub fn new(source: S, geometry: Geometry) -> Self {
        Self {
            source,
            geometry,
            system_id: None,
            history: None,
            page: vec![0u8; geometry.page_size as usize],
            page_addr: None,
            valid_upto: Lsn::INVALID,
            last_seen_tli: None,
            read_rec: Lsn::INVALID,
            end_rec: Lsn::INVALID,
            end_reason: None,
        }
    }

    /// Requires long headers to carry `system_id`.
    #[must_use]
    pub fn with_system_id(mut self, system_id: u64) -> Self {
        self.system_id = Some(system_id);
        self
    }

    /// Requires page timelines to belong to `history`.
    #[must_use]
    pub fn with_history(mut self, history: TimelineHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// The page source.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Consumes the reader, returning its source.
    pub fn into_source(self) -> S {
        self.source
    }

    /// Start of the last record returned.
    #[must_use]
    pub fn last_record(&self) -> Lsn {
        self.read_rec
    }

    /// End of the last record returned: where the next one starts.
    #[must_use]
    pub fn end_of_last(&self) -> Lsn {
        self.end_rec
    }

    /// Why the last scan stopped, once it has.
    #[must_use]
    pub fn end_reason(&self) -> Option<&str> {
        self.end_reason.as_deref()
    }

    /// Reads the record at `start`, or the one after the last record read.
    /// Returns `None` at the end of valid log.
    ///
    /// # Errors
    ///
    /// Returns I/O errors and `Shutdown`; validation failures end the scan
    /// instead.
    pub fn read_record(&mut self, start: Option<Lsn>) -> WalResult<Option<DecodedRecord>> {
        if start.is_some() {
            self.source.reposition();
            self.last_seen_tli = None;
            self.page_addr = None;
        }
        let target = start.unwrap_or(self.end_rec);
        loop {
            match self.attempt(target, start.is_some()) {
                Outcome::Done(Some(record)) => {
                    self.read_rec = record.lsn;
                    self.end_rec = record.end_lsn;
                    self.end_reason = None;
                    return Ok(Some(record));
                }
                Outcome::Done(None) => return Ok(None),
                Outcome::Retry => {
                    debug!(lsn = %target, "retrying read after invalid record");
                    self.page_addr = None;
                }
                Outcome::Fatal(err) => return Err(err),
            }
        }
    }

    fn attempt(&mut self, target: Lsn, random: bool) -> Outcome<Option<DecodedRecord>, WalError> {
        match self.fetch(target, random) {
            Ok(Some(record)) => Outcome::Done(Some(record)),
            Ok(None) => {
                self.end_reason = Some(format!("end of available WAL at {target}"));
                Outcome::Done(None)
            }
            Err(err) if err.is_end_of_log() => match self.source.report_invalid(target, &err) {
                Ok(true) => Outcome::Retry,
                Ok(false) => {
                    warn!(lsn = %target, error = %err, "end of valid WAL");
                    self.end_reason = Some(err.to_string());
                    Outcome::Done(None)
                }
                Err(e) => Outcome::Fatal(e),
            },
            Err(err) => Outcome::Fatal(err),
        }
    }

    fn fetch(&mut self, target: Lsn, random: bool) -> WalResult<Option<DecodedRecord>> {
        let page_size = self.geometry.page_size;
        let segment_size = self.geometry.segment_size;

        let mut pos = target;
        if page_size - pos.page_offset(page_size) < RECORD_HEADER_SIZE as u64 {
            pos = Lsn::new(pos.page_start(page_size).as_u64() + page_size);
        }
        if pos.page_offset(page_size) == 0 {
            pos = pos.add(header_size_at(pos, segment_size) as u64);
        }

        let page_addr = pos.page_start(page_size);
        if !self.load_page(page_addr, pos.add(RECORD_HEADER_SIZE as u64))? {
            return Ok(None);
        }
        let header = self.current_header()?;
        if header.is_contrecord() && pos.page_offset(page_size) as usize == header.size() {
            return Err(WalError::invalid_record(
                pos,
                format!("contrecord is requested by {pos}"),
            ));
        }

        let offset = pos.page_offset(page_size) as usize;
        let rec = RecordHeader::decode(&self.page[offset..])
            .ok_or_else(|| WalError::invalid_record(pos, "truncated record header"))?;
        rec.check(pos, self.geometry.data_page_size)?;
        if random {
            if rec.prev >= pos {
                return Err(WalError::invalid_record(
                    pos,
                    format!("record with incorrect prev-link {}", rec.prev),
                ));
            }
        } else if rec.prev != self.read_rec {
            return Err(WalError::invalid_record(
                pos,
                format!(
                    "record with incorrect prev-link {} (expected {})",
                    rec.prev, self.read_rec
                ),
            ));
        }

        let total = rec.tot_len as usize;
        let first = total.min(page_size as usize - offset);
        if !self.load_page(page_addr, pos.add(first as u64))? {
            return Ok(None);
        }
        let mut bytes = Vec::with_capacity(total.min(page_size as usize));
        bytes.extend_from_slice(&self.page[offset..offset + first]);
        let mut end = pos.add(first as u64);

        let mut next_page = page_addr;
        while bytes.len() < total {
            next_page = next_page.add(page_size);
            let rem = total - bytes.len();
            let header_len = header_size_at(next_page, segment_size);
            let data_off = maxalign((header_len + CONT_RECORD_HEADER_SIZE) as u64) as usize;
            let take = rem.min(page_size as usize - data_off);
            if !self.load_page(next_page, next_page.add((data_off + take) as u64))? {
                return Ok(None);
            }
            let cont_page = self.current_header()?;
            if !cont_page.is_contrecord() {
                return Err(WalError::invalid_record(
                    next_page,
                    format!("there is no contrecord flag in log file {}", self.segment_name(next_page, cont_page.tli)),
                ));
            }
            let cont_len = decode_cont_header(&self.page, cont_page.size()).unwrap_or(0);
            if cont_len as usize != rem {
                return Err(WalError::invalid_record(
                    next_page,
                    format!("invalid contrecord length {cont_len} in log file {}", self.segment_name(next_page, cont_page.tli)),
                ));
            }
            bytes.extend_from_slice(&self.page[data_off..data_off + take]);
            end = next_page.add((data_off + take) as u64);
        }

        let mut end = end.align();
        if rec.is_switch() {
            end = Lsn::new((pos.segno(segment_size) + 1) * segment_size);
        }
        DecodedRecord::decode(pos, end, &bytes, self.geometry.data_page_size).map(Some)
    }

    /// Makes the page at `page_addr` current with content valid through
    /// `needed_upto`, validating its header when it is newly read.
    fn load_page(&mut self, page_addr: Lsn, needed_upto: Lsn) -> WalResult<bool> {
        if self.page_addr == Some(page_addr) && self.valid_upto >= needed_upto {
            return Ok(true);
        }
        self.page_addr = None;
        if !self.source.read_page(page_addr, needed_upto, &mut self.page)? {
            return Ok(false);
        }
        self.validate_page_header(page_addr)?;
        self.page_addr = Some(page_addr);
        self.valid_upto = needed_upto;
        Ok(true)
    }

    fn current_header(&self) -> WalResult<PageHeader> {
        PageHeader::decode(&self.page).ok_or_else(|| {
            WalError::invalid_page_header(
                self.page_addr.unwrap_or_default(),
                String::new(),
                "truncated page header",
            )
        })
    }

    fn segment_name(&self, lsn: Lsn, tli: TimeLineId) -> String {
        segment_file_name(tli, lsn.segno(self.geometry.segment_size), &self.geometry)
    }

    fn validate_page_header(&mut self, page_addr: Lsn) -> WalResult<()> {
        let geometry = self.geometry;
        let fallback_tli = self.history.as_ref().map_or(0, TimelineHistory::target);
        let Some(header) = PageHeader::decode(&self.page) else {
            return Err(WalError::invalid_page_header(
                page_addr,
                self.segment_name(page_addr, fallback_tli),
                "truncated page header",
            ));
        };
        let segment = self.segment_name(page_addr, header.tli);
        let bad = |message: String| WalError::invalid_page_header(page_addr, segment.clone(), message);

        if header.magic != XLOG_PAGE_MAGIC {
            return Err(bad(format!("invalid magic number {:04X}", header.magic)));
        }
        if header.info & !XLP_ALL_FLAGS != 0 {
            return Err(bad(format!("invalid info bits {:04X}", header.info)));
        }
        match header.long {
            Some(long) => {
                if let Some(expected) = self.system_id {
                    if long.system_id != expected {
                        return Err(bad(format!(
                            "WAL file is from different system: file identifier {}, control file identifier {expected}",
                            long.system_id
                        )));
                    }
                }
                if u64::from(long.segment_size) != geometry.segment_size {
                    return Err(bad("incorrect segment size in page header".to_string()));
                }
                if u64::from(long.page_size) != geometry.page_size {
                    return Err(bad("incorrect page size in page header".to_string()));
                }
            }
            None if page_addr.segment_offset(geometry.segment_size) == 0 => {
                return Err(bad("missing long header at start of segment".to_string()));
            }
            None => {}
        }
        if header.page_addr != page_addr {
            return Err(bad(format!("unexpected pageaddr {}", header.page_addr)));
        }

        if let Some(history) = &self.history {
            if !history.contains(header.tli) {
                return Err(bad(format!("unexpected timeline ID {}", header.tli)));
            }
            if !history.accepts_page(header.tli, page_addr) {
                return Err(bad(format!(
                    "timeline ID {} is past the point where timeline {} forked off",
                    header.tli,
                    history.target()
                )));
            }
        }

        // Timelines never go back within one forward scan.
        if let Some(seen_tli) = self.last_seen_tli {
            if header.tli < seen_tli {
                return Err(bad(format!(
                    "out-of-sequence timeline ID {} (after {seen_tli})",
                    header.tli
                )));
            }
        }
        self.last_seen_tli = Some(header.tli);
        Ok(())
    }

    /// Returns a copy of the page at `page_addr`, validated like any other
    /// page. Used to reload the last partial page after a scan.
    ///
    /// # Errors
    ///
    /// Returns I/O or validation errors.
    pub fn read_page_image(&mut self, page_addr: Lsn) -> WalResult<Option<Vec<u8>>> {
        let page_end = page_addr.add(self.geometry.page_size);
        self.last_seen_tli = None;
        if !self.load_page(page_addr, page_end)? {
            return Ok(None);
        }
        Ok(Some(self.page.clone()))
    }
}

struct OpenSegment {
    tli: TimeLineId,
    segno: u64,
    backend: Box<dyn StorageBackend>,
    name: String,
}

/// Reads pages from segment files in a list of directories, normally
/// `pg_xlog` followed by the archive.
///
/// For each segment the newest timeline of the history that can contain
/// it is tried first. Once a file of some timeline has been used, older
/// timelines are not considered again.
pub struct SegmentFileSource {
    dirs: Vec<PathBuf>,
    opener: Arc<dyn SegmentOpener>,
    geometry: Geometry,
    history: TimelineHistory,
    open: Option<OpenSegment>,
    cur_file_tli: TimeLineId,
}

impl SegmentFileSource {
    /// Creates a source over `dirs`, searched in order.
    #[must_use]
    pub fn new(
        dirs: Vec<PathBuf>,
        opener: Arc<dyn SegmentOpener>,
        geometry: Geometry,
        history: TimelineHistory,
    ) -> Self {
        Self {
            dirs,
            opener,
            geometry,
            history,
            open: None,
            cur_file_tli: 0,
        }
    }

    /// Directories searched, in order.
    #[must_use]
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Layout sizes.
    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// The history whose timelines are searched.
    #[must_use]
    pub fn history(&self) -> &TimelineHistory {
        &self.history
    }

    /// Timeline of the file pages were last read from.
    #[must_use]
    pub fn current_file_tli(&self) -> TimeLineId {
        self.cur_file_tli
    }

    /// Finds the file holding segment `segno` without opening it for use.
    /// Returns its timeline and path.
    #[must_use]
    pub fn locate(&self, segno: u64) -> Option<(TimeLineId, PathBuf)> {
        self.candidates(segno).into_iter().find(|(_, path)| path.exists())
    }

    fn candidates(&self, segno: u64) -> Vec<(TimeLineId, PathBuf)> {
        let seg_start = Lsn::new(segno * self.geometry.segment_size);
        let mut out = Vec::new();
        for tli in self.history.expected_tlis() {
            if tli < self.cur_file_tli {
                break;
            }
            if self.history.end_of(tli).is_some_and(|end| end <= seg_start) {
                continue;
            }
            let name = segment_file_name(tli, segno, &self.geometry);
            for dir in &self.dirs {
                out.push((tli, dir.join(&name)));
            }
        }
        out
    }

    /// Drops the open file so the next read searches again.
    pub fn close(&mut self) {
        self.open = None;
    }

    fn open_segment(&mut self, segno: u64) -> WalResult<bool> {
        for (tli, path) in self.candidates(segno) {
            if let Some(backend) = open_read_only(&*self.opener, &path)? {
                let name = segment_file_name(tli, segno, &self.geometry);
                debug!(segment = %name, path = %path.display(), "opened log file for reading");
                self.cur_file_tli = tli;
                self.open = Some(OpenSegment {
                    tli,
                    segno,
                    backend,
                    name,
                });
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl PageSource for SegmentFileSource {
    fn read_page(&mut self, page_addr: Lsn, _needed_upto: Lsn, buf: &mut [u8]) -> WalResult<bool> {
        let segno = page_addr.segno(self.geometry.segment_size);
        let reusable = self
            .open
            .as_ref()
            .is_some_and(|o| o.segno == segno && o.tli >= self.cur_file_tli);
        if !reusable {
            self.open = None;
            if !self.open_segment(segno)? {
                return Ok(false);
            }
        }
        let Some(open) = self.open.as_ref() else {
            return Ok(false);
        };
        let offset = page_addr.segment_offset(self.geometry.segment_size);
        let data = open
            .backend
            .read_at(offset, buf.len())
            .map_err(|e| WalError::segment_io("read from", open.name.clone(), e))?;
        if data.len() != buf.len() {
            return Ok(false);
        }
        buf.copy_from_slice(&data);
        Ok(true)
    }

    fn reposition(&mut self) {
        self.cur_file_tli = 0;
        self.open = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::page::XLP_FIRST_IS_CONTRECORD;
    use crate::wal::record::{AssembledBody, RecordRequest};

    const PAGE: u64 = 1024;
    const SEG: u64 = 8 * 1024;

    fn geometry() -> Geometry {
        Geometry {
            page_size: PAGE,
            segment_size: SEG,
            data_page_size: 512,
        }
    }

    /// Pages held in memory, built by a minimal writer that follows the
    /// same layout rules as the inserter.
    #[derive(Default)]
    struct MemPages {
        pages: std::collections::BTreeMap<u64, Vec<u8>>,
    }

    impl PageSource for MemPages {
        fn read_page(&mut self, page_addr: Lsn, _needed: Lsn, buf: &mut [u8]) -> WalResult<bool> {
            match self.pages.get(&page_addr.as_u64()) {
                Some(page) => {
                    buf.copy_from_slice(page);
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    struct Builder {
        pages: MemPages,
        pos: Lsn,
        prev: Lsn,
        tli: TimeLineId,
    }

    impl Builder {
        fn new(start: Lsn) -> Self {
            let mut b = Self {
                pages: MemPages::default(),
                pos: start,
                prev: Lsn::INVALID,
                tli: 1,
            };
            b.new_page(start.page_start(PAGE), None);
            b.pos = start.max(start.page_start(PAGE).add(header_size_at(start, SEG) as u64));
            b
        }

        fn new_page(&mut self, addr: Lsn, cont: Option<u32>) -> usize {
            let mut page = vec![0u8; PAGE as usize];
            let mut header = PageHeader::new(addr, self.tli, 7, &geometry());
            let mut off = header.size();
            if let Some(rem) = cont {
                header.info |= XLP_FIRST_IS_CONTRECORD;
                crate::wal::page::encode_cont_header(&mut page, header.size(), rem);
                off += CONT_RECORD_HEADER_SIZE;
            }
            header.encode_into(&mut page);
            self.pages.pages.insert(addr.as_u64(), page);
            maxalign(off as u64) as usize
        }

        fn add(&mut self, payload: &[u8]) -> Lsn {
            let req = RecordRequest::new(5, 0x10).data(payload);
            let body = AssembledBody::assemble(&req, [false; 3]);
            if PAGE - self.pos.page_offset(PAGE) < RECORD_HEADER_SIZE as u64 {
                let next = self.pos.page_start(PAGE).add(PAGE);
                let off = self.new_page(next, None);
                self.pos = next.add(off as u64);
            }
            let start = self.pos;
            let bytes = body.finish(RecordHeader {
                prev: self.prev,
                rmid: 5,
                info: 0x10,
                ..RecordHeader::default()
            });
            let mut rest = &bytes[..];
            loop {
                let addr = self.pos.page_start(PAGE);
                let off = self.pos.page_offset(PAGE) as usize;
                let n = rest.len().min(PAGE as usize - off);
                let page = self.pages.pages.get_mut(&addr.as_u64()).unwrap();
                page[off..off + n].copy_from_slice(&rest[..n]);
                rest = &rest[n..];
                self.pos = self.pos.add(n as u64);
                if rest.is_empty() {
                    break;
                }
                let next = addr.add(PAGE);
                let data_off = self.new_page(next, Some(rest.len() as u32));
                self.pos = next.add(data_off as u64);
            }
            self.pos = Lsn::new(maxalign(self.pos.as_u64()).min(self.pos.page_start(PAGE).as_u64() + PAGE));
            if self.pos.page_offset(PAGE) == 0 {
                let off = self.new_page(self.pos, None);
                self.pos = self.pos.add(off as u64);
            }
            self.prev = start;
            start
        }
    }

    #[test]
    fn reads_records_spanning_pages_and_segments() {
        let mut b = Builder::new(Lsn::new(SEG));
        let first = b.add(b"small");
        let big: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let second = b.add(&big);
        let huge: Vec<u8> = vec![0x5A; 9000];
        let third = b.add(&huge);

        let mut reader = WalReader::new(b.pages, geometry())
            .with_system_id(7)
            .with_history(TimelineHistory::root(1));
        let r1 = reader.read_record(Some(first)).unwrap().unwrap();
        assert_eq!(r1.data, b"small");
        let r2 = reader.read_record(None).unwrap().unwrap();
        assert_eq!(r2.lsn, second);
        assert_eq!(r2.data, big);
        let r3 = reader.read_record(None).unwrap().unwrap();
        assert_eq!(r3.lsn, third);
        assert_eq!(r3.data, huge);
        assert!(r3.end_lsn.segno(SEG) > third.segno(SEG));
        assert!(reader.read_record(None).unwrap().is_none());
        assert!(reader.end_reason().is_some());
        assert_eq!(reader.last_record(), third);
    }

    #[test]
    fn corrupted_record_ends_scan() {
        let mut b = Builder::new(Lsn::new(SEG));
        let first = b.add(b"one");
        let second = b.add(b"two");
        let page = b.pages.pages.get_mut(&second.page_start(PAGE).as_u64()).unwrap();
        page[second.page_offset(PAGE) as usize + RECORD_HEADER_SIZE] ^= 0xFF;

        let mut reader = WalReader::new(b.pages, geometry());
        assert!(reader.read_record(Some(first)).unwrap().is_some());
        assert!(reader.read_record(None).unwrap().is_none());
        assert!(reader.end_reason().unwrap().contains("checksum"));
        assert_eq!(reader.end_of_last(), second);
    }

    #[test]
    fn foreign_system_and_timeline_rejected() {
        let mut b = Builder::new(Lsn::new(SEG));
        let first = b.add(b"one");

        let mut reader = WalReader::new(b.pages, geometry()).with_system_id(8);
        assert!(reader.read_record(Some(first)).unwrap().is_none());
        assert!(reader.end_reason().unwrap().contains("different system"));

        let mut b = Builder::new(Lsn::new(SEG));
        b.tli = 3;
        let first = b.add(b"one");
        let mut reader = WalReader::new(b.pages, geometry()).with_history(TimelineHistory::root(2));
        assert!(reader.read_record(Some(first)).unwrap().is_none());
        assert!(reader.end_reason().unwrap().contains("unexpected timeline ID"));
    }

    #[test]
    fn oversized_length_waits_for_missing_pages() {
        let mut b = Builder::new(Lsn::new(SEG));
        let first = b.add(b"one");
        let second = b.add(b"two");
        let page = b.pages.pages.get_mut(&second.page_start(PAGE).as_u64()).unwrap();
        let at = second.page_offset(PAGE) as usize;
        let len = u32::MAX - 64;
        page[at + 16..at + 20].copy_from_slice(&(len + RECORD_HEADER_SIZE as u32).to_le_bytes());
        page[at + 20..at + 24].copy_from_slice(&len.to_le_bytes());

        let mut reader = WalReader::new(b.pages, geometry());
        assert!(reader.read_record(Some(first)).unwrap().is_some());
        assert!(reader.read_record(None).unwrap().is_none());
        assert!(reader.end_reason().unwrap().contains("end of available WAL"));
        assert_eq!(reader.end_of_last(), second);
    }

    #[test]
    fn timeline_going_back_across_segments_ends_scan() {
        let mut b = Builder::new(Lsn::new(SEG));
        b.tli = 2;
        b.pages.pages.clear();
        b.new_page(Lsn::new(SEG), None);
        let huge = vec![0x11; 9000];
        let first = b.add(&huge);
        let tail = b.add(b"tail");
        assert!(tail.segno(SEG) > first.segno(SEG));

        // Restamp the second segment with an older timeline.
        for (addr, page) in b.pages.pages.iter_mut() {
            if Lsn::new(*addr).segno(SEG) > first.segno(SEG) {
                page[4..8].copy_from_slice(&1u32.to_le_bytes());
            }
        }

        let mut reader = WalReader::new(b.pages, geometry());
        assert!(reader.read_record(Some(first)).unwrap().is_none());
        assert!(reader.end_reason().unwrap().contains("out-of-sequence timeline"));

        // Repositioning starts a new scan.
        let rec = reader.read_record(Some(tail)).unwrap().unwrap();
        assert_eq!(rec.data, b"tail");
    }

    #[test]
    fn broken_prev_link_ends_sequential_scan() {
        let mut b = Builder::new(Lsn::new(SEG));
        let first = b.add(b"one");
        b.prev = Lsn::new(0x40);
        b.add(b"two");
        let mut reader = WalReader::new(b.pages, geometry());
        assert!(reader.read_record(Some(first)).unwrap().is_some());
        assert!(reader.read_record(None).unwrap().is_none());
        assert!(reader.end_reason().unwrap().contains("prev-link"));
    }

    #[test]
    fn retry_after_report() {
        struct Flaky {
            inner: MemPages,
            fixed: Option<Vec<u8>>,
            addr: u64,
        }
        impl PageSource for Flaky {
            fn read_page(&mut self, a: Lsn, n: Lsn, buf: &mut [u8]) -> WalResult<bool> {
                self.inner.read_page(a, n, buf)
            }
            fn report_invalid(&mut self, _lsn: Lsn, _err: &WalError) -> WalResult<bool> {
                match self.fixed.take() {
                    Some(page) => {
                        self.inner.pages.insert(self.addr, page);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
        }

        let mut b = Builder::new(Lsn::new(SEG));
        let first = b.add(b"one");
        let addr = first.page_start(PAGE).as_u64();
        let good = b.pages.pages[&addr].clone();
        b.pages.pages.get_mut(&addr).unwrap()[0] = 0;
        let mut reader = WalReader::new(
            Flaky {
                inner: b.pages,
                fixed: Some(good),
                addr,
            },
            geometry(),
        );
        let rec = reader.read_record(Some(first)).unwrap().unwrap();
        assert_eq!(rec.data, b"one");
    }
}
