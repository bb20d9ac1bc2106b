//! Full-page images: the first change to a page after a checkpoint logs
//! the whole page, and replay puts it back.

use std::sync::Arc;
use xlog_core::{Lsn, PageTag, RelFileNode};
use xlog_testkit::prelude::*;

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

/// A page image with a zeroed hole at 100..150.
fn image(fill: u8) -> Vec<u8> {
    let mut page = vec![fill; SMALL_DATA_PAGE_SIZE as usize];
    page[100..150].fill(0);
    page
}

fn collab_with_store() -> (Collaborators, Arc<RecordingRmgr>, Arc<MemoryPageStore>) {
    let (collab, rmgr) = recording_collab();
    let store = MemoryPageStore::new();
    (collab.page_store(store.clone()), rmgr, store)
}

fn touch(wal: &WalManager, page: &[u8], page_lsn: Lsn, plain: &[u8], delta: &[u8]) -> xlog_core::Inserted {
    wal.insert_record(
        &RecordRequest::new(TEST_RMGR_ID, TEST_OP_WRITE)
            .xid(1)
            .data(plain)
            .page(TouchedPage::new(tag(7), page_lsn, page).with_hole(100, 50))
            .page_data(0, delta),
    )
    .unwrap()
}

#[test]
fn test_first_touch_is_imaged_and_restored() {
    let cluster = TestCluster::new();
    let wal = cluster.open();
    let page = image(0x5A);
    let first = touch(&wal, &page, Lsn::INVALID, b"first", b"delta one");
    let second = touch(&wal, &page, first.end_lsn, b"second", b"delta two");
    wal.flush_through(second.end_lsn).unwrap();
    cluster.crash(wal);

    let (collab, rmgr, store) = collab_with_store();
    let _wal = cluster.open_with(collab);
    assert_eq!(store.restores(), 1);
    assert_eq!(store.page(&tag(7)), Some((first.lsn, page)));

    let redone = rmgr.redone();
    assert_eq!(redone.len(), 2);
    // The image supersedes the page's own payload.
    assert_eq!(redone[0].data, b"first");
    assert_eq!(redone[1].data, b"seconddelta two");
}

#[test]
fn test_checkpoint_makes_pages_image_again() {
    let cluster = TestCluster::new();
    let wal = cluster.open();
    let page = image(0x11);
    let first = touch(&wal, &page, Lsn::INVALID, b"a", b"x");
    wal.checkpoint(false, true).unwrap();
    assert!(wal.redo_pointer() > first.end_lsn);

    let updated = image(0x22);
    let third = touch(&wal, &updated, first.end_lsn, b"b", b"y");
    wal.flush_through(third.end_lsn).unwrap();
    cluster.crash(wal);

    let (collab, rmgr, store) = collab_with_store();
    let _wal = cluster.open_with(collab);
    assert_eq!(store.restores(), 1);
    assert_eq!(store.page(&tag(7)), Some((third.lsn, updated)));
    assert_eq!(rmgr.payloads(), vec![b"b".to_vec()]);
}

#[test]
fn test_no_images_without_full_page_writes() {
    let cluster = TestCluster::with_config(small_config().full_page_writes(false));
    let wal = cluster.open();
    let page = image(0x33);
    let first = touch(&wal, &page, Lsn::INVALID, b"plain", b"+delta");
    wal.flush_through(first.end_lsn).unwrap();
    cluster.crash(wal);

    let (collab, rmgr, store) = collab_with_store();
    let _wal = cluster.open_with(collab);
    assert_eq!(store.restores(), 0);
    assert_eq!(rmgr.payloads(), vec![b"plain+delta".to_vec()]);
}

#[test]
fn test_image_makes_record_larger() {
    let cluster = TestCluster::new();
    let wal = cluster.open();
    let page = image(0x44);
    let imaged = touch(&wal, &page, Lsn::INVALID, b"p", b"d");
    let plain = touch(&wal, &page, imaged.end_lsn, b"p", b"d");
    let imaged_len = imaged.end_lsn.as_u64() - imaged.lsn.as_u64();
    let plain_len = plain.end_lsn.as_u64() - plain.lsn.as_u64();
    // The 50-byte hole is left out of the image.
    assert!(imaged_len >= plain_len + u64::from(SMALL_DATA_PAGE_SIZE) - 50 - 8);
    wal.shutdown().unwrap();
}

#[test]
fn test_replaying_twice_leaves_pages_unchanged() {
    let cluster = TestCluster::new();
    let wal = cluster.open();
    let page = image(0x3C);
    let first = touch(&wal, &page, Lsn::INVALID, b"first", b"delta one");
    let second = touch(&wal, &page, first.end_lsn, b"second", b"delta two");
    wal.flush_through(second.end_lsn).unwrap();
    cluster.crash(wal);
    let base = cluster.scratch("crashed");
    cluster.copy_data_dir(&base);

    let (collab, rmgr, store) = collab_with_store();
    let wal = cluster.open_with(collab);
    let once = store.page(&tag(7));
    let end_once = wal.startup_report().end_of_log;
    cluster.crash(wal);

    // Same store again: the image is replayed over itself.
    cluster.restore_data_dir(&base);
    let (collab, again_rmgr) = recording_collab();
    let wal = cluster.open_with(collab.page_store(store.clone()));
    assert_eq!(store.page(&tag(7)), once);
    assert_eq!(store.restores(), 2);
    assert_eq!(wal.startup_report().end_of_log, end_once);
    cluster.crash(wal);

    let lsns = |r: &RecordingRmgr| r.redone().iter().map(|d| (d.lsn, d.data.clone())).collect::<Vec<_>>();
    assert_eq!(lsns(again_rmgr.as_ref()), lsns(rmgr.as_ref()));
    assert_eq!(once, Some((first.lsn, page)));
}
