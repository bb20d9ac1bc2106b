//! Property tests: whatever sequence of records is flushed comes back from
//! crash recovery unchanged and in order.

use proptest::prelude::*;
use xlog_testkit::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn flushed_records_replay_in_order(payloads in payload_batch_strategy(40)) {
        let cluster = TestCluster::new();
        let wal = cluster.open();
        let mut end = Lsn::INVALID;
        for (i, payload) in payloads.iter().enumerate() {
            end = records::write(&wal, i as u32 + 1, payload);
        }
        wal.flush_through(end).unwrap();
        cluster.crash(wal);

        let (collab, rmgr) = recording_collab();
        let wal = cluster.open_with(collab);
        prop_assert_eq!(rmgr.payloads(), payloads);
        prop_assert_eq!(wal.startup_report().end_of_log, end);
    }

    #[test]
    fn page_images_restore_exactly(
        tag in page_tag_strategy(),
        (image, offset, length) in page_image_strategy(),
    ) {
        let cluster = TestCluster::new();
        let wal = cluster.open();
        let inserted = wal
            .insert_record(
                &RecordRequest::new(TEST_RMGR_ID, TEST_OP_WRITE)
                    .data(b"change")
                    .page(TouchedPage::new(tag, Lsn::INVALID, &image).with_hole(offset, length)),
            )
            .unwrap();
        wal.flush_through(inserted.end_lsn).unwrap();
        cluster.crash(wal);

        let (collab, _) = recording_collab();
        let store = MemoryPageStore::new();
        let _wal = cluster.open_with(collab.page_store(store.clone()));
        prop_assert_eq!(store.page(&tag), Some((inserted.lsn, image)));
    }
}
