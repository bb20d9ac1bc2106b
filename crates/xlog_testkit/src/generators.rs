//! Property-based test generators using proptest.
//!
//! Provides strategies for record payloads and data pages sized for the
//! small test geometry.

use crate::fixtures::SMALL_DATA_PAGE_SIZE;
use proptest::prelude::*;
use xlog_core::{PageTag, RelFileNode};

/// Strategy for a record payload. Sizes range from a single byte to several log
/// pages so that records cross page and segment boundaries.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        4 => prop::collection::vec(any::<u8>(), 1..64),
        2 => prop::collection::vec(any::<u8>(), 64..1024),
        1 => prop::collection::vec(any::<u8>(), 1024..5000),
    ]
}

/// Strategy for a batch of payloads.
pub fn payload_batch_strategy(max: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(payload_strategy(), 1..max)
}

/// Strategy for a page tag in a handful of relations.
pub fn page_tag_strategy() -> impl Strategy<Value = PageTag> {
    (1u32..4, 0u32..16).prop_map(|(rel, block)| {
        PageTag::new(
            RelFileNode {
                spc_node: 1663,
                db_node: 1,
                rel_node: 16384 + rel,
            },
            block,
        )
    })
}

/// Strategy for a data page image of the small test geometry, with an
/// optional hole `(offset, length)` inside it.
pub fn page_image_strategy() -> impl Strategy<Value = (Vec<u8>, u16, u16)> {
    let size = SMALL_DATA_PAGE_SIZE as usize;
    (prop::collection::vec(1u8..=255, size), 0..size / 2, 0..size / 2).prop_map(
        move |(mut image, offset, length)| {
            image[offset..offset + length].fill(0);
            (image, offset as u16, length as u16)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn page_images_have_zeroed_holes() {
        let mut runner = TestRunner::default();
        for _ in 0..32 {
            let (image, offset, length) = page_image_strategy()
                .new_tree(&mut runner)
                .unwrap()
                .current();
            assert_eq!(image.len(), SMALL_DATA_PAGE_SIZE as usize);
            let hole = &image[usize::from(offset)..usize::from(offset) + usize::from(length)];
            assert!(hole.iter().all(|&b| b == 0));
        }
    }
}
