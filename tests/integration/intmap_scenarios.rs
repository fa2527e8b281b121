#![allow(missing_docs)]

use std::sync::Arc;

use sombra_intmap::{
    primitives::pager::{PageCache, PageProvider, PagerOptions},
    storage::intmap::{
        FileHeaderStore, HeaderStore, IntMapOptions, IntToIntBTree, MemHeaderStore, TreeHeader,
    },
    types::{IntMapError, Result},
};
use tempfile::tempdir;

fn four_record_leaves() -> IntMapOptions {
    IntMapOptions::default()
        .node_size(48)
        .storage_page_size(48 * 8)
        .cache_pages(8)
}

#[test]
fn nine_sequential_keys_build_a_two_level_tree() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("nine.idx");
    let mut tree = IntToIntBTree::create(&path, four_record_leaves())?;
    for key in 1..=9 {
        tree.put(key, key * 10)?;
    }
    let stats = tree.statistics()?;
    assert_eq!(stats.height, 2, "stats: {stats:?}");
    assert_eq!(stats.count, 9);

    let mut seen = Vec::new();
    assert!(tree.process_mappings(|key, value| {
        seen.push((key, value));
        true
    })?);
    seen.sort_unstable();
    assert_eq!(seen, (1..=9).map(|k| (k, k * 10)).collect::<Vec<_>>());
    tree.close()?;
    Ok(())
}

#[test]
fn height_forced_to_zero_is_reported_as_corruption() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("tampered.idx");
    {
        let mut tree = IntToIntBTree::create(&path, four_record_leaves())?;
        for key in 1..=9 {
            tree.put(key, key)?;
        }
        tree.close()?;
    }

    let store = FileHeaderStore::for_index(&path);
    let bytes = store.load()?.expect("header written on close");
    let mut header = TreeHeader::decode(&bytes);
    assert_eq!(header.height, 2);
    header.height = 0;
    store.store(&header.encode())?;

    let tree = IntToIntBTree::open(&path, four_record_leaves())?;
    match tree.get(9) {
        Err(IntMapError::CorruptedIndex { file, .. }) => assert_eq!(file, path),
        other => panic!("expected corruption, got {other:?}"),
    }
    Ok(())
}

#[test]
fn counts_and_height_grow_monotonically_across_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("grow.idx");
    let options = four_record_leaves();
    let mut last_height = 0;
    let mut expected = 0;
    for round in 0..4 {
        let mut tree = IntToIntBTree::open(&path, options.clone())?;
        assert_eq!(tree.len(), expected);
        assert!(tree.header().height >= last_height);
        for key in (round * 50 + 1)..=(round * 50 + 50) {
            tree.put(key, -key)?;
            expected += 1;
            assert!(tree.header().height >= last_height);
            last_height = tree.header().height;
        }
        tree.check_consistency()?;
        tree.close()?;
    }
    let tree = IntToIntBTree::open(&path, options)?;
    for key in 1..=200 {
        assert_eq!(tree.get(key)?, Some(-key));
    }
    Ok(())
}

#[test]
fn custom_provider_and_header_store() -> Result<()> {
    let options = IntMapOptions::from_toml_str(
        r#"
        node_size = 272
        storage_page_size = 4352
        cache_pages = 8
        "#,
    )?;
    let cache = Arc::new(PageCache::in_memory(PagerOptions {
        page_size: options.storage_page_size,
        cache_pages: options.cache_pages,
    })?);
    let provider: Arc<dyn PageProvider> = cache.clone();
    let store = MemHeaderStore::new();
    let mut tree = IntToIntBTree::with_parts(provider, Box::new(store.clone()), options)?;
    for key in (-500..500).rev() {
        tree.put(key, key.wrapping_mul(7))?;
    }
    assert!(store.bytes().is_none());
    tree.flush()?;
    let header = TreeHeader::decode(&store.bytes().expect("flushed"));
    // key 0 sits in the header, outside the count
    assert_eq!(header.count, 999);
    assert!(header.has_zero_key);

    let report = tree.check_consistency()?;
    let json = serde_json::to_value(&report).expect("report serializes");
    assert_eq!(json["records"], 999);
    assert_eq!(cache.pinned_frames(), 0);
    Ok(())
}
