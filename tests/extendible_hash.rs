#![cfg(not(loom))]

use page_cache::extendible_hash::ExtendibleHashTable;

#[test]
fn test_bulk_insert_find_remove() {
    let table = ExtendibleHashTable::<u64, u64>::new(4);

    for k in 0..1000u64 {
        table.insert(k, k * 2 + 1);
    }
    assert_eq!(table.len(), 1000);
    assert!(table.global_depth() > 0);
    assert!(table.num_buckets() > 1);
    for k in 0..1000u64 {
        assert_eq!(table.find(k), Some(k * 2 + 1));
    }

    for k in 0..500u64 {
        table.insert(k, k);
    }
    assert_eq!(table.len(), 1000);
    assert_eq!(table.find(123), Some(123));

    for k in 0..500u64 {
        assert!(table.remove(k));
        assert_eq!(table.find(k), None);
    }
    assert!(!table.remove(42));
    assert_eq!(table.len(), 500);
    for k in 500..1000u64 {
        assert_eq!(table.find(k), Some(k * 2 + 1));
    }
}

#[test]
fn test_global_depth_is_monotonic() {
    let table = ExtendibleHashTable::<u64, u64>::new(2);
    let mut last = table.global_depth();
    for k in 0..256u64 {
        table.insert(k, k);
        let depth = table.global_depth();
        assert!(depth >= last);
        last = depth;
    }
}
