#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::sync::Arc;

use rm_cloud::NodeId;
use rm_fs::fs::inode_table::{FIRST_DYNAMIC_INODE, InodeTable};
use rm_fs::fs::{MODE_INODE, ROOT_INODE, TRASH_INODE};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reserved_inodes_are_premapped() {
    let table = InodeTable::new();
    assert_eq!(table.resolve(ROOT_INODE), Some(NodeId::root()));
    assert_eq!(table.resolve(TRASH_INODE), Some(NodeId::trash()));
    assert_eq!(table.resolve(MODE_INODE), None, ".mode has no node behind it");
    assert_eq!(table.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn allocate_is_idempotent_and_starts_after_reserved() {
    let table = InodeTable::new();
    let a = NodeId::from("a");
    let first = table.allocate(&a);
    assert_eq!(first, FIRST_DYNAMIC_INODE);
    assert_eq!(table.allocate(&a), first, "same id must keep its inode");
    assert_eq!(table.allocate(&NodeId::from("b")), first + 1);
    assert_eq!(table.allocate(&NodeId::root()), ROOT_INODE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retired_inodes_are_never_reused() {
    let table = InodeTable::new();
    let a = NodeId::from("a");
    let old = table.allocate(&a);

    assert_eq!(table.retire(&a), Some(old));
    assert_eq!(table.resolve(old), None);
    assert_eq!(table.resolve_id(&a), None);

    let fresh = table.allocate(&a);
    assert_ne!(fresh, old, "a returning node gets a new number");
    assert!(fresh > old);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reserved_entries_cannot_be_retired() {
    let table = InodeTable::new();
    assert_eq!(table.retire(&NodeId::root()), None);
    assert_eq!(table.retire(&NodeId::trash()), None);
    assert_eq!(table.resolve(ROOT_INODE), Some(NodeId::root()));
    assert_eq!(table.resolve(TRASH_INODE), Some(NodeId::trash()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_allocations_agree() {
    let table = Arc::new(InodeTable::new());
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let table = Arc::clone(&table);
        tasks.push(tokio::spawn(async move {
            (0..50)
                .map(|i| table.allocate(&NodeId::from(format!("node-{i}"))))
                .collect::<Vec<_>>()
        }));
    }

    let results = futures::future::join_all(tasks).await;
    let first = results[0].as_ref().unwrap();
    for result in &results {
        assert_eq!(result.as_ref().unwrap(), first);
    }
    assert_eq!(table.len(), 2 + 50);
}
