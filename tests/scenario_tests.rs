#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::sync::Arc;

use rm_cloud::DocType;
use rm_fs::fs::{INodeType, ROOT_INODE, SizeInfo, TRASH_INODE};

use common::{
    MockCloud, MockRenderer, PDF_BYTES, epub_bytes, lookup_path, mount, names, read_all,
    write_mode_file,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn book_is_estimated_then_exact_then_shown_as_epub() {
    let cloud = MockCloud::new();
    cloud.add_document("b1", "", "book", DocType::Epub, &epub_bytes());
    let h = mount(&cloud, 1).await;

    let listed = h.fs.readdir(ROOT_INODE).unwrap();
    let book = listed.iter().find(|e| e.name == "book.pdf").unwrap();
    assert!(matches!(book.inode.size, SizeInfo::Estimated(_)));

    let bytes = read_all(&h.fs, book.inode.addr).await.unwrap();
    let listed = h.fs.readdir(ROOT_INODE).unwrap();
    let book = listed.iter().find(|e| e.name == "book.pdf").unwrap();
    assert_eq!(book.inode.size, SizeInfo::Known(bytes.len() as u64));

    write_mode_file(&h.fs, b"orig\n").await.unwrap();
    assert_eq!(
        names(&h.fs, ROOT_INODE),
        vec![".mode", ".trash", "book.epub"]
    );
    assert_eq!(
        read_all(&h.fs, book.inode.addr).await.unwrap(),
        epub_bytes()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_opens_with_one_slot_both_succeed() {
    let cloud = MockCloud::new();
    cloud.add_document("a", "", "a", DocType::Notebook, b"");
    cloud.add_document("b", "", "b", DocType::Notebook, b"");
    let h = mount(&cloud, 1).await;
    let a = lookup_path(&h.fs, "a.pdf").unwrap().addr;
    let b = lookup_path(&h.fs, "b.pdf").unwrap().addr;

    for _ in 0..8 {
        let (fs_a, fs_b) = (Arc::clone(&h.fs), Arc::clone(&h.fs));
        let ta = tokio::spawn(async move { read_all(&fs_a, a).await });
        let tb = tokio::spawn(async move { read_all(&fs_b, b).await });
        assert_eq!(ta.await.unwrap().unwrap(), MockRenderer::expected_output("a"));
        assert_eq!(tb.await.unwrap().unwrap(), MockRenderer::expected_output("b"));
    }
    assert!(h.renderer.calls() >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_walkthrough_through_the_trash() {
    let cloud = MockCloud::new();
    cloud.add_folder("f1", "", "Papers");
    cloud.add_document("d1", "f1", "thesis", DocType::Pdf, PDF_BYTES);
    let h = mount(&cloud, 1).await;
    let papers = lookup_path(&h.fs, "Papers").unwrap().addr;

    h.fs.unlink(papers, "thesis.pdf".as_ref()).await.unwrap();
    h.fs.refresh().await.unwrap();
    assert!(names(&h.fs, papers).is_empty());
    assert_eq!(names(&h.fs, TRASH_INODE), vec!["thesis.pdf"]);

    h.fs.unlink(TRASH_INODE, "thesis.pdf".as_ref()).await.unwrap();
    h.fs.refresh().await.unwrap();
    assert!(names(&h.fs, TRASH_INODE).is_empty());
    assert!(cloud.nodes().iter().all(|n| n.name != "thesis"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn directory_attributes_hang_together() {
    let cloud = MockCloud::new();
    cloud.add_folder("f1", "", "Outer");
    cloud.add_folder("f2", "f1", "Inner");
    cloud.add_document("d1", "f2", "paper", DocType::Pdf, PDF_BYTES);
    let h = mount(&cloud, 1).await;

    let outer = lookup_path(&h.fs, "Outer").unwrap();
    let inner = lookup_path(&h.fs, "Outer/Inner").unwrap();
    let paper = lookup_path(&h.fs, "Outer/Inner/paper.pdf").unwrap();
    assert_eq!(inner.parent, Some(outer.addr));
    assert_eq!(paper.parent, Some(inner.addr));
    assert_eq!(paper.itype, INodeType::File);
    assert_eq!(paper.uid, 1000);
    assert_eq!(paper.gid, 1000);

    assert_eq!(h.fs.lookup(inner.addr, "..".as_ref()).unwrap().addr, outer.addr);
    assert_eq!(h.fs.lookup(inner.addr, ".".as_ref()).unwrap().addr, inner.addr);
    assert_eq!(h.fs.lookup(outer.addr, "..".as_ref()).unwrap().addr, ROOT_INODE);
    assert_eq!(h.fs.lookup(ROOT_INODE, "..".as_ref()).unwrap().addr, ROOT_INODE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn statfs_reports_room_for_every_inode() {
    let cloud = MockCloud::new();
    cloud.add_document("d1", "", "paper", DocType::Pdf, PDF_BYTES);
    let h = mount(&cloud, 1).await;

    let stats = h.fs.statfs();
    assert_eq!(stats.block_size, 4096);
    assert_eq!(stats.max_filename_length, 255);
    assert!(stats.free_blocks > 0);
    assert!(stats.free_inodes < stats.total_inodes);
    assert_eq!(
        stats.total_inodes - stats.free_inodes,
        h.fs.inode_table().len() as u64
    );
}
