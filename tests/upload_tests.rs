#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::ffi::OsStr;

use rm_cloud::{DocType, NodeId};
use rm_fs::fs::{FsError, InodePerms, MAX_UPLOAD_SIZE, OpenFlags, ROOT_INODE, TRASH_INODE};

use common::{
    MockCloud, PDF_BYTES, copy_in, epub_bytes, lookup_path, mount, names, read_all,
    write_mode_file,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pdf_upload_round_trips_in_orig_mode() {
    let cloud = MockCloud::new();
    let h = mount(&cloud, 1).await;

    copy_in(&h.fs, ROOT_INODE, "paper.pdf", PDF_BYTES)
        .await
        .unwrap();
    let uploaded = cloud.nodes();
    assert_eq!(uploaded.len(), 1);
    assert_eq!(uploaded[0].name, "paper");
    assert_eq!(uploaded[0].doc_type, Some(DocType::Pdf));

    write_mode_file(&h.fs, b"orig").await.unwrap();
    let addr = lookup_path(&h.fs, "paper.pdf").unwrap().addr;
    assert_eq!(read_all(&h.fs, addr).await.unwrap(), PDF_BYTES);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn epub_upload_lands_in_the_target_folder() {
    let cloud = MockCloud::new();
    cloud.add_folder("f1", "", "Shelf");
    let h = mount(&cloud, 1).await;
    let shelf = lookup_path(&h.fs, "Shelf").unwrap().addr;

    copy_in(&h.fs, shelf, "novel.epub", &epub_bytes())
        .await
        .unwrap();
    let node = cloud
        .nodes()
        .into_iter()
        .find(|n| n.name == "novel")
        .unwrap();
    assert_eq!(node.parent_id, Some(NodeId::from("f1")));
    assert_eq!(node.doc_type, Some(DocType::Epub));
    assert_eq!(names(&h.fs, shelf), vec!["novel.pdf"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uploaded_file_keeps_its_inode() {
    let cloud = MockCloud::new();
    let h = mount(&cloud, 1).await;

    let (attr, fh) = h.fs.create(ROOT_INODE, OsStr::new("paper.pdf")).unwrap();
    h.fs.write(fh, 0, PDF_BYTES).await.unwrap();
    h.fs.flush(fh).await.unwrap();
    h.fs.release(fh).await.unwrap();

    assert_eq!(lookup_path(&h.fs, "paper.pdf").unwrap().addr, attr.addr);
    h.fs.refresh().await.unwrap();
    assert_eq!(lookup_path(&h.fs, "paper.pdf").unwrap().addr, attr.addr);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_name_fails_before_any_remote_call() {
    let cloud = MockCloud::new();
    cloud.add_document("d1", "", "paper", DocType::Pdf, PDF_BYTES);
    let h = mount(&cloud, 1).await;
    let before = names(&h.fs, ROOT_INODE);

    let err = h
        .fs
        .create(ROOT_INODE, OsStr::new("notes.txt"))
        .unwrap_err();
    assert!(matches!(err, FsError::UnsupportedContentType));
    assert_eq!(err.to_errno(), libc::EOPNOTSUPP);

    assert_eq!(cloud.mutation_calls(), 0);
    assert_eq!(names(&h.fs, ROOT_INODE), before);
    assert!(matches!(
        lookup_path(&h.fs, "notes.txt"),
        Err(FsError::NotFound)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_content_fails_on_close() {
    let cloud = MockCloud::new();
    let h = mount(&cloud, 1).await;

    let err = copy_in(&h.fs, ROOT_INODE, "fake.pdf", b"just some text")
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::UnsupportedContentType));
    assert_eq!(cloud.mutation_calls(), 0);
    assert!(matches!(
        lookup_path(&h.fs, "fake.pdf"),
        Err(FsError::NotFound)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pending_upload_is_visible_to_lookup_but_not_listing() {
    let cloud = MockCloud::new();
    let h = mount(&cloud, 1).await;

    let (attr, fh) = h.fs.create(ROOT_INODE, OsStr::new("paper.pdf")).unwrap();
    assert_eq!(attr.permissions, InodePerms::READ_WRITE);
    assert_eq!(attr.size.bytes(), 0);

    h.fs.write(fh, 0, &PDF_BYTES[..10]).await.unwrap();
    let seen = lookup_path(&h.fs, "paper.pdf").unwrap();
    assert_eq!(seen.addr, attr.addr);
    assert_eq!(seen.size.bytes(), 10);
    assert_eq!(names(&h.fs, ROOT_INODE), vec![".mode", ".trash"]);

    h.fs.write(fh, 10, &PDF_BYTES[10..]).await.unwrap();
    h.fs.release(fh).await.unwrap();
    assert_eq!(
        names(&h.fs, ROOT_INODE),
        vec![".mode", ".trash", "paper.pdf"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn release_uploads_when_never_flushed() {
    let cloud = MockCloud::new();
    let h = mount(&cloud, 1).await;

    let (_, fh) = h.fs.create(ROOT_INODE, OsStr::new("paper.pdf")).unwrap();
    h.fs.write(fh, 0, PDF_BYTES).await.unwrap();
    assert_eq!(cloud.mutation_calls(), 0);
    h.fs.release(fh).await.unwrap();
    assert_eq!(cloud.mutation_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_flushes_upload_once() {
    let cloud = MockCloud::new();
    let h = mount(&cloud, 1).await;

    let (_, fh) = h.fs.create(ROOT_INODE, OsStr::new("paper.pdf")).unwrap();
    h.fs.flush(fh).await.unwrap();
    h.fs.write(fh, 0, PDF_BYTES).await.unwrap();
    h.fs.flush(fh).await.unwrap();
    h.fs.flush(fh).await.unwrap();
    h.fs.release(fh).await.unwrap();
    assert_eq!(cloud.mutation_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_file_is_never_uploaded() {
    let cloud = MockCloud::new();
    let h = mount(&cloud, 1).await;

    let (attr, fh) = h.fs.create(ROOT_INODE, OsStr::new("empty.pdf")).unwrap();
    h.fs.release(fh).await.unwrap();

    assert_eq!(cloud.mutation_calls(), 0);
    assert!(matches!(h.fs.getattr(attr.addr), Err(FsError::NotFound)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unlinked_pending_upload_is_discarded() {
    let cloud = MockCloud::new();
    let h = mount(&cloud, 1).await;

    let (_, fh) = h.fs.create(ROOT_INODE, OsStr::new("paper.pdf")).unwrap();
    h.fs.write(fh, 0, PDF_BYTES).await.unwrap();
    h.fs.unlink(ROOT_INODE, OsStr::new("paper.pdf")).await.unwrap();
    h.fs.release(fh).await.unwrap();

    assert_eq!(cloud.mutation_calls(), 0);
    assert!(lookup_path(&h.fs, "paper.pdf").is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncating_a_pending_upload_discards_bytes() {
    let cloud = MockCloud::new();
    let h = mount(&cloud, 1).await;

    let (attr, fh) = h.fs.create(ROOT_INODE, OsStr::new("paper.pdf")).unwrap();
    h.fs.write(fh, 0, b"garbage").await.unwrap();
    let attr = h.fs.setattr(attr.addr, Some(0)).unwrap();
    assert_eq!(attr.size.bytes(), 0);
    h.fs.write(fh, 0, PDF_BYTES).await.unwrap();
    h.fs.release(fh).await.unwrap();

    write_mode_file(&h.fs, b"orig").await.unwrap();
    let addr = lookup_path(&h.fs, "paper.pdf").unwrap().addr;
    assert_eq!(read_all(&h.fs, addr).await.unwrap(), PDF_BYTES);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_checks_names_and_places() {
    let cloud = MockCloud::new();
    cloud.add_document("d1", "", "paper", DocType::Pdf, PDF_BYTES);
    let h = mount(&cloud, 1).await;

    assert!(matches!(
        h.fs.create(ROOT_INODE, OsStr::new("paper.pdf")),
        Err(FsError::AlreadyExists)
    ));
    assert!(matches!(
        h.fs.create(ROOT_INODE, OsStr::new(".trash")),
        Err(FsError::AlreadyExists)
    ));
    assert!(matches!(
        h.fs.create(TRASH_INODE, OsStr::new("new.pdf")),
        Err(FsError::PermissionDenied)
    ));

    let (_, fh) = h.fs.create(ROOT_INODE, OsStr::new("new.pdf")).unwrap();
    assert!(matches!(
        h.fs.create(ROOT_INODE, OsStr::new("new.pdf")),
        Err(FsError::AlreadyExists)
    ));
    h.fs.release(fh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_upload_reports_remote_error() {
    let cloud = MockCloud::new();
    let h = mount(&cloud, 1).await;

    let (_, fh) = h.fs.create(ROOT_INODE, OsStr::new("paper.pdf")).unwrap();
    h.fs.write(fh, 0, PDF_BYTES).await.unwrap();
    cloud.set_offline(true);
    let err = h.fs.flush(fh).await.unwrap_err();
    assert!(matches!(err, FsError::RemoteUnavailable(_)));
    h.fs.release(fh).await.unwrap();

    cloud.set_offline(false);
    h.fs.refresh().await.unwrap();
    assert!(cloud.nodes().is_empty());
    assert!(lookup_path(&h.fs, "paper.pdf").is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pending_upload_reads_back_buffered_bytes() {
    let cloud = MockCloud::new();
    let h = mount(&cloud, 1).await;

    let (attr, fh) = h.fs.create(ROOT_INODE, OsStr::new("paper.pdf")).unwrap();
    h.fs.write(fh, 0, PDF_BYTES).await.unwrap();
    let reader = h.fs.open(attr.addr, OpenFlags::RDONLY).await.unwrap();
    assert_eq!(common::read_handle(&h.fs, reader).unwrap(), PDF_BYTES);
    h.fs.release(reader).await.unwrap();
    h.fs.release(fh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pending_upload_refuses_to_grow_past_the_limit() {
    let cloud = MockCloud::new();
    let h = mount(&cloud, 1).await;

    let (attr, fh) = h.fs.create(ROOT_INODE, OsStr::new("paper.pdf")).unwrap();
    h.fs.write(fh, 0, PDF_BYTES).await.unwrap();

    let err = h.fs.write(fh, MAX_UPLOAD_SIZE, b"x").await.unwrap_err();
    assert!(matches!(err, FsError::FileTooLarge));
    assert_eq!(err.to_errno(), libc::EFBIG);
    let err = h.fs.write(fh, u64::MAX, b"x").await.unwrap_err();
    assert!(matches!(err, FsError::FileTooLarge));
    let err = h.fs.setattr(attr.addr, Some(1 << 40)).unwrap_err();
    assert!(matches!(err, FsError::FileTooLarge));

    assert_eq!(
        h.fs.getattr(attr.addr).unwrap().size.bytes(),
        PDF_BYTES.len() as u64
    );
    h.fs.release(fh).await.unwrap();
    write_mode_file(&h.fs, b"orig").await.unwrap();
    let addr = lookup_path(&h.fs, "paper.pdf").unwrap().addr;
    assert_eq!(read_all(&h.fs, addr).await.unwrap(), PDF_BYTES);
}
