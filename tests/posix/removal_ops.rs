use kvfuse::store::{attr, Backend, Key, RangeFilter, Update};
use kvfuse::FsError;

use super::common::{ctx, other_ctx, root_ctx, Fixture};

#[tokio::test]
async fn unlink_missing_entry() {
    let fixture = Fixture::new().await;
    assert_eq!(
        fixture.fs.unlink(&ctx(), "/missing").await.unwrap_err(),
        FsError::NoEntry
    );
}

#[tokio::test]
async fn unlink_directory_is_rejected() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.fs.mkdir(&ctx, "/d", 0o755).await.unwrap();
    assert_eq!(fixture.fs.unlink(&ctx, "/d").await.unwrap_err(), FsError::IsDir);
}

#[tokio::test]
async fn unlink_requires_a_writable_parent() {
    let fixture = Fixture::new().await;
    let root = root_ctx();
    fixture.fs.mkdir(&root, "/guarded", 0o755).await.unwrap();
    fixture.fs.create(&root, "/guarded/f", 0o666).await.unwrap();

    assert_eq!(
        fixture.fs.unlink(&ctx(), "/guarded/f").await.unwrap_err(),
        FsError::Access
    );
    fixture.fs.unlink(&root, "/guarded/f").await.unwrap();
}

#[tokio::test]
async fn sticky_directory_restricts_unlink() {
    let fixture = Fixture::new().await;
    let root = root_ctx();
    fixture.fs.mkdir(&root, "/shared", 0o1777).await.unwrap();

    let owner = ctx();
    fixture.fs.create(&owner, "/shared/mine", 0o644).await.unwrap();

    assert_eq!(
        fixture.fs.unlink(&other_ctx(), "/shared/mine").await.unwrap_err(),
        FsError::Permission
    );
    fixture.fs.unlink(&owner, "/shared/mine").await.unwrap();
}

#[tokio::test]
async fn unlink_reclaims_block_rows() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.fs.create(&ctx, "/f", 0o644).await.unwrap();
    fixture.fs.write(&ctx, "/f", &vec![9u8; 70_000], 0).await.unwrap();
    let block_id = fixture.block_id_of("/f").await;
    assert_eq!(fixture.block_numbers(&block_id).await.len(), 3);

    fixture.fs.unlink(&ctx, "/f").await.unwrap();
    assert!(fixture.block_numbers(&block_id).await.is_empty());
}

#[tokio::test]
async fn symlink_and_node_rows_delete_cleanly() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.fs.symlink(&ctx, "/ln", "/target").await.unwrap();
    fixture.fs.mknod(&ctx, "/fifo", 0o010644, 0).await.unwrap();

    fixture.fs.unlink(&ctx, "/ln").await.unwrap();
    fixture.fs.unlink(&ctx, "/fifo").await.unwrap();
    assert_eq!(fixture.fs.getattr(&ctx, "/ln").await.unwrap_err(), FsError::NoEntry);
    assert_eq!(fixture.fs.getattr(&ctx, "/fifo").await.unwrap_err(), FsError::NoEntry);
}

#[tokio::test]
async fn reaper_purges_orphaned_tombstones() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.write_file("/t", b"abc").await;
    let block_id = fixture.block_id_of("/t").await;
    fixture.fs.link(&ctx, "/u", "/t").await.unwrap();
    fixture.fs.unlink(&ctx, "/t").await.unwrap();

    let tombstones = fixture
        .backend
        .query("kvfuse", "/DELETED_LINKS", RangeFilter::All, None)
        .await
        .unwrap();
    assert_eq!(tombstones.len(), 1);
    let name = tombstones[0].str(attr::NAME).unwrap().to_owned();

    // Simulate a crash that lost the final decrement.
    fixture
        .backend
        .update(
            "kvfuse",
            &Key::meta("/DELETED_LINKS", &name),
            &Update::new().set(attr::NLINK, 0i64),
            &[],
        )
        .await
        .unwrap();

    assert_eq!(fixture.fs.reap_tombstones().await.unwrap(), 1);
    assert!(fixture.block_numbers(&block_id).await.is_empty());
    assert_eq!(fixture.fs.reap_tombstones().await.unwrap(), 0);
}

#[tokio::test]
async fn cleanup_keeps_only_the_reserved_rows() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.fs.mkdir(&ctx, "/d", 0o755).await.unwrap();
    fixture.write_file("/d/f", b"data").await;

    fixture.fs.cleanup().await.unwrap();

    let keys = fixture.backend.scan_keys("kvfuse").await.unwrap();
    assert_eq!(keys.len(), 3);
    assert!(fixture.fs.readdir(&ctx, "/").await.unwrap().len() == 2);
    assert!(fixture.backend.scan_keys("kvfuseBlocks").await.unwrap().is_empty());
}
