use kvfuse::fs::Context;
use kvfuse::FsError;

use super::common::{ctx, other_ctx, root_ctx, Fixture};

#[tokio::test]
async fn rename_file_moves_the_record() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.write_file("/a", b"payload").await;

    fixture.fs.rename(&ctx, "/a", "/b").await.unwrap();

    assert_eq!(fixture.fs.getattr(&ctx, "/a").await.unwrap_err(), FsError::NoEntry);
    assert_eq!(fixture.fs.read(&ctx, "/b", 7, 0).await.unwrap(), b"payload");
}

#[tokio::test]
async fn rename_preserves_stat_identity() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.write_file("/a", b"id").await;
    let before = fixture.fs.getattr(&ctx, "/a").await.unwrap();

    fixture.fs.rename(&ctx, "/a", "/b").await.unwrap();
    let after = fixture.fs.getattr(&ctx, "/b").await.unwrap();
    assert_eq!(after.ino, before.ino);
    assert_eq!(after.size, before.size);
    assert_eq!(after.mode, before.mode);
}

#[tokio::test]
async fn directory_rename_carries_children() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.fs.mkdir(&ctx, "/d", 0o755).await.unwrap();
    fixture.fs.create(&ctx, "/d/x", 0o644).await.unwrap();
    fixture.fs.write(&ctx, "/d/x", b"deep", 0).await.unwrap();
    fixture.fs.mkdir(&ctx, "/d/nested", 0o755).await.unwrap();
    fixture.fs.create(&ctx, "/d/nested/y", 0o644).await.unwrap();

    fixture.fs.rename(&ctx, "/d", "/e").await.unwrap();

    let entries = fixture.fs.readdir(&ctx, "/e").await.unwrap();
    assert!(entries.contains(&String::from("x")));
    assert!(entries.contains(&String::from("nested")));
    assert_eq!(fixture.fs.readdir(&ctx, "/d").await.unwrap_err(), FsError::NoEntry);
    assert_eq!(fixture.fs.read(&ctx, "/e/x", 4, 0).await.unwrap(), b"deep");
    assert_eq!(fixture.fs.getattr(&ctx, "/e/nested/y").await.unwrap().size, 0);
}

#[tokio::test]
async fn rename_rejects_roots_and_self_nesting() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.fs.mkdir(&ctx, "/d", 0o755).await.unwrap();
    fixture.fs.mkdir(&ctx, "/d/inner", 0o755).await.unwrap();

    assert_eq!(
        fixture.fs.rename(&ctx, "/", "/x").await.unwrap_err(),
        FsError::InvalidArgument
    );
    assert_eq!(
        fixture.fs.rename(&ctx, "/d", "/").await.unwrap_err(),
        FsError::InvalidArgument
    );
    assert_eq!(
        fixture.fs.rename(&ctx, "/d", "/d/inner/moved").await.unwrap_err(),
        FsError::InvalidArgument
    );
    // Renaming to itself is a no-op.
    fixture.fs.rename(&ctx, "/d", "/d").await.unwrap();
}

#[tokio::test]
async fn rename_onto_existing_entries() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.fs.mkdir(&ctx, "/dir", 0o755).await.unwrap();
    fixture.fs.mkdir(&ctx, "/empty", 0o755).await.unwrap();
    fixture.fs.mkdir(&ctx, "/full", 0o755).await.unwrap();
    fixture.fs.create(&ctx, "/full/f", 0o644).await.unwrap();
    fixture.write_file("/file", b"one").await;
    fixture.write_file("/other", b"two").await;

    // Directory onto a non-empty directory / a file.
    assert_eq!(
        fixture.fs.rename(&ctx, "/dir", "/full").await.unwrap_err(),
        FsError::NotEmpty
    );
    assert_eq!(
        fixture.fs.rename(&ctx, "/dir", "/file").await.unwrap_err(),
        FsError::IsDir
    );
    // File onto a directory.
    assert_eq!(
        fixture.fs.rename(&ctx, "/file", "/empty").await.unwrap_err(),
        FsError::IsDir
    );

    // File onto a file replaces it.
    fixture.fs.rename(&ctx, "/file", "/other").await.unwrap();
    assert_eq!(fixture.fs.read(&ctx, "/other", 3, 0).await.unwrap(), b"one");
    assert_eq!(fixture.fs.getattr(&ctx, "/file").await.unwrap_err(), FsError::NoEntry);

    // Directory onto an empty directory replaces it.
    fixture.fs.rename(&ctx, "/dir", "/empty").await.unwrap();
    assert!(fixture.fs.readdir(&ctx, "/empty").await.is_ok());
    assert_eq!(fixture.fs.getattr(&ctx, "/dir").await.unwrap_err(), FsError::NoEntry);
}

#[tokio::test]
async fn rename_needs_an_existing_destination_directory() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.write_file("/f", b"x").await;
    assert_eq!(
        fixture.fs.rename(&ctx, "/f", "/missing/f").await.unwrap_err(),
        FsError::NoEntry
    );
}

#[tokio::test]
async fn sticky_directory_restricts_rename() {
    let fixture = Fixture::new().await;
    let root = root_ctx();
    fixture.fs.mkdir(&root, "/shared", 0o1777).await.unwrap();

    let owner = ctx();
    fixture.fs.create(&owner, "/shared/mine", 0o644).await.unwrap();

    let stranger: Context = other_ctx();
    assert_eq!(
        fixture.fs.rename(&stranger, "/shared/mine", "/shared/stolen").await.unwrap_err(),
        FsError::Permission
    );
    fixture.fs.rename(&owner, "/shared/mine", "/shared/renamed").await.unwrap();
}
