use kvfuse::{FsError, MAX_NAME_LEN};

use super::common::{ctx, Fixture};

#[tokio::test]
async fn readdir_lists_created_entries() {
    let fixture = Fixture::new().await;
    let ctx = ctx();

    fixture.fs.mkdir(&ctx, "/d", 0o755).await.unwrap();
    fixture.fs.create(&ctx, "/d/one", 0o644).await.unwrap();
    fixture.fs.create(&ctx, "/d/two", 0o644).await.unwrap();
    fixture.fs.mkdir(&ctx, "/d/sub", 0o755).await.unwrap();

    let entries = fixture.fs.readdir(&ctx, "/d").await.unwrap();
    assert_eq!(entries[..2], [String::from("."), String::from("..")]);
    assert!(entries.contains(&String::from("one")));
    assert!(entries.contains(&String::from("two")));
    assert!(entries.contains(&String::from("sub")));

    fixture.fs.unlink(&ctx, "/d/one").await.unwrap();
    let entries = fixture.fs.readdir(&ctx, "/d").await.unwrap();
    assert!(!entries.contains(&String::from("one")));
}

#[tokio::test]
async fn root_listing_hides_reserved_rows() {
    let fixture = Fixture::new().await;
    let entries = fixture.fs.readdir(&ctx(), "/").await.unwrap();
    assert!(!entries.contains(&String::from("DELETED_LINKS")));
    assert!(!entries.contains(&String::from("/")));
}

#[tokio::test]
async fn hidden_directory_is_invisible_to_getattr() {
    let fixture = Fixture::new().await;
    let err = fixture.fs.getattr(&ctx(), "/DELETED_LINKS").await.unwrap_err();
    assert_eq!(err, FsError::NoEntry);
}

#[tokio::test]
async fn readdir_of_a_file_is_not_a_directory() {
    let fixture = Fixture::new().await;
    fixture.write_file("/f", b"x").await;
    assert_eq!(fixture.fs.readdir(&ctx(), "/f").await.unwrap_err(), FsError::NotDir);
}

#[tokio::test]
async fn rmdir_semantics() {
    let fixture = Fixture::new().await;
    let ctx = ctx();

    fixture.fs.mkdir(&ctx, "/d", 0o755).await.unwrap();
    fixture.fs.create(&ctx, "/d/f", 0o644).await.unwrap();

    assert_eq!(fixture.fs.rmdir(&ctx, "/d").await.unwrap_err(), FsError::NotEmpty);
    assert_eq!(
        fixture.fs.rmdir(&ctx, "/d/f").await.unwrap_err(),
        FsError::InvalidArgument
    );

    fixture.fs.unlink(&ctx, "/d/f").await.unwrap();
    fixture.fs.rmdir(&ctx, "/d").await.unwrap();
    assert_eq!(fixture.fs.getattr(&ctx, "/d").await.unwrap_err(), FsError::NoEntry);
}

#[tokio::test]
async fn mkdir_over_existing_entry_fails() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.fs.mkdir(&ctx, "/d", 0o755).await.unwrap();
    assert_eq!(fixture.fs.mkdir(&ctx, "/d", 0o755).await.unwrap_err(), FsError::Exist);
}

#[tokio::test]
async fn name_length_limits() {
    let fixture = Fixture::new().await;
    let ctx = ctx();

    let longest = format!("/{}", "n".repeat(MAX_NAME_LEN));
    fixture.fs.create(&ctx, &longest, 0o644).await.unwrap();
    assert_eq!(fixture.fs.getattr(&ctx, &longest).await.unwrap().size, 0);

    let too_long = format!("/{}", "n".repeat(MAX_NAME_LEN + 1));
    assert_eq!(
        fixture.fs.create(&ctx, &too_long, 0o644).await.unwrap_err(),
        FsError::NameTooLong
    );
}

#[tokio::test]
async fn mkdir_updates_parent_times() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    let before = fixture.fs.getattr(&ctx, "/").await.unwrap();
    fixture.fs.mkdir(&ctx, "/stamped", 0o755).await.unwrap();
    let after = fixture.fs.getattr(&ctx, "/").await.unwrap();
    assert!(after.mtime >= before.mtime);
    assert!(after.ctime >= before.ctime);
}
