use kvfuse::fs::LockProbe;
use kvfuse::lock::registry::LocalLock;
use kvfuse::FsError;

use super::common::{ctx, Fixture};

#[tokio::test(start_paused = true)]
async fn exclusive_lock_is_handed_over_between_mounts() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.write_file("/f", b"x").await;
    let other = fixture.second();

    fixture.fs.setlk(&ctx, "/f", LocalLock::Exclusive, 1, false).await.unwrap();

    // The second mount exhausts its retries and reports EAGAIN.
    let err = other.setlk(&ctx, "/f", LocalLock::Exclusive, 2, false).await.unwrap_err();
    assert_eq!(err, FsError::Again);

    fixture.fs.unlock(&ctx, "/f", 1).await.unwrap();
    other.setlk(&ctx, "/f", LocalLock::Exclusive, 2, false).await.unwrap();
    other.unlock(&ctx, "/f", 2).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shared_locks_coexist_and_block_writers() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.write_file("/f", b"x").await;
    let other = fixture.second();

    fixture.fs.setlk(&ctx, "/f", LocalLock::Shared, 1, false).await.unwrap();
    other.setlk(&ctx, "/f", LocalLock::Shared, 2, false).await.unwrap();

    assert_eq!(fixture.fs.getlk(&ctx, "/f").await.unwrap(), LockProbe::Shared(2));

    // A writer elsewhere cannot get in while readers hold the file.
    let third = fixture.second();
    let err = third.setlk(&ctx, "/f", LocalLock::Exclusive, 3, false).await.unwrap_err();
    assert_eq!(err, FsError::Again);

    fixture.fs.unlock(&ctx, "/f", 1).await.unwrap();
    other.unlock(&ctx, "/f", 2).await.unwrap();
    assert_eq!(fixture.fs.getlk(&ctx, "/f").await.unwrap(), LockProbe::Unlocked);

    third.setlk(&ctx, "/f", LocalLock::Exclusive, 3, false).await.unwrap();
    assert_eq!(fixture.fs.getlk(&ctx, "/f").await.unwrap(), LockProbe::Exclusive);
    third.unlock(&ctx, "/f", 3).await.unwrap();
}

#[tokio::test]
async fn local_conflicts_fail_fast_with_ebusy() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.write_file("/f", b"x").await;

    fixture.fs.setlk(&ctx, "/f", LocalLock::Exclusive, 1, false).await.unwrap();
    // A second owner in the same process never reaches the KV store.
    assert_eq!(
        fixture.fs.setlk(&ctx, "/f", LocalLock::Exclusive, 2, false).await.unwrap_err(),
        FsError::Busy
    );
    assert_eq!(
        fixture.fs.setlk(&ctx, "/f", LocalLock::Shared, 1, false).await.unwrap_err(),
        FsError::Busy
    );
    // Re-asserting the same lock is a no-op.
    fixture.fs.setlk(&ctx, "/f", LocalLock::Exclusive, 1, false).await.unwrap();
    fixture.fs.unlock(&ctx, "/f", 1).await.unwrap();
}

#[tokio::test]
async fn local_readers_share_one_kv_increment() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.write_file("/f", b"x").await;

    fixture.fs.setlk(&ctx, "/f", LocalLock::Shared, 1, false).await.unwrap();
    fixture.fs.setlk(&ctx, "/f", LocalLock::Shared, 2, false).await.unwrap();
    fixture.fs.setlk(&ctx, "/f", LocalLock::Shared, 3, false).await.unwrap();

    // One process, one increment.
    let row = fixture.raw_meta("/", "f").await.unwrap();
    assert_eq!(row.i64("readLock"), Some(1));

    fixture.fs.unlock(&ctx, "/f", 1).await.unwrap();
    fixture.fs.unlock(&ctx, "/f", 2).await.unwrap();
    let row = fixture.raw_meta("/", "f").await.unwrap();
    assert_eq!(row.i64("readLock"), Some(1));

    fixture.fs.unlock(&ctx, "/f", 3).await.unwrap();
    let row = fixture.raw_meta("/", "f").await.unwrap();
    assert_eq!(row.i64("readLock"), Some(0));
}

#[tokio::test(start_paused = true)]
async fn setlkw_waits_for_the_holder() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.write_file("/f", b"x").await;
    let other = fixture.second();

    fixture.fs.setlk(&ctx, "/f", LocalLock::Exclusive, 1, false).await.unwrap();

    let waiter = tokio::spawn(async move {
        other.setlk(&ctx, "/f", LocalLock::Exclusive, 2, true).await.unwrap();
        other.unlock(&ctx, "/f", 2).await.unwrap();
    });

    // Outlast the non-waiting retry budget before releasing.
    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
    fixture.fs.unlock(&ctx, "/f", 1).await.unwrap();

    waiter.await.unwrap();
}

#[tokio::test]
async fn flock_maps_onto_the_advisory_machinery() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.write_file("/f", b"x").await;

    fixture
        .fs
        .flock(&ctx, "/f", kvfuse::fs::FlockOp::Exclusive, 9, false)
        .await
        .unwrap();
    assert_eq!(fixture.fs.getlk(&ctx, "/f").await.unwrap(), LockProbe::Exclusive);
    fixture.fs.flock(&ctx, "/f", kvfuse::fs::FlockOp::Unlock, 9, false).await.unwrap();
    assert_eq!(fixture.fs.getlk(&ctx, "/f").await.unwrap(), LockProbe::Unlocked);
}

#[tokio::test]
async fn locking_a_missing_file_fails() {
    let fixture = Fixture::new().await;
    assert_eq!(
        fixture
            .fs
            .setlk(&ctx(), "/missing", LocalLock::Shared, 1, false)
            .await
            .unwrap_err(),
        FsError::NoEntry
    );
}
