use kvfuse::BLOCK_SIZE;

use super::common::{ctx, Fixture};

#[tokio::test]
async fn sparse_write_reads_zeroes_below() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.fs.create(&ctx, "/s", 0o644).await.unwrap();

    let written = fixture.fs.write(&ctx, "/s", b"x", 100_000).await.unwrap();
    assert_eq!(written, 1);

    let attr = fixture.fs.getattr(&ctx, "/s").await.unwrap();
    assert_eq!(attr.size, 100_001);

    assert_eq!(fixture.fs.read(&ctx, "/s", 5, 0).await.unwrap(), b"\0\0\0\0\0");
    assert_eq!(fixture.fs.read(&ctx, "/s", 1, 100_000).await.unwrap(), b"x");
    // A hole in the middle reads as zeroes too.
    assert_eq!(fixture.fs.read(&ctx, "/s", 3, 50_000).await.unwrap(), b"\0\0\0");
}

#[tokio::test]
async fn expanding_truncate_is_sparse() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.write_file("/grow", b"data").await;
    let block_id = fixture.block_id_of("/grow").await;

    fixture.fs.truncate(&ctx, "/grow", 5 * BLOCK_SIZE as u64).await.unwrap();

    let attr = fixture.fs.getattr(&ctx, "/grow").await.unwrap();
    assert_eq!(attr.size, 5 * BLOCK_SIZE as u64);
    // No blocks were allocated for the extension.
    assert_eq!(fixture.block_numbers(&block_id).await, vec![0]);

    let tail = fixture.fs.read(&ctx, "/grow", 16, 4 * BLOCK_SIZE as u64).await.unwrap();
    assert!(tail.iter().all(|b| *b == 0));
    assert_eq!(fixture.fs.read(&ctx, "/grow", 4, 0).await.unwrap(), b"data");
}

#[tokio::test]
async fn truncate_trims_content_and_blocks() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.fs.create(&ctx, "/t", 0o644).await.unwrap();
    let payload: Vec<u8> = (0..3 * BLOCK_SIZE).map(|i| (i % 199) as u8).collect();
    fixture.fs.write(&ctx, "/t", &payload, 0).await.unwrap();
    let block_id = fixture.block_id_of("/t").await;
    assert_eq!(fixture.block_numbers(&block_id).await, vec![0, 1, 2]);

    fixture.fs.truncate(&ctx, "/t", 1000).await.unwrap();

    assert_eq!(fixture.fs.getattr(&ctx, "/t").await.unwrap().size, 1000);
    assert_eq!(fixture.block_numbers(&block_id).await, vec![0]);
    let data = fixture.fs.read(&ctx, "/t", 2000, 0).await.unwrap();
    assert_eq!(data, payload[..1000]);
}

#[tokio::test]
async fn truncate_to_block_multiple_deletes_trailing_blocks() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.fs.create(&ctx, "/m", 0o644).await.unwrap();
    let payload: Vec<u8> = (0..3 * BLOCK_SIZE).map(|i| (i % 17) as u8).collect();
    fixture.fs.write(&ctx, "/m", &payload, 0).await.unwrap();
    let block_id = fixture.block_id_of("/m").await;

    fixture.fs.truncate(&ctx, "/m", BLOCK_SIZE as u64).await.unwrap();

    assert_eq!(fixture.fs.getattr(&ctx, "/m").await.unwrap().size, BLOCK_SIZE as u64);
    let numbers = fixture.block_numbers(&block_id).await;
    assert!(!numbers.contains(&2));
    let data = fixture.fs.read(&ctx, "/m", 2 * BLOCK_SIZE, 0).await.unwrap();
    assert_eq!(data, payload[..BLOCK_SIZE]);
}

#[tokio::test]
async fn truncate_to_zero_removes_content_rows() {
    let fixture = Fixture::new().await;
    let ctx = ctx();
    fixture.fs.create(&ctx, "/z", 0o644).await.unwrap();
    let payload = vec![7u8; 2 * BLOCK_SIZE];
    fixture.fs.write(&ctx, "/z", &payload, 0).await.unwrap();
    let block_id = fixture.block_id_of("/z").await;

    fixture.fs.truncate(&ctx, "/z", 0).await.unwrap();

    assert_eq!(fixture.fs.getattr(&ctx, "/z").await.unwrap().size, 0);
    assert!(fixture.fs.read(&ctx, "/z", 10, 0).await.unwrap().is_empty());
    assert_eq!(fixture.block_numbers(&block_id).await, vec![0]);

    // The file is still writable after a full truncate.
    fixture.fs.write(&ctx, "/z", b"fresh", 0).await.unwrap();
    assert_eq!(fixture.fs.read(&ctx, "/z", 5, 0).await.unwrap(), b"fresh");
}
