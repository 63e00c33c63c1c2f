//! Concurrency behavior: single writer per blob id, independent readers,
//! cancellation at chunk boundaries.

use sealstore_crypto::KeyMaterial;
use sealstore_engine::{BlobEngine, ByteRange, EngineError, StaticKeyProvider};
use tokio::io::AsyncWriteExt;

fn engine_in(dir: &tempfile::TempDir) -> BlobEngine {
    BlobEngine::new(dir.path(), StaticKeyProvider::new(KeyMaterial::generate()))
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_second_writer_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(&dir);

    let guard = engine.store().acquire_writer("doc").unwrap();
    assert!(matches!(
        engine.write("doc", &b"late"[..]).await,
        Err(EngineError::WriteConflict(_))
    ));

    // The slot frees on release and the write goes through.
    drop(guard);
    engine.write("doc", &b"data"[..]).await.unwrap();
    assert_eq!(
        engine.open("doc").await.unwrap().read_to_end().await.unwrap(),
        b"data"
    );
}

#[tokio::test]
async fn test_in_flight_write_blocks_second_writer() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(&dir);

    // A duplex source keeps the first write in flight until we close it.
    let (mut tx, rx) = tokio::io::duplex(64);
    let writer_engine = engine.clone();
    let first = tokio::spawn(async move {
        writer_engine
            .write_with_chunk_size("doc", rx, 16)
            .await
            .unwrap()
    });

    // Feed one chunk and wait until the writer has claimed the slot.
    tx.write_all(&[1u8; 16]).await.unwrap();
    while engine.store().acquire_writer("doc").is_ok() {
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    assert!(matches!(
        engine.write("doc", &b"late"[..]).await,
        Err(EngineError::WriteConflict(_))
    ));

    tx.write_all(&[2u8; 5]).await.unwrap();
    drop(tx);
    let sidecar = first.await.unwrap();
    assert_eq!(sidecar.plaintext_size, 21);

    let mut expected = vec![1u8; 16];
    expected.extend_from_slice(&[2u8; 5]);
    assert_eq!(
        engine.open("doc").await.unwrap().read_to_end().await.unwrap(),
        expected
    );
}

#[tokio::test]
async fn test_concurrent_readers_of_one_blob() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(&dir);

    let plaintext = patterned(500);
    engine
        .write_with_chunk_size("shared", &plaintext[..], 64)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for start in [0u64, 63, 64, 129, 499] {
        let engine = engine.clone();
        let expected = plaintext[start as usize..].to_vec();
        tasks.push(tokio::spawn(async move {
            let handle = engine.open("shared").await.unwrap();
            let got = handle.read_range(ByteRange::from(start)).await.unwrap();
            assert_eq!(got, expected);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_concurrent_writes_to_different_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(&dir);

    let mut tasks = Vec::new();
    for i in 0..8usize {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            let payload = patterned(100 + i * 13);
            engine
                .write_with_chunk_size(&format!("blob-{i}"), &payload[..], 32)
                .await
                .unwrap();
            payload
        }));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        let payload = task.await.unwrap();
        let handle = engine.open(&format!("blob-{i}")).await.unwrap();
        assert_eq!(handle.read_to_end().await.unwrap(), payload);
    }
}

#[tokio::test]
async fn test_dropping_a_stream_mid_read_is_clean() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(&dir);

    let plaintext = patterned(200);
    engine
        .write_with_chunk_size("doc", &plaintext[..], 32)
        .await
        .unwrap();

    let handle = engine.open("doc").await.unwrap();
    let mut stream = handle.stream(None).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(&first[..], &plaintext[..32]);
    drop(stream);

    // The abort released its resources; the blob reads fully afterwards and
    // can be deleted.
    assert_eq!(handle.read_to_end().await.unwrap(), plaintext);
    engine.delete("doc").await.unwrap();
    assert!(!engine.exists("doc").await.unwrap());
}

#[tokio::test]
async fn test_reader_unaffected_by_concurrent_write_of_other_blob() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(&dir);

    let plaintext = patterned(300);
    engine
        .write_with_chunk_size("stable", &plaintext[..], 64)
        .await
        .unwrap();

    let reader_engine = engine.clone();
    let reader = tokio::spawn(async move {
        for _ in 0..10 {
            let handle = reader_engine.open("stable").await.unwrap();
            assert_eq!(handle.read_to_end().await.unwrap().len(), 300);
        }
    });
    let writer = tokio::spawn(async move {
        for i in 0..10usize {
            engine
                .write(&format!("new-{i}"), &patterned(80)[..])
                .await
                .unwrap();
        }
    });

    reader.await.unwrap();
    writer.await.unwrap();
}
