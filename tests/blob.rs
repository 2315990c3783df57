//! Encrypted blob store contract tests: write atomicity, round-trip
//! identity, tamper and truncation detection.

use bytes::Bytes;
use futures::TryStreamExt;
use std::io;
use std::path::PathBuf;
use uuid::Uuid;

use arca::infra::blob::BlobStore;

const KEY: [u8; 32] = *b"0123456789abcdef0123456789abcdef";

fn store() -> (BlobStore, PathBuf) {
    let dir = std::env::temp_dir().join(format!("arca-blob-test-{}", Uuid::new_v4()));
    let store = BlobStore::new(&dir, KEY).expect("BlobStore::new failed");
    (store, dir)
}

async fn read_all(store: &BlobStore, name: &str) -> io::Result<Vec<u8>> {
    let mut stream = store.open_read(name).await?;
    let mut out = Vec::new();
    while let Some(chunk) = stream.try_next().await? {
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

#[tokio::test]
async fn roundtrip_small_payload() {
    let (store, dir) = store();
    let payload = b"a tiny payload".to_vec();

    let encrypted = store
        .write("small", Bytes::from(payload.clone()))
        .await
        .unwrap();
    assert!(encrypted > payload.len() as u64);

    assert_eq!(read_all(&store, "small").await.unwrap(), payload);

    // The ciphertext on disk does not contain the plaintext.
    let on_disk = std::fs::read(dir.join("small")).unwrap();
    assert_eq!(on_disk.len() as u64, encrypted);
    assert!(!on_disk
        .windows(payload.len())
        .any(|window| window == payload.as_slice()));
}

#[tokio::test]
async fn roundtrip_multi_frame_stream() {
    let (store, _dir) = store();

    // Larger than one 64 KiB frame, delivered in awkward chunk sizes.
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();
    let chunks: Vec<io::Result<Bytes>> = payload
        .chunks(7_001)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();

    store
        .write_stream("large", futures::stream::iter(chunks))
        .await
        .unwrap();

    assert_eq!(read_all(&store, "large").await.unwrap(), payload);
}

#[tokio::test]
async fn roundtrip_empty_payload() {
    let (store, _dir) = store();
    store.write("empty", Bytes::new()).await.unwrap();
    assert_eq!(read_all(&store, "empty").await.unwrap(), Vec::<u8>::new());
}

#[tokio::test]
async fn open_read_missing_blob_is_not_found() {
    let (store, _dir) = store();
    let err = store.open_read("nope").await.map(|_| ()).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::NotFound);
}

#[tokio::test]
async fn each_open_is_a_fresh_pass() {
    let (store, _dir) = store();
    let payload = b"read me twice".to_vec();
    store.write("twice", Bytes::from(payload.clone())).await.unwrap();

    assert_eq!(read_all(&store, "twice").await.unwrap(), payload);
    assert_eq!(read_all(&store, "twice").await.unwrap(), payload);
}

#[tokio::test]
async fn delete_reports_prior_existence() {
    let (store, _dir) = store();
    store.write("victim", Bytes::from_static(b"x")).await.unwrap();

    assert!(store.delete("victim").await.unwrap());
    assert!(!store.delete("victim").await.unwrap());
    assert!(!store.exists("victim").await);
}

#[tokio::test]
async fn truncated_blob_fails_decryption() {
    let (store, dir) = store();
    let payload: Vec<u8> = vec![42u8; 70_000];
    store.write("cut", Bytes::from(payload)).await.unwrap();

    let path = dir.join("cut");
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

    let err = read_all(&store, "cut").await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
}

#[tokio::test]
async fn tampered_blob_fails_decryption() {
    let (store, dir) = store();
    store
        .write("flip", Bytes::from(vec![7u8; 1_000]))
        .await
        .unwrap();

    let path = dir.join("flip");
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();

    let err = read_all(&store, "flip").await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
}

#[tokio::test]
async fn failed_write_leaves_nothing_behind() {
    let (store, dir) = store();

    let chunks: Vec<io::Result<Bytes>> = vec![
        Ok(Bytes::from_static(b"starts fine")),
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "client gone")),
    ];
    let result = store
        .write_stream("aborted", futures::stream::iter(chunks))
        .await;
    assert!(result.is_err());

    assert!(!store.exists("aborted").await);
    assert!(!dir.join("aborted.tmp").exists());
}
