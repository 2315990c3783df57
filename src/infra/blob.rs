//! Filesystem blob store with encryption at rest.
//!
//! Blobs are written as a sequence of XChaCha20-Poly1305 frames so that
//! payloads of any size can be encrypted and decrypted in a single forward
//! pass without holding the plaintext in memory. Each blob carries a random
//! nonce prefix in its header; per-frame nonces append a little-endian frame
//! counter. The frame flag and counter are bound into the AAD, and the last
//! frame is an authenticated terminator, so reordering, splicing, and
//! truncation all fail decryption.
//!
//! On-disk layout:
//!
//! ```text
//! [4: magic+version][16: nonce prefix]
//! frame*: [1: flag][4: ciphertext len, LE][ciphertext (plaintext + 16 tag)]
//! ```

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use rand::RngCore;
use std::io;
use std::path::PathBuf;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const MAGIC: [u8; 4] = *b"ARC\x01";
const NONCE_PREFIX_LEN: usize = 16;
const TAG_LEN: usize = 16;
const FRAME_HEADER_LEN: usize = 5;
const CHUNK_LEN: usize = 64 * 1024;

const FLAG_DATA: u8 = 0;
const FLAG_FINAL: u8 = 1;

#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
    key: [u8; 32],
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>, key: [u8; 32]) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("cannot create blob dir {}", root.display()))?;
        Ok(Self { root, key })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.key))
    }

    /// Encrypt `source` into the named blob, returning the encrypted size in
    /// bytes. The destination appears atomically: frames are written to a
    /// temp file that is renamed into place only after a clean finish.
    pub async fn write_stream<S>(&self, name: &str, source: S) -> Result<u64>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let tmp = self.path(&format!("{name}.tmp"));
        let result = self.write_frames(&tmp, source).await;
        match result {
            Ok(written) => {
                fs::rename(&tmp, self.path(name)).await?;
                Ok(written)
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp).await;
                Err(err)
            }
        }
    }

    /// Convenience for payloads already buffered in memory (images).
    pub async fn write(&self, name: &str, bytes: Bytes) -> Result<u64> {
        self.write_stream(name, futures::stream::iter([Ok::<_, io::Error>(bytes)]))
            .await
    }

    async fn write_frames<S>(&self, tmp: &PathBuf, mut source: S) -> Result<u64>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let cipher = self.cipher();
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        rand::rngs::OsRng.fill_bytes(&mut prefix);

        let mut file = File::create(tmp).await?;
        file.write_all(&MAGIC).await?;
        file.write_all(&prefix).await?;
        let mut written = (MAGIC.len() + NONCE_PREFIX_LEN) as u64;

        let mut counter: u64 = 0;
        let mut pending: Vec<u8> = Vec::with_capacity(CHUNK_LEN);

        while let Some(chunk) = source.try_next().await? {
            pending.extend_from_slice(&chunk);
            while pending.len() >= CHUNK_LEN {
                let rest = pending.split_off(CHUNK_LEN);
                let frame = std::mem::replace(&mut pending, rest);
                written += encrypt_frame(&cipher, &prefix, counter, FLAG_DATA, &frame, &mut file)
                    .await?;
                counter += 1;
            }
        }
        if !pending.is_empty() {
            written +=
                encrypt_frame(&cipher, &prefix, counter, FLAG_DATA, &pending, &mut file).await?;
            counter += 1;
        }
        // Authenticated terminator; its absence marks a truncated blob.
        written += encrypt_frame(&cipher, &prefix, counter, FLAG_FINAL, &[], &mut file).await?;

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Open a fresh single-pass decrypting read over the named blob.
    ///
    /// Fails with `io::ErrorKind::NotFound` if the blob does not exist. The
    /// stream yields plaintext in frame-sized chunks and errors out on any
    /// authentication or framing failure.
    pub async fn open_read(&self, name: &str) -> io::Result<BoxStream<'static, io::Result<Bytes>>> {
        let mut file = File::open(self.path(name)).await?;

        let mut header = [0u8; 4 + NONCE_PREFIX_LEN];
        file.read_exact(&mut header).await?;
        if header[..4] != MAGIC {
            return Err(invalid_data("unrecognized blob header"));
        }
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        prefix.copy_from_slice(&header[4..]);

        let cipher = self.cipher();
        let state = ReadState {
            file,
            cipher,
            prefix,
            counter: 0,
            done: false,
        };

        let stream = futures::stream::try_unfold(state, |mut state| async move {
            if state.done {
                return Ok(None);
            }
            let mut frame_header = [0u8; FRAME_HEADER_LEN];
            if let Err(err) = state.file.read_exact(&mut frame_header).await {
                // EOF before the terminator frame means the blob was cut off.
                return Err(match err.kind() {
                    io::ErrorKind::UnexpectedEof => invalid_data("truncated blob"),
                    _ => err,
                });
            }
            let flag = frame_header[0];
            let ct_len = u32::from_le_bytes(frame_header[1..].try_into().unwrap()) as usize;
            if ct_len < TAG_LEN || ct_len > CHUNK_LEN + TAG_LEN {
                return Err(invalid_data("invalid frame length"));
            }

            let mut ciphertext = vec![0u8; ct_len];
            state.file.read_exact(&mut ciphertext).await.map_err(|err| {
                match err.kind() {
                    io::ErrorKind::UnexpectedEof => invalid_data("truncated blob"),
                    _ => err,
                }
            })?;

            let nonce = frame_nonce(&state.prefix, state.counter);
            let aad = frame_aad(flag, state.counter);
            let plaintext = state
                .cipher
                .decrypt(
                    XNonce::from_slice(&nonce),
                    Payload {
                        msg: &ciphertext,
                        aad: &aad,
                    },
                )
                .map_err(|_| invalid_data("blob authentication failed"))?;

            state.counter += 1;
            if flag == FLAG_FINAL {
                state.done = true;
            }
            Ok(Some((Bytes::from(plaintext), state)))
        })
        // Skip the zero-length yield from the terminator frame.
        .try_filter(|chunk| futures::future::ready(!chunk.is_empty()))
        .boxed();

        Ok(stream)
    }

    /// Remove the named blob. A blob that is already gone counts as removed
    /// so that interrupted deletes stay retryable.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        match fs::remove_file(self.path(name)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(anyhow!("failed to delete blob {}: {}", name, err)),
        }
    }

    pub async fn exists(&self, name: &str) -> bool {
        fs::try_exists(self.path(name)).await.unwrap_or(false)
    }
}

struct ReadState {
    file: File,
    cipher: XChaCha20Poly1305,
    prefix: [u8; NONCE_PREFIX_LEN],
    counter: u64,
    done: bool,
}

async fn encrypt_frame(
    cipher: &XChaCha20Poly1305,
    prefix: &[u8; NONCE_PREFIX_LEN],
    counter: u64,
    flag: u8,
    plaintext: &[u8],
    file: &mut File,
) -> Result<u64> {
    let nonce = frame_nonce(prefix, counter);
    let aad = frame_aad(flag, counter);
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| anyhow!("blob encryption failed"))?;

    let mut frame_header = [0u8; FRAME_HEADER_LEN];
    frame_header[0] = flag;
    frame_header[1..].copy_from_slice(&(ciphertext.len() as u32).to_le_bytes());
    file.write_all(&frame_header).await?;
    file.write_all(&ciphertext).await?;
    Ok((FRAME_HEADER_LEN + ciphertext.len()) as u64)
}

fn frame_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u64) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

fn frame_aad(flag: u8, counter: u64) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[0] = flag;
    aad[1..].copy_from_slice(&counter.to_le_bytes());
    aad
}

fn invalid_data(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
