//! PNG preview derivation for uploaded images and videos.

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use image::ImageFormat;
use std::io::{self, Cursor};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

pub const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a];

/// Decode an image per its declared content type, downsample to fit within
/// `max_dim`, and re-encode as PNG. Fails if the bytes are not a valid
/// instance of the declared type.
pub fn derive_image(bytes: &[u8], content_type: &str, max_dim: u32) -> Result<Vec<u8>> {
    let format = ImageFormat::from_mime_type(content_type)
        .ok_or_else(|| anyhow!("no decoder for {}", content_type))?;
    let decoded = image::load_from_memory_with_format(bytes, format)
        .with_context(|| format!("payload is not valid {}", content_type))?;

    let preview = decoded.thumbnail(max_dim, max_dim);
    let mut out = Cursor::new(Vec::new());
    preview
        .write_to(&mut out, ImageFormat::Png)
        .context("failed to encode preview")?;
    Ok(out.into_inner())
}

/// Extract a representative frame from a video stream and encode it as PNG,
/// scaled to `max_dim` wide.
///
/// The plaintext is fed to ffmpeg over a pipe; ffmpeg stops reading once it
/// has a frame, so broken-pipe errors while feeding are expected and benign.
pub async fn derive_video_frame<S>(ffmpeg_bin: &str, source: S, max_dim: u32) -> Result<Vec<u8>>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin + Send + 'static,
{
    let scale = format!("scale={max_dim}:-1");
    let mut child = Command::new(ffmpeg_bin)
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            "pipe:0",
            "-frames:v",
            "1",
            "-vf",
            &scale,
            "-f",
            "image2pipe",
            "-c:v",
            "png",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn {}", ffmpeg_bin))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("ffmpeg stdin unavailable"))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("ffmpeg stdout unavailable"))?;

    let feeder = tokio::spawn(async move {
        let mut source = source;
        while let Some(chunk) = source.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => return Err(err),
            };
            if stdin.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = stdin.shutdown().await;
        Ok(())
    });

    let mut png = Vec::new();
    stdout
        .read_to_end(&mut png)
        .await
        .context("failed to read ffmpeg output")?;
    let status = child.wait().await.context("ffmpeg did not exit")?;

    if let Ok(Err(err)) = feeder.await {
        return Err(anyhow!("failed to read video payload: {}", err));
    }
    if !status.success() || png.len() < PNG_MAGIC.len() || png[..8] != PNG_MAGIC {
        return Err(anyhow!("payload is not a decodable video"));
    }
    Ok(png)
}
