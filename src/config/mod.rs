use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::net::SocketAddr;
use std::str::FromStr;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub http_addr: String,
    pub database_url: String,
    pub blob_dir: String,
    pub blob_key: [u8; 32],
    pub session_key: [u8; 32],
    pub session_ttl_hours: u64,
    pub upload_max_bytes: usize,
    pub image_max_bytes: usize,
    pub thumb_max_dim: u32,
    pub ffmpeg_bin: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let http_addr = env_or("ARCA_HTTP_ADDR", "0.0.0.0:8080");
        let _parsed_http_addr = SocketAddr::from_str(&http_addr)
            .map_err(|err| anyhow!("invalid ARCA_HTTP_ADDR: {}", err))?;

        Ok(Self {
            http_addr,
            database_url: env_or("DATABASE_URL", "sqlite://arca.db?mode=rwc"),
            blob_dir: env_or("ARCA_BLOB_DIR", "blobs"),
            blob_key: env_key_32("ARCA_BLOB_KEY")?,
            session_key: env_key_32("ARCA_SESSION_KEY")?,
            session_ttl_hours: env_or_parse("ARCA_SESSION_TTL_HOURS", "720")?,
            upload_max_bytes: env_or_parse("ARCA_UPLOAD_MAX_BYTES", "2147483648")?,
            image_max_bytes: env_or_parse("ARCA_IMAGE_MAX_BYTES", "33554432")?,
            thumb_max_dim: env_or_parse("ARCA_THUMB_MAX_DIM", "320")?,
            ffmpeg_bin: env_or("ARCA_FFMPEG_BIN", "ffmpeg"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_err(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing required env var: {}", key))
}

fn env_or_parse<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let value = std::env::var(key).unwrap_or_else(|_| default.to_string());
    value
        .parse::<T>()
        .map_err(|err| anyhow!("invalid {}: {}", key, err))
}

fn env_key_32(key: &str) -> Result<[u8; 32]> {
    let value = env_or_err(key)?;
    let decoded = STANDARD
        .decode(value.as_bytes())
        .map_err(|err| anyhow!("invalid {}: {}", key, err))?;
    if decoded.len() != 32 {
        return Err(anyhow!("invalid {}: expected 32 bytes", key));
    }
    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(&decoded);
    Ok(key_bytes)
}
