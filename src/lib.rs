pub mod app;
pub mod config;
pub mod domain;
pub mod http;
pub mod infra;

use crate::app::media::IdLocks;
use crate::infra::{blob::BlobStore, db::Db};

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub blobs: BlobStore,
    pub locks: IdLocks,
    pub session_key: [u8; 32],
    pub session_ttl_hours: u64,
    pub image_max_bytes: usize,
    pub thumb_max_dim: u32,
    pub ffmpeg_bin: String,
}
