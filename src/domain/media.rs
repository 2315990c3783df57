use serde::{Deserialize, Serialize};
use std::str::FromStr;
use time::OffsetDateTime;

/// Metadata for one stored media item and its thumbnail. A record exists
/// only while both referenced blobs exist on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: i64,
    #[serde(skip_serializing)]
    pub stored_name: String,
    pub original_name: String,
    #[serde(skip_serializing)]
    pub thumb_name: String,
    pub content_type: String,
    pub encrypted_size: i64,
    pub logical_size: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Pagination sort direction over the creation timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    /// Newest first (recency-descending).
    RecentFirst,
    /// Oldest first (recency-ascending).
    RecentLast,
}

impl FromStr for OrderType {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "recent-first" => Ok(Self::RecentFirst),
            "recent-last" => Ok(Self::RecentLast),
            _ => Err(()),
        }
    }
}

/// Upload content categories accepted by the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp"];
const VIDEO_TYPES: &[&str] = &["video/mp4", "video/quicktime", "video/webm"];

impl MediaKind {
    /// Classify a declared content type against the allow-list.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        if IMAGE_TYPES.contains(&content_type) {
            Some(Self::Image)
        } else if VIDEO_TYPES.contains(&content_type) {
            Some(Self::Video)
        } else {
            None
        }
    }
}
