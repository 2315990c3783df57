use serde::Serialize;
use time::OffsetDateTime;

/// The vault's single registered account. The password is stored only as an
/// argon2 PHC string.
#[derive(Debug, Clone, Serialize)]
pub struct Credential {
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
