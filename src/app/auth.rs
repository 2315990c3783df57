use anyhow::{anyhow, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use pasetors::claims::{Claims, ClaimsValidationRules};
use pasetors::keys::SymmetricKey;
use pasetors::token::UntrustedToken;
use pasetors::{local, version4::V4, Local};
use sqlx::Row;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::account::Credential;
use crate::infra::db::Db;

/// Outcome of a registration attempt. The vault holds at most one account,
/// so a second registration is a conflict regardless of username.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    Conflict,
}

#[derive(Debug, Clone)]
pub struct SessionToken {
    pub token: String,
    pub expires_at: OffsetDateTime,
}

/// Verified identity carried by a session cookie.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub username: String,
}

#[derive(Clone)]
pub struct AuthService {
    db: Db,
    session_key: [u8; 32],
    session_ttl_hours: u64,
}

impl AuthService {
    pub fn new(db: Db, session_key: [u8; 32], session_ttl_hours: u64) -> Self {
        Self {
            db,
            session_key,
            session_ttl_hours,
        }
    }

    /// One-time registration. The single-row account table turns a racing
    /// second insert into a unique violation, which maps to Conflict.
    pub async fn register(&self, username: &str, secret: &str) -> Result<RegisterOutcome> {
        let password_hash = hash_password(secret)?;
        let created_at = OffsetDateTime::now_utc();

        let result = sqlx::query(
            "INSERT INTO account (id, username, password_hash, created_at) \
             VALUES (1, ?, ?, ?)",
        )
        .bind(username)
        .bind(&password_hash)
        .bind(created_at.unix_timestamp_nanos() as i64)
        .execute(self.db.pool())
        .await;

        match result {
            Ok(_) => Ok(RegisterOutcome::Created),
            Err(sqlx::Error::Database(db_err))
                if db_err.kind() == sqlx::error::ErrorKind::UniqueViolation =>
            {
                Ok(RegisterOutcome::Conflict)
            }
            // The id=1 CHECK surfaces as a plain constraint violation when a
            // second row is attempted with an explicit id.
            Err(sqlx::Error::Database(db_err))
                if db_err.kind() == sqlx::error::ErrorKind::CheckViolation =>
            {
                Ok(RegisterOutcome::Conflict)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_credential(&self, username: &str) -> Result<Option<Credential>> {
        let row = sqlx::query(
            "SELECT username, password_hash, created_at FROM account WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(self.db.pool())
        .await?;

        let credential = match row {
            Some(row) => Some(Credential {
                username: row.get("username"),
                password_hash: row.get("password_hash"),
                created_at: OffsetDateTime::from_unix_timestamp_nanos(
                    row.get::<i64, _>("created_at") as i128,
                )?,
            }),
            None => None,
        };
        Ok(credential)
    }

    /// Verify a basic-credential challenge and mint a session token on
    /// success. Returns None for any unknown username or bad secret.
    pub async fn login(&self, username: &str, secret: &str) -> Result<Option<SessionToken>> {
        let credential = match self.get_credential(username).await? {
            Some(credential) => credential,
            None => return Ok(None),
        };

        if !verify_password(secret, &credential.password_hash)? {
            return Ok(None);
        }

        let token = self.issue_session_token(&credential.username)?;
        Ok(Some(token))
    }

    /// Re-derive the authenticated state from a presented cookie value.
    /// There is no server-side session table; the token is self-verifying.
    pub fn authenticate(&self, token: &str) -> Option<AuthSession> {
        let claims = self.decrypt_claims(token)?;
        let username = claims
            .get_claim("sub")
            .and_then(|value| value.as_str())?
            .to_string();
        Some(AuthSession { username })
    }

    fn issue_session_token(&self, username: &str) -> Result<SessionToken> {
        let ttl = std::time::Duration::from_secs(self.session_ttl_hours * 60 * 60);
        let mut claims = Claims::new_expires_in(&ttl)?;
        claims.issuer("arca")?;
        claims.audience("arca")?;
        claims.subject(username)?;
        claims.token_identifier(&Uuid::new_v4().to_string())?;

        let key = SymmetricKey::<V4>::from(&self.session_key)?;
        let token = local::encrypt(&key, &claims, None, None)?;
        let expires_at =
            OffsetDateTime::now_utc() + time::Duration::hours(self.session_ttl_hours as i64);

        Ok(SessionToken { token, expires_at })
    }

    fn decrypt_claims(&self, token: &str) -> Option<Claims> {
        let key = SymmetricKey::<V4>::from(&self.session_key).ok()?;
        let mut rules = ClaimsValidationRules::new();
        rules.validate_issuer_with("arca");
        rules.validate_audience_with("arca");

        let untrusted = UntrustedToken::<Local, V4>::try_from(token).ok()?;
        let trusted = local::decrypt(&key, &untrusted, &rules, None, None).ok()?;
        trusted.payload_claims().cloned()
    }
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("failed to hash password: {}", err))?;
    Ok(hash.to_string())
}

fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|err| anyhow!("failed to parse password hash: {}", err))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
