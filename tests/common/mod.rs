#![allow(dead_code)]

use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::OnceCell;
use tower::ServiceExt;
use uuid::Uuid;

use arca::app::media::IdLocks;
use arca::config::AppConfig;
use arca::infra::{blob::BlobStore, db::Db};
use arca::AppState;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

// 32 bytes base64-encoded (test-only keys — NOT used in production)
// "0123456789abcdef0123456789abcdef" (32 bytes)
const TEST_SESSION_KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";
// "fedcba9876543210fedcba9876543210" (32 bytes)
const TEST_BLOB_KEY: &str = "ZmVkY2JhOTg3NjU0MzIxMGZlZGNiYTk4NzY1NDMyMTA=";

pub const DEFAULT_USERNAME: &str = "vaultowner";
pub const DEFAULT_SECRET: &str = "testsecret123";

// ---------------------------------------------------------------------------
// TestApp — shared, lazily initialized once per test binary
// ---------------------------------------------------------------------------

pub struct TestApp {
    router: Router,
    pub state: AppState,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    body_bytes: bytes::Bytes,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body_bytes).unwrap_or(Value::Null)
    }

    pub fn error_message(&self) -> String {
        self.json()["error"].as_str().unwrap_or("").to_string()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.body_bytes
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }
}

static TEST_APP: OnceCell<TestApp> = OnceCell::const_new();

/// Get (or lazily create) the shared TestApp instance.
pub async fn app() -> &'static TestApp {
    TEST_APP
        .get_or_init(|| async { TestApp::setup().await })
        .await
}

impl TestApp {
    // ------------------------------------------------------------------
    // Setup — runs once per test binary
    // ------------------------------------------------------------------
    async fn setup() -> Self {
        // Throwaway workspace under the OS temp dir; each test binary gets
        // its own database file and blob directory.
        let workdir = std::env::temp_dir().join(format!("arca-test-{}", Uuid::new_v4()));
        let blob_dir = workdir.join("blobs");
        std::fs::create_dir_all(&blob_dir).expect("cannot create test workdir");

        assert_eq!(STANDARD.decode(TEST_SESSION_KEY).unwrap().len(), 32);
        assert_eq!(STANDARD.decode(TEST_BLOB_KEY).unwrap().len(), 32);

        std::env::set_var(
            "DATABASE_URL",
            format!("sqlite://{}/arca.db?mode=rwc", workdir.display()),
        );
        std::env::set_var("ARCA_BLOB_DIR", blob_dir.display().to_string());
        std::env::set_var("ARCA_SESSION_KEY", TEST_SESSION_KEY);
        std::env::set_var("ARCA_BLOB_KEY", TEST_BLOB_KEY);
        std::env::set_var("ARCA_SESSION_TTL_HOURS", "1");

        // Same code path as production.
        let config = AppConfig::from_env().expect("failed to build AppConfig");

        let db = Db::connect(&config).await.expect("Db::connect failed");
        let blobs = BlobStore::new(&config.blob_dir, config.blob_key)
            .expect("BlobStore::new failed");

        let state = AppState {
            db,
            blobs,
            locks: IdLocks::default(),
            session_key: config.session_key,
            session_ttl_hours: config.session_ttl_hours,
            image_max_bytes: config.image_max_bytes,
            thumb_max_dim: config.thumb_max_dim,
            ffmpeg_bin: config.ffmpeg_bin.clone(),
        };

        let router = arca::http::router(state.clone());

        TestApp { router, state }
    }

    // ------------------------------------------------------------------
    // Low-level request helper
    // ------------------------------------------------------------------
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Body,
        headers: &[(&str, &str)],
    ) -> TestResponse {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("host", "localhost");

        for &(key, value) in headers {
            builder = builder.header(key, value);
        }

        let request = builder.body(body).unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("oneshot failed");

        let status = response.status();
        let headers = response.headers().clone();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to collect body")
            .to_bytes();

        TestResponse {
            status,
            headers,
            body_bytes,
        }
    }

    // ------------------------------------------------------------------
    // Convenience HTTP helpers
    // ------------------------------------------------------------------
    pub async fn get(&self, path: &str, cookie: Option<&str>) -> TestResponse {
        let mut headers = vec![];
        let jar;
        if let Some(c) = cookie {
            jar = c.to_string();
            headers.push(("cookie", jar.as_str()));
        }
        self.request(Method::GET, path, Body::empty(), &headers).await
    }

    pub async fn post_json(&self, path: &str, body: Value, cookie: Option<&str>) -> TestResponse {
        let mut headers = vec![("content-type", "application/json")];
        let jar;
        if let Some(c) = cookie {
            jar = c.to_string();
            headers.push(("cookie", jar.as_str()));
        }
        self.request(
            Method::POST,
            path,
            Body::from(serde_json::to_string(&body).unwrap()),
            &headers,
        )
        .await
    }

    pub async fn delete(&self, path: &str, cookie: Option<&str>) -> TestResponse {
        let mut headers = vec![];
        let jar;
        if let Some(c) = cookie {
            jar = c.to_string();
            headers.push(("cookie", jar.as_str()));
        }
        self.request(Method::DELETE, path, Body::empty(), &headers)
            .await
    }

    /// Raw-body upload with the headers the upload route requires.
    pub async fn upload(
        &self,
        payload: Vec<u8>,
        content_type: &str,
        filename: &str,
        cookie: &str,
    ) -> TestResponse {
        let disposition = format!("attachment; filename=\"{}\"", filename);
        let length = payload.len().to_string();
        let headers = vec![
            ("content-type", content_type),
            ("content-disposition", disposition.as_str()),
            ("content-length", length.as_str()),
            ("cookie", cookie),
        ];
        self.request(Method::POST, "/media", Body::from(payload), &headers)
            .await
    }

    // ------------------------------------------------------------------
    // Test data helpers
    // ------------------------------------------------------------------

    /// Register the vault's single account if nobody has yet. Tests run in
    /// parallel and share the app, so a conflict here is fine.
    pub async fn ensure_account(&self) {
        let resp = self
            .post_json(
                "/register",
                serde_json::json!({ "username": DEFAULT_USERNAME, "secret": DEFAULT_SECRET }),
                None,
            )
            .await;
        assert!(
            resp.status == StatusCode::OK || resp.status == StatusCode::CONFLICT,
            "unexpected registration status: {}",
            resp.status
        );
    }

    /// Log in with the default credentials and return the session cookie
    /// in `name=value` form.
    pub async fn session_cookie(&self) -> String {
        self.ensure_account().await;

        let auth = format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", DEFAULT_USERNAME, DEFAULT_SECRET))
        );
        let resp = self
            .request(Method::GET, "/login", Body::empty(), &[("authorization", auth.as_str())])
            .await;
        assert_eq!(resp.status, StatusCode::OK, "login failed: {}", resp.error_message());

        let set_cookie = resp
            .header("set-cookie")
            .expect("login response missing set-cookie");
        set_cookie
            .split(';')
            .next()
            .expect("malformed set-cookie")
            .to_string()
    }

    /// A small but real PNG payload, unique per call so tests can identify
    /// their own records in the shared store.
    pub fn png_payload(&self) -> Vec<u8> {
        let seed = Uuid::new_v4();
        let pixels = seed.as_bytes();
        let img = image::RgbImage::from_fn(8, 8, |x, y| {
            let i = ((x + y * 8) % 16) as usize;
            image::Rgb([pixels[i], x as u8 * 16, y as u8 * 16])
        });
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .expect("failed to encode test PNG");
        out.into_inner()
    }
}
