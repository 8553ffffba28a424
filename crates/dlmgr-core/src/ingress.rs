//! Local HTTP ingress (§4.5): a loopback-only `axum` server the browser
//! extension (or its native-messaging shim) talks to, plus the
//! native-messaging manifest/framing boundary contract (§6).

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::scheduler::Scheduler;

pub const APP_NAME: &str = "dlmgr";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct IngressState {
    pub scheduler: Scheduler,
    pub default_download_dir: PathBuf,
    pub worker_count: usize,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    app: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", app: APP_NAME, version: APP_VERSION })
}

#[derive(Deserialize)]
struct AddDownloadRequest {
    url: String,
    filename: Option<String>,
    stream_type: Option<String>,
}

#[derive(Serialize)]
struct AddDownloadResponse {
    status: &'static str,
    id: String,
}

/// POST /add_download — the extension's main entry point. `stream_type`
/// currently just distinguishes a user-declared streaming URL from a direct
/// one; the scheduler layer re-derives this itself via
/// `streaming::should_delegate` rather than trusting the caller blindly.
async fn add_download_handler(
    State(state): State<Arc<IngressState>>,
    Json(req): Json<AddDownloadRequest>,
) -> Result<Json<AddDownloadResponse>, (StatusCode, String)> {
    if req.url.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "url must not be empty".to_string()));
    }
    let url = crate::url_model::sanitize_url(&req.url)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    tracing::info!(url, filename = ?req.filename, stream_type = ?req.stream_type, "add_download");

    let item = state
        .scheduler
        .add_download(
            &url,
            state.default_download_dir.clone(),
            crate::queue::MAIN_QUEUE,
            state.worker_count,
            Arc::new(std::collections::HashMap::new()),
            None,
        )
        .await;

    Ok(Json(AddDownloadResponse { status: "success", id: item.id }))
}

#[derive(Deserialize)]
struct RegisterRequest {
    extension_id: String,
    browser: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    status: &'static str,
    app_version: &'static str,
}

/// POST /register — writes both the Chromium-family and Firefox-family
/// native-messaging manifests and installs the shim binary, so the
/// extension can reach this process over stdio as a fallback when the HTTP
/// ingress isn't reachable (§4.5). `browser` only validates the caller's
/// request; both manifests are written on every call regardless of its
/// value, since a single install has to serve whichever browser the
/// extension actually runs in.
async fn register_handler(
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, (StatusCode, String)> {
    native_messaging::Browser::parse(&req.browser)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    native_messaging::install(&req.extension_id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(RegisterResponse { status: "success", app_version: APP_VERSION }))
}

/// Builds the ingress router. CORS is permissive on the GET health probe
/// only (extensions poll it to detect whether the app is running); the
/// mutating POST endpoints are reached directly by the extension's
/// background script over the loopback address, not via cross-origin fetch.
pub fn router(state: Arc<IngressState>) -> Router {
    let health_cors = CorsLayer::new().allow_methods([Method::GET]).allow_origin(Any);

    let health = Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .layer(health_cors);

    let mutating = Router::new()
        .route("/add_download", post(add_download_handler))
        .route("/register", post(register_handler));

    health.merge(mutating).with_state(state)
}

/// Binds to the IPv4 loopback address only, on the given port (§4.5 "Local
/// HTTP Ingress... loopback-only binding").
pub fn loopback_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

pub async fn serve(state: Arc<IngressState>, port: u16) -> Result<()> {
    let addr = loopback_addr(port);
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "ingress listening");
    axum::serve(listener, router(state)).await.context("ingress server error")
}

/// Native-messaging boundary contract (§6): manifest shape, install
/// locations, and the stdio framed-message protocol. Deliberately stops at
/// the boundary — this crate does not ship a standalone native-messaging
/// host process, only the functions a shim would need.
pub mod native_messaging {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Browser {
        Chromium,
        Firefox,
    }

    impl Browser {
        pub fn parse(s: &str) -> Result<Self> {
            match s.to_ascii_lowercase().as_str() {
                "chrome" | "chromium" | "brave" | "edge" => Ok(Browser::Chromium),
                "firefox" => Ok(Browser::Firefox),
                other => anyhow::bail!("unsupported browser: {other}"),
            }
        }
    }

    /// Single manifest schema both browser families share (§6): only the
    /// install directory and the `allowed_origins` scheme prefix differ.
    #[derive(Serialize)]
    struct Manifest<'a> {
        name: &'a str,
        description: &'a str,
        path: String,
        #[serde(rename = "type")]
        kind: &'a str,
        allowed_origins: Vec<String>,
    }

    fn manifest_dir(browser: Browser) -> Result<PathBuf> {
        let home = std::env::var_os("HOME").map(PathBuf::from).context("HOME not set")?;
        Ok(match browser {
            Browser::Chromium => home.join(".config/google-chrome/NativeMessagingHosts"),
            Browser::Firefox => home.join(".mozilla/native-messaging-hosts"),
        })
    }

    fn origin_scheme(browser: Browser) -> &'static str {
        match browser {
            Browser::Chromium => "chrome-extension",
            Browser::Firefox => "moz-extension",
        }
    }

    fn shim_install_path() -> Result<PathBuf> {
        let home = std::env::var_os("HOME").map(PathBuf::from).context("HOME not set")?;
        Ok(home.join(format!(".local/bin/{}-native-host", super::APP_NAME)))
    }

    fn write_manifest(extension_id: &str, browser: Browser, shim_path: &std::path::Path) -> Result<PathBuf> {
        let dir = manifest_dir(browser)?;
        std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let manifest_path = dir.join(format!("{}.json", super::APP_NAME));

        let scheme = origin_scheme(browser);
        let json = serde_json::to_string_pretty(&Manifest {
            name: super::APP_NAME,
            description: "Segmented download manager native messaging host",
            path: shim_path.to_string_lossy().into_owned(),
            kind: "stdio",
            allowed_origins: vec![format!("{scheme}://{extension_id}/")],
        })?;

        std::fs::write(&manifest_path, format!("{json}\n"))
            .with_context(|| format!("write {}", manifest_path.display()))?;
        Ok(manifest_path)
    }

    /// Writes both the Chromium-family and Firefox-family manifests for
    /// `extension_id` (pointing at the installed shim) and copies the
    /// current executable into place as that shim, marking it executable on
    /// Unix. A single shim binary serves both browsers, so both manifests
    /// are always written together rather than gated on a chosen browser
    /// (§6 "manifests" plural). Returns `(chromium_manifest, firefox_manifest)`.
    pub fn install(extension_id: &str) -> Result<(PathBuf, PathBuf)> {
        let shim_path = install_shim()?;
        let chromium = write_manifest(extension_id, Browser::Chromium, &shim_path)?;
        let firefox = write_manifest(extension_id, Browser::Firefox, &shim_path)?;
        Ok((chromium, firefox))
    }

    /// Copies the running executable to the fixed shim path so the manifest's
    /// `path` stays stable across upgrades that change the install location.
    fn install_shim() -> Result<PathBuf> {
        let shim_path = shim_install_path()?;
        if let Some(parent) = shim_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let current_exe = std::env::current_exe().context("current_exe")?;
        std::fs::copy(&current_exe, &shim_path).with_context(|| format!("copy shim to {}", shim_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&shim_path)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&shim_path, perms)?;
        }

        Ok(shim_path)
    }

    /// Actions a framed stdio message may carry (§6 "stdio framed-message
    /// protocol").
    #[derive(Debug, Clone, Deserialize, Serialize)]
    #[serde(tag = "action", rename_all = "snake_case")]
    pub enum HostMessage {
        AddDownload { url: String, filename: Option<String> },
        Ping,
        TestConnection,
        RegisterExtension { extension_id: String },
    }

    /// Reads one length-prefixed JSON message: a 4-byte little-endian length
    /// followed by that many bytes of UTF-8 JSON (the same framing Chromium
    /// and Firefox both use for native messaging).
    pub fn read_framed_message(reader: &mut impl Read) -> Result<HostMessage> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).context("read message length")?;
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).context("read message body")?;
        serde_json::from_slice(&buf).context("parse framed message")
    }

    /// Writes `value` length-prefixed the same way.
    pub fn write_framed_message(writer: &mut impl Write, value: &impl Serialize) -> Result<()> {
        let body = serde_json::to_vec(value).context("serialize framed message")?;
        let len = u32::try_from(body.len()).context("message too large to frame")?;
        writer.write_all(&len.to_le_bytes()).context("write message length")?;
        writer.write_all(&body).context("write message body")?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::io::Cursor;

        #[test]
        fn parses_known_browsers() {
            assert_eq!(Browser::parse("chrome").unwrap(), Browser::Chromium);
            assert_eq!(Browser::parse("Firefox").unwrap(), Browser::Firefox);
            assert!(Browser::parse("lynx").is_err());
        }

        #[test]
        fn framed_message_roundtrips() {
            let msg = HostMessage::AddDownload { url: "https://example.com/a".to_string(), filename: None };
            let mut buf = Vec::new();
            write_framed_message(&mut buf, &msg).unwrap();

            let mut cursor = Cursor::new(buf);
            let read_back = read_framed_message(&mut cursor).unwrap();
            match read_back {
                HostMessage::AddDownload { url, filename } => {
                    assert_eq!(url, "https://example.com/a");
                    assert!(filename.is_none());
                }
                _ => panic!("wrong variant"),
            }
        }

        #[test]
        fn ping_message_parses_from_tagged_json() {
            let json = br#"{"action":"ping"}"#;
            let mut framed = Vec::new();
            framed.extend_from_slice(&(json.len() as u32).to_le_bytes());
            framed.extend_from_slice(json);
            let mut cursor = Cursor::new(framed);
            assert!(matches!(read_framed_message(&mut cursor).unwrap(), HostMessage::Ping));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_addr_is_ipv4_localhost() {
        let addr = loopback_addr(9123);
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(addr.port(), 9123);
    }
}
