use std::collections::{HashSet, VecDeque};
use std::env;
use std::fs;
use std::io::{BufRead, BufReader, ErrorKind};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::GenericImageView;
use serde_json::{json, Value};
use tempfile::TempDir;
use tungstenite::client::IntoClientRequest;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect as websocket_connect, Message as WsMessage, WebSocket};

use crate::RenderBackend;

const VIEWPORT_WIDTH: u32 = 1280;
const VIEWPORT_HEIGHT: u32 = 800;
// Chrome refuses screenshots taller than its texture limit.
const MAX_PAGE_HEIGHT: u32 = 16_384;
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
const STARTUP_TIMEOUT: Duration = Duration::from_secs(20);
const NETWORK_QUIET_WINDOW: Duration = Duration::from_millis(500);
const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(500);

const CHROME_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
    "headless_shell",
    "headless-shell",
];
const MACOS_CHROME: &str = "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rendered {
    pub width: u32,
    pub height: u32,
}

/// Full-page screenshot renderer driving a headless Chrome instance over
/// the DevTools websocket. The browser is launched fresh for every capture
/// and torn down when the capture ends, successful or not.
pub struct ChromeRenderer {
    binary: PathBuf,
}

impl ChromeRenderer {
    pub fn discover() -> Result<Self> {
        Ok(Self {
            binary: chrome_binary()?,
        })
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl RenderBackend for ChromeRenderer {
    fn capture(&self, html_body: &str, png_path: &Path) -> Result<Rendered> {
        let document = wrap_document(html_body);
        if let Some(parent) = png_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let html_path = png_path.with_extension("html");
        fs::write(&html_path, &document)
            .with_context(|| format!("failed to write {}", html_path.display()))?;
        let html_path = fs::canonicalize(&html_path)
            .with_context(|| format!("failed to resolve {}", html_path.display()))?;
        let page_url = format!("file://{}", html_path.display());

        let mut session = BrowserSession::launch(&self.binary)?;
        let deadline = Instant::now() + NAVIGATION_TIMEOUT;
        session.command("Page.enable", json!({}), deadline)?;
        session.command("Network.enable", json!({}), deadline)?;
        session.command(
            "Emulation.setDeviceMetricsOverride",
            device_metrics(VIEWPORT_HEIGHT),
            deadline,
        )?;
        session.reset_settle();
        session.command("Page.navigate", json!({"url": page_url}), deadline)?;
        session.wait_until_settled(deadline)?;

        let metrics = session.command("Page.getLayoutMetrics", json!({}), deadline)?;
        let height = full_page_height(&metrics);
        if height > VIEWPORT_HEIGHT {
            session.command(
                "Emulation.setDeviceMetricsOverride",
                device_metrics(height),
                deadline,
            )?;
        }
        let shot = session.command("Page.captureScreenshot", json!({"format": "png"}), deadline)?;
        let encoded = shot
            .get("data")
            .and_then(Value::as_str)
            .context("screenshot reply missing image data")?;
        let bytes = BASE64
            .decode(encoded.as_bytes())
            .context("screenshot base64 decode failed")?;
        fs::write(png_path, &bytes)
            .with_context(|| format!("failed to write {}", png_path.display()))?;
        let decoded = image::load_from_memory(&bytes)
            .context("captured screenshot is not a decodable image")?;
        let (width, height) = decoded.dimensions();
        Ok(Rendered { width, height })
    }
}

/// Minimal document shell around the generated body. Tailwind comes from
/// the CDN runtime, matching what the model is told to target.
fn wrap_document(body: &str) -> String {
    format!(
        "<html>\n  <head>\n    <script src=\"https://cdn.tailwindcss.com\"></script>\n  </head>\n  <body>\n{body}\n  </body>\n</html>\n"
    )
}

fn device_metrics(height: u32) -> Value {
    json!({
        "width": VIEWPORT_WIDTH,
        "height": height,
        "deviceScaleFactor": 1,
        "mobile": false,
    })
}

fn full_page_height(metrics: &Value) -> u32 {
    metrics
        .get("cssContentSize")
        .and_then(|size| size.get("height"))
        .and_then(Value::as_f64)
        .map(|height| height.ceil() as u32)
        .unwrap_or(VIEWPORT_HEIGHT)
        .clamp(VIEWPORT_HEIGHT, MAX_PAGE_HEIGHT)
}

fn chrome_binary() -> Result<PathBuf> {
    if let Some(raw) = crate::non_empty_env("MIMIC_CHROME") {
        let path = PathBuf::from(raw);
        if path.exists() {
            return Ok(path);
        }
        bail!(
            "MIMIC_CHROME points at {}, which does not exist",
            path.display()
        );
    }
    let path_var = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&path_var) {
        for candidate in CHROME_CANDIDATES {
            let full = dir.join(candidate);
            if full.is_file() {
                return Ok(full);
            }
        }
    }
    let mac = PathBuf::from(MACOS_CHROME);
    if mac.exists() {
        return Ok(mac);
    }
    bail!("no Chrome or Chromium binary found; set MIMIC_CHROME to the browser executable")
}

/// One headless browser plus its DevTools socket and page session. Owns
/// the child process and the throwaway profile directory; both are
/// released on drop, including on error paths.
struct BrowserSession {
    child: Child,
    ws: WebSocket<MaybeTlsStream<TcpStream>>,
    session_id: String,
    next_id: u64,
    loaded: bool,
    inflight: HashSet<String>,
    last_activity: Instant,
    _profile: TempDir,
}

impl BrowserSession {
    fn launch(binary: &Path) -> Result<Self> {
        let profile = tempfile::tempdir().context("failed to create browser profile dir")?;
        let mut child = Command::new(binary)
            .arg("--headless=new")
            .arg("--remote-debugging-port=0")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-gpu")
            .arg("--hide-scrollbars")
            .arg("--mute-audio")
            .arg(format!("--user-data-dir={}", profile.path().display()))
            .arg("about:blank")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to launch {}", binary.display()))?;

        let stderr = match child.stderr.take() {
            Some(stderr) => stderr,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                bail!("browser stderr unavailable");
            }
        };
        let ws = match wait_for_devtools_url(stderr).and_then(|ws_url| {
            let request = ws_url
                .as_str()
                .into_client_request()
                .context("invalid devtools websocket url")?;
            let (mut ws, _) =
                websocket_connect(request).context("failed to connect devtools websocket")?;
            set_socket_read_timeout(&mut ws, Some(SOCKET_READ_TIMEOUT));
            Ok(ws)
        }) {
            Ok(ws) => ws,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };

        let mut session = Self {
            child,
            ws,
            session_id: String::new(),
            next_id: 0,
            loaded: false,
            inflight: HashSet::new(),
            last_activity: Instant::now(),
            _profile: profile,
        };
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        let target = session.browser_command(
            "Target.createTarget",
            json!({"url": "about:blank"}),
            deadline,
        )?;
        let target_id = target
            .get("targetId")
            .and_then(Value::as_str)
            .context("createTarget reply missing targetId")?
            .to_string();
        let attached = session.browser_command(
            "Target.attachToTarget",
            json!({"targetId": target_id, "flatten": true}),
            deadline,
        )?;
        session.session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .context("attachToTarget reply missing sessionId")?
            .to_string();
        Ok(session)
    }

    /// Command scoped to the attached page session.
    fn command(&mut self, method: &str, params: Value, deadline: Instant) -> Result<Value> {
        let session_id = self.session_id.clone();
        self.dispatch(method, params, Some(session_id), deadline)
    }

    /// Browser-level command (target management has no session scope).
    fn browser_command(&mut self, method: &str, params: Value, deadline: Instant) -> Result<Value> {
        self.dispatch(method, params, None, deadline)
    }

    fn dispatch(
        &mut self,
        method: &str,
        params: Value,
        session_id: Option<String>,
        deadline: Instant,
    ) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        let mut request = json!({"id": id, "method": method, "params": params});
        if let Some(session_id) = session_id {
            request["sessionId"] = Value::String(session_id);
        }
        let raw = serde_json::to_string(&request).context("failed to serialize devtools command")?;
        self.ws
            .send(WsMessage::Text(raw.into()))
            .with_context(|| format!("failed to send {method}"))?;

        loop {
            if Instant::now() >= deadline {
                bail!("{method} timed out");
            }
            let Some(value) = self.read_payload(method)? else {
                continue;
            };
            if value.get("id").and_then(Value::as_u64) == Some(id) {
                if let Some(error) = value.get("error") {
                    bail!(
                        "{method} failed: {}",
                        error
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("devtools error")
                    );
                }
                return Ok(value.get("result").cloned().unwrap_or(Value::Null));
            }
            self.track_event(&value);
        }
    }

    /// Called just before navigation: the initial about:blank load may
    /// already have fired while earlier commands were draining.
    fn reset_settle(&mut self) {
        self.loaded = false;
        self.inflight.clear();
        self.last_activity = Instant::now();
    }

    /// Blocks until the load event has fired and the network has been
    /// quiet (no inflight requests) for the quiet window, or the deadline
    /// passes.
    fn wait_until_settled(&mut self, deadline: Instant) -> Result<()> {
        loop {
            if self.loaded
                && self.inflight.is_empty()
                && self.last_activity.elapsed() >= NETWORK_QUIET_WINDOW
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "page did not reach network quiescence within {:?}",
                    NAVIGATION_TIMEOUT
                );
            }
            if let Some(value) = self.read_payload("navigation settle")? {
                if value.get("id").is_none() {
                    self.track_event(&value);
                }
            }
        }
    }

    /// One websocket read; `None` on timeout ticks and ignorable frames.
    fn read_payload(&mut self, method: &str) -> Result<Option<Value>> {
        let message = match self.ws.read() {
            Ok(message) => message,
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                return Ok(None);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("devtools read failed during {method}"))
            }
        };
        let raw = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => return Ok(None),
            WsMessage::Close(_) => bail!("devtools socket closed during {method}"),
            _ => return Ok(None),
        };
        Ok(serde_json::from_str(&raw).ok())
    }

    fn track_event(&mut self, value: &Value) {
        let Some(method) = value.get("method").and_then(Value::as_str) else {
            return;
        };
        match method {
            "Page.loadEventFired" => {
                self.loaded = true;
                self.last_activity = Instant::now();
            }
            "Network.requestWillBeSent" => {
                if let Some(id) = request_id(value) {
                    self.inflight.insert(id);
                    self.last_activity = Instant::now();
                }
            }
            "Network.loadingFinished" | "Network.loadingFailed" => {
                if let Some(id) = request_id(value) {
                    self.inflight.remove(&id);
                    self.last_activity = Instant::now();
                }
            }
            _ => {}
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        let _ = self.ws.close(None);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn request_id(value: &Value) -> Option<String> {
    value
        .get("params")
        .and_then(|params| params.get("requestId"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn wait_for_devtools_url(stderr: ChildStderr) -> Result<String> {
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let reader = BufReader::new(stderr);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if sender.send(line).is_err() {
                break;
            }
        }
    });

    let deadline = Instant::now() + STARTUP_TIMEOUT;
    let mut tail: VecDeque<String> = VecDeque::new();
    loop {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            bail!(
                "browser did not expose a DevTools endpoint within {:?}: {}",
                STARTUP_TIMEOUT,
                tail.iter().cloned().collect::<Vec<_>>().join(" | ")
            );
        };
        match receiver.recv_timeout(remaining) {
            Ok(line) => {
                if let Some(url) = devtools_url_from_line(&line) {
                    return Ok(url);
                }
                if tail.len() == 8 {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                bail!(
                    "browser exited before exposing a DevTools endpoint: {}",
                    tail.iter().cloned().collect::<Vec<_>>().join(" | ")
                );
            }
        }
    }
}

fn devtools_url_from_line(line: &str) -> Option<String> {
    line.trim()
        .strip_prefix("DevTools listening on ")
        .map(|url| url.trim().to_string())
        .filter(|url| url.starts_with("ws://") || url.starts_with("wss://"))
}

fn set_socket_read_timeout(
    ws: &mut WebSocket<MaybeTlsStream<TcpStream>>,
    timeout: Option<Duration>,
) {
    match ws.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            let _ = stream.set_read_timeout(timeout);
        }
        MaybeTlsStream::Rustls(stream) => {
            let _ = stream.get_mut().set_read_timeout(timeout);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_document_loads_tailwind_around_the_body() {
        let document = wrap_document("<div>hello</div>");
        assert!(document.contains("https://cdn.tailwindcss.com"));
        assert!(document.contains("<body>\n<div>hello</div>"));
        let script = document.find("cdn.tailwindcss.com").unwrap();
        let body = document.find("<div>hello</div>").unwrap();
        assert!(script < body);
    }

    #[test]
    fn devtools_line_parses_only_websocket_urls() {
        assert_eq!(
            devtools_url_from_line(
                "DevTools listening on ws://127.0.0.1:40157/devtools/browser/abc"
            ),
            Some("ws://127.0.0.1:40157/devtools/browser/abc".to_string())
        );
        assert_eq!(devtools_url_from_line("DevTools listening on nonsense"), None);
        assert_eq!(devtools_url_from_line("[1234:WARNING] gpu init failed"), None);
    }

    #[test]
    fn page_height_is_clamped_to_viewport_and_texture_limits() {
        let short = serde_json::json!({"cssContentSize": {"width": 1280.0, "height": 240.0}});
        assert_eq!(full_page_height(&short), VIEWPORT_HEIGHT);
        let tall = serde_json::json!({"cssContentSize": {"width": 1280.0, "height": 90000.0}});
        assert_eq!(full_page_height(&tall), MAX_PAGE_HEIGHT);
        let mid = serde_json::json!({"cssContentSize": {"width": 1280.0, "height": 3212.4}});
        assert_eq!(full_page_height(&mid), 3213);
        assert_eq!(full_page_height(&serde_json::json!({})), VIEWPORT_HEIGHT);
    }
}
