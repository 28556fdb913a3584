//! Static dev server for `pagewright dev`.
//!
//! Serves the intermediate, final and public directories (first hit wins)
//! plus `/node_modules`, and counts completed rebuilds. The count is exposed
//! at `/__reload` so a page can poll for changes.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::build::{BuildContext, ProgressEvent, ProgressReporter};
use crate::watch::ReloadNotifier;

/// Route answering with the reload generation.
pub const RELOAD_ROUTE: &str = "/__reload";

const NODE_MODULES_ROUTE: &str = "/node_modules/";

/// Error starting the dev server
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ServeError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// An HTTP response before serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Response {
    fn text(status: u16, body: impl Into<String>) -> Self {
        Self { status, content_type: "text/plain; charset=utf-8", body: body.into().into_bytes() }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            _ => "Bad Request",
        }
    }
}

/// Content type for a served file.
pub fn content_type(path: &Path) -> &'static str {
    let ext = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "application/javascript; charset=utf-8",
        Some("json" | "map") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Static file server that doubles as the rebuild notification sink.
#[derive(Debug)]
pub struct DevServer {
    roots: Vec<PathBuf>,
    node_modules: PathBuf,
    generation: AtomicU64,
    last_written: Mutex<Vec<PathBuf>>,
}

impl DevServer {
    pub fn new(ctx: &BuildContext) -> Self {
        let roots = vec![ctx.intermediate_dir(), ctx.dist_dir(), ctx.public_dir()];
        Self::with_roots(roots, ctx.node_modules_dir())
    }

    pub fn with_roots(roots: Vec<PathBuf>, node_modules: PathBuf) -> Self {
        Self { roots, node_modules, generation: AtomicU64::new(0), last_written: Mutex::new(Vec::new()) }
    }

    /// Number of reloads requested so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Paths reported by the most recent reload.
    pub fn last_written(&self) -> Vec<PathBuf> {
        self.last_written.lock().map(|paths| paths.clone()).unwrap_or_default()
    }

    fn bump(&self, paths: &[PathBuf]) {
        if let Ok(mut last) = self.last_written.lock() {
            *last = paths.to_vec();
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(generation, files = paths.len(), "reload");
    }

    /// Map a request path to a file on disk.
    ///
    /// Percent escapes are decoded before the traversal check, so `%2e%2e`
    /// is rejected like `..`.
    pub fn resolve(&self, url_path: &str) -> Result<PathBuf, u16> {
        let raw = url_path.split(['?', '#']).next().unwrap_or_default();
        let decoded = percent_decode(raw).ok_or(400u16)?;
        let path = decoded.as_str();
        let relative = Path::new(path.trim_start_matches('/'));
        if relative.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
            return Err(403);
        }

        if let Some(rest) = path.strip_prefix(NODE_MODULES_ROUTE) {
            let file = self.node_modules.join(rest);
            return if file.is_file() { Ok(file) } else { Err(404) };
        }

        for root in &self.roots {
            let mut file = root.join(relative);
            if file.is_dir() {
                file = file.join("index.html");
            }
            if file.is_file() {
                return Ok(file);
            }
        }
        Err(404)
    }

    /// Answer one request.
    pub fn respond(&self, method: &str, url_path: &str) -> Response {
        if method != "GET" && method != "HEAD" {
            return Response::text(405, "method not allowed");
        }
        if url_path == RELOAD_ROUTE {
            return Response::text(200, self.generation().to_string());
        }

        let file = match self.resolve(url_path) {
            Ok(file) => file,
            Err(400) => return Response::text(400, "bad request"),
            Err(403) => return Response::text(403, "forbidden"),
            Err(status) => return Response::text(status, "not found"),
        };
        match std::fs::read(&file) {
            Ok(body) => Response { status: 200, content_type: content_type(&file), body },
            Err(e) => {
                tracing::debug!(path = %file.display(), error = %e, "read failed");
                Response::text(404, "not found")
            }
        }
    }

    /// Bind `addr` and serve on a background thread, one thread per connection.
    pub fn spawn(self: &Arc<Self>, addr: &str) -> Result<SocketAddr, ServeError> {
        let bind_error = |source| ServeError::Bind { addr: addr.to_string(), source };
        let listener = TcpListener::bind(addr).map_err(bind_error)?;
        let local = listener.local_addr().map_err(bind_error)?;

        let server = Arc::clone(self);
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let server = Arc::clone(&server);
                        thread::spawn(move || {
                            if let Err(e) = server.handle(stream) {
                                tracing::debug!(error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
        });
        Ok(local)
    }

    fn handle(&self, stream: TcpStream) -> std::io::Result<()> {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut request_line = String::new();
        reader.read_line(&mut request_line)?;

        // Drain headers
        let mut header = String::new();
        while reader.read_line(&mut header)? > 2 {
            header.clear();
        }

        let mut parts = request_line.split_whitespace();
        let (method, target) = match (parts.next(), parts.next()) {
            (Some(method), Some(target)) => (method, target),
            _ => ("", ""),
        };
        let response =
            if method.is_empty() { Response::text(400, "bad request") } else { self.respond(method, target) };
        tracing::debug!(method, path = target, status = response.status, "request");

        let mut out = stream;
        write!(
            out,
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
            response.status,
            response.reason(),
            response.content_type,
            response.body.len()
        )?;
        if method != "HEAD" {
            out.write_all(&response.body)?;
        }
        out.flush()
    }
}

impl ProgressReporter for DevServer {
    fn report(&self, event: ProgressEvent) {
        if let ProgressEvent::RunCompleted { written, .. } = event {
            self.bump(&written);
        }
    }
}

impl ReloadNotifier for DevServer {
    fn reload(&self, paths: &[PathBuf]) {
        self.bump(paths);
    }
}

/// Decode `%XX` escapes; `None` for a malformed escape or non-UTF-8 result.
fn percent_decode(path: &str) -> Option<String> {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            if !hex.iter().all(u8::is_ascii_hexdigit) {
                return None;
            }
            out.push(u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
