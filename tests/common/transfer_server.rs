//! Minimal HTTP/1.1 server for integration tests.
//!
//! Serves a single static body with optional Range support, scripted status
//! sequences (e.g. 503, 503, 200), configurable ETag/Content-Disposition
//! headers, throttled chunked writes (so pause and cancel can interject),
//! and capture of upload request bodies.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// Emit `Accept-Ranges: bytes` when ranges are supported.
    pub advertise_ranges: bool,
    /// ETag header value (sent verbatim, include quotes).
    pub etag: Option<String>,
    pub content_disposition: Option<String>,
    /// Status for each successive request; the last entry repeats. `200`
    /// means "serve normally".
    pub status_script: Vec<u16>,
    /// Body returned with a scripted 404.
    pub not_found_body: String,
    /// Serve the body in writes of this size...
    pub chunk_size: usize,
    /// ...sleeping this long between writes.
    pub chunk_delay: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            advertise_ranges: true,
            etag: None,
            content_disposition: None,
            status_script: vec![200],
            not_found_body: String::new(),
            chunk_size: 64 * 1024,
            chunk_delay: Duration::ZERO,
        }
    }
}

/// A request as received by the server, for upload assertions.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct TestServer {
    pub url: String,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    hits: Arc<AtomicUsize>,
}

impl TestServer {
    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }
}

pub fn start(body: Vec<u8>) -> TestServer {
    start_with_options(body, ServerOptions::default())
}

/// Starts a server in a background thread serving `body`. Returns a handle
/// with the base URL; the server runs until the process exits.
pub fn start_with_options(body: Vec<u8>, opts: ServerOptions) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let requests: Arc<Mutex<Vec<CapturedRequest>>> = Arc::default();
    let hits = Arc::new(AtomicUsize::new(0));

    let thread_requests = Arc::clone(&requests);
    let thread_hits = Arc::clone(&hits);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            let opts = opts.clone();
            let requests = Arc::clone(&thread_requests);
            let hits = Arc::clone(&thread_hits);
            thread::spawn(move || handle(stream, &body, &opts, &requests, &hits));
        }
    });
    TestServer {
        url: format!("http://127.0.0.1:{port}/file.bin"),
        requests,
        hits,
    }
}

fn handle(
    mut stream: std::net::TcpStream,
    body: &[u8],
    opts: &ServerOptions,
    requests: &Mutex<Vec<CapturedRequest>>,
    hits: &AtomicUsize,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));

    let Some(request) = read_request(&mut stream) else {
        return;
    };
    let hit = hits.fetch_add(1, Ordering::Relaxed);
    requests.lock().unwrap().push(request.clone());

    let scripted = *opts
        .status_script
        .get(hit)
        .or(opts.status_script.last())
        .unwrap_or(&200);
    if scripted == 404 {
        let _ = write_simple(
            &mut stream,
            "404 Not Found",
            opts.not_found_body.as_bytes(),
        );
        return;
    }
    if scripted != 200 {
        let reason = match scripted {
            503 => "Service Unavailable",
            500 => "Internal Server Error",
            _ => "Error",
        };
        let _ = write_simple(&mut stream, &format!("{scripted} {reason}"), b"");
        return;
    }

    if request.method.eq_ignore_ascii_case("POST") || request.method.eq_ignore_ascii_case("PUT") {
        let _ = write_simple(&mut stream, "200 OK", b"received");
        return;
    }

    let total = body.len() as u64;
    let range = request
        .header("range")
        .filter(|_| opts.support_ranges)
        .and_then(parse_range);
    let (status_line, range_header, slice) = match range {
        Some((start, end)) => {
            let start = start.min(total);
            let end = end.map(|e| e.min(total.saturating_sub(1))).unwrap_or(total.saturating_sub(1));
            if start > end {
                let _ = write_simple(&mut stream, "416 Range Not Satisfiable", b"");
                return;
            }
            (
                "206 Partial Content",
                Some(format!("bytes {start}-{end}/{total}")),
                &body[start as usize..=end as usize],
            )
        }
        None => ("200 OK", None, body),
    };

    let mut headers = format!(
        "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n",
        slice.len()
    );
    if opts.advertise_ranges && opts.support_ranges {
        headers.push_str("Accept-Ranges: bytes\r\n");
    }
    if let Some(range_header) = range_header {
        headers.push_str(&format!("Content-Range: {range_header}\r\n"));
    }
    if let Some(etag) = &opts.etag {
        headers.push_str(&format!("ETag: {etag}\r\n"));
    }
    if let Some(cd) = &opts.content_disposition {
        headers.push_str(&format!("Content-Disposition: {cd}\r\n"));
    }
    headers.push_str("\r\n");
    if stream.write_all(headers.as_bytes()).is_err() {
        return;
    }
    if request.method.eq_ignore_ascii_case("HEAD") {
        return;
    }

    for chunk in slice.chunks(opts.chunk_size.max(1)) {
        if stream.write_all(chunk).is_err() {
            return;
        }
        let _ = stream.flush();
        if !opts.chunk_delay.is_zero() {
            thread::sleep(opts.chunk_delay);
        }
    }
}

/// Read one request: request line, headers, and (per Content-Length) body.
fn read_request(stream: &mut std::net::TcpStream) -> Option<CapturedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let header_end = loop {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > 1 << 20 {
            return None;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let method = request_line.split_whitespace().next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0);
    let mut request_body = buf[header_end + 4..].to_vec();
    while request_body.len() < content_length {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            break;
        }
        request_body.extend_from_slice(&chunk[..n]);
    }
    request_body.truncate(content_length);

    Some(CapturedRequest {
        method,
        headers,
        body: request_body,
    })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// `bytes=S-` or `bytes=S-E`.
fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim();
    if end.is_empty() {
        Some((start, None))
    } else {
        Some((start, end.parse().ok()))
    }
}

fn write_simple(stream: &mut std::net::TcpStream, status: &str, body: &[u8]) -> std::io::Result<()> {
    let headers = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(headers.as_bytes())?;
    stream.write_all(body)
}
