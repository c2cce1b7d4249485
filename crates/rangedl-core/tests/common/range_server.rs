//! Minimal HTTP/1.1 server that supports HEAD and Range GET for integration tests.
//!
//! Serves a single static body, one connection per thread, `Connection: close`.
//! Can ignore ranges entirely and can dribble the body out slowly so tests get
//! a window to pause or cancel mid-stream. Every request is logged.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RangeServerOptions {
    /// If false, GET ignores Range and always returns 200 with the full body,
    /// and HEAD does not advertise `Accept-Ranges`.
    pub support_ranges: bool,
    /// Write the body in pieces of this many bytes with a pause between them
    pub slow: Option<(usize, Duration)>,
    /// Keep advertising `Accept-Ranges` on HEAD but answer every GET with
    /// 200 and the full body
    pub ignore_get_ranges: bool,
    /// Send at most this many body bytes, with a matching `Content-Length`
    pub short_body: Option<usize>,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            slow: None,
            ignore_get_ranges: false,
            short_body: None,
        }
    }
}

/// One request as the server saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRequest {
    pub method: String,
    /// `(start, end)` of a `Range: bytes=start-end` header; `end` is `None` for `start-`
    pub range: Option<(u64, Option<u64>)>,
}

pub struct RangeServer {
    pub url: String,
    log: Arc<Mutex<Vec<LoggedRequest>>>,
}

impl RangeServer {
    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.log.lock().unwrap().clone()
    }

    /// Range starts of every GET other than the `bytes=0-0` probe
    pub fn ranged_get_starts(&self) -> Vec<u64> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == "GET")
            .filter_map(|r| r.range)
            .filter(|range| *range != (0, Some(0)))
            .map(|(start, _)| start)
            .collect()
    }
}

/// Starts a server in a background thread serving `body` at `/files/payload.bin`.
/// The server runs until the process exits.
pub fn start(body: Vec<u8>) -> RangeServer {
    start_with_options(body, RangeServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let log = Arc::new(Mutex::new(Vec::new()));

    let server_log = Arc::clone(&log);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            let log = Arc::clone(&server_log);
            thread::spawn(move || handle(stream, &body, opts, &log));
        }
    });

    RangeServer {
        url: format!("http://127.0.0.1:{}/files/payload.bin", port),
        log,
    }
}

fn handle(
    mut stream: TcpStream,
    body: &[u8],
    opts: RangeServerOptions,
    log: &Mutex<Vec<LoggedRequest>>,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let Ok(request) = std::str::from_utf8(&buf[..n]) else {
        return;
    };
    let (method, range) = parse_request(request);
    log.lock().unwrap().push(LoggedRequest {
        method: method.to_uppercase(),
        range,
    });

    let total = body.len() as u64;
    let accept_ranges = if opts.support_ranges {
        "Accept-Ranges: bytes\r\n"
    } else {
        ""
    };

    if method.eq_ignore_ascii_case("HEAD") {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
            total, accept_ranges
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
        return;
    }

    let honour_range = opts.support_ranges && !opts.ignore_get_ranges;
    let (status, content_range, slice) = match range.filter(|_| honour_range) {
        Some((start, end)) => {
            let end_incl = end.unwrap_or(u64::MAX).min(total.saturating_sub(1));
            if start >= total || start > end_incl {
                let response = format!(
                    "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    total
                );
                let _ = stream.write_all(response.as_bytes());
                return;
            }
            let slice = &body[start as usize..=end_incl as usize];
            (
                "206 Partial Content",
                format!("Content-Range: bytes {}-{}/{}\r\n", start, end_incl, total),
                slice,
            )
        }
        None => ("200 OK", String::new(), body),
    };
    let slice = match opts.short_body {
        Some(max) => &slice[..max.min(slice.len())],
        None => slice,
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}{}Connection: close\r\n\r\n",
        status,
        slice.len(),
        content_range,
        accept_ranges
    );
    if stream.write_all(response.as_bytes()).is_err() {
        return;
    }

    match opts.slow {
        Some((piece, delay)) => {
            for part in slice.chunks(piece.max(1)) {
                if stream.write_all(part).is_err() || stream.flush().is_err() {
                    return;
                }
                thread::sleep(delay);
            }
        }
        None => {
            let _ = stream.write_all(slice);
        }
    }
}

/// Returns (method, optional (start, end) for `Range: bytes=X-Y` or `bytes=X-`).
fn parse_request(request: &str) -> (&str, Option<(u64, Option<u64>)>) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("range") {
            continue;
        }
        let value = value.trim();
        if !value.to_lowercase().starts_with("bytes=") {
            continue;
        }
        if let Some((a, b)) = value[6..].trim().split_once('-') {
            let start = a.trim().parse::<u64>().unwrap_or(0);
            let end = b.trim();
            let end = if end.is_empty() {
                None
            } else {
                end.parse::<u64>().ok()
            };
            range = Some((start, end));
        }
    }
    (method, range)
}
