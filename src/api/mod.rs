use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::coordinator::Coordinator;
use crate::error::IngestError;
use crate::ingest::{DetectionReport, IngestOutcome, Ingestor};

const MAX_REQUEST_BYTES: usize = 16 * 1024;

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    addr: String,
    coordinator: Arc<Coordinator>,
    ingestor: Arc<Ingestor>,
}

impl ApiServer {
    pub fn new(addr: &str, coordinator: Arc<Coordinator>, ingestor: Arc<Ingestor>) -> Self {
        Self {
            addr: addr.to_string(),
            coordinator,
            ingestor,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;
        log::info!("coordinator api listening on {}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = self.run(listener, shutdown_thread) {
                log::error!("coordinator api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }

    fn run(&self, listener: TcpListener, shutdown: Arc<AtomicBool>) -> Result<()> {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = self.handle_connection(stream) {
                        log::warn!("api request failed: {}", err);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        stream.set_nonblocking(false)?;
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        if local.ip().is_loopback() && !peer.ip().is_loopback() {
            write_json_response(&mut stream, 403, &json!({"error": "forbidden"}))?;
            return Ok(());
        }

        let request = match read_request(&mut stream) {
            Ok(request) => request,
            Err(err) => {
                write_json_response(
                    &mut stream,
                    400,
                    &json!({"error": "bad_request", "detail": err.to_string()}),
                )?;
                return Ok(());
            }
        };
        let (status, body) = self.route(&request);
        log::debug!("{} {} -> {}", request.method, request.path, status);
        write_json_response(&mut stream, status, &body)
    }

    fn route(&self, request: &HttpRequest) -> (u16, serde_json::Value) {
        let method = request.method.as_str();
        match (method, request.path.as_str()) {
            ("GET", "/") => (
                200,
                json!({
                    "service": "sortied",
                    "version": env!("CARGO_PKG_VERSION"),
                    "endpoints": [
                        "GET /health",
                        "GET /mission/status",
                        "POST /initiate_process",
                        "POST /test-detection",
                        "POST /mission/abort"
                    ]
                }),
            ),
            ("GET", "/health") => (200, json!({"status": "ok"})),
            ("GET", "/mission/status") => match serde_json::to_value(self.coordinator.status()) {
                Ok(status) => (200, status),
                Err(err) => (500, json!({"error": "internal", "detail": err.to_string()})),
            },
            ("POST", "/initiate_process") => match parse_body::<DetectionReport>(&request.body) {
                Ok(report) => self.submit(&report),
                Err(detail) => malformed(detail),
            },
            ("POST", "/test-detection") => match parse_body::<TestDetection>(&request.body) {
                Ok(test) => self.submit(&DetectionReport {
                    site_id: test.site_id,
                    lat: None,
                    lon: None,
                    confidence: test.confidence.unwrap_or(1.0),
                    species: test.species,
                    timestamp: None,
                }),
                Err(detail) => malformed(detail),
            },
            ("POST", "/mission/abort") => {
                let aborted = self.coordinator.abort_active();
                (
                    200,
                    json!({"was_running": aborted.is_some(), "mission_id": aborted}),
                )
            }
            (_, "/" | "/health" | "/mission/status" | "/initiate_process" | "/test-detection" | "/mission/abort") => {
                (405, json!({"error": "method_not_allowed"}))
            }
            _ => (404, json!({"error": "not_found"})),
        }
    }

    fn submit(&self, report: &DetectionReport) -> (u16, serde_json::Value) {
        match self.ingestor.ingest_report(report, crate::now_utc()) {
            Ok(outcome) => {
                let status = match outcome {
                    IngestOutcome::Queued { .. } => 202,
                    IngestOutcome::Suppressed { .. } => 200,
                };
                match serde_json::to_value(&outcome) {
                    Ok(body) => (status, body),
                    Err(err) => (500, json!({"error": "internal", "detail": err.to_string()})),
                }
            }
            Err(err) => error_response(&err),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TestDetection {
    site_id: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    species: Option<String>,
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, String> {
    serde_json::from_slice(body).map_err(|err| err.to_string())
}

fn malformed(detail: String) -> (u16, serde_json::Value) {
    (400, json!({"error": "malformed_event", "detail": detail}))
}

fn error_response(err: &IngestError) -> (u16, serde_json::Value) {
    (
        err.category().http_status(),
        json!({"error": err.kind(), "detail": err.to_string()}),
    )
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if header_end + content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        202 => "HTTP/1.1 202 Accepted",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        422 => "HTTP/1.1 422 Unprocessable Entity",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}
