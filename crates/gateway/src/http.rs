//! Minimal HTTP/1.1 front end.
//!
//! One connection per request: parse the request line, headers and a
//! `Content-Length` body, route, respond, close. `POST /process` answers
//! with a chunked-transfer stream; the dispatcher runs on a blocking
//! thread and its chunks are bridged back through a channel. A failed
//! socket write drops the receiving half, which makes the dispatcher's
//! `on_chunk` return false and flags the client as disconnected.

use crate::dispatcher::Dispatcher;
use serde::Deserialize;
use spindle_common::{Result, SpindleError, METRICS};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

/// Upper bound on header block plus body we are willing to buffer.
const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Body of `POST /process`.
#[derive(Debug, Deserialize)]
struct ProcessRequest {
    message: String,
    #[serde(default)]
    max_tokens: usize,
}

/// A parsed inbound request.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Accept loop. Runs until the task is dropped by the shutdown select.
pub async fn serve(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "connection accepted");
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, dispatcher).await {
                debug!(%peer, "connection ended: {}", e);
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let request = read_request(&mut stream).await?;

    match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/process") => {
            let parsed: ProcessRequest = match serde_json::from_slice(&request.body) {
                Ok(parsed) => parsed,
                Err(e) => {
                    let body = format!("{{\"error\": \"invalid request body: {}\"}}", e);
                    write_simple_response(&mut stream, 400, "Bad Request", &body).await?;
                    return Ok(());
                }
            };
            stream_process(&mut stream, dispatcher, parsed).await
        }
        ("GET", "/metrics") => {
            let body = METRICS.gather();
            write_response(&mut stream, 200, "OK", "text/plain; version=0.0.4", body.as_bytes())
                .await
        }
        _ => {
            write_simple_response(
                &mut stream,
                404,
                "Not Found",
                "{\"error\": \"Endpoint not found\"}",
            )
            .await
        }
    }
}

/// Run the dispatcher for one request and stream its chunks back.
async fn stream_process(
    stream: &mut TcpStream,
    dispatcher: Arc<Dispatcher>,
    request: ProcessRequest,
) -> Result<()> {
    stream.write_all(chunked_response_header().as_bytes()).await?;

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(32);
    let task = tokio::task::spawn_blocking(move || {
        dispatcher.process(
            |bytes| tx.blocking_send(bytes.to_vec()).is_ok(),
            &request.message,
            request.max_tokens,
        );
    });

    while let Some(chunk) = rx.recv().await {
        if stream.write_all(&http_chunk(&chunk)).await.is_err() {
            // Client hung up; dropping the receiver tells the dispatcher.
            break;
        }
    }
    drop(rx);

    // Terminating zero-length chunk; the client may already be gone.
    let _ = stream.write_all(b"0\r\n\r\n").await;
    let _ = stream.shutdown().await;

    task.await
        .map_err(|e| SpindleError::internal(format!("dispatcher task panicked: {}", e)))?;
    Ok(())
}

/// Read and parse one HTTP request from the socket.
async fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    let mut buffer = Vec::with_capacity(4096);
    let mut scratch = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find_header_end(&buffer) {
            break pos;
        }
        if buffer.len() > MAX_REQUEST_BYTES {
            return Err(SpindleError::parse("request headers too large"));
        }
        let n = stream.read(&mut scratch).await?;
        if n == 0 {
            return Err(SpindleError::parse("connection closed before headers"));
        }
        buffer.extend_from_slice(&scratch[..n]);
    };

    let mut request = parse_head(&buffer[..header_end])?;

    let content_length = request
        .headers
        .get("content-length")
        .map(|v| v.parse::<usize>())
        .transpose()
        .map_err(|_| SpindleError::parse("invalid Content-Length"))?
        .unwrap_or(0);
    if content_length > MAX_REQUEST_BYTES {
        return Err(SpindleError::parse("request body too large"));
    }

    let body_start = header_end + 4;
    let mut body = buffer[body_start.min(buffer.len())..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut scratch).await?;
        if n == 0 {
            return Err(SpindleError::parse("connection closed before body"));
        }
        body.extend_from_slice(&scratch[..n]);
    }
    body.truncate(content_length);
    request.body = body;

    Ok(request)
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse the request line and headers. Header names are lowercased.
pub fn parse_head(head: &[u8]) -> Result<HttpRequest> {
    let head = std::str::from_utf8(head)
        .map_err(|_| SpindleError::parse("request head is not valid UTF-8"))?;
    let mut lines = head.split("\r\n");

    let request_line = lines
        .next()
        .ok_or_else(|| SpindleError::parse("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| SpindleError::parse("missing method"))?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| SpindleError::parse("missing path"))?
        .to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    Ok(HttpRequest {
        method,
        path,
        headers,
        body: Vec::new(),
    })
}

fn chunked_response_header() -> String {
    "HTTP/1.1 200 OK\r\n\
     Content-Type: application/json\r\n\
     Transfer-Encoding: chunked\r\n\
     Connection: close\r\n\
     \r\n"
        .to_string()
}

/// Frame one payload as an HTTP chunk.
pub fn http_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    status_text: &str,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        status_text,
        content_type,
        body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(body).await?;
    if let Err(e) = stream.shutdown().await {
        warn!("socket shutdown failed: {}", e);
    }
    Ok(())
}

async fn write_simple_response(
    stream: &mut TcpStream,
    status: u16,
    status_text: &str,
    body: &str,
) -> Result<()> {
    write_response(stream, status, status_text, "application/json", body.as_bytes()).await
}
