//! Raw-TCP HTTP helpers for the end-to-end tests.
//!
//! The tests talk to the master over plain sockets on purpose: the relay
//! routes on buffered bytes, and a real HTTP client would hide exactly
//! the head-of-connection behavior under test.

use anyhow::Context as _;
use serde_json::Value;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Write one request, read until the server closes.
pub async fn raw_request(addr: SocketAddr, request: &[u8]) -> anyhow::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request).await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// POST a JSON body; returns the status code and the decoded body
/// (`Value::Null` for empty bodies such as 204s).
pub async fn post_json(addr: SocketAddr, path: &str, body: &Value) -> anyhow::Result<(u16, Value)> {
    let payload = body.to_string();
    let request = format!(
        "POST {path} HTTP/1.1\r\n\
         Host: stagehand\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{payload}",
        payload.len()
    );
    let raw = raw_request(addr, request.as_bytes()).await?;
    let status = parse_status(&raw)?;
    let body = raw.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("");
    let json = if body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(body.trim()).with_context(|| format!("bad response body: {body:?}"))?
    };
    Ok((status, json))
}

/// GET with an optional extra header, e.g. the binding header.
pub async fn get(
    addr: SocketAddr,
    path: &str,
    extra_header: Option<(&str, &str)>,
) -> anyhow::Result<String> {
    let extra = match extra_header {
        Some((name, value)) => format!("{name}: {value}\r\n"),
        None => String::new(),
    };
    let request =
        format!("GET {path} HTTP/1.1\r\nHost: stagehand\r\n{extra}Connection: close\r\n\r\n");
    raw_request(addr, request.as_bytes()).await
}

pub fn parse_status(raw: &str) -> anyhow::Result<u16> {
    raw.split_whitespace()
        .nth(1)
        .context("malformed status line")?
        .parse()
        .context("non-numeric status code")
}
