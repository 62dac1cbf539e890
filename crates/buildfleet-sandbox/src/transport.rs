// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection layer beneath [`crate::Client`].
//!
//! Plain operations go through reqwest. Hijacked operations need the raw
//! socket after the response head, which reqwest does not hand back, so
//! those open a dedicated TCP connection and speak HTTP/1.1 by hand.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{ClientError, ClientResult};
use crate::protocol::Route;

/// Chunked byte stream used for archive transfer.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Raw duplex connection left over after a successful hijack.
pub struct HijackedConn {
    pub read: Box<dyn AsyncRead + Send + Unpin>,
    pub write: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Low-level access to a container backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// One JSON request, one JSON response.
    async fn request(&self, route: Route, body: Option<Value>) -> ClientResult<Value>;

    /// Uploads an archive stream as the request body.
    async fn stream_in(&self, route: Route, content: ByteStream) -> ClientResult<()>;

    /// Downloads the response body as an archive stream.
    async fn stream_out(&self, route: Route) -> ClientResult<ByteStream>;

    /// Sends the request, validates the response head, then hands back the
    /// raw connection for envelope traffic.
    async fn hijack(&self, route: Route, body: Option<Value>) -> ClientResult<HijackedConn>;
}

/// [`Transport`] over HTTP/1.1 to a single backend address.
pub struct HttpTransport {
    base_url: String,
    host: String,
    port: u16,
    http: reqwest::Client,
}

impl HttpTransport {
    /// `base_url` is scheme and authority only, e.g. `http://10.0.3.7:7777`.
    pub fn new(base_url: &str) -> ClientResult<Self> {
        let trimmed = base_url.trim_end_matches('/');
        let authority = trimmed.strip_prefix("http://").ok_or_else(|| ClientError::Url {
            url: base_url.to_string(),
            details: "expected an http:// scheme".to_string(),
        })?;
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| ClientError::Url {
                    url: base_url.to_string(),
                    details: format!("invalid port '{port}'"),
                })?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), 80),
        };
        Ok(Self {
            base_url: trimmed.to_string(),
            host,
            port,
            http: reqwest::Client::new(),
        })
    }

    fn builder(&self, route: &Route) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, route.path_and_query());
        match route.method() {
            "POST" => self.http.post(url),
            "PUT" => self.http.put(url),
            "DELETE" => self.http.delete(url),
            _ => self.http.get(url),
        }
    }

    async fn check(response: reqwest::Response) -> ClientResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ClientError::Backend { status: status.as_u16(), message })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, route: Route, body: Option<Value>) -> ClientResult<Value> {
        debug!(method = route.method(), path = %route.path_and_query(), "backend request");
        let mut builder = self.builder(&route);
        if let Some(body) = &body {
            builder = builder.json(body);
        }
        let response = Self::check(builder.send().await?).await?;
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn stream_in(&self, route: Route, content: ByteStream) -> ClientResult<()> {
        let builder = self
            .builder(&route)
            .header(reqwest::header::CONTENT_TYPE, "application/gzip")
            .body(reqwest::Body::wrap_stream(content));
        Self::check(builder.send().await?).await?;
        Ok(())
    }

    async fn stream_out(&self, route: Route) -> ClientResult<ByteStream> {
        let response = Self::check(self.builder(&route).send().await?).await?;
        let stream = response
            .bytes_stream()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));
        Ok(Box::pin(stream))
    }

    async fn hijack(&self, route: Route, body: Option<Value>) -> ClientResult<HijackedConn> {
        debug!(method = route.method(), path = %route.path_and_query(), "backend hijack");
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();

        let payload = body.map(|body| serde_json::to_vec(&body)).transpose()?;
        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\n",
            route.method(),
            route.path_and_query(),
            self.host,
        );
        if let Some(payload) = &payload {
            head.push_str("Content-Type: application/json\r\n");
            head.push_str(&format!("Content-Length: {}\r\n", payload.len()));
        }
        head.push_str("\r\n");
        write_half.write_all(head.as_bytes()).await?;
        if let Some(payload) = &payload {
            write_half.write_all(payload).await?;
        }
        write_half.flush().await?;

        let (status, leftover, read_half) = read_response_head(read_half).await?;
        if !(200..300).contains(&status) {
            return Err(ClientError::Backend {
                status,
                message: String::from_utf8_lossy(&leftover).into_owned(),
            });
        }

        let read: Box<dyn AsyncRead + Send + Unpin> =
            Box::new(std::io::Cursor::new(leftover).chain(read_half));
        Ok(HijackedConn { read, write: Box::new(write_half) })
    }
}

/// Consumes the HTTP response head, returning the status code and any bytes
/// already read past the blank line.
async fn read_response_head<R: AsyncRead + Unpin>(
    mut reader: R,
) -> ClientResult<(u16, Vec<u8>, R)> {
    let mut buffer = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    let head_end = loop {
        if let Some(pos) = find_blank_line(&buffer) {
            break pos;
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(ClientError::Protocol {
                payload: String::from_utf8_lossy(&buffer).into_owned(),
            });
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]);
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| ClientError::Protocol { payload: status_line.to_string() })?;

    let leftover = buffer[head_end + 4..].to_vec();
    Ok((status, leftover, reader))
}

fn find_blank_line(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}
