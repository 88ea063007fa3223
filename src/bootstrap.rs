//! Bootstrap: fetching the vbucket configuration over HTTP.
//!
//! The cluster exposes a streaming REST resource that emits one JSON
//! document per topology revision, newline-delimited. This module
//! issues the GET (with optional Basic auth), decodes the chunked
//! transfer encoding when present, and returns the first complete
//! document as a parsed [`VbucketConfig`]. The caller installs later
//! revisions by running the same parse on subsequent documents.
//!
//! This path runs once per (re)configuration and is deliberately plain
//! buffered I/O; the readiness machinery is reserved for data traffic.

use crate::error::{Error, Result};
use crate::vbucket::VbucketConfig;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::{Buf, BytesMut};
use memchr::memchr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Fetch the current configuration for `bucket` from `host`
/// (`host[:port]`, defaulting to the REST port).
pub(crate) async fn fetch_config(
    host: &str,
    bucket: &str,
    auth: Option<(&str, &str)>,
) -> Result<VbucketConfig> {
    let authority = if host.contains(':') {
        host.to_owned()
    } else {
        format!("{host}:{}", crate::DEFAULT_CONFIG_PORT)
    };
    debug!(%authority, bucket, "fetching bucket configuration");

    let mut stream = TcpStream::connect(&authority)
        .await
        .map_err(|e| Error::Network(format!("failed to connect to {authority}: {e}")))?;

    let mut request = format!(
        "GET /pools/default/bucketsStreaming/{bucket} HTTP/1.1\r\n\
         Host: {authority}\r\n\
         User-Agent: caravel/{}\r\n\
         Accept: application/json\r\n",
        crate::VERSION
    );
    if let Some((user, pass)) = auth {
        let token = BASE64.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut raw = BytesMut::with_capacity(8192);

    // Accumulate until the header block is complete.
    let header_end = loop {
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if raw.len() > MAX_HEADER_BYTES {
            return Err(Error::Bootstrap("oversized response headers".into()));
        }
        if stream.read_buf(&mut raw).await? == 0 {
            return Err(Error::Bootstrap(
                "connection closed before response headers".into(),
            ));
        }
    };
    let headers = raw.split_to(header_end + 4);
    let headers = String::from_utf8_lossy(&headers);

    let status = headers
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("");
    match status {
        "200" => {}
        "401" => {
            return Err(Error::Bootstrap(format!(
                "authentication required for bucket {bucket:?}"
            )))
        }
        other => {
            return Err(Error::Bootstrap(format!(
                "unexpected HTTP status {other:?} from {authority}"
            )))
        }
    }
    let chunked = headers
        .lines()
        .any(|line| line.to_ascii_lowercase().trim() == "transfer-encoding: chunked");

    let mut decoder = BodyDecoder::new(chunked);
    let mut body = BytesMut::new();
    let mut document = Vec::new();
    loop {
        decoder.feed(&mut raw, &mut body)?;
        if let Some(config) = extract_document(&mut body, &mut document)? {
            return Ok(config);
        }
        if decoder.is_done() {
            return Err(Error::Bootstrap(
                "configuration stream ended without a document".into(),
            ));
        }
        if stream.read_buf(&mut raw).await? == 0 {
            return Err(Error::Bootstrap("configuration stream ended early".into()));
        }
    }
}

/// Scan decoded body bytes line by line, accumulating the current JSON
/// document and parsing it as soon as it is syntactically complete.
fn extract_document(
    body: &mut BytesMut,
    document: &mut Vec<u8>,
) -> Result<Option<VbucketConfig>> {
    while let Some(pos) = memchr(b'\n', body) {
        let line = body.split_to(pos + 1);
        let trimmed = line.strip_suffix(b"\r\n").unwrap_or(&line[..line.len() - 1]);
        if trimmed.is_empty() && document.is_empty() {
            continue;
        }
        document.extend_from_slice(&line);

        match serde_json::from_slice::<serde::de::IgnoredAny>(document) {
            Ok(_) => {
                let config = VbucketConfig::from_json(document)?;
                return Ok(Some(config));
            }
            Err(e) if e.is_eof() => {} // document continues on later lines
            Err(e) => {
                return Err(Error::Bootstrap(format!(
                    "invalid JSON in configuration stream: {e}"
                )))
            }
        }
    }
    Ok(None)
}

/// Transfer-encoding decoder: chunked framing or identity passthrough.
struct BodyDecoder {
    chunked: bool,
    state: ChunkState,
}

#[derive(Clone, Copy)]
enum ChunkState {
    Size,
    Data(usize),
    Separator,
    Done,
}

impl BodyDecoder {
    fn new(chunked: bool) -> Self {
        BodyDecoder {
            chunked,
            state: ChunkState::Size,
        }
    }

    fn is_done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }

    /// Move as many decoded body bytes as possible from `raw` to `out`.
    fn feed(&mut self, raw: &mut BytesMut, out: &mut BytesMut) -> Result<()> {
        if !self.chunked {
            out.unsplit(raw.split());
            return Ok(());
        }
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(pos) = memchr(b'\n', raw) else {
                        return Ok(());
                    };
                    let line = raw.split_to(pos + 1);
                    let text = String::from_utf8_lossy(&line);
                    let size_text = text.trim_end().split(';').next().unwrap_or("");
                    let size = usize::from_str_radix(size_text.trim(), 16).map_err(|_| {
                        Error::Bootstrap(format!("invalid chunk size {size_text:?}"))
                    })?;
                    self.state = if size == 0 {
                        ChunkState::Done
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    let take = remaining.min(raw.len());
                    if take == 0 {
                        return Ok(());
                    }
                    out.unsplit(raw.split_to(take));
                    if take == remaining {
                        self.state = ChunkState::Separator;
                    } else {
                        self.state = ChunkState::Data(remaining - take);
                    }
                }
                ChunkState::Separator => {
                    if raw.len() < 2 {
                        return Ok(());
                    }
                    raw.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Done => return Ok(()),
            }
        }
    }
}
