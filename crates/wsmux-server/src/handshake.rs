//! HTTP/1.1 WebSocket upgrade handshake (RFC 6455 Section 4).
//!
//! Both directions are implemented over an already-connected byte stream:
//! [`accept`] upgrades an inbound client connection, [`client`] performs the
//! outbound upgrade when dialing an upstream. The request/response head is
//! read one byte at a time so no frame bytes following the head are ever
//! consumed from the stream.

use base64::prelude::*;
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;
use wsmux_core::{MuxError, MuxResult};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the request/response head, including the blank line.
const MAX_HEAD_LEN: usize = 8 * 1024;

/// Compute the `Sec-WebSocket-Accept` value for a `Sec-WebSocket-Key`.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(sha.finalize())
}

/// Generate a random `Sec-WebSocket-Key` (base64 of 16 random bytes).
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    BASE64_STANDARD.encode(nonce)
}

/// Server side: read the upgrade request, validate it, reply `101`.
pub async fn accept<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> MuxResult<()> {
    let head = read_head(stream).await?;
    let (request_line, headers) = parse_head(&head)?;

    if !request_line.starts_with("GET ") {
        return Err(MuxError::Handshake("expected GET request".into()));
    }
    require_token(&headers, "upgrade", "websocket")?;
    require_token(&headers, "connection", "upgrade")?;
    if headers.get("sec-websocket-version").map(String::as_str) != Some("13") {
        return Err(MuxError::Handshake("unsupported websocket version".into()));
    }
    let key = headers
        .get("sec-websocket-key")
        .ok_or_else(|| MuxError::Handshake("missing Sec-WebSocket-Key".into()))?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Client side: send the upgrade request for `url` and validate the `101`
/// response, including the `Sec-WebSocket-Accept` check.
pub async fn client<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    url: &Url,
    headers: &HashMap<String, String>,
    subprotocols: &[String],
) -> MuxResult<()> {
    let host = url
        .host_str()
        .ok_or_else(|| MuxError::Handshake("url has no host".into()))?;
    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let target = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };

    let key = generate_key();
    let mut request = format!(
        "GET {target} HTTP/1.1\r\n\
         Host: {host_header}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n"
    );
    if !subprotocols.is_empty() {
        request.push_str(&format!(
            "Sec-WebSocket-Protocol: {}\r\n",
            subprotocols.join(", ")
        ));
    }
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_head(stream).await?;
    let (status_line, response_headers) = parse_head(&head)?;

    let status = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| MuxError::Handshake("malformed status line".into()))?;
    if status != "101" {
        return Err(MuxError::Handshake(format!(
            "upstream refused upgrade: {status_line}"
        )));
    }
    match response_headers.get("sec-websocket-accept") {
        Some(accept) if *accept == accept_key(&key) => Ok(()),
        Some(_) => Err(MuxError::Handshake("Sec-WebSocket-Accept mismatch".into())),
        None => Err(MuxError::Handshake("missing Sec-WebSocket-Accept".into())),
    }
}

/// Read bytes until the head terminator, one byte at a time so nothing past
/// the blank line is consumed.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> MuxResult<Vec<u8>> {
    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD_LEN {
            return Err(MuxError::Handshake("request head too large".into()));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }
    Ok(head)
}

/// Split a head into its first line and a lowercase-keyed header map.
fn parse_head(head: &[u8]) -> MuxResult<(String, HashMap<String, String>)> {
    let text = std::str::from_utf8(head)
        .map_err(|_| MuxError::Handshake("head is not valid UTF-8".into()))?;
    let mut lines = text.split("\r\n");
    let first = lines
        .next()
        .ok_or_else(|| MuxError::Handshake("empty head".into()))?
        .to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| MuxError::Handshake(format!("malformed header line: {line}")))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    Ok((first, headers))
}

/// Check that a comma-separated header contains `token` (case-insensitive).
fn require_token(headers: &HashMap<String, String>, name: &str, token: &str) -> MuxResult<()> {
    let present = headers
        .get(name)
        .map(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false);
    if present {
        Ok(())
    } else {
        Err(MuxError::Handshake(format!("missing {name}: {token}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_example() {
        // RFC 6455 Section 1.3 sample handshake.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_keys_are_distinct_base64() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
        assert_eq!(BASE64_STANDARD.decode(&a).unwrap().len(), 16);
    }

    #[tokio::test]
    async fn server_and_client_handshake_agree() {
        let (mut client_end, mut server_end) = tokio::io::duplex(4096);
        let url = Url::parse("ws://localhost/splice").unwrap();

        let server = tokio::spawn(async move {
            accept(&mut server_end).await.unwrap();
        });
        client(&mut client_end, &url, &HashMap::new(), &[])
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn accept_rejects_missing_key() {
        let (mut client_end, mut server_end) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move { accept(&mut server_end).await });

        client_end
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\n\r\n")
            .await
            .unwrap();
        assert!(server.await.unwrap().is_err());
    }

    #[test]
    fn head_parsing_normalizes_names() {
        let (_, headers) =
            parse_head(b"GET / HTTP/1.1\r\nUPGRADE: WebSocket\r\nX-Custom:  v \r\n\r\n").unwrap();
        assert_eq!(headers.get("upgrade").unwrap(), "WebSocket");
        assert_eq!(headers.get("x-custom").unwrap(), "v");
        assert!(require_token(&headers, "upgrade", "websocket").is_ok());
    }
}
