//! Outbound dialing: turn a `connect` command into an upgraded duplex stream.
//!
//! Validation failures keep their own protocol codes (4005 for an
//! unparseable URL, 4007 for an allowlisted-hostname miss); everything that
//! fails while actually reaching the upstream maps to 4008 with the
//! transport error message.

use super::socket::BoxStream;
use crate::config::GatewayConfig;
use crate::handshake;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;
use wsmux_core::protocol::ConnectCommand;
use wsmux_core::{ErrorCode, MuxError, MuxResult, ResponseError};

/// Dial the upstream described by `cmd` and complete the client-side
/// WebSocket upgrade. The whole operation is bounded by the resolved dial
/// timeout.
pub async fn dial(cmd: &ConnectCommand, config: &GatewayConfig) -> Result<BoxStream, ResponseError> {
    let url = Url::parse(&cmd.url).map_err(|_| ErrorCode::InvalidUrl.response_error())?;
    let secure = match url.scheme() {
        "ws" => false,
        "wss" => true,
        _ => return Err(ErrorCode::InvalidUrl.response_error()),
    };
    let host = url
        .host_str()
        .ok_or_else(|| ErrorCode::InvalidUrl.response_error())?
        .to_string();

    if !config.hostname_allowlist.is_empty()
        && !config
            .hostname_allowlist
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&host))
    {
        return Err(ErrorCode::InvalidHostname.with_path("url"));
    }

    let deadline = resolve_timeout(cmd.timeout, config);
    debug!(url = %cmd.url, timeout_ms = deadline.as_millis() as u64, "dialing upstream");

    match tokio::time::timeout(deadline, connect_and_upgrade(&url, &host, secure, cmd, config))
        .await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ResponseError::dial_error(e.to_string())),
        Err(_) => Err(ResponseError::dial_error("dial timed out")),
    }
}

/// The effective dial timeout: the client's requested value, capped by the
/// configured bound, defaulting to 10 seconds when both are zero.
fn resolve_timeout(requested_ms: u64, config: &GatewayConfig) -> Duration {
    let mut deadline = Duration::from_millis(requested_ms);
    if deadline.is_zero() || (!config.dial_timeout.is_zero() && deadline > config.dial_timeout) {
        deadline = config.dial_timeout;
    }
    if deadline.is_zero() {
        deadline = Duration::from_secs(10);
    }
    deadline
}

async fn connect_and_upgrade(
    url: &Url,
    host: &str,
    secure: bool,
    cmd: &ConnectCommand,
    config: &GatewayConfig,
) -> MuxResult<BoxStream> {
    let port = url
        .port_or_known_default()
        .unwrap_or(if secure { 443 } else { 80 });
    let tcp = TcpStream::connect((host, port)).await?;
    tcp.set_nodelay(true)?;

    let mut stream: BoxStream = if secure {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| MuxError::Tls(format!("invalid server name: {host}")))?;
        let tls = tls_connector()
            .connect(server_name, tcp)
            .await
            .map_err(|e| MuxError::Tls(e.to_string()))?;
        Box::new(tls)
    } else {
        Box::new(tcp)
    };

    let upgrade = handshake::client(&mut stream, url, &cmd.headers, &cmd.subprotocols);
    if config.read_timeout.is_zero() {
        upgrade.await?;
    } else {
        match tokio::time::timeout(config.read_timeout, upgrade).await {
            Ok(result) => result?,
            Err(_) => return Err(MuxError::Timeout),
        }
    }
    Ok(stream)
}

fn tls_connector() -> &'static TlsConnector {
    static CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();
    CONNECTOR.get_or_init(|| {
        let mut roots = tokio_rustls::rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = tokio_rustls::rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(allowlist: &[&str], dial_timeout: Duration) -> GatewayConfig {
        GatewayConfig {
            hostname_allowlist: allowlist.iter().map(|s| s.to_string()).collect(),
            dial_timeout,
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn timeout_resolution() {
        let config = config_with(&[], Duration::from_secs(10));
        // Requested value below the cap wins.
        assert_eq!(resolve_timeout(500, &config), Duration::from_millis(500));
        // Requested value above the cap is clamped.
        assert_eq!(resolve_timeout(60_000, &config), Duration::from_secs(10));
        // No request falls back to the configured bound.
        assert_eq!(resolve_timeout(0, &config), Duration::from_secs(10));
        // Both zero falls back to 10 seconds.
        let unbounded = config_with(&[], Duration::ZERO);
        assert_eq!(resolve_timeout(0, &unbounded), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn rejects_unparseable_url() {
        let cmd = ConnectCommand {
            url: "not a url".into(),
            ..Default::default()
        };
        let err = match dial(&cmd, &GatewayConfig::default()).await {
            Ok(_) => panic!("expected dial to fail"),
            Err(e) => e,
        };
        assert_eq!(err.code, ErrorCode::InvalidUrl);
    }

    #[tokio::test]
    async fn rejects_non_websocket_scheme() {
        let cmd = ConnectCommand {
            url: "https://example.com".into(),
            ..Default::default()
        };
        let err = match dial(&cmd, &GatewayConfig::default()).await {
            Ok(_) => panic!("expected dial to fail"),
            Err(e) => e,
        };
        assert_eq!(err.code, ErrorCode::InvalidUrl);
    }

    #[tokio::test]
    async fn rejects_host_not_on_allowlist() {
        let config = config_with(&["127.0.0.1"], Duration::from_secs(1));
        let cmd = ConnectCommand {
            url: "wss://example.com".into(),
            ..Default::default()
        };
        let err = match dial(&cmd, &config).await {
            Ok(_) => panic!("expected dial to fail"),
            Err(e) => e,
        };
        assert_eq!(err.code, ErrorCode::InvalidHostname);
        assert_eq!(err.path.as_deref(), Some("url"));
    }

    #[tokio::test]
    async fn allowlist_is_case_insensitive() {
        let config = config_with(&["LocalHost"], Duration::from_millis(50));
        let cmd = ConnectCommand {
            // Nothing is listening here; the point is to get past the
            // allowlist and fail with a dial error instead.
            url: "ws://localhost:1".into(),
            ..Default::default()
        };
        let err = match dial(&cmd, &config).await {
            Ok(_) => panic!("expected dial to fail"),
            Err(e) => e,
        };
        assert_eq!(err.code, ErrorCode::DialError);
        assert_eq!(err.path.as_deref(), Some("url"));
    }
}
