//! Delivery transports and the connections they run over.
//!
//! Every strategy follows the same lifecycle: `Uninitialized -> Connected -> Closed`.
//! Connecting is run-fatal, sending is row-scoped, closing is best-effort.

mod dial;
mod oauth;
mod smtp;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::{ConnectionConfig, ConnectionProtocol, StackOverrides};
use crate::message::EmailMessage;
use crate::BatchmailError;

pub use dial::{socks5_handshake, Dialer};
pub use oauth::{
    graph_payload, parse_token_response, AccessToken, OAuth2Transport, OAuthEndpoints,
};
pub use smtp::{SmtpSecurity, SmtpTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    Connected,
    Closed,
}

impl TransportState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }

    /// Error unless the transport is in `expected`.
    pub fn require(self, expected: TransportState) -> crate::Result<()> {
        if self == expected {
            Ok(())
        } else {
            Err(BatchmailError::TransportState {
                state: self.as_str(),
                expected: expected.as_str(),
            })
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A delivery strategy owning one connection for the whole run.
#[async_trait]
pub trait Transport: Send {
    /// Short strategy name for logs.
    fn name(&self) -> &'static str;

    fn state(&self) -> TransportState;

    /// Open and authenticate the connection.
    async fn connect(&mut self) -> crate::Result<()>;

    /// Deliver one message over the open connection. Failure leaves the state unchanged.
    async fn send(&mut self, message: &EmailMessage) -> crate::Result<()>;

    /// Tear the connection down. Failures are logged, never returned.
    async fn close(&mut self);
}

/// Pick the strategy named by `connection.connection_protocol`.
pub fn build_transport(
    connection: &ConnectionConfig,
    overrides: &StackOverrides,
) -> crate::Result<Box<dyn Transport>> {
    let dialer = Dialer::new(
        connection.proxy.clone(),
        Duration::from_secs(connection.connect_timeout_secs),
    );

    let transport: Box<dyn Transport> = match connection.connection_protocol {
        ConnectionProtocol::Ssl | ConnectionProtocol::Tls => {
            check_allowed_host(&connection.server_host, connection.server_port, overrides)?;
            let security = if connection.connection_protocol == ConnectionProtocol::Ssl {
                SmtpSecurity::ImplicitTls
            } else {
                SmtpSecurity::StartTls
            };
            Box::new(SmtpTransport::new(
                &connection.server_host,
                connection.server_port,
                security,
                &connection.sender_email_address,
                connection.sender_password.clone(),
                dialer,
            ))
        }
        ConnectionProtocol::Oauth2 => {
            let oauth = connection.oauth.clone().ok_or_else(|| BatchmailError::InvalidConfig {
                reason: "connection_protocol OAUTH2 requires the oauth section".into(),
            })?;
            Box::new(OAuth2Transport::new(
                oauth,
                &connection.sender_email_address,
                OAuthEndpoints::default(),
                dialer,
            )?)
        }
    };
    info!(
        strategy = transport.name(),
        host = %connection.server_host,
        port = connection.server_port,
        proxied = connection.proxy.is_some(),
        "transport selected"
    );
    Ok(transport)
}

/// With a non-empty allow-list, `host:port` must be on it.
pub fn check_allowed_host(host: &str, port: u16, overrides: &StackOverrides) -> crate::Result<()> {
    if overrides.allowed_hosts.is_empty()
        || overrides
            .allowed_hosts
            .iter()
            .any(|h| h.host == host && h.port == port)
    {
        return Ok(());
    }
    Err(BatchmailError::HostNotAllowed {
        host: host.to_string(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AllowedHost, OAuthConfig, Secret};

    fn connection(protocol: ConnectionProtocol) -> ConnectionConfig {
        ConnectionConfig {
            sender_email_address: "sender@example.com".into(),
            sender_password: Secret::new("pw"),
            server_host: "smtp.example.com".into(),
            server_port: 465,
            connection_protocol: protocol,
            oauth: Some(OAuthConfig {
                tenant_id: "tenant".into(),
                client_id: "client".into(),
                client_secret: Secret::new("secret"),
            }),
            proxy: None,
            connect_timeout_secs: 5,
        }
    }

    fn allowed(host: &str, port: u16) -> StackOverrides {
        StackOverrides {
            allowed_hosts: vec![AllowedHost {
                host: host.into(),
                port,
            }],
            ..StackOverrides::default()
        }
    }

    #[test]
    fn test_strategy_selected_by_protocol() {
        let none = StackOverrides::default();
        let t = build_transport(&connection(ConnectionProtocol::Ssl), &none).unwrap();
        assert_eq!(t.name(), "implicit-tls");
        assert_eq!(t.state(), TransportState::Uninitialized);
        let t = build_transport(&connection(ConnectionProtocol::Tls), &none).unwrap();
        assert_eq!(t.name(), "starttls");
        let t = build_transport(&connection(ConnectionProtocol::Oauth2), &none).unwrap();
        assert_eq!(t.name(), "oauth2");
    }

    #[test]
    fn test_host_not_allowed() {
        let err = build_transport(
            &connection(ConnectionProtocol::Ssl),
            &allowed("smtp.example.com", 587),
        )
        .err()
        .unwrap();
        assert!(matches!(err, BatchmailError::HostNotAllowed { port: 465, .. }));
        assert!(build_transport(
            &connection(ConnectionProtocol::Ssl),
            &allowed("smtp.example.com", 465)
        )
        .is_ok());
    }

    #[test]
    fn test_oauth_exempt_from_host_list() {
        assert!(build_transport(
            &connection(ConnectionProtocol::Oauth2),
            &allowed("other.example.com", 25)
        )
        .is_ok());
    }

    #[test]
    fn test_state_require() {
        assert!(TransportState::Connected
            .require(TransportState::Connected)
            .is_ok());
        let err = TransportState::Closed
            .require(TransportState::Connected)
            .unwrap_err();
        assert_eq!(err.to_string(), "transport is closed, expected connected");
    }
}
