use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{
    AsyncSmtpConnection, AsyncTokioStream, Certificate, TlsParameters,
};
use lettre::transport::smtp::extension::ClientId;
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::{Dialer, Transport, TransportState};
use crate::config::Secret;
use crate::message::EmailMessage;
use crate::BatchmailError;

/// How the SMTP session is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    /// TLS from the first byte (SMTPS).
    ImplicitTls,
    /// Plaintext greeting, then a STARTTLS upgrade before authenticating.
    StartTls,
}

/// Password-authenticated SMTP delivery over one reused session.
pub struct SmtpTransport {
    host: String,
    port: u16,
    security: SmtpSecurity,
    username: String,
    password: Secret,
    dialer: Dialer,
    extra_roots: Vec<CertificateDer<'static>>,
    state: TransportState,
    session: Option<AsyncSmtpConnection>,
}

impl SmtpTransport {
    pub fn new(
        host: &str,
        port: u16,
        security: SmtpSecurity,
        username: &str,
        password: Secret,
        dialer: Dialer,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            security,
            username: username.to_string(),
            password,
            dialer,
            extra_roots: Vec::new(),
            state: TransportState::Uninitialized,
            session: None,
        }
    }

    /// Also trust `cert` as a root when verifying the server.
    #[cfg(test)]
    fn trusting(mut self, cert: CertificateDer<'static>) -> Self {
        self.extra_roots.push(cert);
        self
    }

    async fn open_session(&self) -> crate::Result<AsyncSmtpConnection> {
        let hello = ClientId::Domain("localhost".to_string());
        let tcp = self.dialer.dial(&self.host, self.port).await?;

        let mut session = match self.security {
            SmtpSecurity::ImplicitTls => {
                let tls = wrap_tls(&self.host, tcp, &self.extra_roots).await?;
                AsyncSmtpConnection::connect_with_transport(Box::new(TlsTunnel(tls)), &hello).await
            }
            SmtpSecurity::StartTls => {
                AsyncSmtpConnection::connect_with_transport(Box::new(tcp), &hello).await
            }
        }
        .map_err(|e| connect_error(format!("SMTP greeting failed: {e}")))?;

        if self.security == SmtpSecurity::StartTls {
            if !session.can_starttls() {
                let _ = session.quit().await;
                return Err(connect_error(format!(
                    "{}:{} does not offer STARTTLS",
                    self.host, self.port
                )));
            }
            let params = self.starttls_parameters()?;
            session
                .starttls(params, &hello)
                .await
                .map_err(|e| connect_error(format!("STARTTLS upgrade failed: {e}")))?;
            debug!(host = %self.host, "STARTTLS upgrade complete");
        }

        let credentials = Credentials::new(self.username.clone(), self.password.expose().to_string());
        session
            .auth(&[Mechanism::Plain, Mechanism::Login], &credentials)
            .await
            .map_err(|e| connect_error(format!("authentication failed: {e}")))?;
        Ok(session)
    }

    fn starttls_parameters(&self) -> crate::Result<TlsParameters> {
        let invalid = |e: lettre::transport::smtp::Error| {
            connect_error(format!("invalid TLS parameters: {e}"))
        };
        let mut builder = TlsParameters::builder(self.host.clone());
        for der in &self.extra_roots {
            let cert = Certificate::from_der(der.to_vec()).map_err(invalid)?;
            builder = builder.add_root_certificate(cert);
        }
        builder.build_rustls().map_err(invalid)
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    fn name(&self) -> &'static str {
        match self.security {
            SmtpSecurity::ImplicitTls => "implicit-tls",
            SmtpSecurity::StartTls => "starttls",
        }
    }

    fn state(&self) -> TransportState {
        self.state
    }

    async fn connect(&mut self) -> crate::Result<()> {
        self.state.require(TransportState::Uninitialized)?;
        let session = self.open_session().await?;
        self.session = Some(session);
        self.state = TransportState::Connected;
        info!(host = %self.host, port = self.port, strategy = self.name(), "SMTP connection established");
        Ok(())
    }

    async fn send(&mut self, message: &EmailMessage) -> crate::Result<()> {
        self.state.require(TransportState::Connected)?;
        let mail = message.to_lettre()?;

        // The server may drop the session after a rejected command.
        let mut session = match self.session.take() {
            Some(session) if !session.has_broken() => session,
            _ => {
                warn!(host = %self.host, "SMTP session lost, reopening");
                self.open_session().await?
            }
        };
        let result = session.send(mail.envelope(), &mail.formatted()).await;
        self.session = Some(session);

        result.map(|_| ()).map_err(|e| BatchmailError::TransportSend {
            reason: e.to_string(),
        })
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.quit().await {
                warn!(error = %e, "SMTP QUIT failed");
            }
        }
        self.state = TransportState::Closed;
    }
}

fn connect_error(reason: String) -> BatchmailError {
    BatchmailError::TransportConnect { reason }
}

/// Wrap a freshly dialed stream in TLS verified against the webpki roots plus `extra_roots`.
async fn wrap_tls(
    host: &str,
    tcp: TcpStream,
    extra_roots: &[CertificateDer<'static>],
) -> crate::Result<TlsStream<TcpStream>> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for cert in extra_roots {
        roots
            .add(cert.clone())
            .map_err(|e| connect_error(format!("invalid root certificate: {e}")))?;
    }

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| connect_error(format!("TLS setup failed: {e}")))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| connect_error(format!("invalid server name '{host}': {e}")))?;
    TlsConnector::from(Arc::new(config))
        .connect(server_name, tcp)
        .await
        .map_err(|e| connect_error(format!("TLS handshake with {host} failed: {e}")))
}

/// An implicit-TLS stream lettre can drive as its SMTP transport.
#[derive(Debug)]
struct TlsTunnel(TlsStream<TcpStream>);

impl AsyncRead for TlsTunnel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsTunnel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl AsyncTokioStream for TlsTunnel {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.0.get_ref().0.peer_addr()
    }
}
