use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::ProxyConfig;
use crate::BatchmailError;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Opens the TCP connections a transport runs over, optionally through a SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct Dialer {
    proxy: Option<ProxyConfig>,
    connect_timeout: Duration,
}

impl Dialer {
    pub fn new(proxy: Option<ProxyConfig>, connect_timeout: Duration) -> Self {
        Self {
            proxy,
            connect_timeout,
        }
    }

    pub fn direct(connect_timeout: Duration) -> Self {
        Self::new(None, connect_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    /// Connect to `host:port`, tunnelling through the proxy if one is configured.
    pub async fn dial(&self, host: &str, port: u16) -> crate::Result<TcpStream> {
        match &self.proxy {
            None => {
                debug!(host, port, "dialing directly");
                self.tcp_connect(host, port).await
            }
            Some(proxy) => {
                debug!(host, port, proxy_host = %proxy.host, proxy_port = proxy.port, "dialing through SOCKS5 proxy");
                let mut stream = self.tcp_connect(&proxy.host, proxy.port).await?;
                timeout(
                    self.connect_timeout,
                    socks5_handshake(&mut stream, proxy, host, port),
                )
                .await
                .map_err(|_| connect_error("SOCKS5 handshake timed out"))??;
                Ok(stream)
            }
        }
    }

    async fn tcp_connect(&self, host: &str, port: u16) -> crate::Result<TcpStream> {
        timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| connect_error(format!("connection to {host}:{port} timed out")))?
            .map_err(|e| connect_error(format!("cannot connect to {host}:{port}: {e}")))
    }
}

fn connect_error(reason: impl Into<String>) -> BatchmailError {
    BatchmailError::TransportConnect {
        reason: reason.into(),
    }
}

/// Negotiate a SOCKS5 CONNECT to `host:port` over an already open proxy stream.
pub async fn socks5_handshake<S>(
    stream: &mut S,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> crate::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let io = |what: &str, e: std::io::Error| connect_error(format!("SOCKS5 {what}: {e}"));

    let credentials = match (&proxy.username, &proxy.password) {
        (Some(user), Some(pass)) => Some((user.as_str(), pass.expose())),
        _ => None,
    };
    let mut greeting = vec![SOCKS_VERSION, 1, METHOD_NONE];
    if credentials.is_some() {
        greeting = vec![SOCKS_VERSION, 2, METHOD_NONE, METHOD_USER_PASS];
    }
    stream
        .write_all(&greeting)
        .await
        .map_err(|e| io("greeting", e))?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| io("greeting reply", e))?;
    if reply[0] != SOCKS_VERSION {
        return Err(connect_error(format!(
            "proxy is not a SOCKS5 server (version byte {})",
            reply[0]
        )));
    }

    match reply[1] {
        METHOD_NONE => {}
        METHOD_USER_PASS => {
            let (user, pass) = credentials.ok_or_else(|| {
                connect_error("SOCKS5 proxy requires credentials but none are configured")
            })?;
            if user.len() > 255 || pass.len() > 255 {
                return Err(connect_error("SOCKS5 username or password too long"));
            }
            let mut auth = vec![0x01, user.len() as u8];
            auth.extend_from_slice(user.as_bytes());
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass.as_bytes());
            stream.write_all(&auth).await.map_err(|e| io("auth", e))?;

            let mut auth_reply = [0u8; 2];
            stream
                .read_exact(&mut auth_reply)
                .await
                .map_err(|e| io("auth reply", e))?;
            if auth_reply[1] != 0x00 {
                return Err(connect_error("SOCKS5 authentication failed"));
            }
        }
        METHOD_UNACCEPTABLE => {
            return Err(connect_error("no acceptable SOCKS5 authentication method"))
        }
        other => {
            return Err(connect_error(format!(
                "unsupported SOCKS5 authentication method {other}"
            )))
        }
    }

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(connect_error(format!("host name too long for SOCKS5: {host}")));
            }
            request.push(ATYP_DOMAIN);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream
        .write_all(&request)
        .await
        .map_err(|e| io("connect request", e))?;

    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| io("connect reply", e))?;
    if head[1] != 0x00 {
        return Err(connect_error(format!(
            "SOCKS5 proxy refused connection to {host}:{port} (reply code {})",
            head[1]
        )));
    }

    // Discard the bound address and port.
    let skip = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| io("bound address", e))?;
            len[0] as usize + 2
        }
        other => {
            return Err(connect_error(format!(
                "SOCKS5 reply has unknown address type {other}"
            )))
        }
    };
    let mut bound = vec![0u8; skip];
    stream
        .read_exact(&mut bound)
        .await
        .map_err(|e| io("bound address", e))?;
    Ok(())
}
