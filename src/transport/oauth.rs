use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{Dialer, Transport, TransportState};
use crate::config::{OAuthConfig, Secret};
use crate::message::EmailMessage;
use crate::BatchmailError;

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// A token this close to its expiry is renewed before use.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Base URLs of the identity platform and the mail API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthEndpoints {
    pub authority: String,
    pub graph: String,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            authority: "https://login.microsoftonline.com".to_string(),
            graph: "https://graph.microsoft.com/v1.0".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// A bearer token and the instant it stops being accepted, when known.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub secret: Secret,
    pub expires_at: Option<Instant>,
}

impl AccessToken {
    fn is_stale(&self) -> bool {
        self.expires_at
            .is_some_and(|at| Instant::now() + EXPIRY_MARGIN >= at)
    }
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Client-credentials token plus a delegated `sendMail` for the sender mailbox.
pub struct OAuth2Transport {
    oauth: OAuthConfig,
    sender: String,
    endpoints: OAuthEndpoints,
    send_mail_url: reqwest::Url,
    client: reqwest::Client,
    token: Option<AccessToken>,
    state: TransportState,
}

impl OAuth2Transport {
    pub fn new(
        oauth: OAuthConfig,
        sender: &str,
        endpoints: OAuthEndpoints,
        dialer: Dialer,
    ) -> crate::Result<Self> {
        let client = http_client(&dialer)?;
        let send_mail_url = send_mail_url(&endpoints.graph, sender)?;
        Ok(Self {
            oauth,
            sender: sender.to_string(),
            endpoints,
            send_mail_url,
            client,
            token: None,
            state: TransportState::Uninitialized,
        })
    }

    async fn acquire_token(&self) -> crate::Result<AccessToken> {
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.endpoints.authority.trim_end_matches('/'),
            self.oauth.tenant_id
        );
        let params = [
            ("client_id", self.oauth.client_id.as_str()),
            ("client_secret", self.oauth.client_secret.expose()),
            ("grant_type", "client_credentials"),
            ("scope", GRAPH_SCOPE),
        ];
        let resp = self
            .client
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| token_error(format!("token request to {url} failed: {e}")))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| token_error(format!("cannot read token response: {e}")))?;
        parse_token_response(status, &body)
    }

    /// The current token, renewed first if it is about to expire.
    async fn fresh_token(&mut self) -> crate::Result<Secret> {
        match &self.token {
            Some(token) if !token.is_stale() => return Ok(token.secret.clone()),
            Some(_) => info!(sender = %self.sender, "OAuth2 token expiring, renewing"),
            None => {
                return Err(BatchmailError::TransportState {
                    state: self.state.as_str(),
                    expected: TransportState::Connected.as_str(),
                })
            }
        }
        self.renew_token().await
    }

    async fn renew_token(&mut self) -> crate::Result<Secret> {
        let token = self.acquire_token().await?;
        let secret = token.secret.clone();
        self.token = Some(token);
        Ok(secret)
    }

    async fn post_message(
        &self,
        token: &Secret,
        payload: &Value,
    ) -> crate::Result<reqwest::Response> {
        self.client
            .post(self.send_mail_url.clone())
            .bearer_auth(token.expose())
            .json(payload)
            .send()
            .await
            .map_err(|e| BatchmailError::TransportSend {
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl Transport for OAuth2Transport {
    fn name(&self) -> &'static str {
        "oauth2"
    }

    fn state(&self) -> TransportState {
        self.state
    }

    async fn connect(&mut self) -> crate::Result<()> {
        self.state.require(TransportState::Uninitialized)?;
        self.token = Some(self.acquire_token().await?);
        self.state = TransportState::Connected;
        info!(sender = %self.sender, "OAuth2 token acquired");
        Ok(())
    }

    async fn send(&mut self, message: &EmailMessage) -> crate::Result<()> {
        self.state.require(TransportState::Connected)?;
        let payload = graph_payload(message);
        let token = self.fresh_token().await?;

        let mut resp = self.post_message(&token, &payload).await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            warn!(sender = %self.sender, "sendMail rejected the token, renewing");
            let token = self.renew_token().await?;
            resp = self.post_message(&token, &payload).await?;
        }

        let status = resp.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "sendMail accepted");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BatchmailError::TransportSend {
            reason: format!("sendMail returned HTTP {}: {}", status.as_u16(), body.trim()),
        })
    }

    async fn close(&mut self) {
        self.token = None;
        self.state = TransportState::Closed;
    }
}

fn token_error(reason: String) -> BatchmailError {
    BatchmailError::TokenAcquisition { reason }
}

fn http_client(dialer: &Dialer) -> crate::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(dialer.connect_timeout());
    builder = match dialer.proxy() {
        None => builder.no_proxy(),
        Some(proxy) => {
            let bad_proxy = |reason: String| BatchmailError::InvalidConfig { reason };
            let mut url = reqwest::Url::parse(&format!("socks5h://{}:{}", proxy.host, proxy.port))
                .map_err(|e| bad_proxy(format!("invalid proxy address: {e}")))?;
            if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
                url.set_username(user)
                    .and_then(|()| url.set_password(Some(pass.expose())))
                    .map_err(|()| bad_proxy("proxy credentials cannot be encoded".into()))?;
            }
            let proxy = reqwest::Proxy::all(url)
                .map_err(|e| bad_proxy(format!("invalid proxy: {e}")))?;
            builder.proxy(proxy)
        }
    };
    builder.build().map_err(|e| BatchmailError::TransportConnect {
        reason: format!("cannot build HTTP client: {e}"),
    })
}

/// `{graph}/users/{sender}/sendMail`, with the sender encoded as one path segment.
fn send_mail_url(graph: &str, sender: &str) -> crate::Result<reqwest::Url> {
    let invalid = |reason: String| BatchmailError::InvalidConfig { reason };
    let mut url = reqwest::Url::parse(graph)
        .map_err(|e| invalid(format!("invalid Graph endpoint '{graph}': {e}")))?;
    url.path_segments_mut()
        .map_err(|()| invalid(format!("Graph endpoint '{graph}' cannot carry a path")))?
        .pop_if_empty()
        .extend(["users", sender, "sendMail"]);
    Ok(url)
}

/// Interpret the identity platform's reply to a token request.
pub fn parse_token_response(status: u16, body: &str) -> crate::Result<AccessToken> {
    if (200..300).contains(&status) {
        let token: TokenResponse = serde_json::from_str(body)
            .map_err(|e| token_error(format!("malformed token response: {e}")))?;
        debug!(expires_in = ?token.expires_in, "token response parsed");
        return Ok(AccessToken {
            secret: Secret::new(token.access_token),
            expires_at: token
                .expires_in
                .map(|secs| Instant::now() + Duration::from_secs(secs)),
        });
    }
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(err) => Err(token_error(match err.error_description {
            Some(desc) => format!("{}: {}", err.error, desc),
            None => err.error,
        })),
        Err(_) => Err(token_error(format!("HTTP {status}: {}", body.trim()))),
    }
}

/// The `sendMail` request body for `message`.
pub fn graph_payload(message: &EmailMessage) -> Value {
    let body = match &message.html_body {
        Some(html) => json!({"contentType": "HTML", "content": html}),
        None => json!({"contentType": "Text", "content": message.plaintext_body}),
    };
    let to: Vec<Value> = message
        .recipients()
        .into_iter()
        .map(|address| json!({"emailAddress": {"address": address}}))
        .collect();
    let attachments: Vec<Value> = message
        .attachments
        .iter()
        .map(|a| {
            json!({
                "@odata.type": "#microsoft.graph.fileAttachment",
                "name": a.filename,
                "contentType": a.content_type,
                "contentBytes": STANDARD.encode(&a.content),
            })
        })
        .collect();

    json!({
        "message": {
            "subject": message.subject,
            "body": body,
            "toRecipients": to,
            "attachments": attachments,
        },
        "saveToSentItems": true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::AttachmentPart;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[derive(Debug, Clone)]
    struct Recorded {
        path: String,
        authorization: String,
        body: String,
    }

    /// How the fake identity platform and Graph behave.
    #[derive(Debug, Clone, Copy)]
    struct FakeApi {
        token_ok: bool,
        expires_in: u64,
        /// Graph answers 401 to bearer tokens starting with this.
        revoked: Option<&'static str>,
    }

    impl FakeApi {
        fn accepting() -> Self {
            Self {
                token_ok: true,
                expires_in: 3599,
                revoked: None,
            }
        }
    }

    /// Minimal HTTP/1.1 peer standing in for both the identity platform and Graph.
    /// Tokens are issued as `tok-1`, `tok-2`, ... in request order.
    async fn fake_api(listener: TcpListener, log: Arc<Mutex<Vec<Recorded>>>, api: FakeApi) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let log = log.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stream);
                loop {
                    let mut request_line = String::new();
                    if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let mut content_length = 0usize;
                    let mut authorization = String::new();
                    loop {
                        let mut header = String::new();
                        reader.read_line(&mut header).await.unwrap();
                        let header = header.trim_end();
                        if header.is_empty() {
                            break;
                        }
                        let (name, value) = header.split_once(':').unwrap();
                        match name.to_ascii_lowercase().as_str() {
                            "content-length" => content_length = value.trim().parse().unwrap(),
                            "authorization" => authorization = value.trim().to_string(),
                            _ => {}
                        }
                    }
                    let mut body = vec![0u8; content_length];
                    reader.read_exact(&mut body).await.unwrap();
                    let path = request_line.split_whitespace().nth(1).unwrap().to_string();

                    let (status, reply) = {
                        let mut log = log.lock().unwrap();
                        let reply = if path.ends_with("/oauth2/v2.0/token") {
                            let issued = log
                                .iter()
                                .filter(|r| r.path.ends_with("/oauth2/v2.0/token"))
                                .count();
                            if api.token_ok {
                                let body = format!(
                                    r#"{{"token_type":"Bearer","expires_in":{},"access_token":"tok-{}"}}"#,
                                    api.expires_in,
                                    issued + 1
                                );
                                ("200 OK", body)
                            } else {
                                let body = r#"{"error":"invalid_client","error_description":"bad secret"}"#;
                                ("401 Unauthorized", body.to_string())
                            }
                        } else if api
                            .revoked
                            .is_some_and(|t| authorization.starts_with(&format!("Bearer {t}")))
                        {
                            let body = r#"{"error":{"code":"InvalidAuthenticationToken"}}"#;
                            ("401 Unauthorized", body.to_string())
                        } else {
                            ("202 Accepted", String::new())
                        };
                        log.push(Recorded {
                            path,
                            authorization,
                            body: String::from_utf8(body).unwrap(),
                        });
                        reply
                    };
                    let response = format!(
                        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{reply}",
                        reply.len()
                    );
                    reader.get_mut().write_all(response.as_bytes()).await.unwrap();
                }
            });
        }
    }

    fn oauth() -> OAuthConfig {
        OAuthConfig {
            tenant_id: "tenant-1".into(),
            client_id: "client-1".into(),
            client_secret: Secret::new("s3cret"),
        }
    }

    fn message() -> EmailMessage {
        EmailMessage {
            from: "sender@example.com".into(),
            to: "a@example.com, b@example.com".into(),
            subject: "Quarterly".into(),
            plaintext_body: "plain".into(),
            html_body: Some("<p>rich</p>".into()),
            attachments: vec![AttachmentPart {
                filename: "a.txt".into(),
                content_type: "text/plain".into(),
                content: b"hi".to_vec(),
            }],
        }
    }

    async fn start(api: FakeApi) -> (OAuth2Transport, Arc<Mutex<Vec<Recorded>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let log = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(fake_api(listener, log.clone(), api));
        let endpoints = OAuthEndpoints {
            authority: base.clone(),
            graph: format!("{base}/v1.0"),
        };
        let transport = OAuth2Transport::new(
            oauth(),
            "sender@example.com",
            endpoints,
            Dialer::direct(Duration::from_secs(5)),
        )
        .unwrap();
        (transport, log)
    }

    #[test]
    fn test_parse_token_success() {
        let token = parse_token_response(200, r#"{"access_token":"abc","expires_in":3600}"#).unwrap();
        assert_eq!(token.secret.expose(), "abc");
        assert!(token.expires_at.is_some());
        assert!(!token.is_stale());

        let token = parse_token_response(200, r#"{"access_token":"abc","expires_in":30}"#).unwrap();
        assert!(token.is_stale());

        let token = parse_token_response(200, r#"{"access_token":"abc"}"#).unwrap();
        assert!(token.expires_at.is_none());
        assert!(!token.is_stale());
    }

    #[test]
    fn test_parse_token_error_description() {
        let err = parse_token_response(
            400,
            r#"{"error":"invalid_request","error_description":"AADSTS900144: missing"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, BatchmailError::TokenAcquisition { .. }));
        assert!(err.to_string().contains("AADSTS900144"));

        let err = parse_token_response(503, "upstream down").unwrap_err();
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[test]
    fn test_graph_payload_shape() {
        let payload = graph_payload(&message());
        assert_eq!(payload["message"]["subject"], "Quarterly");
        assert_eq!(payload["message"]["body"]["contentType"], "HTML");
        assert_eq!(payload["message"]["body"]["content"], "<p>rich</p>");
        let to = payload["message"]["toRecipients"].as_array().unwrap();
        assert_eq!(to.len(), 2);
        assert_eq!(to[1]["emailAddress"]["address"], "b@example.com");
        let att = &payload["message"]["attachments"][0];
        assert_eq!(att["@odata.type"], "#microsoft.graph.fileAttachment");
        assert_eq!(att["contentBytes"], "aGk=");
        assert_eq!(payload["saveToSentItems"], true);
    }

    #[test]
    fn test_graph_payload_plain_text() {
        let mut m = message();
        m.html_body = None;
        let payload = graph_payload(&m);
        assert_eq!(payload["message"]["body"]["contentType"], "Text");
        assert_eq!(payload["message"]["body"]["content"], "plain");
    }

    #[tokio::test]
    async fn test_connect_then_send() {
        let (mut transport, log) = start(FakeApi::accepting()).await;
        transport.connect().await.unwrap();
        assert_eq!(transport.state(), TransportState::Connected);
        transport.send(&message()).await.unwrap();
        transport.close().await;
        assert_eq!(transport.state(), TransportState::Closed);

        let log = log.lock().unwrap().clone();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].path, "/tenant-1/oauth2/v2.0/token");
        assert!(log[0].body.contains("grant_type=client_credentials"));
        assert!(log[0].body.contains("client_id=client-1"));
        assert_eq!(log[1].path, "/v1.0/users/sender@example.com/sendMail");
        assert_eq!(log[1].authorization, "Bearer tok-1");
        let sent: Value = serde_json::from_str(&log[1].body).unwrap();
        assert_eq!(sent["message"]["subject"], "Quarterly");
    }

    #[tokio::test]
    async fn test_rejected_credentials_fail_connect() {
        let (mut transport, _log) = start(FakeApi {
            token_ok: false,
            ..FakeApi::accepting()
        })
        .await;
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, BatchmailError::TokenAcquisition { .. }));
        assert!(err.to_string().contains("bad secret"));
        assert_eq!(transport.state(), TransportState::Uninitialized);
    }

    #[tokio::test]
    async fn test_expiring_token_is_renewed_before_send() {
        let (mut transport, log) = start(FakeApi {
            expires_in: 0,
            ..FakeApi::accepting()
        })
        .await;
        transport.connect().await.unwrap();
        transport.send(&message()).await.unwrap();

        let log = log.lock().unwrap().clone();
        let paths: Vec<&str> = log.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(
            paths,
            [
                "/tenant-1/oauth2/v2.0/token",
                "/tenant-1/oauth2/v2.0/token",
                "/v1.0/users/sender@example.com/sendMail",
            ]
        );
        assert_eq!(log[2].authorization, "Bearer tok-2");
    }

    #[tokio::test]
    async fn test_unauthorized_send_renews_token_once() {
        let (mut transport, log) = start(FakeApi {
            revoked: Some("tok-1"),
            ..FakeApi::accepting()
        })
        .await;
        transport.connect().await.unwrap();
        transport.send(&message()).await.unwrap();
        // The renewed token stays in use.
        transport.send(&message()).await.unwrap();

        let log = log.lock().unwrap().clone();
        let sends: Vec<&str> = log
            .iter()
            .filter(|r| r.path.ends_with("/sendMail"))
            .map(|r| r.authorization.as_str())
            .collect();
        assert_eq!(sends, ["Bearer tok-1", "Bearer tok-2", "Bearer tok-2"]);
        assert_eq!(log.len(), 5);
    }

    #[tokio::test]
    async fn test_still_unauthorized_after_renewal_fails_row() {
        let (mut transport, _log) = start(FakeApi {
            revoked: Some("tok-"),
            ..FakeApi::accepting()
        })
        .await;
        transport.connect().await.unwrap();
        let err = transport.send(&message()).await.unwrap_err();
        assert!(matches!(err, BatchmailError::TransportSend { .. }));
        assert!(err.to_string().contains("HTTP 401"), "{err}");
        assert_eq!(transport.state(), TransportState::Connected);
    }

    #[test]
    fn test_sender_is_encoded_as_one_path_segment() {
        let url = send_mail_url("https://graph.example/v1.0", "ops#1?x@example.com").unwrap();
        assert_eq!(
            url.as_str(),
            "https://graph.example/v1.0/users/ops%231%3Fx@example.com/sendMail"
        );
        let url = send_mail_url("https://graph.example/v1.0/", "a@example.com").unwrap();
        assert_eq!(url.as_str(), "https://graph.example/v1.0/users/a@example.com/sendMail");

        assert!(matches!(
            send_mail_url("not a url", "a@example.com"),
            Err(BatchmailError::InvalidConfig { .. })
        ));
    }
}
