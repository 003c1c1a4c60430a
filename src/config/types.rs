use std::fmt;

use serde::{Deserialize, Serialize};

fn default_server_host() -> String {
    "smtp.gmail.com".to_string()
}

fn default_server_port() -> u16 {
    465
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_recipient_column() -> String {
    "recipient_email_address".to_string()
}

fn default_send_interval_ms() -> u64 {
    100
}

/// A credential value that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// How the delivery connection is established and authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionProtocol {
    /// Implicit TLS (SMTPS), usually port 465.
    #[default]
    Ssl,
    /// Plaintext connection upgraded with STARTTLS, usually port 587.
    Tls,
    /// Client-credentials token plus delegated mailbox send.
    Oauth2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: Secret,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<Secret>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub sender_email_address: String,
    #[serde(default)]
    pub sender_password: Secret,
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub connection_protocol: ConnectionProtocol,
    #[serde(default)]
    pub oauth: Option<OAuthConfig>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Where recipient rows come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RecipientsConfig {
    /// One recipient per row of the input table, read from `column`.
    Table {
        #[serde(default = "default_recipient_column")]
        column: String,
    },
    /// A literal comma-separated list; one row per address.
    AddressList { addresses: String },
}

impl Default for RecipientsConfig {
    fn default() -> Self {
        Self::Table {
            column: default_recipient_column(),
        }
    }
}

impl RecipientsConfig {
    /// Name of the column that holds the recipient address in every row.
    pub fn column(&self) -> &str {
        match self {
            Self::Table { column } => column,
            Self::AddressList { .. } => "recipient_email_address",
        }
    }
}

/// Where the text of one template comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum TemplateSpec {
    /// Read from a column of the current row; re-resolved every row.
    FromTable { column: String },
    /// Read once from an input file.
    FromTemplateFile { filename: String },
    /// Literal text from the configuration.
    FromTemplateDefinition { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Composition {
    /// Fixed text sent verbatim to every recipient.
    Basic {
        subject: String,
        plaintext_body: String,
        #[serde(default)]
        html_body: Option<String>,
    },
    /// Per-row templating.
    Advanced {
        subject: TemplateSpec,
        plaintext_body: TemplateSpec,
        #[serde(default)]
        use_html_template: bool,
        #[serde(default)]
        html_body: Option<TemplateSpec>,
    },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum AttachmentsConfig {
    /// Every non-template input file is attached to every message.
    #[default]
    AllInputFiles,
    /// A column holds a JSON list of attachment filenames per row.
    FromTable { column: String },
    #[serde(rename = "none")]
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedHost {
    pub host: String,
    pub port: u16,
}

/// Deployment-level restrictions layered over the user configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StackOverrides {
    #[serde(default)]
    pub allowed_hosts: Vec<AllowedHost>,
    #[serde(default)]
    pub address_whitelist: Vec<String>,
    #[serde(default)]
    pub disable_attachments: bool,
    /// With attachments disabled, still reject rows that reference unknown files.
    #[serde(default)]
    pub check_disabled_attachment_references: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub recipients: RecipientsConfig,
    #[serde(default)]
    pub input_table: Option<String>,
    pub composition: Composition,
    #[serde(default)]
    pub attachments: AttachmentsConfig,
    #[serde(default)]
    pub overrides: StackOverrides,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// Skip the placeholder check and render unknown variables as empty text.
    #[serde(default)]
    pub lenient_placeholders: bool,
    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,
}

impl Configuration {
    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |reason: String| crate::BatchmailError::InvalidConfig { reason };

        let conn = &self.connection;
        if conn
            .sender_email_address
            .parse::<lettre::message::Mailbox>()
            .is_err()
        {
            return Err(invalid(format!(
                "sender_email_address '{}' is not a valid address",
                conn.sender_email_address
            )));
        }
        if conn.server_port == 0 {
            return Err(invalid("server_port must be non-zero".into()));
        }
        if conn.connection_protocol == ConnectionProtocol::Oauth2 && conn.oauth.is_none() {
            return Err(invalid(
                "connection_protocol OAUTH2 requires the oauth section".into(),
            ));
        }
        if let Composition::Advanced {
            use_html_template: true,
            html_body: None,
            ..
        } = &self.composition
        {
            return Err(invalid(
                "use_html_template is set but html_body is not configured".into(),
            ));
        }
        if let RecipientsConfig::AddressList { addresses } = &self.recipients {
            if addresses.split(',').all(|a| a.trim().is_empty()) {
                return Err(invalid("recipient address list is empty".into()));
            }
        }
        Ok(())
    }

    /// Whether an HTML part is produced at all.
    pub fn uses_html(&self) -> bool {
        match &self.composition {
            Composition::Basic { html_body, .. } => html_body.is_some(),
            Composition::Advanced {
                use_html_template, ..
            } => *use_html_template,
        }
    }
}
