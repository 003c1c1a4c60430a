/// Broad category of a failure, used to pick the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input data or configuration. Exit status 1.
    User,
    /// Unexpected failure inside the program. Exit status 2.
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum BatchmailError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("unsupported configuration format: '{extension}'")]
    UnsupportedFormat { extension: String },

    #[error("JSON parse error in {path}: {source}")]
    ConfigJson {
        path: std::path::PathBuf,
        source: serde_json::Error,
    },

    #[error("YAML parse error in {path}: {source}")]
    ConfigYaml {
        path: std::path::PathBuf,
        source: serde_yaml::Error,
    },

    #[error("TOML parse error in {path}: {source}")]
    ConfigToml {
        path: std::path::PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("CSV parse error in {path}: {source}")]
    CsvParse {
        path: std::path::PathBuf,
        source: csv::Error,
    },

    #[error("CSV file has no headers: {path}")]
    CsvNoHeaders { path: std::path::PathBuf },

    #[error("input resource '{name}' not found")]
    ResourceNotFound { name: String },

    #[error("no input table found in {dir}")]
    NoInputTable { dir: std::path::PathBuf },

    #[error("missing columns: {}", .columns.join(", "))]
    MissingColumns { columns: Vec<String> },

    #[error("column '{column}' is not present in the input row")]
    MissingRowValue { column: String },

    #[error("unknown attachments: {}", .filenames.join(", "))]
    UnknownAttachment { filenames: Vec<String> },

    #[error("column '{column}' does not hold a JSON list of filenames: {reason}")]
    InvalidAttachmentList { column: String, reason: String },

    #[error("cannot read attachment '{filename}' from {path}: {source}")]
    AttachmentRead {
        filename: String,
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("Email '{address}' does not match any of the allowed masks.")]
    RecipientNotAllowed { address: String },

    #[error("invalid allow-list mask '{mask}': {reason}")]
    InvalidMask { mask: String, reason: String },

    #[error("invalid {field} address '{value}': {reason}")]
    InvalidAddress {
        field: String,
        value: String,
        reason: String,
    },

    #[error("template render error in field '{field}': {reason}")]
    TemplateRender { field: String, reason: String },

    #[error("failed to build message: {reason}")]
    MessageBuild { reason: String },

    #[error("SMTP host {host}:{port} is not in the list of allowed hosts")]
    HostNotAllowed { host: String, port: u16 },

    #[error("connection error: {reason}")]
    TransportConnect { reason: String },

    #[error("failed to acquire OAuth2 token: {reason}")]
    TokenAcquisition { reason: String },

    #[error("send error: {reason}")]
    TransportSend { reason: String },

    #[error("transport is {state}, expected {expected}")]
    TransportState {
        state: &'static str,
        expected: &'static str,
    },

    #[error("cannot write result ledger {path}: {source}")]
    Ledger {
        path: std::path::PathBuf,
        source: csv::Error,
    },

    #[error("row {row_index} ({recipient}) failed: {source}")]
    RowAborted {
        row_index: usize,
        recipient: String,
        source: Box<BatchmailError>,
    },
}

impl BatchmailError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Ledger { .. } | Self::TransportState { .. } => ErrorKind::Internal,
            Self::RowAborted { source, .. } => source.kind(),
            _ => ErrorKind::User,
        }
    }

    /// Process exit status for a run that ended with this error.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::User => 1,
            ErrorKind::Internal => 2,
        }
    }
}
