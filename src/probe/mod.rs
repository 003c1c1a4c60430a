//! Interactive validation checks that run without sending anything.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use crate::attachments::parse_filename_list;
use crate::config::{AttachmentsConfig, Configuration};
use crate::data::{DataDir, ResourceLookup, RowSource};
use crate::delivery::open_rows;
use crate::template::{
    missing_columns, parse_placeholders, template_file_paths, ResolvedTemplate, TemplateSet,
};
use crate::transport::build_transport;
use crate::BatchmailError;

pub const CONNECTION_OK: &str = "OK - Connection established!";
pub const SUBJECT_OK: &str = "OK - All subject placeholders are present in the input table";
pub const TEMPLATE_OK: &str = "OK - All template placeholders are present in the input table";
pub const ATTACHMENTS_OK: &str = "OK - All attachments are present";
pub const CONFIG_OK: &str = "OK - Config Valid!";
pub const CONFIG_INVALID: &str = "ERROR - Config Invalid!";

/// Outcome of one probe, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    #[serde(serialize_with = "serialize_status", rename = "status")]
    pub ok: bool,
    pub message: String,
}

fn serialize_status<S: serde::Serializer>(ok: &bool, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(if *ok { "success" } else { "error" })
}

impl ProbeResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }

    fn from_outcome(outcome: crate::Result<Self>) -> Self {
        outcome.unwrap_or_else(|e| Self::error(format!("ERROR - {e}")))
    }
}

/// Which template a placeholder probe inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Subject,
    Plaintext,
    Html,
}

pub struct Probes<'a> {
    config: &'a Configuration,
    data_dir: &'a DataDir,
}

impl<'a> Probes<'a> {
    pub fn new(config: &'a Configuration, data_dir: &'a DataDir) -> Self {
        Self { config, data_dir }
    }

    /// Open and authenticate a connection, then close it.
    pub async fn test_connection(&self) -> ProbeResult {
        let outcome = async {
            let mut transport = build_transport(&self.config.connection, &self.config.overrides)?;
            transport.connect().await?;
            transport.close().await;
            Ok::<_, BatchmailError>(())
        }
        .await;
        match outcome {
            Ok(()) => ProbeResult::ok(CONNECTION_OK),
            Err(e) => ProbeResult::error(format!("ERROR - Could not establish connection! - {e}")),
        }
    }

    pub fn validate_subject(&self) -> ProbeResult {
        ProbeResult::from_outcome(self.placeholder_probe(Field::Subject, SUBJECT_OK))
    }

    pub fn validate_plaintext_template(&self) -> ProbeResult {
        ProbeResult::from_outcome(self.placeholder_probe(Field::Plaintext, TEMPLATE_OK))
    }

    pub fn validate_html_template(&self) -> ProbeResult {
        ProbeResult::from_outcome(self.placeholder_probe(Field::Html, TEMPLATE_OK))
    }

    /// Every filename referenced by the attachment column must be an input file.
    pub fn validate_attachments(&self) -> ProbeResult {
        ProbeResult::from_outcome(self.attachments_probe())
    }

    /// Run every probe and summarize.
    pub async fn validate_config(&self) -> ProbeResult {
        let mut results = vec![
            self.test_connection().await,
            self.validate_plaintext_template(),
            self.validate_html_template(),
            self.validate_subject(),
        ];
        if matches!(self.config.attachments, AttachmentsConfig::FromTable { .. }) {
            results.push(self.validate_attachments());
        } else {
            results.push(ProbeResult::ok(ATTACHMENTS_OK));
        }

        let ok = results.iter().all(|r| r.ok);
        let mut message = if ok { CONFIG_OK } else { CONFIG_INVALID }.to_string();
        for result in &results {
            message.push('\n');
            message.push_str(&result.message);
        }
        ProbeResult { ok, message }
    }

    fn placeholder_probe(&self, field: Field, ok_message: &str) -> crate::Result<ProbeResult> {
        let templates = TemplateSet::prepare(&self.config.composition, self.data_dir)?;
        let template = match field {
            Field::Subject => Some(&templates.subject),
            Field::Plaintext => Some(&templates.plaintext),
            Field::Html => templates.html.as_ref(),
        };
        let Some(template) = template.filter(|_| templates.templating) else {
            debug!(?field, "template not used, nothing to check");
            return Ok(ProbeResult::ok(ok_message));
        };

        let mut rows = open_rows(self.config, self.data_dir)?;
        let missing = missing_placeholders(template, rows.as_mut())?;
        if missing.is_empty() {
            Ok(ProbeResult::ok(ok_message))
        } else {
            let err = BatchmailError::MissingColumns { columns: missing };
            Ok(ProbeResult::error(format!("ERROR - {err}")))
        }
    }

    fn attachments_probe(&self) -> crate::Result<ProbeResult> {
        let AttachmentsConfig::FromTable { column } = &self.config.attachments else {
            return Ok(ProbeResult::ok(ATTACHMENTS_OK));
        };

        let templates = template_file_paths(&self.config.composition, self.data_dir);
        let available: BTreeSet<&str> = self
            .data_dir
            .files()
            .iter()
            .filter(|f| !templates.contains(&f.path))
            .map(|f| f.name.as_str())
            .collect();

        let mut missing = BTreeSet::new();
        for row in open_rows(self.config, self.data_dir)? {
            let row = row?;
            for filename in parse_filename_list(row.require(column)?, column)? {
                if !available.contains(filename.as_str()) {
                    missing.insert(filename);
                }
            }
        }

        if missing.is_empty() {
            Ok(ProbeResult::ok(ATTACHMENTS_OK))
        } else {
            let names: Vec<String> = missing.into_iter().collect();
            Ok(ProbeResult::error(format!(
                "ERROR - Missing attachments: {}",
                names.join(", ")
            )))
        }
    }
}

/// Placeholders of `template` with no column in `rows`, sorted.
///
/// A per-row template contributes the union of placeholders over all rows.
fn missing_placeholders(
    template: &ResolvedTemplate,
    rows: &mut dyn RowSource,
) -> crate::Result<Vec<String>> {
    let columns = rows.columns().clone();
    match template {
        ResolvedTemplate::Shared(text) => Ok(missing_columns(text, &columns)),
        ResolvedTemplate::PerRow { column } => {
            let mut placeholders = BTreeSet::new();
            for row in rows {
                placeholders.extend(parse_placeholders(row?.require(column)?));
            }
            Ok(placeholders.difference(&columns).cloned().collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::AddressListRows;

    #[test]
    fn test_result_json() {
        let json = serde_json::to_value(ProbeResult::error("ERROR - x")).unwrap();
        assert_eq!(json, serde_json::json!({"status": "error", "message": "ERROR - x"}));
        let json = serde_json::to_value(ProbeResult::ok(TEMPLATE_OK)).unwrap();
        assert_eq!(json["status"], "success");
    }

    #[test]
    fn test_shared_template_missing() {
        let mut rows = AddressListRows::new("a@example.com", "recipient_email_address");
        let template = ResolvedTemplate::Shared("{{name}} {{recipient_email_address}}".into());
        assert_eq!(
            missing_placeholders(&template, &mut rows).unwrap(),
            vec!["name"]
        );
    }

    #[test]
    fn test_from_outcome_formats_error() {
        let result = ProbeResult::from_outcome(Err(BatchmailError::ResourceNotFound {
            name: "body.txt".into(),
        }));
        assert!(!result.ok);
        assert_eq!(result.message, "ERROR - input resource 'body.txt' not found");
    }
}
