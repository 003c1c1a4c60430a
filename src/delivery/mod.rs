//! The row-processing loop.
//!
//! Each recipient row goes through resolve, validate, render, build, send and
//! record, strictly in input order over one shared transport.

mod run;

use std::collections::BTreeSet;
use std::io::Write;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::attachments::{filenames_json, AttachmentMap, AttachmentResolver, AttachmentSelection};
use crate::config::Configuration;
use crate::data::{ResourceLookup, Row, RowSource};
use crate::ledger::{DeliveryRecord, ResultLedger, Status};
use crate::message::{AddressAllowList, EmailBuilder};
use crate::render::Renderer;
use crate::template::{template_file_paths, validate_template, TemplateSet};
use crate::transport::{Transport, TransportState};
use crate::BatchmailError;

pub use run::{open_rows, run};

/// Run-wide switches of the delivery loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub continue_on_error: bool,
    pub dry_run: bool,
    pub lenient_placeholders: bool,
    pub send_interval: Duration,
}

impl From<&Configuration> for DeliveryPolicy {
    fn from(config: &Configuration) -> Self {
        Self {
            continue_on_error: config.continue_on_error,
            dry_run: config.dry_run,
            lenient_placeholders: config.lenient_placeholders,
            send_interval: Duration::from_millis(config.send_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Whatever a row produced before it finished or failed.
#[derive(Debug, Default)]
struct RowDraft {
    recipient: String,
    subject: String,
    plaintext: String,
    html: Option<String>,
    attachments: AttachmentMap,
}

pub struct Orchestrator {
    templates: TemplateSet,
    attachments: AttachmentResolver,
    builder: EmailBuilder,
    renderer: Renderer,
    recipient_column: String,
    policy: DeliveryPolicy,
}

impl Orchestrator {
    pub fn new(
        templates: TemplateSet,
        attachments: AttachmentResolver,
        builder: EmailBuilder,
        recipient_column: impl Into<String>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            templates,
            attachments,
            builder,
            renderer: Renderer::new(policy.lenient_placeholders),
            recipient_column: recipient_column.into(),
            policy,
        }
    }

    /// One-time setup from the configuration. Failures here are fatal to the run.
    pub fn prepare(config: &Configuration, resources: &dyn ResourceLookup) -> crate::Result<Self> {
        let templates = TemplateSet::prepare(&config.composition, resources)?;
        let attachments = AttachmentResolver::new(
            resources.files(),
            &template_file_paths(&config.composition, resources),
            AttachmentSelection::from(&config.attachments),
            &config.overrides,
        );
        let allow_list = AddressAllowList::new(config.overrides.address_whitelist.as_slice())?;
        let builder = EmailBuilder::new(&config.connection.sender_email_address, allow_list);
        Ok(Self::new(
            templates,
            attachments,
            builder,
            config.recipients.column(),
            DeliveryPolicy::from(config),
        ))
    }

    /// Process every row, appending one ledger record per row.
    ///
    /// The transport is connected first unless this is a dry run, and is always
    /// closed before returning.
    pub async fn deliver<W: Write>(
        &self,
        rows: &mut dyn RowSource,
        transport: &mut dyn Transport,
        ledger: &mut ResultLedger<W>,
    ) -> crate::Result<RunSummary> {
        let columns = rows.columns().clone();
        if !columns.contains(&self.recipient_column) {
            return Err(BatchmailError::MissingColumns {
                columns: vec![self.recipient_column.clone()],
            });
        }

        if self.policy.dry_run {
            info!("dry run: messages are composed and recorded but not sent");
        } else {
            transport.connect().await?;
        }

        let result = self.deliver_rows(rows, &columns, transport, ledger).await;
        if transport.state() == TransportState::Connected {
            transport.close().await;
        }
        result
    }

    async fn deliver_rows<W: Write>(
        &self,
        rows: &mut dyn RowSource,
        columns: &BTreeSet<String>,
        transport: &mut dyn Transport,
        ledger: &mut ResultLedger<W>,
    ) -> crate::Result<RunSummary> {
        let mut summary = RunSummary::default();

        for (index, row) in rows.enumerate() {
            let row_index = index + 1;
            let row = row?;
            let mut draft = RowDraft::default();
            let outcome = self
                .process_row(&row, columns, transport, &mut draft)
                .await;

            summary.processed += 1;
            let (status, error_message) = match &outcome {
                Ok(()) => {
                    summary.succeeded += 1;
                    (Status::Ok, String::new())
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(row = row_index, recipient = %draft.recipient, error = %e, "row failed");
                    (Status::Error, e.to_string())
                }
            };

            ledger.append(&DeliveryRecord {
                status,
                recipient: draft.recipient.clone(),
                sender: self.builder.sender().to_string(),
                subject: draft.subject,
                plaintext_body: draft.plaintext,
                html_body: draft.html.unwrap_or_default(),
                attachment_filenames: filenames_json(&draft.attachments),
                error_message,
            })?;

            if let Err(e) = outcome {
                if !self.policy.continue_on_error {
                    warn!(row = row_index, "stopping run: continue_on_error is disabled");
                    return Err(BatchmailError::RowAborted {
                        row_index,
                        recipient: draft.recipient,
                        source: Box::new(e),
                    });
                }
            }

            if !self.policy.dry_run && !self.policy.send_interval.is_zero() {
                tokio::time::sleep(self.policy.send_interval).await;
            }
        }

        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "delivery finished"
        );
        Ok(summary)
    }

    async fn process_row(
        &self,
        row: &Row,
        columns: &BTreeSet<String>,
        transport: &mut dyn Transport,
        draft: &mut RowDraft,
    ) -> crate::Result<()> {
        draft.recipient = row.require(&self.recipient_column)?.to_string();

        // Resolve
        let subject = self.templates.subject.resolve(row)?;
        let plaintext = self.templates.plaintext.resolve(row)?;
        let html = self
            .templates
            .html
            .as_ref()
            .map(|t| t.resolve(row))
            .transpose()?;

        // Validate and render
        if self.templates.templating {
            if !self.policy.lenient_placeholders {
                validate_template(subject, columns, false)?;
                validate_template(plaintext, columns, false)?;
                if let Some(html) = html {
                    validate_template(html, columns, false)?;
                }
            }
            let context = row.to_context();
            draft.subject = self.renderer.render_or_fallback(subject, &context);
            draft.plaintext = self.renderer.render("plaintext_body", plaintext, &context)?;
            draft.html = html
                .map(|h| self.renderer.render("html_body", h, &context))
                .transpose()?;
        } else {
            draft.subject = subject.to_string();
            draft.plaintext = plaintext.to_string();
            draft.html = html.map(str::to_string);
        }

        // Build
        draft.attachments = self.attachments.for_row(row)?;
        let message = self.builder.build(
            &draft.recipient,
            &draft.subject,
            &draft.plaintext,
            draft.html.as_deref(),
            &draft.attachments,
        )?;

        info!(
            "Sending email with subject: `{}` from `{}` to `{}`",
            message.subject, message.from, message.to
        );
        if !self.policy.dry_run {
            transport.send(&message).await?;
        }
        Ok(())
    }
}
