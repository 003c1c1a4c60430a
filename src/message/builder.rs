use tracing::debug;

use crate::attachments::AttachmentMap;
use crate::message::{AddressAllowList, AttachmentPart, EmailMessage};
use crate::BatchmailError;

/// Assembles [`EmailMessage`]s for one sender under an allow-list.
#[derive(Debug, Clone)]
pub struct EmailBuilder {
    sender: String,
    allow_list: AddressAllowList,
}

impl EmailBuilder {
    pub fn new(sender: impl Into<String>, allow_list: AddressAllowList) -> Self {
        Self {
            sender: sender.into(),
            allow_list,
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Build one message, reading attachment bytes from disk.
    pub fn build(
        &self,
        recipient: &str,
        subject: &str,
        plaintext_body: &str,
        html_body: Option<&str>,
        attachments: &AttachmentMap,
    ) -> crate::Result<EmailMessage> {
        self.allow_list.check(recipient)?;

        let attachments = attachments
            .iter()
            .map(|(filename, path)| {
                let content = std::fs::read(path).map_err(|e| BatchmailError::AttachmentRead {
                    filename: filename.clone(),
                    path: path.clone(),
                    source: e,
                })?;
                let content_type = mime_guess::from_path(filename)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string();
                debug!(filename = %filename, content_type = %content_type, bytes = content.len(), "attachment read");
                Ok(AttachmentPart {
                    filename: filename.clone(),
                    content_type,
                    content,
                })
            })
            .collect::<crate::Result<Vec<_>>>()?;

        Ok(EmailMessage {
            from: self.sender.clone(),
            to: recipient.to_string(),
            subject: subject.to_string(),
            plaintext_body: plaintext_body.to_string(),
            html_body: html_body.map(str::to_string),
            attachments,
        })
    }
}
