//! Transport-agnostic email messages and their construction.

mod allowlist;
mod builder;

pub use allowlist::{split_recipients, AddressAllowList};
pub use builder::EmailBuilder;

use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::Message;

use crate::BatchmailError;

/// One file attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPart {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// A fully built message, ready for any transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub from: String,
    /// Raw recipient field; may hold several comma-separated addresses.
    pub to: String,
    pub subject: String,
    pub plaintext_body: String,
    pub html_body: Option<String>,
    pub attachments: Vec<AttachmentPart>,
}

impl EmailMessage {
    pub fn recipients(&self) -> Vec<&str> {
        split_recipients(&self.to).collect()
    }

    pub fn attachment_filenames(&self) -> Vec<&str> {
        self.attachments.iter().map(|a| a.filename.as_str()).collect()
    }

    /// Convert to a MIME message.
    ///
    /// Produces `multipart/alternative` when an HTML body is present, plain text
    /// otherwise. Attachments are wrapped in an outer `multipart/mixed`.
    pub fn to_lettre(&self) -> crate::Result<Message> {
        let from = parse_mailbox("from", &self.from)?;
        let mut builder = Message::builder().from(from).subject(&self.subject);
        for address in self.recipients() {
            builder = builder.to(parse_mailbox("to", address)?);
        }

        let body = self.html_body.as_ref().map(|html| {
            MultiPart::alternative()
                .singlepart(SinglePart::plain(self.plaintext_body.clone()))
                .singlepart(SinglePart::html(html.clone()))
        });

        let message = if self.attachments.is_empty() {
            match body {
                Some(alt) => builder.multipart(alt),
                None => builder.body(self.plaintext_body.clone()),
            }
        } else {
            let mut mixed = match body {
                Some(alt) => MultiPart::mixed().multipart(alt),
                None => MultiPart::mixed().singlepart(SinglePart::plain(self.plaintext_body.clone())),
            };
            for part in &self.attachments {
                mixed = mixed.singlepart(
                    Attachment::new(part.filename.clone())
                        .body(part.content.clone(), content_type(&part.content_type)?),
                );
            }
            builder.multipart(mixed)
        };

        message.map_err(|e| BatchmailError::MessageBuild {
            reason: e.to_string(),
        })
    }
}

fn parse_mailbox(field: &str, value: &str) -> crate::Result<Mailbox> {
    value
        .parse::<Mailbox>()
        .map_err(|e| BatchmailError::InvalidAddress {
            field: field.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn content_type(mime: &str) -> crate::Result<ContentType> {
    ContentType::parse(mime)
        .or_else(|_| ContentType::parse("application/octet-stream"))
        .map_err(|e| BatchmailError::MessageBuild {
            reason: format!("invalid content type '{mime}': {e}"),
        })
}
