use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::BatchmailError;

/// Columns of the result table, in output order.
pub const LEDGER_COLUMNS: [&str; 8] = [
    "status",
    "recipient_email_address",
    "sender_email_address",
    "subject",
    "plaintext_message_body",
    "html_message_body",
    "attachment_filenames",
    "error_message",
];

const NEWLINE_TOKEN: &str = "<newline>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Error => "ERROR",
        }
    }
}

/// The outcome of one recipient row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub status: Status,
    pub recipient: String,
    pub sender: String,
    pub subject: String,
    pub plaintext_body: String,
    pub html_body: String,
    /// JSON list of attachment filenames.
    pub attachment_filenames: String,
    pub error_message: String,
}

/// Append-only CSV writer, flushed after every record.
pub struct ResultLedger<W: Write> {
    writer: csv::Writer<W>,
    path: PathBuf,
    written: usize,
    any_failed: bool,
}

impl ResultLedger<File> {
    pub fn create(path: &Path) -> crate::Result<Self> {
        let writer = csv::Writer::from_path(path).map_err(|e| BatchmailError::Ledger {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::with_writer(writer, path.to_path_buf())
    }
}

impl<W: Write> ResultLedger<W> {
    /// Ledger over any sink; `label` names it in errors.
    pub fn from_writer(sink: W, label: impl Into<PathBuf>) -> crate::Result<Self> {
        Self::with_writer(csv::Writer::from_writer(sink), label.into())
    }

    fn with_writer(writer: csv::Writer<W>, path: PathBuf) -> crate::Result<Self> {
        let mut ledger = Self {
            writer,
            path,
            written: 0,
            any_failed: false,
        };
        ledger.write_row(LEDGER_COLUMNS)?;
        Ok(ledger)
    }

    pub fn append(&mut self, record: &DeliveryRecord) -> crate::Result<()> {
        let plaintext = encode_newlines(&record.plaintext_body);
        let html = encode_newlines(&record.html_body);
        self.write_row([
            record.status.as_str(),
            record.recipient.as_str(),
            record.sender.as_str(),
            record.subject.as_str(),
            plaintext.as_str(),
            html.as_str(),
            record.attachment_filenames.as_str(),
            record.error_message.as_str(),
        ])?;
        self.written += 1;
        if record.status == Status::Error {
            self.any_failed = true;
        }
        Ok(())
    }

    fn write_row(&mut self, fields: [&str; 8]) -> crate::Result<()> {
        self.writer
            .write_record(fields)
            .and_then(|()| self.writer.flush().map_err(csv::Error::from))
            .map_err(|e| BatchmailError::Ledger {
                path: self.path.clone(),
                source: e,
            })
    }

    /// Records appended so far, header excluded.
    pub fn len(&self) -> usize {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    pub fn any_failed(&self) -> bool {
        self.any_failed
    }

    pub fn into_inner(self) -> crate::Result<W> {
        let path = self.path;
        self.writer.into_inner().map_err(|e| BatchmailError::Ledger {
            path,
            source: csv::Error::from(e.into_error()),
        })
    }
}

fn encode_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', NEWLINE_TOKEN)
}
