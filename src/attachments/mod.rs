use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::debug;

use crate::config::{AttachmentsConfig, StackOverrides};
use crate::data::{InputResource, Row};
use crate::BatchmailError;

/// Logical attachment filename to local path.
pub type AttachmentMap = BTreeMap<String, PathBuf>;

/// How each row picks its attachments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentSelection {
    /// Every row gets the whole base map.
    AllInputFiles,
    /// A column holds a JSON list of filenames.
    FromTable { column: String },
    /// No attachments at all.
    Disabled,
}

impl From<&AttachmentsConfig> for AttachmentSelection {
    fn from(config: &AttachmentsConfig) -> Self {
        match config {
            AttachmentsConfig::AllInputFiles => Self::AllInputFiles,
            AttachmentsConfig::FromTable { column } => Self::FromTable {
                column: column.clone(),
            },
            AttachmentsConfig::Disabled => Self::Disabled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttachmentResolver {
    base: AttachmentMap,
    selection: AttachmentSelection,
    /// Attachments disabled by stack override.
    disabled: bool,
    check_when_disabled: bool,
}

impl AttachmentResolver {
    /// Build the base map from the input files, leaving out template files.
    pub fn new(
        files: &[InputResource],
        template_paths: &[PathBuf],
        selection: AttachmentSelection,
        overrides: &StackOverrides,
    ) -> Self {
        let base = files
            .iter()
            .filter(|f| !template_paths.contains(&f.path))
            .map(|f| (f.name.clone(), f.path.clone()))
            .collect();
        Self {
            base,
            selection,
            disabled: overrides.disable_attachments,
            check_when_disabled: overrides.check_disabled_attachment_references,
        }
    }

    pub fn base(&self) -> &AttachmentMap {
        &self.base
    }

    /// The attachments for `row`. Unknown filenames are a row-level error.
    pub fn for_row(&self, row: &Row) -> crate::Result<AttachmentMap> {
        if self.disabled {
            if self.check_when_disabled {
                if let AttachmentSelection::FromTable { column } = &self.selection {
                    self.narrow(row, column)?;
                }
            }
            debug!("attachments disabled by override");
            return Ok(AttachmentMap::new());
        }
        match &self.selection {
            AttachmentSelection::AllInputFiles => Ok(self.base.clone()),
            AttachmentSelection::FromTable { column } => self.narrow(row, column),
            AttachmentSelection::Disabled => Ok(AttachmentMap::new()),
        }
    }

    fn narrow(&self, row: &Row, column: &str) -> crate::Result<AttachmentMap> {
        let filenames = parse_filename_list(row.require(column)?, column)?;
        let unknown: Vec<String> = filenames
            .iter()
            .filter(|f| !self.base.contains_key(*f))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(BatchmailError::UnknownAttachment { filenames: unknown });
        }
        Ok(filenames
            .into_iter()
            .filter_map(|f| self.base.get(&f).map(|p| (f, p.clone())))
            .collect())
    }
}

/// Parse a JSON array of filenames. An empty cell means no attachments.
pub fn parse_filename_list(cell: &str, column: &str) -> crate::Result<Vec<String>> {
    if cell.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(cell).map_err(|e| BatchmailError::InvalidAttachmentList {
        column: column.to_string(),
        reason: e.to_string(),
    })
}

/// Filenames in `map`, as the ledger's JSON list.
pub fn filenames_json(map: &AttachmentMap) -> String {
    let names: Vec<&str> = map.keys().map(String::as_str).collect();
    serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string())
}
