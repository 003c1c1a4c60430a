use std::collections::BTreeSet;

use crate::template::parse::parse_placeholders;

/// Check that every placeholder in `text` names one of `columns`.
///
/// With `lenient` set the check is skipped entirely. Otherwise all missing
/// names are reported, sorted.
pub fn validate_template(
    text: &str,
    columns: &BTreeSet<String>,
    lenient: bool,
) -> crate::Result<()> {
    if lenient {
        return Ok(());
    }
    let missing = missing_columns(text, columns);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(crate::BatchmailError::MissingColumns { columns: missing })
    }
}

/// Placeholders of `text` that are not in `columns`, sorted.
pub fn missing_columns(text: &str, columns: &BTreeSet<String>) -> Vec<String> {
    parse_placeholders(text)
        .difference(columns)
        .cloned()
        .collect()
}
