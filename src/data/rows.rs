use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::BatchmailError;

/// One recipient's data: column name to cell value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row {
    values: BTreeMap<String, String>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }

    /// Like [`Row::get`], but a missing column is an error naming it.
    pub fn require(&self, column: &str) -> crate::Result<&str> {
        self.get(column)
            .ok_or_else(|| BatchmailError::MissingRowValue {
                column: column.to_string(),
            })
    }

    /// The row as a template rendering context.
    pub fn to_context(&self) -> Map<String, Value> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect()
    }
}

impl FromIterator<(String, String)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// A lazy, finite, single-pass producer of recipient rows.
pub trait RowSource: Iterator<Item = crate::Result<Row>> {
    /// Column names every row of this source carries.
    fn columns(&self) -> &BTreeSet<String>;
}

/// Rows built from a literal comma-separated list of addresses.
pub struct AddressListRows {
    column: String,
    columns: BTreeSet<String>,
    addresses: std::vec::IntoIter<String>,
}

impl AddressListRows {
    pub fn new(addresses: &str, column: &str) -> Self {
        let addresses: Vec<String> = addresses
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect();
        Self {
            column: column.to_string(),
            columns: BTreeSet::from([column.to_string()]),
            addresses: addresses.into_iter(),
        }
    }
}

impl Iterator for AddressListRows {
    type Item = crate::Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let address = self.addresses.next()?;
        Some(Ok(Row::from_iter([(self.column.clone(), address)])))
    }
}

impl RowSource for AddressListRows {
    fn columns(&self) -> &BTreeSet<String> {
        &self.columns
    }
}
