use std::collections::BTreeSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::data::rows::{Row, RowSource};
use crate::BatchmailError;

#[derive(Debug, Clone, Default)]
pub struct CsvOptions {
    pub separator: Option<u8>,
    pub encoding: Option<String>,
}

pub fn detect_separator(first_line: &str) -> u8 {
    let candidates: &[(u8, char)] = &[(b',', ','), (b';', ';'), (b'|', '|'), (b'\t', '\t')];
    candidates
        .iter()
        .max_by_key(|(_, ch)| first_line.chars().filter(|c| c == ch).count())
        .map(|(byte, _)| *byte)
        .unwrap_or(b',')
}

pub fn decode_bytes(bytes: &[u8], hint: Option<&str>) -> String {
    if let Some(label) = hint {
        let encoding =
            encoding_rs::Encoding::for_label(label.as_bytes()).unwrap_or(encoding_rs::WINDOWS_1252);
        let (decoded, _, _) = encoding.decode(bytes);
        return decoded.into_owned();
    }

    match String::from_utf8(bytes.to_vec()) {
        Ok(s) => s,
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Rows of one input table, read lazily in file order.
///
/// The file is decoded up front (encoding detection needs the whole buffer),
/// but records are parsed one at a time as the iterator advances.
pub struct TableRows {
    path: PathBuf,
    columns: BTreeSet<String>,
    headers: Vec<String>,
    records: csv::StringRecordsIntoIter<Cursor<Vec<u8>>>,
}

impl TableRows {
    pub fn open(path: &Path, opts: &CsvOptions) -> crate::Result<Self> {
        let bytes = std::fs::read(path).map_err(|source| BatchmailError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let content = decode_bytes(&bytes, opts.encoding.as_deref());

        let delimiter = match opts.separator {
            Some(sep) => sep,
            None => {
                let first_line = content.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
                detect_separator(first_line)
            }
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(Cursor::new(content.into_bytes()));

        let headers: Vec<String> = {
            let h = reader.headers().map_err(|source| BatchmailError::CsvParse {
                path: path.to_path_buf(),
                source,
            })?;
            if h.is_empty() || h.iter().all(str::is_empty) {
                return Err(BatchmailError::CsvNoHeaders {
                    path: path.to_path_buf(),
                });
            }
            h.iter().map(String::from).collect()
        };

        Ok(Self {
            path: path.to_path_buf(),
            columns: headers.iter().cloned().collect(),
            headers,
            records: reader.into_records(),
        })
    }
}

impl Iterator for TableRows {
    type Item = crate::Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        Some(
            record
                .map(|record| {
                    self.headers
                        .iter()
                        .cloned()
                        .zip(record.iter().map(String::from))
                        .collect()
                })
                .map_err(|source| BatchmailError::CsvParse {
                    path: self.path.clone(),
                    source,
                }),
        )
    }
}

impl RowSource for TableRows {
    fn columns(&self) -> &BTreeSet<String> {
        &self.columns
    }
}
