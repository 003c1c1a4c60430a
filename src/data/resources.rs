use std::path::{Path, PathBuf};

use crate::BatchmailError;

/// A file or table made available to the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputResource {
    /// Name with the platform's numeric id prefix removed.
    pub name: String,
    pub path: PathBuf,
}

/// Resolves logical input names to local paths.
pub trait ResourceLookup {
    fn files(&self) -> &[InputResource];
    fn tables(&self) -> &[InputResource];

    fn lookup_file(&self, name: &str) -> crate::Result<&Path> {
        find(self.files(), name)
    }

    fn lookup_table(&self, name: &str) -> crate::Result<&Path> {
        find(self.tables(), name)
    }
}

fn find<'a>(resources: &'a [InputResource], name: &str) -> crate::Result<&'a Path> {
    resources
        .iter()
        .find(|r| r.name == name)
        .map(|r| r.path.as_path())
        .ok_or_else(|| BatchmailError::ResourceNotFound {
            name: name.to_string(),
        })
}

/// The run's working directory:
/// `in/tables/` and `in/files/` for inputs, `out/tables/` for the ledger.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
    files: Vec<InputResource>,
    tables: Vec<InputResource>,
}

impl DataDir {
    /// Scan the input directories. Missing directories count as empty.
    pub fn discover(root: &Path) -> crate::Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            files: scan(&root.join("in").join("files"))?,
            tables: scan(&root.join("in").join("tables"))?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Create `out/tables/` and return the ledger path inside it.
    pub fn results_path(&self) -> crate::Result<PathBuf> {
        let dir = self.root.join("out").join("tables");
        std::fs::create_dir_all(&dir).map_err(|source| BatchmailError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(dir.join("results.csv"))
    }

    /// The configured input table, or the first discovered one.
    pub fn input_table(&self, name: Option<&str>) -> crate::Result<&Path> {
        match name {
            Some(name) => self.lookup_table(name),
            None => self
                .tables
                .first()
                .map(|t| t.path.as_path())
                .ok_or_else(|| BatchmailError::NoInputTable {
                    dir: self.root.join("in").join("tables"),
                }),
        }
    }
}

impl ResourceLookup for DataDir {
    fn files(&self) -> &[InputResource] {
        &self.files
    }

    fn tables(&self) -> &[InputResource] {
        &self.tables
    }
}

fn scan(dir: &Path) -> crate::Result<Vec<InputResource>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(BatchmailError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut resources = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| BatchmailError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if file_name.ends_with(".manifest") {
            continue;
        }
        resources.push(InputResource {
            name: logical_name(file_name).to_string(),
            path,
        });
    }
    resources.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(resources)
}

/// Strip a leading `<digits>_` storage id from a file name.
pub fn logical_name(file_name: &str) -> &str {
    match file_name.split_once('_') {
        Some((id, rest))
            if !id.is_empty() && !rest.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) =>
        {
            rest
        }
        _ => file_name,
    }
}
