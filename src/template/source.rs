use std::path::PathBuf;

use crate::config::{Composition, TemplateSpec};
use crate::data::{ResourceLookup, Row};
use crate::BatchmailError;

/// A template whose text is either fixed for the run or read from each row.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedTemplate {
    Shared(String),
    PerRow { column: String },
}

impl ResolvedTemplate {
    /// Load shared template text. A missing template file is fatal to the run.
    pub fn prepare(spec: &TemplateSpec, resources: &dyn ResourceLookup) -> crate::Result<Self> {
        match spec {
            TemplateSpec::FromTable { column } => Ok(Self::PerRow {
                column: column.clone(),
            }),
            TemplateSpec::FromTemplateDefinition { text } => Ok(Self::Shared(text.clone())),
            TemplateSpec::FromTemplateFile { filename } => {
                let path = resources.lookup_file(filename)?;
                let text = std::fs::read_to_string(path).map_err(|source| BatchmailError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Ok(Self::Shared(text))
            }
        }
    }

    /// The template text for `row`.
    pub fn resolve<'a>(&'a self, row: &'a Row) -> crate::Result<&'a str> {
        match self {
            Self::Shared(text) => Ok(text),
            Self::PerRow { column } => row.require(column),
        }
    }
}

/// The subject, plaintext and optional HTML templates of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateSet {
    pub subject: ResolvedTemplate,
    pub plaintext: ResolvedTemplate,
    /// Only resolved when HTML sending is enabled.
    pub html: Option<ResolvedTemplate>,
    /// `false` in basic mode: texts are sent verbatim.
    pub templating: bool,
}

impl TemplateSet {
    pub fn prepare(composition: &Composition, resources: &dyn ResourceLookup) -> crate::Result<Self> {
        match composition {
            Composition::Basic {
                subject,
                plaintext_body,
                html_body,
            } => Ok(Self {
                subject: ResolvedTemplate::Shared(subject.clone()),
                plaintext: ResolvedTemplate::Shared(plaintext_body.clone()),
                html: html_body.clone().map(ResolvedTemplate::Shared),
                templating: false,
            }),
            Composition::Advanced {
                subject,
                plaintext_body,
                use_html_template,
                html_body,
            } => {
                let html = match (use_html_template, html_body) {
                    (true, Some(spec)) => Some(ResolvedTemplate::prepare(spec, resources)?),
                    (true, None) => {
                        return Err(BatchmailError::InvalidConfig {
                            reason: "use_html_template is set but html_body is not configured"
                                .into(),
                        })
                    }
                    (false, _) => None,
                };
                Ok(Self {
                    subject: ResolvedTemplate::prepare(subject, resources)?,
                    plaintext: ResolvedTemplate::prepare(plaintext_body, resources)?,
                    html,
                    templating: true,
                })
            }
        }
    }
}

/// Paths of the input files used as templates, so they are not attached.
pub fn template_file_paths(
    composition: &Composition,
    resources: &dyn ResourceLookup,
) -> Vec<PathBuf> {
    let Composition::Advanced {
        subject,
        plaintext_body,
        use_html_template,
        html_body,
    } = composition
    else {
        return Vec::new();
    };

    let mut specs = vec![subject, plaintext_body];
    if *use_html_template {
        specs.extend(html_body.as_ref());
    }
    specs
        .into_iter()
        .filter_map(|spec| match spec {
            TemplateSpec::FromTemplateFile { filename } => resources
                .lookup_file(filename)
                .ok()
                .map(|p| p.to_path_buf()),
            _ => None,
        })
        .collect()
}
