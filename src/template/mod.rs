mod parse;
mod source;
mod validate;

pub use parse::parse_placeholders;
pub use source::{template_file_paths, ResolvedTemplate, TemplateSet};
pub use validate::{missing_columns, validate_template};
