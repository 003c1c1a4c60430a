use serde_json::{Map, Value};
use tracing::warn;

use crate::BatchmailError;

/// Substitutes row values into template text.
///
/// Strict by default: a variable with no matching column fails the render.
/// The lenient renderer substitutes empty text instead.
pub struct Renderer {
    hbs: handlebars::Handlebars<'static>,
}

impl Renderer {
    pub fn new(lenient: bool) -> Self {
        let mut hbs = handlebars::Handlebars::new();
        hbs.set_strict_mode(!lenient);
        hbs.register_escape_fn(handlebars::no_escape);
        Self { hbs }
    }

    /// Render a body field. Failures propagate: an unrendered body is never sent.
    pub fn render(
        &self,
        field_name: &str,
        template_str: &str,
        context: &Map<String, Value>,
    ) -> crate::Result<String> {
        self.hbs
            .render_template(template_str, context)
            .map_err(|e| BatchmailError::TemplateRender {
                field: field_name.to_string(),
                reason: e.to_string(),
            })
    }

    /// Render a subject, falling back to the template text verbatim on failure.
    pub fn render_or_fallback(&self, template_str: &str, context: &Map<String, Value>) -> String {
        match self.render("subject", template_str, context) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(error = %e, "subject could not be rendered, sending template text as-is");
                template_str.to_string()
            }
        }
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new(false)
    }
}
