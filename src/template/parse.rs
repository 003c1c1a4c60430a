use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{(.*?)\}\}").expect("placeholder pattern is valid"))
}

/// Extract the distinct variable names referenced as `{{ name }}` in `text`.
///
/// Lenient: unbalanced braces are ignored rather than reported. Extra
/// braces (as in `{{{name}}}`) and surrounding whitespace are stripped.
pub fn parse_placeholders(text: &str) -> BTreeSet<String> {
    placeholder_regex()
        .captures_iter(text)
        .map(|c| {
            c[1].trim()
                .trim_matches(|ch| ch == '{' || ch == '}')
                .trim()
                .to_string()
        })
        .collect()
}
