use std::path::Path;

use serde_json::{Map, Value};

use crate::config::types::Configuration;
use crate::BatchmailError;

/// Read, migrate and validate a configuration file.
pub fn load_configuration(path: &Path) -> crate::Result<Configuration> {
    let content = std::fs::read_to_string(path).map_err(|source| BatchmailError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = parse_document(path, &content)?;
    let config: Configuration =
        serde_json::from_value(migrate_shape(raw)).map_err(|source| BatchmailError::ConfigJson {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()?;
    Ok(config)
}

/// Parse `content` as JSON, YAML or TOML, chosen by the file extension.
fn parse_document(path: &Path, content: &str) -> crate::Result<Value> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "json" => serde_json::from_str(content).map_err(|source| BatchmailError::ConfigJson {
            path: path.to_path_buf(),
            source,
        }),
        "yml" | "yaml" => {
            serde_yaml::from_str(content).map_err(|source| BatchmailError::ConfigYaml {
                path: path.to_path_buf(),
                source,
            })
        }
        "toml" => toml::from_str(content).map_err(|source| BatchmailError::ConfigToml {
            path: path.to_path_buf(),
            source,
        }),
        other => Err(BatchmailError::UnsupportedFormat {
            extension: other.to_string(),
        }),
    }
}

/// Bring a platform-shaped document into the canonical shape.
///
/// - A root `parameters` object replaces the root.
/// - Keys carrying the platform's `#` secret marker lose it, unless the
///   unprefixed key is also present.
pub fn migrate_shape(raw: Value) -> Value {
    let inner = match raw {
        Value::Object(mut root) => match root.remove("parameters") {
            Some(params @ Value::Object(_)) => params,
            Some(other) => {
                root.insert("parameters".to_string(), other);
                Value::Object(root)
            }
            None => Value::Object(root),
        },
        other => other,
    };
    strip_secret_markers(inner)
}

fn strip_secret_markers(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            let plain_keys: Vec<String> = map
                .keys()
                .filter(|k| !k.starts_with('#'))
                .cloned()
                .collect();
            for (key, val) in map {
                let val = strip_secret_markers(val);
                match key.strip_prefix('#') {
                    Some(stripped) if !plain_keys.iter().any(|k| k == stripped) => {
                        out.insert(stripped.to_string(), val);
                    }
                    Some(_) => {}
                    None => {
                        out.insert(key, val);
                    }
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(strip_secret_markers).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use serde_json::json;

    use super::*;
    use crate::config::types::{Composition, ConnectionProtocol};

    fn write_config(ext: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(&format!(".{ext}"))
            .tempfile()
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_migrate_unwraps_parameters() {
        let migrated = migrate_shape(json!({"parameters": {"dry_run": true}, "action": "run"}));
        assert_eq!(migrated, json!({"dry_run": true}));
    }

    #[test]
    fn test_migrate_strips_secret_marker() {
        let migrated = migrate_shape(json!({"connection": {"#sender_password": "pw"}}));
        assert_eq!(migrated, json!({"connection": {"sender_password": "pw"}}));
    }

    #[test]
    fn test_migrate_prefers_plain_key() {
        let migrated = migrate_shape(json!({"sender_password": "a", "#sender_password": "b"}));
        assert_eq!(migrated, json!({"sender_password": "a"}));
    }

    #[test]
    fn test_load_platform_json() {
        let file = write_config(
            "json",
            r##"{"parameters": {
                "connection": {"sender_email_address": "s@example.com", "#sender_password": "pw",
                               "connection_protocol": "TLS", "server_port": 587},
                "composition": {"mode": "basic", "subject": "Hi", "plaintext_body": "Hello"}
            }}"##,
        );
        let cfg = load_configuration(file.path()).unwrap();
        assert_eq!(cfg.connection.sender_password.expose(), "pw");
        assert_eq!(cfg.connection.connection_protocol, ConnectionProtocol::Tls);
        assert!(matches!(cfg.composition, Composition::Basic { .. }));
    }

    #[test]
    fn test_load_yaml() {
        let file = write_config(
            "yaml",
            "connection:\n  sender_email_address: s@example.com\n\
             composition:\n  mode: advanced\n  subject: {source: from_template_definition, text: 'Hi'}\n  \
             plaintext_body: {source: from_template_file, filename: body.txt}\n\
             dry_run: true\n",
        );
        let cfg = load_configuration(file.path()).unwrap();
        assert!(cfg.dry_run);
    }

    #[test]
    fn test_load_toml() {
        let file = write_config(
            "toml",
            "continue_on_error = true\n\n[connection]\nsender_email_address = \"s@example.com\"\n\n\
             [composition]\nmode = \"basic\"\nsubject = \"Hi\"\nplaintext_body = \"Hello\"\n",
        );
        let cfg = load_configuration(file.path()).unwrap();
        assert!(cfg.continue_on_error);
    }

    #[test]
    fn test_load_invalid_shape_is_config_error() {
        let file = write_config("json", r#"{"connection": {}}"#);
        assert!(matches!(
            load_configuration(file.path()),
            Err(BatchmailError::ConfigJson { .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_configuration(Path::new("/nonexistent/config.json"));
        assert!(matches!(result, Err(BatchmailError::Io { .. })));
    }

    #[test]
    fn test_format_follows_extension_case_insensitively() {
        let doc = parse_document(Path::new("config.YAML"), "a: 1").unwrap();
        assert_eq!(doc, json!({"a": 1}));
        let doc = parse_document(Path::new("config.yml"), "a: 1").unwrap();
        assert_eq!(doc, json!({"a": 1}));
        let doc = parse_document(Path::new("config.toml"), "a = 1").unwrap();
        assert_eq!(doc, json!({"a": 1}));
    }

    #[test]
    fn test_unknown_extension() {
        let result = parse_document(Path::new("config.ini"), "a=1");
        assert!(
            matches!(result, Err(BatchmailError::UnsupportedFormat { extension }) if extension == "ini")
        );
    }
}
