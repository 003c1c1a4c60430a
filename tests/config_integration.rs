use batchmail_lib::config::{
    load_configuration, AttachmentsConfig, Composition, ConnectionProtocol, RecipientsConfig,
    TemplateSpec,
};
use batchmail_lib::BatchmailError;

fn fixtures_config() -> std::path::PathBuf {
    std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures")
        .join("config")
}

#[test]
fn test_load_advanced_json() {
    let cfg = load_configuration(&fixtures_config().join("advanced.json")).unwrap();
    assert_eq!(cfg.connection.connection_protocol, ConnectionProtocol::Tls);
    assert_eq!(cfg.connection.server_port, 587);
    assert_eq!(cfg.recipients.column(), "email");
    assert!(cfg.uses_html());
    assert!(cfg.continue_on_error);
    assert_eq!(
        cfg.attachments,
        AttachmentsConfig::FromTable {
            column: "files".into()
        }
    );
    assert_eq!(cfg.overrides.address_whitelist, vec!["*@example.com"]);
    let Composition::Advanced { plaintext_body, .. } = &cfg.composition else {
        panic!("expected advanced composition");
    };
    assert_eq!(
        plaintext_body,
        &TemplateSpec::FromTemplateFile {
            filename: "body.txt".into()
        }
    );
}

#[test]
fn test_load_basic_yaml() {
    let cfg = load_configuration(&fixtures_config().join("basic.yaml")).unwrap();
    assert!(cfg.dry_run);
    assert_eq!(cfg.connection.server_port, 465);
    assert_eq!(cfg.attachments, AttachmentsConfig::Disabled);
    assert!(matches!(cfg.recipients, RecipientsConfig::AddressList { .. }));
    assert!(!cfg.uses_html());
}

#[test]
fn test_load_oauth_toml() {
    let cfg = load_configuration(&fixtures_config().join("oauth.toml")).unwrap();
    assert_eq!(cfg.connection.connection_protocol, ConnectionProtocol::Oauth2);
    assert_eq!(cfg.connection.oauth.as_ref().unwrap().client_id, "client-app");
    assert_eq!(cfg.connection.proxy.as_ref().unwrap().port, 1080);
    assert_eq!(cfg.send_interval_ms, 0);
}

#[test]
fn test_platform_wrapper_and_secret_marker() {
    let cfg = load_configuration(&fixtures_config().join("platform_wrapped.json")).unwrap();
    assert_eq!(cfg.connection.sender_password.expose(), "KBC::ProjectSecure::abc");
    assert_eq!(cfg.connection.sender_email_address, "sender@example.com");
    assert!(cfg.dry_run);
}

#[test]
fn test_unknown_extension_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.ini");
    std::fs::write(&path, "x=1").unwrap();
    let err = load_configuration(&path).unwrap_err();
    assert!(matches!(err, BatchmailError::UnsupportedFormat { .. }));
    assert_eq!(err.exit_code(), 1);
}
