use crate::config::{ClientEvalPolicy, ConfigError, QueryOptions};
use std::time::Duration;

#[test]
fn empty_document_yields_defaults() {
    let options = QueryOptions::from_toml_str("").expect("empty config should parse");

    assert_eq!(options, QueryOptions::default());
    assert_eq!(options.client_eval, ClientEvalPolicy::Warn);
    assert!(!options.sensitive_data_logging);
}

#[test]
fn query_table_overrides_defaults() {
    let options = QueryOptions::from_toml_str(
        r#"
        [query]
        client_eval = "throw"
        sensitive_data_logging = true
        command_timeout_secs = 45
        verify_row_ordering = true
        "#,
    )
    .expect("query table should parse");

    assert_eq!(options.client_eval, ClientEvalPolicy::Throw);
    assert!(options.sensitive_data_logging);
    assert!(options.verify_row_ordering);
    assert_eq!(options.command_timeout(), Some(Duration::from_secs(45)));
}

#[test]
fn unknown_keys_are_rejected() {
    let err = QueryOptions::from_toml_str("[query]\nclient_evaluation = \"warn\"\n")
        .expect_err("unknown key should fail");

    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn unknown_policy_is_rejected() {
    let err = QueryOptions::from_toml_str("[query]\nclient_eval = \"sometimes\"\n")
        .expect_err("unknown policy should fail");

    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn missing_file_reports_path() {
    let err = QueryOptions::from_path("/nonexistent/relq.toml").expect_err("missing file");

    assert!(
        err.to_string().contains("/nonexistent/relq.toml"),
        "read errors should name the path: {err}"
    );
}
