use std::io::Write;

use serial_test::serial;

use super::*;

#[test]
fn test_config_default() {
    let config = Config::default();
    assert_eq!(config.manager.managed_databases, vec!["*".to_string()]);
    assert_eq!(config.manager.workers, 4);
    assert_eq!(config.plugins.cache_dir, PathBuf::from("/tmp/plugins"));
    assert_eq!(config.plugins.major_version, "0");
    assert_eq!(config.plugins.handshake_timeout_secs, 10);
    assert_eq!(config.plugins.call_timeout_secs, 300);
    assert_eq!(config.apply.image, "schemahero/schemahero:alpha");
    assert_eq!(config.apply.vault_secret_path, "/vault/secrets/schemaherouri");
    assert!(config.validate().is_ok());
}

#[test]
fn test_manages_wildcard_and_exact() {
    let all = vec!["*".to_string()];
    assert!(manages(&all, "anything"));

    let some = vec!["db1".to_string(), "db2".to_string()];
    assert!(manages(&some, "db1"));
    assert!(!manages(&some, "db3"));
    assert!(!manages(&[], "db1"));
}

#[test]
fn test_validate_rejects_zero_workers() {
    let mut config = Config::for_test();
    config.manager.workers = 0;
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
fn test_validate_rejects_zero_call_timeout() {
    let mut config = Config::for_test();
    config.plugins.call_timeout_secs = 0;
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
#[serial]
fn test_load_from_file() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        "manager:\n  managed_databases: [app, audit]\n  workers: 2\nplugins:\n  repository: registry.local/schemahero\n  major_version: \"1\"\napply:\n  image: example/schemahero:1.0\n"
    )
    .unwrap();

    let config = Config::load(Some(file.path().to_str().unwrap())).unwrap();
    assert_eq!(config.manager.managed_databases, vec!["app", "audit"]);
    assert_eq!(config.manager.workers, 2);
    assert_eq!(config.plugins.repository, "registry.local/schemahero");
    assert_eq!(config.plugins.major_version, "1");
    assert_eq!(config.apply.image, "example/schemahero:1.0");
    assert_eq!(config.plugins.handshake_timeout_secs, 10);
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(file, "manager:\n  workers: 2\n").unwrap();

    std::env::set_var("SCHEMAHERO__MANAGER__WORKERS", "7");
    let loaded = Config::load(Some(file.path().to_str().unwrap()));
    std::env::remove_var("SCHEMAHERO__MANAGER__WORKERS");

    assert_eq!(loaded.unwrap().manager.workers, 7);
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    let result = Config::load(Some("/nonexistent/schemahero-config.yaml"));
    assert!(matches!(result, Err(ConfigError::Load(_))));
}
