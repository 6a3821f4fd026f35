use std::time::Duration;

use backon::ExponentialBuilder;
use tempfile::TempDir;

use super::*;
use crate::test_utils::{stub_manager, StubPlugin};

fn args(driver: &str, ddl: PathBuf) -> ApplyArgs {
    ApplyArgs {
        driver: driver.to_string(),
        ddl,
        uri: None,
        vault_uri_ref: None,
        hosts: Vec::new(),
        keyspace: None,
        username: None,
        password: None,
    }
}

fn fast_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(50))
        .with_max_times(40)
}

fn write_ddl(dir: &TempDir, ddl: &str) -> PathBuf {
    let path = dir.path().join("ddl.sql");
    std::fs::write(&path, ddl).unwrap();
    path
}

#[test]
fn test_split_statements() {
    let ddl = "CREATE TABLE a (id int);\nALTER TABLE a ADD COLUMN b text\n;\n  ;\nDROP TABLE c;";
    assert_eq!(
        split_statements(ddl),
        vec![
            "CREATE TABLE a (id int)",
            "ALTER TABLE a ADD COLUMN b text",
            "DROP TABLE c",
        ]
    );
    assert!(split_statements("  \n").is_empty());
}

#[tokio::test]
async fn test_run_deploys_in_order() {
    let plugin = StubPlugin::postgres();
    let state = plugin.state();
    let manager = stub_manager(plugin).await.unwrap();
    let dir = TempDir::new().unwrap();
    let mut apply = args(
        "postgres",
        write_ddl(&dir, "CREATE TABLE users (id int);\nCREATE INDEX idx ON users (id)"),
    );
    apply.uri = Some("postgres://u:p@h/db".to_string());

    let applied = run(&apply, &manager).await.unwrap();
    assert_eq!(applied, 2);
    assert_eq!(
        state.deployed().await,
        vec![
            "CREATE TABLE users (id int)".to_string(),
            "CREATE INDEX idx ON users (id)".to_string(),
        ]
    );
    manager.cleanup().await;
}

#[tokio::test]
async fn test_run_empty_payload_does_not_connect() {
    let plugin = StubPlugin::postgres();
    let state = plugin.state();
    let manager = stub_manager(plugin).await.unwrap();
    let dir = TempDir::new().unwrap();
    let mut apply = args("postgres", write_ddl(&dir, "\n"));
    apply.uri = Some("postgres://u:p@h/db".to_string());

    assert_eq!(run(&apply, &manager).await.unwrap(), 0);
    assert_eq!(state.connect_count(), 0);
}

#[tokio::test]
async fn test_run_deploy_failure_is_reported() {
    let plugin = StubPlugin::postgres();
    let state = plugin.state();
    state.set_fail_on_deploy(true).await;
    let manager = stub_manager(plugin).await.unwrap();
    let dir = TempDir::new().unwrap();
    let mut apply = args("postgres", write_ddl(&dir, "CREATE TABLE t (id int)"));
    apply.uri = Some("postgres://u:p@h/db".to_string());

    let err = run(&apply, &manager).await.unwrap_err();
    assert!(matches!(err, ApplyError::Plugin(PluginError::Remote(_))));
    manager.cleanup().await;
}

#[tokio::test]
async fn test_run_missing_ddl_file() {
    let manager = stub_manager(StubPlugin::postgres()).await.unwrap();
    let mut apply = args("postgres", PathBuf::from("/nonexistent/ddl.sql"));
    apply.uri = Some("postgres://u:p@h/db".to_string());

    let err = run(&apply, &manager).await.unwrap_err();
    assert!(matches!(err, ApplyError::Read { .. }));
}

#[tokio::test]
async fn test_target_requires_connection() {
    let apply = args("mysql", PathBuf::from("ddl.sql"));
    let err = apply.target(fast_backoff()).await.unwrap_err();
    assert!(matches!(err, ApplyError::MissingConnection(Engine::Mysql)));
}

#[tokio::test]
async fn test_target_unknown_driver() {
    let apply = args("oracle", PathBuf::from("ddl.sql"));
    let err = apply.target(fast_backoff()).await.unwrap_err();
    assert!(matches!(err, ApplyError::Engine(_)));
}

#[tokio::test]
async fn test_target_cassandra_options() {
    let mut apply = args("cassandra", PathBuf::from("ddl.sql"));
    apply.hosts = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
    apply.keyspace = Some("app".to_string());
    apply.username = Some("cass".to_string());

    let target = apply.target(fast_backoff()).await.unwrap();
    assert_eq!(target.engine, Engine::Cassandra);
    assert!(target.uri.is_empty());
    let options = target.options.unwrap();
    assert_eq!(options[option_keys::HOSTS], "10.0.0.1,10.0.0.2");
    assert_eq!(options[option_keys::KEYSPACE], "app");
    assert_eq!(options[option_keys::USERNAME], "cass");
    assert!(!options.contains_key(option_keys::PASSWORD));
}

#[tokio::test]
async fn test_target_cassandra_needs_keyspace() {
    let mut apply = args("cassandra", PathBuf::from("ddl.sql"));
    apply.hosts = vec!["10.0.0.1".to_string()];
    let err = apply.target(fast_backoff()).await.unwrap_err();
    assert!(matches!(err, ApplyError::MissingCassandraTarget));
}

#[tokio::test]
async fn test_vault_file_is_awaited() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("schemaherouri");
    let mut apply = args("postgres", PathBuf::from("ddl.sql"));
    apply.vault_uri_ref = Some(path.clone());
    apply.uri = Some("postgres://ignored".to_string());

    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        tokio::fs::write(&path, "postgres://vault:secret@h/db\n")
            .await
            .unwrap();
    });

    let target = apply.target(fast_backoff()).await.unwrap();
    assert_eq!(target.uri, "postgres://vault:secret@h/db");
    writer.await.unwrap();
}

#[tokio::test]
async fn test_vault_file_timeout() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("never");
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(1))
        .with_max_times(2);

    let err = read_uri_file(&path, backoff).await.unwrap_err();
    assert!(matches!(err, ApplyError::VaultFileTimeout(p) if p == path));
}
