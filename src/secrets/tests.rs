use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use serde_json::json;

use super::*;
use crate::api::{
    CassandraConnection, SecretKeyRef, ValueFrom, VaultSource,
};
use crate::store::MemoryStore;
use crate::test_utils::{meta, postgres_database};

struct FixedVault(String);

#[async_trait]
impl VaultReader for FixedVault {
    async fn read(&self, _source: &VaultSource) -> Result<String> {
        Ok(self.0.clone())
    }
}

fn secret_ref(name: &str, key: &str) -> ValueOrValueFrom {
    ValueOrValueFrom {
        value: None,
        value_from: Some(ValueFrom {
            secret_key_ref: Some(SecretKeyRef {
                name: name.to_string(),
                key: key.to_string(),
            }),
            vault: None,
        }),
    }
}

fn vault_ref() -> ValueOrValueFrom {
    ValueOrValueFrom {
        value: None,
        value_from: Some(ValueFrom {
            secret_key_ref: None,
            vault: Some(VaultSource {
                secret: "database/creds/app".to_string(),
                role: "app".to_string(),
                agent_inject: true,
                ..Default::default()
            }),
        }),
    }
}

async fn store_with_secret() -> Arc<MemoryStore<Secret>> {
    let store = Arc::new(MemoryStore::<Secret>::new());
    let mut data = BTreeMap::new();
    data.insert(
        "uri".to_string(),
        ByteString(b"postgres://u:p@h/db".to_vec()),
    );
    store
        .create(&Secret {
            metadata: meta("ns", "db-creds"),
            data: Some(data),
            ..Default::default()
        })
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn test_resolve_literal_uri() {
    let resolver = SecretResolver::new(Arc::new(MemoryStore::<Secret>::new()));
    let db = postgres_database("ns", "db", "postgres://u:p@h/db");
    let resolved = resolver.resolve(&db).await.unwrap();
    assert_eq!(resolved.uri, "postgres://u:p@h/db");
    assert!(resolved.options.is_none());
}

#[tokio::test]
async fn test_resolve_secret_key_ref() {
    let resolver = SecretResolver::new(store_with_secret().await);
    let value = resolver
        .value("ns", &secret_ref("db-creds", "uri"), "uri")
        .await
        .unwrap();
    assert_eq!(value, "postgres://u:p@h/db");
}

#[tokio::test]
async fn test_missing_secret_and_key() {
    let resolver = SecretResolver::new(store_with_secret().await);
    let err = resolver
        .value("ns", &secret_ref("absent", "uri"), "uri")
        .await
        .unwrap_err();
    assert!(matches!(err, SecretError::SecretNotFound { .. }));

    let err = resolver
        .value("ns", &secret_ref("db-creds", "password"), "uri")
        .await
        .unwrap_err();
    assert!(matches!(err, SecretError::KeyNotFound { .. }));
}

#[tokio::test]
async fn test_vault_without_reader_is_unavailable() {
    let resolver = SecretResolver::new(Arc::new(MemoryStore::<Secret>::new()));
    let err = resolver.value("ns", &vault_ref(), "uri").await.unwrap_err();
    assert!(matches!(err, SecretError::VaultUnavailable));
}

#[tokio::test]
async fn test_vault_reader_is_used() {
    let resolver = SecretResolver::new(Arc::new(MemoryStore::<Secret>::new()))
        .with_vault(Arc::new(FixedVault("postgres://vault@h/db".to_string())));
    let value = resolver.value("ns", &vault_ref(), "uri").await.unwrap();
    assert_eq!(value, "postgres://vault@h/db");
}

#[tokio::test]
async fn test_empty_value_is_missing() {
    let resolver = SecretResolver::new(Arc::new(MemoryStore::<Secret>::new()));
    let err = resolver
        .value("ns", &ValueOrValueFrom::default(), "uri")
        .await
        .unwrap_err();
    assert!(matches!(err, SecretError::Missing(_)));
}

#[tokio::test]
async fn test_resolve_cassandra_options() {
    let resolver = SecretResolver::new(Arc::new(MemoryStore::<Secret>::new()));
    let mut db = postgres_database("ns", "cass", "");
    db.spec.connection = DatabaseConnection::Cassandra(CassandraConnection {
        hosts: vec!["c1".to_string(), "c2".to_string()],
        keyspace: "app".to_string(),
        username: Some(ValueOrValueFrom::literal("cassandra")),
        password: None,
    });

    let resolved = resolver.resolve(&db).await.unwrap();
    assert_eq!(resolved.uri, "");
    let options = resolved.options.unwrap();
    assert_eq!(options[option_keys::HOSTS], "c1,c2");
    assert_eq!(options[option_keys::KEYSPACE], "app");
    assert_eq!(options[option_keys::USERNAME], "cassandra");
    assert!(!options.contains_key(option_keys::PASSWORD));
}

#[test]
fn test_extract_uri_kv_versions() {
    let v2 = json!({"data": {"uri": "postgres://v2"}, "metadata": {}});
    assert_eq!(extract_uri(&v2).as_deref(), Some("postgres://v2"));

    let v1 = json!({"uri": "postgres://v1"});
    assert_eq!(extract_uri(&v1).as_deref(), Some("postgres://v1"));

    assert_eq!(extract_uri(&json!({"user": "x"})), None);
}

#[test]
fn test_render_template() {
    let data = json!({"username": "app", "password": "s3cret"});
    let template = r#"{{- with secret "database/creds/app" -}}postgres://{{ .Data.username }}:{{ .Data.password }}@db:5432/app{{- end }}"#;
    assert_eq!(
        render_template(template, &data),
        "postgres://app:s3cret@db:5432/app"
    );
}

#[test]
fn test_render_template_kv2() {
    let data = json!({"data": {"username": "app"}});
    assert_eq!(
        render_template("user={{ .Data.data.username }}", &data),
        "user=app"
    );
    assert_eq!(render_template("plain", &data), "plain");
}
