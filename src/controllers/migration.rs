//! Runs approved migrations.
//!
//! An approved, unexecuted `Migration` gets a ConfigMap holding its DDL and
//! an apply pod that mounts it. Both are owned by the `Migration`. When the
//! DDL changes under an existing pod the pod is deleted and recreated on a
//! later pass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::ObjectMeta;
use kube::Resource;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::lookup;
use super::{Context, Outcome, ReconcileError, Reconciler, Result, MISSING_DATABASE_REQUEUE};
use crate::api::{Database, DatabaseConnection, Migration, ValueOrValueFrom, VaultSource};
use crate::config::ApplyConfig;
use crate::store::{is_deleting, ObjectKey, ResourceStore};
use crate::utils::names::apply_object_name;

/// Key of the DDL in the payload ConfigMap.
pub const DDL_KEY: &str = "ddl.sql";
/// Where apply pods mount the payload.
pub const INPUT_DIR: &str = "/input";

pub const LABEL_NAME: &str = "schemahero-name";
pub const LABEL_NAMESPACE: &str = "schemahero-namespace";
pub const LABEL_ROLE: &str = "schemahero-role";
pub const ROLE_APPLY: &str = "apply";

/// Env vars apply pods read connection values from.
pub const URI_ENV: &str = "SCHEMAHERO_URI";
pub const USERNAME_ENV: &str = "SCHEMAHERO_USERNAME";
pub const PASSWORD_ENV: &str = "SCHEMAHERO_PASSWORD";

/// Wait for a deleted apply pod to go away before recreating it.
const POD_RECREATE_DELAY: Duration = Duration::from_secs(5);

const VAULT_SECRET_NAME: &str = "schemaherouri";

pub struct MigrationReconciler {
    ctx: Arc<Context>,
}

impl MigrationReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Create or update the payload. Returns true when an existing payload
    /// changed.
    async fn reconcile_payload(
        &self,
        migration: &Migration,
        name: &str,
        ddl: &str,
    ) -> Result<bool> {
        let store = &self.ctx.cluster.config_maps;
        let namespace = ObjectKey::of(migration).namespace;
        let mut data = BTreeMap::new();
        data.insert(DDL_KEY.to_string(), ddl.to_string());

        match store.get(&namespace, name).await? {
            Some(existing) if existing.data.as_ref() == Some(&data) => Ok(false),
            Some(mut existing) => {
                existing.data = Some(data);
                store.replace(&existing).await?;
                info!(namespace = %namespace, payload = %name, "Updated migration payload");
                Ok(true)
            }
            None => {
                let payload = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.clone()),
                        owner_references: migration.controller_owner_ref(&()).map(|r| vec![r]),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                match store.create(&payload).await {
                    Ok(_) => {}
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Reconciler for MigrationReconciler {
    type Object = Migration;

    const NAME: &'static str = "migration";

    fn store(&self) -> Arc<dyn ResourceStore<Migration>> {
        self.ctx.cluster.migrations.clone()
    }

    async fn apply(&self, migration: Migration) -> Result<Outcome> {
        let key = ObjectKey::of(&migration);
        if !migration.status.as_ref().is_some_and(|s| s.is_actionable()) {
            return Ok(Outcome::Done);
        }
        if !self.ctx.settings.manages(&migration.spec.database_name) {
            debug!(
                migration = %key,
                database = %migration.spec.database_name,
                "Database not managed here"
            );
            return Ok(Outcome::Done);
        }

        let database = lookup::migration_database(&self.ctx.cluster, &migration).await?;
        let Some(database) = database else {
            info!(
                migration = %key,
                database = %migration.spec.database_name,
                "Database not found, requeueing"
            );
            return Ok(Outcome::RequeueAfter(MISSING_DATABASE_REQUEUE));
        };

        let name = apply_object_name(
            &migration.spec.database_name,
            &migration.spec.table_name,
            &key.name,
        );
        let changed = self
            .reconcile_payload(&migration, &name, migration.spec.effective_ddl())
            .await?;

        let pods = &self.ctx.cluster.pods;
        match pods.get(&key.namespace, &name).await? {
            Some(pod) if is_deleting(&pod) => Ok(Outcome::RequeueAfter(POD_RECREATE_DELAY)),
            Some(_) if changed => {
                info!(migration = %key, pod = %name, "Payload changed, replacing apply pod");
                pods.delete(&key.namespace, &name).await?;
                Ok(Outcome::RequeueAfter(POD_RECREATE_DELAY))
            }
            Some(_) => Ok(Outcome::Done),
            None => {
                let pod = apply_pod(&migration, &database, &name, &self.ctx.settings.apply)?;
                match pods.create(&pod).await {
                    Ok(_) => info!(migration = %key, pod = %name, "Scheduled apply pod"),
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(Outcome::Done)
            }
        }
    }
}

/// How the apply pod receives its connection.
#[derive(Debug, Default)]
struct ConnectionArgs {
    args: Vec<String>,
    env: Vec<Value>,
    annotations: BTreeMap<String, String>,
}

fn env_value(var: &str, value: &ValueOrValueFrom, what: &str) -> Result<Value> {
    if let Some(literal) = value.value.as_deref().filter(|v| !v.is_empty()) {
        return Ok(json!({ "name": var, "value": literal }));
    }
    if let Some(key_ref) = value.secret_key_ref() {
        return Ok(json!({
            "name": var,
            "valueFrom": { "secretKeyRef": { "name": key_ref.name, "key": key_ref.key } }
        }));
    }
    Err(ReconcileError::Invalid(format!(
        "{} must be a value or a secret key reference",
        what
    )))
}

fn vault_annotations(vault: &VaultSource) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    if !vault.agent_inject {
        return annotations;
    }
    let prefix = "vault.hashicorp.com";
    annotations.insert(format!("{}/agent-inject", prefix), "true".to_string());
    annotations.insert(format!("{}/agent-pre-populate-only", prefix), "true".to_string());
    annotations.insert(format!("{}/role", prefix), vault.role.clone());
    annotations.insert(
        format!("{}/agent-inject-secret-{}", prefix, VAULT_SECRET_NAME),
        vault.secret.clone(),
    );
    if let Some(template) = &vault.connection_template {
        annotations.insert(
            format!("{}/agent-inject-template-{}", prefix, VAULT_SECRET_NAME),
            template.clone(),
        );
    }
    if let Some(auth) = &vault.kubernetes_auth_endpoint {
        annotations.insert(format!("{}/auth-path", prefix), auth.clone());
    }
    if let Some(endpoint) = &vault.endpoint {
        annotations.insert(format!("{}/service", prefix), endpoint.clone());
    }
    annotations
}

fn missing_uri() -> ReconcileError {
    ReconcileError::Invalid("database has no connection uri".to_string())
}

fn connection_args(database: &Database, apply: &ApplyConfig) -> Result<ConnectionArgs> {
    let mut out = ConnectionArgs::default();
    match &database.spec.connection {
        DatabaseConnection::Cassandra(c) => {
            for host in &c.hosts {
                out.args.extend(["--host".to_string(), host.clone()]);
            }
            out.args.extend(["--keyspace".to_string(), c.keyspace.clone()]);
            if let Some(username) = &c.username {
                out.env.push(env_value(USERNAME_ENV, username, "cassandra username")?);
            }
            if let Some(password) = &c.password {
                out.env.push(env_value(PASSWORD_ENV, password, "cassandra password")?);
            }
        }
        other => {
            let uri = other.uri().ok_or_else(missing_uri)?;
            if let Some(vault) = uri.vault() {
                out.annotations = vault_annotations(vault);
                out.args.extend([
                    "--vault-uri-ref".to_string(),
                    apply.vault_secret_path.clone(),
                ]);
            } else if uri.secret_key_ref().is_some() {
                out.env.push(env_value(URI_ENV, uri, "connection uri")?);
            } else {
                let literal = uri
                    .value
                    .clone()
                    .filter(|v| !v.is_empty())
                    .ok_or_else(missing_uri)?;
                out.args.extend(["--uri".to_string(), literal]);
            }
        }
    }
    Ok(out)
}

/// The apply pod for `migration`, reading its DDL from the payload `name`.
pub fn apply_pod(
    migration: &Migration,
    database: &Database,
    name: &str,
    apply: &ApplyConfig,
) -> Result<Pod> {
    let key = ObjectKey::of(migration);
    let connection = connection_args(database, apply)?;

    let mut args = vec![
        "apply".to_string(),
        "--driver".to_string(),
        database.engine().as_str().to_string(),
        "--ddl".to_string(),
        format!("{}/{}", INPUT_DIR, DDL_KEY),
    ];
    args.extend(connection.args);

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_NAME.to_string(), migration.spec.table_name.clone());
    labels.insert(LABEL_NAMESPACE.to_string(), key.namespace.clone());
    labels.insert(LABEL_ROLE.to_string(), ROLE_APPLY.to_string());

    let image = database.image_override().unwrap_or(&apply.image);
    let mut spec = json!({
        "restartPolicy": "Never",
        "containers": [{
            "name": "schemahero",
            "image": image,
            "imagePullPolicy": "IfNotPresent",
            "args": args,
            "env": connection.env,
            "volumeMounts": [{ "name": "input", "mountPath": INPUT_DIR, "readOnly": true }],
        }],
        "volumes": [{ "name": "input", "configMap": { "name": name } }],
    });
    let node_selector = database.node_selector();
    if !node_selector.is_empty() {
        spec["nodeSelector"] = json!(node_selector);
    }
    if let Some(account) = &apply.service_account {
        spec["serviceAccountName"] = json!(account);
    }

    let mut pod: Pod = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "spec": spec,
    }))?;
    pod.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(key.namespace),
        labels: Some(labels),
        annotations: (!connection.annotations.is_empty()).then_some(connection.annotations),
        owner_references: migration.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    };
    Ok(pod)
}
