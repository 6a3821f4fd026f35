use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, PodStatus};
use kube::Resource;

use super::compile::compile;
use super::extension::{drop_extension_statements, ExtensionReconciler};
use super::finalizer::{self, FinalizerState};
use super::function::FunctionReconciler;
use super::runtime::owner_key;
use super::*;
use crate::api::schema::{
    FunctionSchema, PostgresViewSchema, PostgresqlFunctionSchema, ViewSchema,
};
use crate::api::{
    ApplyPhase, DataMigration, DataMigrationSpec, DataOperation, DataOperationKind,
    DatabaseConnection, DatabaseExtension, DatabaseExtensionSpec, EngineFamily, Function,
    FunctionSpec, MigrationPhase, PostgresConnection, PostgresDatabaseExtension, ResourcePhase,
    SecretKeyRef, SourceKind, SqliteConnection, Table, ValueFrom, ValueOrValueFrom, VaultSource,
    View, ViewSpec, FINALIZER,
};
use crate::store::{has_finalizer, MemoryCluster, ObjectKey, ResourceStore};
use crate::test_utils::{
    meta, mysql_database, postgres_database, stub_manager, users_table, StubPlugin, StubState,
};
use crate::utils::names::{data_migration_name, migration_id};

const URI: &str = "postgres://u:p@h/db";
const USERS_DDL: &str = "CREATE TABLE users (id int NOT NULL, email text NOT NULL, PRIMARY KEY (id))";

struct Harness {
    mem: MemoryCluster,
    state: Arc<StubState>,
    ctx: Arc<Context>,
}

async fn harness_with(settings: Settings) -> Harness {
    let plugin = StubPlugin::postgres();
    let state = plugin.state();
    let manager = stub_manager(plugin).await.unwrap();
    let mem = MemoryCluster::new();
    let ctx = Arc::new(Context::new(mem.cluster(), manager).with_settings(settings));
    Harness { mem, state, ctx }
}

async fn harness() -> Harness {
    harness_with(Settings::default()).await
}

fn key(name: &str) -> ObjectKey {
    ObjectKey::new("ns", name)
}

async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

impl Harness {
    fn tables(&self) -> SchemaReconciler<Table> {
        SchemaReconciler::new(self.ctx.clone())
    }

    fn migrations(&self) -> MigrationReconciler {
        MigrationReconciler::new(self.ctx.clone())
    }

    async fn add_database(&self, database: crate::api::Database) {
        self.mem.databases.create(&database).await.unwrap();
    }

    /// Plan the users table and return its migration name.
    async fn plan_users(&self) -> String {
        let table = self.mem.tables.create(&users_table("ns", "db")).await.unwrap();
        let outcome = reconcile(&self.tables(), &key("users")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        migration_id(&table.spec_sha())
    }
}

fn view(name: &str, database: &str, query: &str) -> View {
    View {
        metadata: meta("ns", name),
        spec: ViewSpec {
            database: database.to_string(),
            name: name.to_string(),
            schema: ViewSchema::Postgres(PostgresViewSchema {
                query: query.to_string(),
                is_deleted: false,
            }),
        },
        status: None,
    }
}

fn function(name: &str, database: &str, remove_on_deletion: bool) -> Function {
    Function {
        metadata: meta("ns", name),
        spec: FunctionSpec {
            database: database.to_string(),
            name: name.to_string(),
            schema: FunctionSchema {
                postgres: Some(PostgresqlFunctionSchema {
                    schema: None,
                    lang: "plpgsql".to_string(),
                    params: Vec::new(),
                    return_type: "integer".to_string(),
                    body: "BEGIN RETURN 1; END;".to_string(),
                    is_deleted: false,
                }),
            },
            remove_on_deletion,
        },
        status: None,
    }
}

fn extension(name: &str, database: &str, remove_on_deletion: bool) -> DatabaseExtension {
    DatabaseExtension {
        metadata: meta("ns", name),
        spec: DatabaseExtensionSpec {
            database_name: database.to_string(),
            postgres: Some(PostgresDatabaseExtension {
                name: "uuid-ossp".to_string(),
                version: None,
                schema: None,
            }),
            remove_on_deletion,
        },
        status: None,
    }
}

fn data_migration(name: &str, database: &str) -> DataMigration {
    let mut update = DataOperation::new(DataOperationKind::Update, "users", "status");
    update.value = Some("'active'".to_string());
    update.where_clause = Some("status IS NULL".to_string());
    let mut convert = DataOperation::new(DataOperationKind::Convert, "events", "created_at");
    convert.from = Some("timestamp".to_string());
    convert.to = Some("timestamptz".to_string());
    DataMigration {
        metadata: meta("ns", name),
        spec: DataMigrationSpec {
            database: database.to_string(),
            operations: vec![update, convert],
        },
        status: None,
    }
}

fn uri_from(value_from: ValueFrom) -> DatabaseConnection {
    DatabaseConnection::Postgres(PostgresConnection {
        uri: ValueOrValueFrom {
            value: None,
            value_from: Some(value_from),
        },
    })
}

async fn set_pod_phase(mem: &MemoryCluster, name: &str, phase: &str) {
    let mut pod: Pod = mem.pods.get("ns", name).await.unwrap().unwrap();
    pod.status = Some(PodStatus {
        phase: Some(phase.to_string()),
        ..Default::default()
    });
    mem.pods.replace_status(&pod).await.unwrap();
}

// ============================================================================
// Table / View planning
// ============================================================================

#[tokio::test]
async fn test_simple_plan_creates_migration() {
    let h = harness().await;
    h.add_database(postgres_database("ns", "db", URI)).await;
    let name = h.plan_users().await;

    let migration = h.mem.migrations.get("ns", &name).await.unwrap().unwrap();
    assert_eq!(name.len(), 7);
    assert_eq!(migration.spec.generated_ddl, USERS_DDL);
    assert_eq!(migration.spec.table_name, "users");
    assert_eq!(migration.spec.database_name, "db");
    assert_eq!(migration.spec.source_kind, SourceKind::Table);

    let status = migration.status.unwrap();
    assert_eq!(status.phase, Some(MigrationPhase::Planned));
    assert!(status.planned_at > 0);
    assert_eq!(status.approved_at, 0);

    let owner = &migration.metadata.owner_references.unwrap()[0];
    assert_eq!(owner.kind, "Table");
    assert_eq!(owner.name, "users");

    let table = h.mem.tables.get("ns", "users").await.unwrap().unwrap();
    let table_status = table.status.clone().unwrap();
    assert_eq!(table_status.last_planned_spec_sha, Some(table.spec_sha()));
    assert_eq!(table_status.phase, Some(ResourcePhase::Planned));
}

#[tokio::test]
async fn test_replanning_same_spec_is_a_no_op() {
    let h = harness().await;
    h.add_database(postgres_database("ns", "db", URI)).await;
    h.plan_users().await;
    let before = h.mem.tables.get("ns", "users").await.unwrap().unwrap();

    for _ in 0..3 {
        let outcome = reconcile(&h.tables(), &key("users")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
    }

    let after = h.mem.tables.get("ns", "users").await.unwrap().unwrap();
    assert_eq!(h.mem.migrations.len().await, 1);
    assert_eq!(h.state.planned_tables().await.len(), 1);
    assert_eq!(
        before.metadata.resource_version,
        after.metadata.resource_version
    );
}

#[tokio::test]
async fn test_immediate_deploy_approves_and_schedules_pod() {
    let h = harness().await;
    let mut db = postgres_database("ns", "db", URI);
    db.spec.immediate_deploy = true;
    h.add_database(db).await;
    let name = h.plan_users().await;

    let migration = h.mem.migrations.get("ns", &name).await.unwrap().unwrap();
    let status = migration.status.unwrap();
    assert_eq!(status.phase, Some(MigrationPhase::Approved));
    assert!(status.planned_at > 0);
    assert_eq!(status.approved_at, status.planned_at);

    let outcome = reconcile(&h.migrations(), &key(&name)).await.unwrap();
    assert_eq!(outcome, Outcome::Done);

    let object_name = format!("db-users-{}", name);
    let payload = h.mem.config_maps.get("ns", &object_name).await.unwrap().unwrap();
    assert_eq!(payload.data.unwrap()["ddl.sql"], USERS_DDL);

    let pod = h.mem.pods.get("ns", &object_name).await.unwrap().unwrap();
    let spec = pod.spec.clone().unwrap();
    assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
    let container = &spec.containers[0];
    assert_eq!(container.image.as_deref(), Some("schemahero/schemahero:alpha"));
    assert_eq!(
        container.args.clone().unwrap(),
        vec!["apply", "--driver", "postgres", "--ddl", "/input/ddl.sql", "--uri", URI]
    );
    let labels = pod.metadata.labels.clone().unwrap();
    assert_eq!(labels["schemahero-role"], "apply");
    assert_eq!(labels["schemahero-name"], "users");
    assert_eq!(labels["schemahero-namespace"], "ns");
    assert_eq!(
        owner_key(&pod, "Migration"),
        Some(ObjectKey::new("ns", name.clone()))
    );
}

#[tokio::test]
async fn test_missing_database_requeues_without_status() {
    let h = harness().await;
    h.mem.tables.create(&users_table("ns", "db")).await.unwrap();

    let outcome = reconcile(&h.tables(), &key("users")).await.unwrap();
    assert_eq!(outcome, Outcome::RequeueAfter(Duration::from_secs(10)));
    assert!(h.mem.migrations.is_empty().await);
    let table = h.mem.tables.get("ns", "users").await.unwrap().unwrap();
    assert!(table.status.is_none());

    h.add_database(postgres_database("ns", "db", URI)).await;
    let outcome = reconcile(&h.tables(), &key("users")).await.unwrap();
    assert_eq!(outcome, Outcome::Done);
    assert_eq!(h.mem.migrations.len().await, 1);
}

#[tokio::test]
async fn test_engine_mismatch_is_permanent_and_recorded() {
    let h = harness().await;
    h.add_database(mysql_database("ns", "db", "mysql://u:p@h/db")).await;
    h.mem.tables.create(&users_table("ns", "db")).await.unwrap();

    let err = reconcile(&h.tables(), &key("users")).await.unwrap_err();
    assert!(err.is_permanent());
    assert!(matches!(err, ReconcileError::EngineMismatch { .. }));

    let table = h.mem.tables.get("ns", "users").await.unwrap().unwrap();
    let status = table.status.clone().unwrap();
    assert_eq!(status.phase, Some(ResourcePhase::Failed));
    assert!(status.message.unwrap().contains("mysql"));
    assert!(h.mem.migrations.is_empty().await);

    // The recorded fingerprint stops further passes.
    let outcome = reconcile(&h.tables(), &key("users")).await.unwrap();
    assert_eq!(outcome, Outcome::Done);
}

#[tokio::test]
async fn test_unmanaged_database_is_skipped() {
    let h = harness_with(Settings {
        managed_databases: vec!["other".to_string()],
        ..Default::default()
    })
    .await;
    h.add_database(postgres_database("ns", "db", URI)).await;
    h.mem.tables.create(&users_table("ns", "db")).await.unwrap();

    let outcome = reconcile(&h.tables(), &key("users")).await.unwrap();
    assert_eq!(outcome, Outcome::Done);
    assert!(h.mem.migrations.is_empty().await);
    assert_eq!(h.state.connect_count(), 0);
}

#[tokio::test]
async fn test_existing_live_table_plans_nothing() {
    let h = harness().await;
    h.add_database(postgres_database("ns", "db", URI)).await;
    h.state.add_existing_table("users").await;
    h.mem.tables.create(&users_table("ns", "db")).await.unwrap();

    let outcome = reconcile(&h.tables(), &key("users")).await.unwrap();
    assert_eq!(outcome, Outcome::Done);
    assert!(h.mem.migrations.is_empty().await);
}

#[tokio::test]
async fn test_plan_connection_failure_is_transient() {
    let h = harness().await;
    h.add_database(postgres_database("ns", "db", URI)).await;
    h.state.set_fail_on_connect(true).await;
    h.mem.tables.create(&users_table("ns", "db")).await.unwrap();

    let err = reconcile(&h.tables(), &key("users")).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Plugin(_)));
    assert!(!err.is_permanent());
    let table = h.mem.tables.get("ns", "users").await.unwrap().unwrap();
    assert!(table.status.is_none());
}

#[tokio::test]
async fn test_view_plan() {
    let h = harness().await;
    h.add_database(postgres_database("ns", "db", URI)).await;
    let created = h
        .mem
        .views
        .create(&view("active_users", "db", "SELECT * FROM users"))
        .await
        .unwrap();

    let reconciler: SchemaReconciler<View> = SchemaReconciler::new(h.ctx.clone());
    reconcile(&reconciler, &key("active_users")).await.unwrap();

    let name = migration_id(&created.spec_sha());
    let migration = h.mem.migrations.get("ns", &name).await.unwrap().unwrap();
    assert_eq!(
        migration.spec.generated_ddl,
        "CREATE OR REPLACE VIEW active_users AS SELECT * FROM users"
    );
    assert_eq!(migration.spec.source_kind, SourceKind::View);
}

// ============================================================================
// Migrations and apply pods
// ============================================================================

#[tokio::test]
async fn test_unapproved_migration_is_not_applied() {
    let h = harness().await;
    h.add_database(postgres_database("ns", "db", URI)).await;
    let name = h.plan_users().await;

    let outcome = reconcile(&h.migrations(), &key(&name)).await.unwrap();
    assert_eq!(outcome, Outcome::Done);
    assert!(h.mem.pods.is_empty().await);
    assert!(h.mem.config_maps.is_empty().await);
}

#[tokio::test]
async fn test_approved_migration_for_unmanaged_database_is_skipped() {
    let h = harness().await;
    let mut db = postgres_database("ns", "db", URI);
    db.spec.immediate_deploy = true;
    h.add_database(db).await;
    let name = h.plan_users().await;

    let ctx = Arc::new(
        Context::new(h.mem.cluster(), h.ctx.plugins.clone()).with_settings(Settings {
            managed_databases: vec!["other".to_string()],
            ..Default::default()
        }),
    );
    reconcile(&MigrationReconciler::new(ctx), &key(&name))
        .await
        .unwrap();
    assert!(h.mem.pods.is_empty().await);
}

#[tokio::test]
async fn test_changed_payload_replaces_pod() {
    let h = harness().await;
    let mut db = postgres_database("ns", "db", URI);
    db.spec.immediate_deploy = true;
    h.add_database(db).await;
    let name = h.plan_users().await;
    reconcile(&h.migrations(), &key(&name)).await.unwrap();
    let object_name = format!("db-users-{}", name);

    let mut migration = h.mem.migrations.get("ns", &name).await.unwrap().unwrap();
    migration.spec.edited_ddl = Some("CREATE TABLE users (id bigint)".to_string());
    h.mem.migrations.replace(&migration).await.unwrap();

    let outcome = reconcile(&h.migrations(), &key(&name)).await.unwrap();
    assert!(matches!(outcome, Outcome::RequeueAfter(_)));
    let payload = h.mem.config_maps.get("ns", &object_name).await.unwrap().unwrap();
    assert_eq!(payload.data.unwrap()["ddl.sql"], "CREATE TABLE users (id bigint)");
    assert!(h.mem.pods.get("ns", &object_name).await.unwrap().is_none());

    reconcile(&h.migrations(), &key(&name)).await.unwrap();
    assert!(h.mem.pods.get("ns", &object_name).await.unwrap().is_some());
}

#[tokio::test]
async fn test_secret_uri_goes_through_env() {
    let h = harness().await;
    let mut db = postgres_database("ns", "db", URI);
    db.spec.connection = uri_from(ValueFrom {
        secret_key_ref: Some(SecretKeyRef {
            name: "db-creds".to_string(),
            key: "uri".to_string(),
        }),
        vault: None,
    });
    let name = "abc1234";
    let migration = crate::api::Migration {
        metadata: meta("ns", name),
        spec: crate::api::MigrationSpec {
            table_name: "users".to_string(),
            table_namespace: "ns".to_string(),
            database_name: "db".to_string(),
            generated_ddl: USERS_DDL.to_string(),
            edited_ddl: None,
            source_kind: SourceKind::Table,
        },
        status: None,
    };

    let pod = migration::apply_pod(&migration, &db, "db-users-abc1234", &h.ctx.settings.apply)
        .unwrap();
    let container = &pod.spec.unwrap().containers[0];
    let args = container.args.clone().unwrap();
    assert!(!args.contains(&"--uri".to_string()));
    let env = container.env.clone().unwrap();
    assert_eq!(env[0].name, "SCHEMAHERO_URI");
    let selector = env[0]
        .value_from
        .as_ref()
        .unwrap()
        .secret_key_ref
        .as_ref()
        .unwrap();
    assert_eq!(selector.key, "uri");
}

#[tokio::test]
async fn test_vault_uri_uses_agent_annotations() {
    let h = harness().await;
    let mut db = postgres_database("ns", "db", URI);
    db.spec.connection = uri_from(ValueFrom {
        secret_key_ref: None,
        vault: Some(VaultSource {
            secret: "database/creds/app".to_string(),
            role: "app".to_string(),
            agent_inject: true,
            ..Default::default()
        }),
    });
    let migration = crate::api::Migration {
        metadata: meta("ns", "abc1234"),
        spec: crate::api::MigrationSpec {
            table_name: "users".to_string(),
            table_namespace: "ns".to_string(),
            database_name: "db".to_string(),
            generated_ddl: USERS_DDL.to_string(),
            edited_ddl: None,
            source_kind: SourceKind::Table,
        },
        status: None,
    };

    let pod = migration::apply_pod(&migration, &db, "db-users-abc1234", &h.ctx.settings.apply)
        .unwrap();
    let annotations = pod.metadata.annotations.clone().unwrap();
    assert_eq!(annotations["vault.hashicorp.com/agent-inject"], "true");
    assert_eq!(annotations["vault.hashicorp.com/role"], "app");
    assert_eq!(
        annotations["vault.hashicorp.com/agent-inject-secret-schemaherouri"],
        "database/creds/app"
    );
    let args = pod.spec.unwrap().containers[0].args.clone().unwrap();
    let pos = args.iter().position(|a| a == "--vault-uri-ref").unwrap();
    assert_eq!(args[pos + 1], "/vault/secrets/schemaherouri");
    assert!(!args.contains(&"--uri".to_string()));
}

#[tokio::test]
async fn test_database_image_override() {
    let h = harness().await;
    let mut db = postgres_database("ns", "db", URI);
    db.spec.schemahero = Some(crate::api::SchemaHeroOptions {
        image: Some("registry.local/schemahero:1.2".to_string()),
        ..Default::default()
    });
    let migration = crate::api::Migration {
        metadata: meta("ns", "abc1234"),
        spec: crate::api::MigrationSpec {
            table_name: "users".to_string(),
            table_namespace: "ns".to_string(),
            database_name: "db".to_string(),
            generated_ddl: USERS_DDL.to_string(),
            edited_ddl: None,
            source_kind: SourceKind::Table,
        },
        status: None,
    };
    let pod = migration::apply_pod(&migration, &db, "x", &h.ctx.settings.apply).unwrap();
    assert_eq!(
        pod.spec.unwrap().containers[0].image.as_deref(),
        Some("registry.local/schemahero:1.2")
    );
}

#[tokio::test]
async fn test_succeeded_pod_executes_migration_and_is_deleted() {
    let h = harness().await;
    let mut db = postgres_database("ns", "db", URI);
    db.spec.immediate_deploy = true;
    h.add_database(db).await;
    let name = h.plan_users().await;
    reconcile(&h.migrations(), &key(&name)).await.unwrap();
    let pod_name = format!("db-users-{}", name);

    set_pod_phase(&h.mem, &pod_name, "Succeeded").await;
    let collector = ApplyPodReconciler::new(h.ctx.clone());
    reconcile(&collector, &key(&pod_name)).await.unwrap();

    let migration = h.mem.migrations.get("ns", &name).await.unwrap().unwrap();
    let status = migration.status.unwrap();
    assert_eq!(status.phase, Some(MigrationPhase::Executed));
    assert!(status.executed_at > 0);
    assert!(!status.is_actionable());

    let table = h.mem.tables.get("ns", "users").await.unwrap().unwrap();
    let table_status = table.status.unwrap();
    assert_eq!(table_status.phase, Some(ResourcePhase::Applied));
    assert_eq!(table_status.applied_at, status.executed_at);

    assert!(h.mem.pods.get("ns", &pod_name).await.unwrap().is_none());

    // Executed migrations are left alone.
    reconcile(&h.migrations(), &key(&name)).await.unwrap();
    assert!(h.mem.pods.is_empty().await);
}

#[tokio::test]
async fn test_applied_mirror_is_retried_after_migration_executed() {
    let h = harness().await;
    let mut db = postgres_database("ns", "db", URI);
    db.spec.immediate_deploy = true;
    h.add_database(db).await;
    let name = h.plan_users().await;
    reconcile(&h.migrations(), &key(&name)).await.unwrap();
    let pod_name = format!("db-users-{}", name);
    set_pod_phase(&h.mem, &pod_name, "Succeeded").await;
    let collector = ApplyPodReconciler::new(h.ctx.clone());

    h.mem.tables.set_fail_on_write(true).await;
    assert!(reconcile(&collector, &key(&pod_name)).await.is_err());

    let migration = h.mem.migrations.get("ns", &name).await.unwrap().unwrap();
    assert_eq!(migration.status.unwrap().phase, Some(MigrationPhase::Executed));
    assert!(h.mem.pods.get("ns", &pod_name).await.unwrap().is_some());

    h.mem.tables.set_fail_on_write(false).await;
    reconcile(&collector, &key(&pod_name)).await.unwrap();

    let table = h.mem.tables.get("ns", "users").await.unwrap().unwrap();
    assert_eq!(table.status.unwrap().phase, Some(ResourcePhase::Applied));
    assert!(h.mem.pods.get("ns", &pod_name).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_pod_fails_migration_and_stays() {
    let h = harness().await;
    let mut db = postgres_database("ns", "db", URI);
    db.spec.immediate_deploy = true;
    h.add_database(db).await;
    let name = h.plan_users().await;
    reconcile(&h.migrations(), &key(&name)).await.unwrap();
    let pod_name = format!("db-users-{}", name);

    set_pod_phase(&h.mem, &pod_name, "Failed").await;
    reconcile(&ApplyPodReconciler::new(h.ctx.clone()), &key(&pod_name))
        .await
        .unwrap();

    let migration = h.mem.migrations.get("ns", &name).await.unwrap().unwrap();
    let status = migration.status.unwrap();
    assert_eq!(status.phase, Some(MigrationPhase::Failed));
    assert!(status.message.is_some());
    assert!(h.mem.pods.get("ns", &pod_name).await.unwrap().is_some());
}

#[tokio::test]
async fn test_running_pod_is_ignored() {
    let h = harness().await;
    let mut db = postgres_database("ns", "db", URI);
    db.spec.immediate_deploy = true;
    h.add_database(db).await;
    let name = h.plan_users().await;
    reconcile(&h.migrations(), &key(&name)).await.unwrap();
    let pod_name = format!("db-users-{}", name);

    set_pod_phase(&h.mem, &pod_name, "Running").await;
    reconcile(&ApplyPodReconciler::new(h.ctx.clone()), &key(&pod_name))
        .await
        .unwrap();

    let migration = h.mem.migrations.get("ns", &name).await.unwrap().unwrap();
    assert_eq!(
        migration.status.unwrap().phase,
        Some(MigrationPhase::Approved)
    );
    assert!(h.mem.pods.get("ns", &pod_name).await.unwrap().is_some());
}

// ============================================================================
// Data migrations
// ============================================================================

#[tokio::test]
async fn test_data_migration_postgres() {
    let h = harness().await;
    h.add_database(postgres_database("ns", "db", URI)).await;
    h.mem
        .data_migrations
        .create(&data_migration("backfill", "db"))
        .await
        .unwrap();

    let reconciler = DataMigrationReconciler::new(h.ctx.clone());
    reconcile(&reconciler, &key("backfill")).await.unwrap();

    let name = data_migration_name("ns", "backfill");
    assert!(name.starts_with("datamig-"));
    assert_eq!(name.len(), 16);
    let migration = h.mem.migrations.get("ns", &name).await.unwrap().unwrap();
    assert_eq!(
        migration.spec.generated_ddl,
        "UPDATE users SET status = 'active' WHERE status IS NULL;\nALTER TABLE events ALTER COLUMN created_at TYPE timestamptz USING created_at AT TIME ZONE 'UTC'"
    );
    assert_eq!(migration.spec.source_kind, SourceKind::DataMigration);

    let stored = h.mem.data_migrations.get("ns", "backfill").await.unwrap().unwrap();
    assert_eq!(
        stored.status.clone().unwrap().migration_name.as_deref(),
        Some(name.as_str())
    );

    // At most once.
    reconcile(&reconciler, &key("backfill")).await.unwrap();
    let again = h.mem.data_migrations.get("ns", "backfill").await.unwrap().unwrap();
    assert_eq!(
        stored.metadata.resource_version,
        again.metadata.resource_version
    );
    assert_eq!(h.mem.migrations.len().await, 1);
}

#[tokio::test]
async fn test_data_migration_mysql_convert() {
    let h = harness().await;
    h.add_database(mysql_database("ns", "db", "mysql://u:p@h/db")).await;
    h.mem
        .data_migrations
        .create(&data_migration("backfill", "db"))
        .await
        .unwrap();

    reconcile(&DataMigrationReconciler::new(h.ctx.clone()), &key("backfill"))
        .await
        .unwrap();

    let name = data_migration_name("ns", "backfill");
    let migration = h.mem.migrations.get("ns", &name).await.unwrap().unwrap();
    assert_eq!(
        migration.spec.generated_ddl,
        "UPDATE users SET status = 'active' WHERE status IS NULL;\nALTER TABLE events MODIFY COLUMN created_at DATETIME"
    );
}

#[tokio::test]
async fn test_data_migration_unsupported_engine() {
    let h = harness().await;
    let mut db = postgres_database("ns", "db", URI);
    db.spec.connection = DatabaseConnection::Sqlite(SqliteConnection {
        dsn: ValueOrValueFrom::literal("/data/app.db"),
    });
    h.add_database(db).await;
    h.mem
        .data_migrations
        .create(&data_migration("backfill", "db"))
        .await
        .unwrap();

    let err = reconcile(&DataMigrationReconciler::new(h.ctx.clone()), &key("backfill"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::UnsupportedEngine(_)));
    assert!(err.is_permanent());
    let stored = h.mem.data_migrations.get("ns", "backfill").await.unwrap().unwrap();
    let status = stored.status.unwrap();
    assert_eq!(status.phase, Some(ResourcePhase::Failed));
    assert!(status.migration_name.is_none());
    assert!(h.mem.migrations.is_empty().await);
}

#[tokio::test]
async fn test_data_migration_missing_field() {
    let h = harness().await;
    h.add_database(postgres_database("ns", "db", URI)).await;
    let mut dm = data_migration("backfill", "db");
    dm.spec.operations[0].value = None;
    h.mem.data_migrations.create(&dm).await.unwrap();

    let err = reconcile(&DataMigrationReconciler::new(h.ctx.clone()), &key("backfill"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::InvalidOperation(CompileError::MissingField { field: "value", .. })
    ));
    assert!(h.mem.migrations.is_empty().await);
}

#[tokio::test]
async fn test_data_migration_missing_database_requeues() {
    let h = harness().await;
    h.mem
        .data_migrations
        .create(&data_migration("backfill", "db"))
        .await
        .unwrap();
    let outcome = reconcile(&DataMigrationReconciler::new(h.ctx.clone()), &key("backfill"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::RequeueAfter(MISSING_DATABASE_REQUEUE));
}

#[test]
fn test_compile_calculate_and_generic_convert() {
    let mut calculate = DataOperation::new(DataOperationKind::Calculate, "orders", "total");
    calculate.expression = Some("price * quantity".to_string());
    let mut convert = DataOperation::new(DataOperationKind::Convert, "orders", "note");
    convert.from = Some("varchar(10)".to_string());
    convert.to = Some("text".to_string());

    let statements = compile(&[calculate, convert], EngineFamily::Postgres).unwrap();
    assert_eq!(
        statements,
        vec![
            "UPDATE orders SET total = price * quantity",
            "ALTER TABLE orders ALTER COLUMN note TYPE text",
        ]
    );
}

#[test]
fn test_compile_missing_table() {
    let mut op = DataOperation::new(DataOperationKind::Update, "t", "c");
    op.table = None;
    op.value = Some("1".to_string());
    let err = compile(&[op], EngineFamily::Mysql).unwrap_err();
    assert_eq!(
        err,
        CompileError::MissingField {
            index: 0,
            kind: "update",
            field: "table"
        }
    );
}

// ============================================================================
// Functions and extensions
// ============================================================================

#[tokio::test]
async fn test_function_finalizer_then_apply_then_teardown() {
    let h = harness().await;
    h.add_database(postgres_database("ns", "db", URI)).await;
    h.mem.functions.create(&function("answer", "db", true)).await.unwrap();
    let reconciler = FunctionReconciler::new(h.ctx.clone());

    // First pass installs the finalizer only.
    reconcile(&reconciler, &key("answer")).await.unwrap();
    let stored = h.mem.functions.get("ns", "answer").await.unwrap().unwrap();
    assert!(has_finalizer(&stored, FINALIZER));
    assert!(h.state.deployed().await.is_empty());

    reconcile(&reconciler, &key("answer")).await.unwrap();
    let deployed = h.state.deployed().await;
    assert_eq!(deployed.len(), 1);
    assert!(deployed[0].starts_with("CREATE OR REPLACE FUNCTION answer()"));
    let stored = h.mem.functions.get("ns", "answer").await.unwrap().unwrap();
    let status = stored.status.unwrap();
    assert_eq!(status.phase, Some(ApplyPhase::Applied));
    assert!(status.applied_at > 0);

    // Unchanged spec is not re-applied.
    reconcile(&reconciler, &key("answer")).await.unwrap();
    assert_eq!(h.state.deployed().await.len(), 1);

    h.mem.functions.delete("ns", "answer").await.unwrap();
    reconcile(&reconciler, &key("answer")).await.unwrap();
    let deployed = h.state.deployed().await;
    assert_eq!(deployed.last().unwrap(), "DROP FUNCTION IF EXISTS answer");
    assert!(h.mem.functions.get("ns", "answer").await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_teardown_keeps_finalizer() {
    let h = harness().await;
    h.add_database(postgres_database("ns", "db", URI)).await;
    h.mem.functions.create(&function("answer", "db", true)).await.unwrap();
    let reconciler = FunctionReconciler::new(h.ctx.clone());
    reconcile(&reconciler, &key("answer")).await.unwrap();
    reconcile(&reconciler, &key("answer")).await.unwrap();

    h.state.set_fail_on_deploy(true).await;
    h.mem.functions.delete("ns", "answer").await.unwrap();
    let err = reconcile(&reconciler, &key("answer")).await.unwrap_err();
    assert!(!err.is_permanent());

    let stored = h.mem.functions.get("ns", "answer").await.unwrap().unwrap();
    assert!(has_finalizer(&stored, FINALIZER));
    assert!(stored.metadata.deletion_timestamp.is_some());

    h.state.set_fail_on_deploy(false).await;
    reconcile(&reconciler, &key("answer")).await.unwrap();
    assert!(h.mem.functions.get("ns", "answer").await.unwrap().is_none());
}

#[tokio::test]
async fn test_teardown_waits_for_missing_database() {
    let h = harness().await;
    h.add_database(postgres_database("ns", "db", URI)).await;
    h.mem.functions.create(&function("answer", "db", true)).await.unwrap();
    let reconciler = FunctionReconciler::new(h.ctx.clone());
    reconcile(&reconciler, &key("answer")).await.unwrap();
    reconcile(&reconciler, &key("answer")).await.unwrap();

    h.mem.databases.delete("ns", "db").await.unwrap();
    h.mem.functions.delete("ns", "answer").await.unwrap();
    let outcome = reconcile(&reconciler, &key("answer")).await.unwrap();

    assert_eq!(outcome, Outcome::RequeueAfter(MISSING_DATABASE_REQUEUE));
    let stored = h.mem.functions.get("ns", "answer").await.unwrap().unwrap();
    assert!(has_finalizer(&stored, FINALIZER));
    assert_eq!(h.state.deployed().await.len(), 1);

    h.add_database(postgres_database("ns", "db", URI)).await;
    reconcile(&reconciler, &key("answer")).await.unwrap();
    assert_eq!(
        h.state.deployed().await.last().unwrap(),
        "DROP FUNCTION IF EXISTS answer"
    );
    assert!(h.mem.functions.get("ns", "answer").await.unwrap().is_none());
}

#[tokio::test]
async fn test_function_without_remove_on_deletion_is_not_dropped() {
    let h = harness().await;
    h.add_database(postgres_database("ns", "db", URI)).await;
    h.mem.functions.create(&function("answer", "db", false)).await.unwrap();
    let reconciler = FunctionReconciler::new(h.ctx.clone());

    reconcile(&reconciler, &key("answer")).await.unwrap();
    let stored = h.mem.functions.get("ns", "answer").await.unwrap().unwrap();
    assert!(!has_finalizer(&stored, FINALIZER));
    assert_eq!(h.state.deployed().await.len(), 1);

    h.mem.functions.delete("ns", "answer").await.unwrap();
    assert!(h.mem.functions.get("ns", "answer").await.unwrap().is_none());
    reconcile(&reconciler, &key("answer")).await.unwrap();
    assert_eq!(h.state.deployed().await.len(), 1);
}

#[tokio::test]
async fn test_function_apply_failure_is_recorded() {
    let h = harness().await;
    h.add_database(postgres_database("ns", "db", URI)).await;
    h.mem.functions.create(&function("answer", "db", false)).await.unwrap();
    h.state.set_fail_on_deploy(true).await;

    let err = reconcile(&FunctionReconciler::new(h.ctx.clone()), &key("answer"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Plugin(_)));
    let stored = h.mem.functions.get("ns", "answer").await.unwrap().unwrap();
    let status = stored.status.unwrap();
    assert_eq!(status.phase, Some(ApplyPhase::Failed));
    assert!(status.message.unwrap().contains("deploy failed"));
}

#[tokio::test]
async fn test_non_postgres_function_and_extension_do_nothing() {
    let h = harness().await;
    h.add_database(mysql_database("ns", "db", "mysql://u:p@h/db")).await;
    h.mem.functions.create(&function("answer", "db", true)).await.unwrap();
    h.mem.extensions.create(&extension("uuid", "db", true)).await.unwrap();

    reconcile(&FunctionReconciler::new(h.ctx.clone()), &key("answer"))
        .await
        .unwrap();
    reconcile(&ExtensionReconciler::new(h.ctx.clone()), &key("uuid"))
        .await
        .unwrap();

    assert!(h.state.deployed().await.is_empty());
    assert_eq!(h.state.connect_count(), 0);
    let stored = h.mem.functions.get("ns", "answer").await.unwrap().unwrap();
    assert!(!has_finalizer(&stored, FINALIZER));
}

#[tokio::test]
async fn test_extension_create_and_drop() {
    let h = harness().await;
    h.add_database(postgres_database("ns", "db", URI)).await;
    h.mem.extensions.create(&extension("uuid", "db", true)).await.unwrap();
    let reconciler = ExtensionReconciler::new(h.ctx.clone());

    reconcile(&reconciler, &key("uuid")).await.unwrap();
    reconcile(&reconciler, &key("uuid")).await.unwrap();
    assert_eq!(
        h.state.deployed().await,
        vec!["CREATE EXTENSION IF NOT EXISTS \"uuid-ossp\"".to_string()]
    );

    h.mem.extensions.delete("ns", "uuid").await.unwrap();
    reconcile(&reconciler, &key("uuid")).await.unwrap();
    assert_eq!(
        h.state.deployed().await.last().unwrap(),
        "DROP EXTENSION IF EXISTS \"uuid-ossp\""
    );
    assert!(h.mem.extensions.get("ns", "uuid").await.unwrap().is_none());
}

#[test]
fn test_drop_extension_statements() {
    let ext = PostgresDatabaseExtension {
        name: "pgcrypto".to_string(),
        version: Some("1.3".to_string()),
        schema: None,
    };
    assert_eq!(
        drop_extension_statements(&ext),
        vec!["DROP EXTENSION IF EXISTS \"pgcrypto\"".to_string()]
    );
}

#[test]
fn test_finalizer_states() {
    let mut f = function("answer", "db", true);
    assert_eq!(finalizer::state(&f, true), FinalizerState::Unguarded);
    assert_eq!(finalizer::state(&f, false), FinalizerState::Active);

    f.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    assert_eq!(finalizer::state(&f, true), FinalizerState::Active);

    f.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
        chrono::Utc::now(),
    ));
    assert_eq!(
        finalizer::state(&f, true),
        FinalizerState::Finalizing { teardown: true }
    );
    assert_eq!(
        finalizer::state(&f, false),
        FinalizerState::Finalizing { teardown: false }
    );

    f.metadata.finalizers = None;
    assert_eq!(finalizer::state(&f, true), FinalizerState::Released);
}

// ============================================================================
// Runtime
// ============================================================================

#[test]
fn test_error_classification() {
    assert!(ReconcileError::UnsupportedEngine(crate::api::Engine::Sqlite).is_permanent());
    assert!(ReconcileError::Invalid("x".to_string()).is_permanent());
    assert!(!ReconcileError::Plugin(crate::plugin::PluginError::EmptyEngine).is_permanent());
}

#[tokio::test]
async fn test_work_queue_coalesces() {
    let queue = WorkQueue::new();
    queue.add(key("a")).await;
    queue.add(key("a")).await;
    queue.add(key("b")).await;
    assert_eq!(queue.len().await, 2);

    let first = queue.next().await.unwrap();
    assert_eq!(first, key("a"));
    // Added while in flight: held back until released.
    queue.add(key("a")).await;
    assert_eq!(queue.len().await, 1);

    let second = queue.next().await.unwrap();
    assert_eq!(second, key("b"));
    queue.done(&first).await;
    assert_eq!(queue.len().await, 1);
    assert_eq!(queue.next().await.unwrap(), key("a"));

    queue.done(&key("a")).await;
    queue.done(&second).await;
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn test_work_queue_next_waits_for_work() {
    let queue = WorkQueue::new();
    let mut next = tokio_test::task::spawn(queue.next());
    tokio_test::assert_pending!(next.poll());

    queue.add(key("a")).await;
    assert!(next.is_woken());
    assert_eq!(tokio_test::assert_ready!(next.poll()), Some(key("a")));
}

#[tokio::test]
async fn test_work_queue_shutdown_wakes_workers() {
    let queue = Arc::new(WorkQueue::new());
    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.next().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.shutdown().await;
    assert_eq!(waiter.await.unwrap(), None);
}

#[tokio::test]
async fn test_work_queue_add_after() {
    let queue = Arc::new(WorkQueue::new());
    queue.add_after(key("later"), Duration::from_millis(20));
    assert!(queue.is_empty().await);
    let next = tokio::time::timeout(Duration::from_secs(2), queue.next())
        .await
        .unwrap();
    assert_eq!(next, Some(key("later")));
}

#[tokio::test]
async fn test_owner_key_requires_controller_reference() {
    let h = harness().await;
    let table = h.mem.tables.create(&users_table("ns", "db")).await.unwrap();
    let mut pod = Pod {
        metadata: meta("ns", "p"),
        ..Default::default()
    };
    let mut reference = table.controller_owner_ref(&()).unwrap();
    pod.metadata.owner_references = Some(vec![reference.clone()]);
    assert_eq!(owner_key(&pod, "Table"), Some(key("users")));
    assert_eq!(owner_key(&pod, "Migration"), None);

    reference.controller = None;
    pod.metadata.owner_references = Some(vec![reference]);
    assert_eq!(owner_key(&pod, "Table"), None);
}

#[tokio::test]
async fn test_controller_plans_from_watch() {
    let h = harness().await;
    h.add_database(postgres_database("ns", "db", URI)).await;

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let controller = Controller::new(Arc::new(h.tables())).workers(2);
    let running = tokio::spawn(controller.run(async move {
        let _ = stopped.await;
    }));

    h.mem.tables.create(&users_table("ns", "db")).await.unwrap();
    let mem = h.mem.clone();
    assert!(
        wait_for(|| {
            let mem = mem.clone();
            async move { mem.migrations.len().await == 1 }
        })
        .await
    );
    let table = h.mem.tables.get("ns", "users").await.unwrap().unwrap();
    assert!(table.status.is_some());

    stop.send(()).unwrap();
    running.await.unwrap();
    assert_eq!(h.mem.migrations.len().await, 1);
}

#[tokio::test]
async fn test_controller_runs_migration_to_pod_via_owned_watch() {
    let h = harness().await;
    let mut db = postgres_database("ns", "db", URI);
    db.spec.immediate_deploy = true;
    h.add_database(db).await;

    let (stop_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let shutdown = |mut rx: tokio::sync::broadcast::Receiver<()>| async move {
        let _ = rx.recv().await;
    };
    let tables = tokio::spawn(
        Controller::new(Arc::new(h.tables())).run(shutdown(stop_tx.subscribe())),
    );
    let migrations = tokio::spawn(
        Controller::new(Arc::new(h.migrations()))
            .owns(h.mem.pods.watch())
            .run(shutdown(stop_tx.subscribe())),
    );

    h.mem.tables.create(&users_table("ns", "db")).await.unwrap();
    let mem = h.mem.clone();
    assert!(
        wait_for(|| {
            let mem = mem.clone();
            async move { mem.pods.len().await == 1 }
        })
        .await
    );

    stop_tx.send(()).unwrap();
    tables.await.unwrap();
    migrations.await.unwrap();
}
