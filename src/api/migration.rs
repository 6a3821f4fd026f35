use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A batch of DDL waiting to be applied to one database.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "schemas.schemahero.io",
    version = "v1alpha4",
    kind = "Migration",
    plural = "migrations",
    namespaced,
    status = "MigrationStatus",
    printcolumn = r#"{"name":"Database","type":"string","jsonPath":".spec.databaseName"}"#,
    printcolumn = r#"{"name":"Table","type":"string","jsonPath":".spec.tableName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSpec {
    /// Name of the source resource (Table, View or DataMigration).
    pub table_name: String,
    pub table_namespace: String,
    pub database_name: String,
    #[serde(rename = "generatedDDL", default)]
    pub generated_ddl: String,
    /// Operator-supplied replacement for the generated DDL.
    #[serde(rename = "editedDDL", default, skip_serializing_if = "Option::is_none")]
    pub edited_ddl: Option<String>,
    #[serde(default)]
    pub source_kind: SourceKind,
}

impl MigrationSpec {
    /// The DDL that will actually be applied.
    pub fn effective_ddl(&self) -> &str {
        match self.edited_ddl.as_deref() {
            Some(edited) if !edited.trim().is_empty() => edited,
            _ => &self.generated_ddl,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum SourceKind {
    #[default]
    Table,
    View,
    DataMigration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum MigrationPhase {
    Planned,
    Approved,
    Executed,
    Failed,
}

impl MigrationPhase {
    /// Allowed forward edges. Re-entering the current phase is allowed so
    /// repeated reconciles stay idempotent.
    pub fn can_advance_to(self, next: MigrationPhase) -> bool {
        use MigrationPhase::*;
        matches!(
            (self, next),
            (Planned, Planned)
                | (Planned, Approved)
                | (Planned, Failed)
                | (Approved, Approved)
                | (Approved, Executed)
                | (Approved, Failed)
                | (Executed, Executed)
                | (Failed, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationPhase::Executed | MigrationPhase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("migration phase cannot move from {from:?} to {to:?}")]
pub struct PhaseRegression {
    pub from: Option<MigrationPhase>,
    pub to: MigrationPhase,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<MigrationPhase>,
    #[serde(default)]
    pub planned_at: i64,
    #[serde(default)]
    pub approved_at: i64,
    #[serde(default)]
    pub executed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MigrationStatus {
    /// Status for a freshly planned migration, pre-approved when the
    /// database deploys immediately.
    pub fn planned(now: i64, immediate_deploy: bool) -> Self {
        let mut status = Self {
            phase: Some(MigrationPhase::Planned),
            planned_at: now,
            ..Default::default()
        };
        if immediate_deploy {
            status.phase = Some(MigrationPhase::Approved);
            status.approved_at = now;
        }
        status
    }

    /// Ready for an apply job.
    pub fn is_actionable(&self) -> bool {
        self.approved_at > 0 && self.executed_at == 0
    }

    /// Move to `next`, stamping the matching timestamp on first entry.
    pub fn advance(&mut self, next: MigrationPhase, now: i64) -> Result<(), PhaseRegression> {
        match self.phase {
            None if matches!(next, MigrationPhase::Planned | MigrationPhase::Approved) => {}
            Some(current) if current.can_advance_to(next) => {}
            from => return Err(PhaseRegression { from, to: next }),
        }
        if self.phase == Some(next) {
            return Ok(());
        }
        self.phase = Some(next);
        match next {
            MigrationPhase::Planned if self.planned_at == 0 => self.planned_at = now,
            MigrationPhase::Approved if self.approved_at == 0 => self.approved_at = now,
            MigrationPhase::Executed if self.executed_at == 0 => self.executed_at = now,
            _ => {}
        }
        Ok(())
    }
}
