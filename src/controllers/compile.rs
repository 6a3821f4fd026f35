//! Data migration operations to SQL.

use crate::api::{DataOperation, DataOperationKind, EngineFamily};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("operation {index} ({kind}) is missing `{field}`")]
    MissingField {
        index: usize,
        kind: &'static str,
        field: &'static str,
    },
}

/// Compile `operations` in order, one statement each.
pub fn compile(
    operations: &[DataOperation],
    family: EngineFamily,
) -> Result<Vec<String>, CompileError> {
    operations
        .iter()
        .enumerate()
        .map(|(index, op)| compile_one(index, op, family))
        .collect()
}

fn required<'a>(
    index: usize,
    op: &'a DataOperation,
    field: &'static str,
    value: &'a Option<String>,
) -> Result<&'a str, CompileError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(CompileError::MissingField {
            index,
            kind: op.kind.as_str(),
            field,
        })
}

fn with_where(statement: String, op: &DataOperation) -> String {
    let condition = op
        .where_clause
        .as_deref()
        .map(str::trim)
        .filter(|w| !w.is_empty());
    match condition {
        Some(condition) => format!("{} WHERE {}", statement, condition),
        None => statement,
    }
}

fn compile_one(
    index: usize,
    op: &DataOperation,
    family: EngineFamily,
) -> Result<String, CompileError> {
    let table = required(index, op, "table", &op.table)?;
    let column = required(index, op, "column", &op.column)?;
    match op.kind {
        DataOperationKind::Update => {
            let value = required(index, op, "value", &op.value)?;
            Ok(with_where(
                format!("UPDATE {} SET {} = {}", table, column, value),
                op,
            ))
        }
        DataOperationKind::Calculate => {
            let expression = required(index, op, "expression", &op.expression)?;
            Ok(with_where(
                format!("UPDATE {} SET {} = {}", table, column, expression),
                op,
            ))
        }
        DataOperationKind::Convert => {
            let from = required(index, op, "from", &op.from)?;
            let to = required(index, op, "to", &op.to)?;
            Ok(convert(table, column, from, to, family))
        }
    }
}

fn convert(table: &str, column: &str, from: &str, to: &str, family: EngineFamily) -> String {
    let timestamp_to_tz =
        from.eq_ignore_ascii_case("timestamp") && to.eq_ignore_ascii_case("timestamptz");
    match family {
        EngineFamily::Postgres if timestamp_to_tz => format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE timestamptz USING {} AT TIME ZONE 'UTC'",
            table, column, column
        ),
        // MySQL has no timestamptz.
        EngineFamily::Mysql if timestamp_to_tz => {
            format!("ALTER TABLE {} MODIFY COLUMN {} DATETIME", table, column)
        }
        _ => format!("ALTER TABLE {} ALTER COLUMN {} TYPE {}", table, column, to),
    }
}
