use super::*;
use serde_json::json;

#[test]
fn test_table_schema_requires_an_engine() {
    let err = serde_json::from_value::<TableSchema>(json!({})).unwrap_err();
    assert!(err.to_string().contains("none given"));
}

#[test]
fn test_table_schema_rejects_two_engines() {
    let err = serde_json::from_value::<TableSchema>(json!({
        "postgres": {"columns": []},
        "sqlite": {"columns": []},
    }))
    .unwrap_err();
    assert!(err.to_string().contains("postgres, sqlite"));
}

#[test]
fn test_table_schema_engine_tag() {
    let schema: TableSchema = serde_json::from_value(json!({
        "cockroachdb": {"primaryKey": ["id"], "columns": [{"name": "id", "type": "int"}]}
    }))
    .unwrap();
    assert_eq!(schema.engine(), Engine::Cockroachdb);

    let back = serde_json::to_value(&schema).unwrap();
    assert!(back.get("cockroachdb").is_some());
    assert!(back.get("postgres").is_none());
}

#[test]
fn test_empty_default_is_distinct_from_absent() {
    let schema: TableSchema = serde_json::from_value(json!({
        "postgres": {"columns": [
            {"name": "a", "type": "text", "default": ""},
            {"name": "b", "type": "text"},
        ]}
    }))
    .unwrap();
    let TableSchema::Postgres(pg) = &schema else {
        panic!("expected postgres");
    };
    assert_eq!(pg.columns[0].default.as_deref(), Some(""));
    assert_eq!(pg.columns[1].default, None);

    let back = serde_json::to_value(&schema).unwrap();
    assert_eq!(back["postgres"]["columns"][0]["default"], json!(""));
    assert!(back["postgres"]["columns"][1].get("default").is_none());
}

#[test]
fn test_column_defaults_mut_covers_timescale() {
    let mut schema: TableSchema = serde_json::from_value(json!({
        "timescaledb": {
            "columns": [{"name": "t", "type": "timestamptz", "default": "now()"}],
            "hypertable": {"timeColumnName": "t"}
        }
    }))
    .unwrap();
    let defaults = schema.column_defaults_mut();
    assert_eq!(defaults.len(), 1);
    *defaults.into_iter().next().unwrap() = None;

    let TableSchema::Timescaledb(ts) = schema else {
        panic!("expected timescaledb");
    };
    assert_eq!(ts.table.columns[0].default, None);
    assert_eq!(ts.hypertable.unwrap().time_column_name, "t");
}

#[test]
fn test_cassandra_has_no_defaults() {
    let mut schema: TableSchema = serde_json::from_value(json!({
        "cassandra": {"primaryKey": [["id"]], "columns": [{"name": "id", "type": "uuid"}]}
    }))
    .unwrap();
    assert!(schema.column_defaults_mut().is_empty());
}

#[test]
fn test_view_schema_exactly_one() {
    let view: ViewSchema =
        serde_json::from_value(json!({"postgres": {"query": "select 1"}})).unwrap();
    assert_eq!(view.engine(), Engine::Postgres);

    let err = serde_json::from_value::<ViewSchema>(json!({
        "postgres": {"query": "select 1"},
        "timescaledb": {"query": "select 1"},
    }))
    .unwrap_err();
    assert!(err.to_string().contains("exactly one engine"));
}

#[test]
fn test_function_body_wire_name() {
    let schema: FunctionSchema = serde_json::from_value(json!({
        "postgres": {
            "lang": "plpgsql",
            "returnType": "trigger",
            "as": "BEGIN RETURN NEW; END;",
            "params": [{"name": "x", "type": "int"}]
        }
    }))
    .unwrap();
    let pg = schema.postgres.unwrap();
    assert_eq!(pg.body, "BEGIN RETURN NEW; END;");
    assert_eq!(pg.params[0].param_type, "int");
    assert!(!pg.is_deleted);
}
