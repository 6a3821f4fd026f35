//! Object naming helpers.

use sha2::{Digest, Sha256};

/// Longest name used for generated workload objects.
pub const MAX_NAME_LEN: usize = 63;

/// Characters of the spec fingerprint used as a migration name.
pub const MIGRATION_ID_LEN: usize = 7;

/// Length of a data migration's migration name, prefix included.
pub const DATA_MIGRATION_NAME_LEN: usize = 16;

/// Migration name for a planned table or view: the first seven characters of
/// its spec fingerprint.
pub fn migration_id(spec_sha: &str) -> String {
    spec_sha.chars().take(MIGRATION_ID_LEN).collect()
}

/// `datamig-{sha256(namespace-name)}`, cut to 16 characters.
pub fn data_migration_name(namespace: &str, name: &str) -> String {
    let digest = hex::encode(Sha256::digest(format!("{}-{}", namespace, name).as_bytes()));
    format!("datamig-{}", digest)
        .chars()
        .take(DATA_MIGRATION_NAME_LEN)
        .collect()
}

/// Name for the DDL payload and apply pod of a migration.
///
/// `{database}-{table}-{id}`, or `{table}-{id}` when that would be too long.
pub fn apply_object_name(database: &str, table: &str, migration: &str) -> String {
    let full = format!("{}-{}-{}", database, table, migration);
    if full.len() <= MAX_NAME_LEN {
        return full;
    }
    let short = format!("{}-{}", table, migration);
    if short.len() <= MAX_NAME_LEN {
        return short;
    }
    // Keep the migration id, it is what makes the name unique.
    let keep = MAX_NAME_LEN.saturating_sub(migration.len() + 1);
    let table: String = table.chars().take(keep).collect();
    format!("{}-{}", table.trim_end_matches('-'), migration)
}

/// Seconds since the unix epoch.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_id_takes_seven() {
        assert_eq!(migration_id("abcdef0123456789"), "abcdef0");
        assert_eq!(migration_id("abc"), "abc");
    }

    #[test]
    fn test_data_migration_name() {
        let name = data_migration_name("ns", "name");
        let digest = hex::encode(Sha256::digest(b"ns-name"));
        assert_eq!(name.len(), 16);
        assert_eq!(name, format!("datamig-{}", &digest[..8]));
        assert_eq!(name, data_migration_name("ns", "name"));
        assert_ne!(name, data_migration_name("ns", "other"));
    }

    #[test]
    fn test_apply_object_name_full() {
        assert_eq!(apply_object_name("db", "users", "abc1234"), "db-users-abc1234");
    }

    #[test]
    fn test_apply_object_name_falls_back_to_table() {
        let database = "d".repeat(60);
        assert_eq!(apply_object_name(&database, "users", "abc1234"), "users-abc1234");
    }

    #[test]
    fn test_apply_object_name_truncates_long_table() {
        let table = "t".repeat(80);
        let name = apply_object_name("db", &table, "abc1234");
        assert!(name.len() <= MAX_NAME_LEN);
        assert!(name.ends_with("-abc1234"));
    }
}
