//! Database schema and migrations for luabot.

/// Database migrations.
///
/// Each migration is a SQL script executed in order. The `schema_version`
/// table records which migrations have been applied.
pub const MIGRATIONS: &[&str] = &[
    // v1: Script key-value store
    r#"
CREATE TABLE IF NOT EXISTS kv_store (
    namespace   TEXT NOT NULL,
    key         TEXT NOT NULL,
    value       TEXT,
    PRIMARY KEY (namespace, key)
);
"#,
];
