//! SQLite schema for the in-process state store.

use rusqlite::{params, Connection};

use crate::errors::SolsticeResult;

/// Bumped whenever a table or index definition changes. The store is
/// rebuilt from the metadata snapshot on every start, so there is no
/// migration path between versions.
pub const SCHEMA_VERSION: i32 = 1;

/// Executed with `IF NOT EXISTS`, safe to replay.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables ──────────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS store_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS sources (
        dir TEXT NOT NULL,
        filename TEXT NOT NULL,
        mod_time INTEGER NOT NULL,
        tainted INTEGER NOT NULL DEFAULT 1,
        version TEXT NOT NULL DEFAULT '[]',
        imports TEXT NOT NULL DEFAULT '[]',
        ast TEXT,
        unit_id TEXT,
        PRIMARY KEY(dir, filename)
    );",
    "CREATE TABLE IF NOT EXISTS contracts (
        dir TEXT NOT NULL,
        filename TEXT NOT NULL,
        name TEXT NOT NULL,
        abi TEXT NOT NULL,
        bin TEXT NOT NULL,
        bin_runtime TEXT NOT NULL,
        src_map TEXT NOT NULL,
        src_map_runtime TEXT NOT NULL,
        PRIMARY KEY(dir, filename, name),
        FOREIGN KEY(dir, filename) REFERENCES sources(dir, filename) ON DELETE CASCADE
    );",
    // ── indexes ─────────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_sources_tainted ON sources(tainted);",
    "CREATE INDEX IF NOT EXISTS idx_sources_unit ON sources(unit_id);",
    "CREATE INDEX IF NOT EXISTS idx_contracts_source ON contracts(dir, filename);",
    "CREATE INDEX IF NOT EXISTS idx_contracts_name ON contracts(name);",
];

/// Create tables and indexes and record the schema version.
pub fn init_schema(conn: &Connection) -> SolsticeResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    for stmt in SCHEMA_STATEMENTS {
        conn.execute_batch(stmt)?;
    }
    conn.execute(
        "INSERT INTO store_meta(key, value) VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        params![SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Stored schema version, 0 when absent or unparseable.
pub fn schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT value FROM store_meta WHERE key = 'schema_version';",
        [],
        |row| row.get::<_, String>(0),
    )
    .ok()
    .and_then(|v| v.parse().ok())
    .unwrap_or(0)
}
