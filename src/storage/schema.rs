//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS measurements (
            id INTEGER PRIMARY KEY,
            source_id TEXT NOT NULL,
            parameter TEXT NOT NULL,
            value REAL NOT NULL,
            measured_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS incidents (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            severity TEXT NOT NULL,
            incident_type TEXT NOT NULL,
            message TEXT NOT NULL DEFAULT '',
            detected_value REAL NOT NULL,
            threshold_value REAL NOT NULL,
            recommended_action TEXT NOT NULL,
            action_status TEXT NOT NULL,
            action_zone TEXT NOT NULL,
            agent_type TEXT,
            z_score REAL,
            rate_of_change REAL,
            resolved INTEGER NOT NULL DEFAULT 0,
            resolved_at TEXT,
            operator_notes TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL UNIQUE,
            agent_type TEXT NOT NULL,
            status TEXT NOT NULL,
            last_heartbeat TEXT NOT NULL,
            detections_24h INTEGER NOT NULL DEFAULT 0,
            capabilities_json TEXT NOT NULL DEFAULT '[]',
            protocol TEXT NOT NULL,
            registered_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_measurements_stream ON measurements(source_id, parameter, id);
        CREATE INDEX IF NOT EXISTS idx_incidents_created ON incidents(created_at);
        CREATE INDEX IF NOT EXISTS idx_incidents_source ON incidents(source_id, incident_type);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
