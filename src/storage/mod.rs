//! SQLite storage layer -- schema, queries, and the event writer.

pub mod schema;

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::detect::engine::{Measurement, StreamKey};
use crate::detect::{Agent, EngineEvent, EventReceiver, Incident};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("failed to open database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Measurements
// ---------------------------------------------------------------------------

pub fn save_measurement(conn: &Connection, m: &Measurement) -> Result<()> {
    conn.execute(
        "INSERT INTO measurements (source_id, parameter, value, measured_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![m.source_id, m.parameter, m.value, m.timestamp.to_rfc3339()],
    )?;
    Ok(())
}

/// The last `limit` values of every stream, oldest first.
pub fn load_recent_series(conn: &Connection, limit: usize) -> Result<HashMap<StreamKey, Vec<f64>>> {
    let mut stmt = conn.prepare(
        "SELECT source_id, parameter, value FROM (
             SELECT id, source_id, parameter, value,
                    ROW_NUMBER() OVER (PARTITION BY source_id, parameter ORDER BY id DESC) AS rn
             FROM measurements
         )
         WHERE rn <= ?1
         ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, f64>(2)?,
        ))
    })?;

    let mut series: HashMap<StreamKey, Vec<f64>> = HashMap::new();
    for r in rows {
        let (source_id, parameter, value) = r?;
        series
            .entry(StreamKey::new(source_id, parameter))
            .or_default()
            .push(value);
    }
    Ok(series)
}

// ---------------------------------------------------------------------------
// Incidents
// ---------------------------------------------------------------------------

/// Insert or update an incident. A row that is already resolved keeps its
/// resolution and action status; only its notes may still change.
pub fn upsert_incident(conn: &Connection, incident: &Incident) -> Result<()> {
    conn.execute(
        "INSERT INTO incidents (
             id, source_id, severity, incident_type, message, detected_value,
             threshold_value, recommended_action, action_status, action_zone,
             agent_type, z_score, rate_of_change, resolved, resolved_at,
             operator_notes, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
         ON CONFLICT(id) DO UPDATE SET
             action_status = CASE WHEN incidents.resolved THEN incidents.action_status
                                  ELSE excluded.action_status END,
             resolved_at = CASE WHEN incidents.resolved THEN incidents.resolved_at
                                ELSE excluded.resolved_at END,
             resolved = incidents.resolved OR excluded.resolved,
             operator_notes = excluded.operator_notes",
        params![
            incident.id.to_string(),
            incident.source_id,
            incident.severity.as_str(),
            incident.incident_type,
            incident.message,
            incident.detected_value,
            incident.threshold_value,
            incident.recommended_action,
            incident.action_status.as_str(),
            incident.action_zone.as_str(),
            incident.agent_type.map(|t| t.as_str()),
            incident.z_score,
            incident.rate_of_change,
            incident.resolved,
            incident.resolved_at.map(|t| t.to_rfc3339()),
            incident.operator_notes,
            incident.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn incident_from_row(row: &Row<'_>) -> rusqlite::Result<Incident> {
    Ok(Incident {
        id: parse_col(row, 0)?,
        source_id: row.get(1)?,
        severity: parse_col(row, 2)?,
        incident_type: row.get(3)?,
        message: row.get(4)?,
        detected_value: row.get(5)?,
        threshold_value: row.get(6)?,
        recommended_action: row.get(7)?,
        action_status: parse_col(row, 8)?,
        action_zone: parse_col(row, 9)?,
        agent_type: parse_opt_col(row, 10)?,
        z_score: row.get(11)?,
        rate_of_change: row.get(12)?,
        resolved: row.get(13)?,
        resolved_at: parse_opt_col(row, 14)?,
        operator_notes: row.get(15)?,
        created_at: parse_col(row, 16)?,
    })
}

const INCIDENT_COLUMNS: &str = "id, source_id, severity, incident_type, message, detected_value,
     threshold_value, recommended_action, action_status, action_zone,
     agent_type, z_score, rate_of_change, resolved, resolved_at,
     operator_notes, created_at";

/// Incidents, newest first. With `since`, resolved incidents created before
/// it are left out; unresolved ones are always loaded.
pub fn load_incidents(conn: &Connection, since: Option<DateTime<Utc>>) -> Result<Vec<Incident>> {
    let incidents = match since {
        Some(since) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INCIDENT_COLUMNS} FROM incidents
                 WHERE resolved = 0 OR julianday(created_at) >= julianday(?1)
                 ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map(params![since.to_rfc3339()], incident_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INCIDENT_COLUMNS} FROM incidents ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map([], incident_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
    };
    Ok(incidents)
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

pub fn upsert_agent(conn: &Connection, agent: &Agent) -> Result<()> {
    let capabilities = serde_json::to_string(&agent.capabilities)?;
    conn.execute(
        "INSERT INTO agents (
             id, source_id, agent_type, status, last_heartbeat, detections_24h,
             capabilities_json, protocol, registered_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
             status = excluded.status,
             last_heartbeat = excluded.last_heartbeat,
             detections_24h = excluded.detections_24h",
        params![
            agent.id.to_string(),
            agent.source_id,
            agent.agent_type.as_str(),
            agent.status.as_str(),
            agent.last_heartbeat.to_rfc3339(),
            agent.detections_24h as i64,
            capabilities,
            agent.protocol,
            agent.registered_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn load_agents(conn: &Connection) -> Result<Vec<Agent>> {
    let mut stmt = conn.prepare(
        "SELECT id, source_id, agent_type, status, last_heartbeat, detections_24h,
                capabilities_json, protocol, registered_at
         FROM agents ORDER BY source_id",
    )?;
    let rows = stmt.query_map([], |row| {
        let capabilities: String = row.get(6)?;
        Ok((
            Agent {
                id: parse_col(row, 0)?,
                source_id: row.get(1)?,
                agent_type: parse_col(row, 2)?,
                status: parse_col(row, 3)?,
                last_heartbeat: parse_col(row, 4)?,
                detections_24h: row.get::<_, i64>(5)?.max(0) as u64,
                capabilities: Vec::new(),
                protocol: row.get(7)?,
                registered_at: parse_col(row, 8)?,
            },
            capabilities,
        ))
    })?;

    let mut agents = Vec::new();
    for r in rows {
        let (mut agent, capabilities) = r?;
        agent.capabilities = serde_json::from_str(&capabilities)
            .with_context(|| format!("bad capabilities for agent {}", agent.id))?;
        agents.push(agent);
    }
    Ok(agents)
}

// ---------------------------------------------------------------------------
// Event writer
// ---------------------------------------------------------------------------

pub fn apply_event(conn: &Connection, event: &EngineEvent) -> Result<()> {
    match event {
        EngineEvent::MeasurementRecorded(m) => save_measurement(conn, m),
        EngineEvent::IncidentCreated(incident) | EngineEvent::IncidentUpdated(incident) => {
            upsert_incident(conn, incident)
        }
        EngineEvent::AgentUpdated(agent) => upsert_agent(conn, agent),
    }
}

/// Persist engine events. Incident and agent events are written in publish
/// order and take priority over measurements. Database work runs on the
/// blocking pool. Stops once every sender is gone.
pub fn spawn_writer(pool: Pool, events: EventReceiver) -> JoinHandle<()> {
    let EventReceiver {
        mut lifecycle,
        mut measurements,
    } = events;
    tokio::spawn(async move {
        info!("storage writer started");
        let mut lifecycle_open = true;
        let mut measurements_open = true;
        while lifecycle_open || measurements_open {
            let event = tokio::select! {
                biased;
                next = lifecycle.recv(), if lifecycle_open => match next {
                    Some(event) => event,
                    None => {
                        lifecycle_open = false;
                        continue;
                    }
                },
                next = measurements.recv(), if measurements_open => match next {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "storage writer lagged, measurements dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        measurements_open = false;
                        continue;
                    }
                },
                else => break,
            };

            let pool = pool.clone();
            let result = tokio::task::spawn_blocking(move || -> Result<()> {
                let conn = pool.get()?;
                apply_event(&conn, &event)
            })
            .await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "failed to persist event"),
                Err(e) => error!(error = %e, "storage task panicked"),
            }
        }
        debug!("storage writer stopped");
    })
}
