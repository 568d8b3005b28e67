//! spcguard -- statistical anomaly detection and safety-circuit escalation.
//!
//! This crate provides control charts and Western Electric rules over
//! measurement streams, three-tier escalation of detections, the incident
//! lifecycle, and the HTTP API and SQLite persistence around them.

pub mod analysis;
pub mod api;
pub mod config;
pub mod detect;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info};

use crate::api::state::AppState;
use crate::config::Config;
use crate::detect::{event_channel, EventSender};
use crate::storage::Pool;

/// Capacity of the measurement event channel.
pub const EVENT_BUFFER: usize = 4096;

const RETENTION_SWEEP_SECS: u64 = 600;

/// Build the engine over `pool` and load persisted incidents, agents and
/// stream history into it. Resolved incidents past the retention horizon
/// stay in the database only.
pub async fn restore_state(config: Arc<Config>, pool: Pool, events: EventSender) -> Result<AppState> {
    let history_limit = config.baseline.history_limit;
    let since = Utc::now() - config.incident_retention();
    let load_pool = pool.clone();
    let (incidents, agents, series) = tokio::task::spawn_blocking(move || -> Result<_> {
        let conn = load_pool.get()?;
        Ok((
            storage::load_incidents(&conn, Some(since))?,
            storage::load_agents(&conn)?,
            storage::load_recent_series(&conn, history_limit)?,
        ))
    })
    .await
    .context("state restore task failed")??;

    info!(
        incidents = incidents.len(),
        agents = agents.len(),
        streams = series.len(),
        "restoring persisted state"
    );

    let state = AppState::new(config, pool, events);
    state.agents.restore(agents).await;
    state.incidents.restore(incidents).await;
    state.pipeline.seed(series).await;
    Ok(state)
}

/// Register an agent for every configured source that does not have one.
pub async fn register_sources(state: &AppState) {
    let now = Utc::now();
    for source in &state.config.sources {
        state
            .agents
            .register(
                &source.source_id,
                source.agent_type,
                source.capabilities.clone(),
                &source.protocol,
                now,
            )
            .await;
    }
}

/// Periodic maintenance: the `detections_24h` reset tick, the
/// stale-heartbeat sweep and eviction of old resolved incidents.
fn spawn_maintenance(state: &AppState) {
    let agents = state.agents.clone();
    let reset_every = Duration::from_secs(state.config.agents.counter_reset_secs.max(1));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(reset_every);
        tick.tick().await;
        loop {
            tick.tick().await;
            agents.reset_detection_counters().await;
        }
    });

    let agents = state.agents.clone();
    let timeout_secs = state.config.agents.heartbeat_timeout_secs.max(1);
    let timeout = chrono::Duration::seconds(timeout_secs as i64);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs((timeout_secs / 2).max(1)));
        loop {
            tick.tick().await;
            let stale = agents.mark_stale(Utc::now(), timeout).await;
            if !stale.is_empty() {
                debug!(count = stale.len(), "marked agents inactive");
            }
        }
    });

    let incidents = state.incidents.clone();
    let retention = state.config.incident_retention();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(RETENTION_SWEEP_SECS));
        loop {
            tick.tick().await;
            let evicted = incidents.evict_resolved_before(Utc::now() - retention).await;
            if evicted > 0 {
                info!(evicted, "resolved incidents past retention released");
            }
        }
    });
}

/// Start the spcguard daemon: storage writer, agent maintenance and API server.
pub async fn serve(config: Config) -> Result<()> {
    // 1. Initialize Storage
    let db_path = config.storage.db_path.clone();
    info!(db_path = %db_path.display(), "Initializing database");
    let pool = storage::open_pool(&db_path)?;

    // 2. Restore engine state, then start persisting changes
    let (events, writer_rx) = event_channel(EVENT_BUFFER);
    let state = restore_state(Arc::new(config), pool.clone(), events).await?;
    storage::spawn_writer(pool, writer_rx);

    // 3. Agents for configured sources, background ticks
    register_sources(&state).await;
    spawn_maintenance(&state);

    // 4. Start API Server
    let addr: std::net::SocketAddr = state
        .config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {:?}", state.config.server.bind))?;
    let app = api::router(state);

    info!(%addr, "spcguard listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
