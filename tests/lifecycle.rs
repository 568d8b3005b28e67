//! End-to-end: measurements through the pipeline, operator actions,
//! persistence, and restart.

use std::sync::Arc;
use std::time::Duration;

use assert_cmd::Command;
use chrono::Utc;
use uuid::Uuid;

use spcguard::api::state::AppState;
use spcguard::config::{Config, SourceConfig, StorageConfig};
use spcguard::detect::circuit::SafetyCircuitStatus;
use spcguard::detect::engine::Measurement;
use spcguard::detect::incident::DetectionOutcome;
use spcguard::detect::{event_channel, ActionStatus, AgentType, Incident, SafetyZone};
use spcguard::storage;

fn config(dir: &std::path::Path) -> Config {
    Config {
        storage: StorageConfig {
            db_path: dir.join("spcguard.db"),
        },
        sources: vec![
            SourceConfig::new("cnc-01", AgentType::Precision).with_threshold("temperature", 105.0),
            SourceConfig::new("hvac-2", AgentType::Facility).with_threshold("humidity", 60.0),
        ],
        ..Config::default()
    }
}

fn reading(source: &str, parameter: &str, value: f64) -> Measurement {
    Measurement {
        source_id: source.to_string(),
        parameter: parameter.to_string(),
        value,
        timestamp: Utc::now(),
    }
}

async fn start(config: &Config) -> (AppState, tokio::task::JoinHandle<()>) {
    let pool = storage::open_pool(&config.storage.db_path).unwrap();
    let (events, rx) = event_channel(spcguard::EVENT_BUFFER);
    let state = spcguard::restore_state(Arc::new(config.clone()), pool.clone(), events)
        .await
        .unwrap();
    let writer = storage::spawn_writer(pool, rx);
    spcguard::register_sources(&state).await;
    (state, writer)
}

/// Drop every sender so the writer drains and exits.
async fn shutdown(state: AppState, writer: tokio::task::JoinHandle<()>) {
    drop(state);
    tokio::time::timeout(Duration::from_secs(5), writer)
        .await
        .expect("writer did not stop")
        .unwrap();
}

/// Poll the database until the writer has stored `id`.
async fn stored(config: &Config, id: Uuid) -> Incident {
    let pool = storage::open_pool(&config.storage.db_path).unwrap();
    for _ in 0..100 {
        let conn = pool.get().unwrap();
        if let Some(found) = storage::load_incidents(&conn, None)
            .unwrap()
            .into_iter()
            .find(|i| i.id == id)
        {
            return found;
        }
        drop(conn);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("incident {id} was never persisted");
}

#[tokio::test]
async fn test_incidents_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let (state, writer) = start(&config).await;
    let outcomes = state
        .pipeline
        .submit(reading("cnc-01", "temperature", 100.0))
        .await
        .unwrap();
    let pending = outcomes[0].created().unwrap().clone();
    assert_eq!(pending.action_zone, SafetyZone::Yellow);

    let red = state
        .pipeline
        .submit(reading("hvac-2", "humidity", 75.0))
        .await
        .unwrap();
    let red = red[0].created().unwrap().clone();
    assert_eq!(red.action_status, ActionStatus::AlertOnly);

    state
        .incidents
        .approve_incident(pending.id, false, Some("false alarm".into()))
        .await
        .unwrap();
    shutdown(state, writer).await;

    let (state, writer) = start(&config).await;
    let restored = state.incidents.get(pending.id).await.unwrap();
    assert_eq!(restored.action_status, ActionStatus::Rejected);
    assert_eq!(restored.operator_notes.as_deref(), Some("false alarm"));

    // Dedup state came back with the incidents.
    let again = state
        .pipeline
        .submit(reading("cnc-01", "temperature", 101.0))
        .await
        .unwrap();
    assert_eq!(again[0], DetectionOutcome::Suppressed { existing: pending.id });

    // Agent counters were persisted too: two detections on cnc-01 so far.
    let agent = state.agents.get_by_source("cnc-01").await.unwrap();
    assert_eq!(agent.detections_24h, 2);

    let status = SafetyCircuitStatus::compute(
        &state.incidents.snapshot().await,
        &state.agents.list().await,
        Utc::now(),
    );
    assert_eq!(status.red_alerts_24h, 1);
    assert_eq!(status.yellow_pending, 0);
    assert_eq!(status.agents_total, 2);
    shutdown(state, writer).await;
}

#[tokio::test]
async fn test_stream_history_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let (state, writer) = start(&config).await;
    for i in 0..20 {
        let value = if i % 2 == 0 { 50.0 } else { 50.4 };
        state
            .pipeline
            .ingest(reading("cnc-01", "spindle_load", value))
            .await
            .unwrap();
    }
    // Flush the stream queue.
    state
        .pipeline
        .submit(reading("cnc-01", "spindle_load", 50.2))
        .await
        .unwrap();
    shutdown(state, writer).await;

    let (state, writer) = start(&config).await;
    let outcomes = state
        .pipeline
        .submit(reading("cnc-01", "spindle_load", 70.0))
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    let incident = outcomes[0].created().unwrap();
    assert_eq!(incident.incident_type, "spindle_load_spc_rule_1");
    assert_eq!(incident.recommended_action, "request_operator_review");
    shutdown(state, writer).await;
}

#[tokio::test]
async fn test_second_engine_cannot_reopen_resolved_incident() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let (daemon, daemon_writer) = start(&config).await;
    let outcomes = daemon
        .pipeline
        .submit(reading("cnc-01", "temperature", 100.0))
        .await
        .unwrap();
    let pending = outcomes[0].created().unwrap().clone();
    stored(&config, pending.id).await;

    // A second engine over the same database resolves it.
    let (other, other_writer) = start(&config).await;
    other
        .incidents
        .resolve_incident(pending.id, Some("handled on site".into()), Utc::now())
        .await
        .unwrap();
    shutdown(other, other_writer).await;

    // The first engine still holds the pending copy and approves it.
    daemon
        .incidents
        .approve_incident(pending.id, true, None)
        .await
        .unwrap();
    shutdown(daemon, daemon_writer).await;

    let row = stored(&config, pending.id).await;
    assert!(row.resolved);
    assert!(row.resolved_at.is_some());
    assert_eq!(row.action_status, ActionStatus::PendingApproval);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cli_resolves_through_running_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    config.server.bind = addr.to_string();

    let (state, _writer) = start(&config).await;
    let app = spcguard::api::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let outcomes = state
        .pipeline
        .submit(reading("cnc-01", "temperature", 100.0))
        .await
        .unwrap();
    let pending = outcomes[0].created().unwrap().clone();

    let config_path = dir.path().join("spcguard.toml");
    std::fs::write(
        &config_path,
        format!(
            "[server]\nbind = \"{}\"\n\n[storage]\ndb_path = {:?}\n",
            addr,
            config.storage.db_path.display().to_string()
        ),
    )
    .unwrap();

    let id = pending.id.to_string();
    let path = config_path.clone();
    tokio::task::spawn_blocking(move || {
        Command::cargo_bin("spcguard")
            .unwrap()
            .env_remove("SPCGUARD_CONFIG")
            .arg("--config")
            .arg(&path)
            .args(["approve", &id, "--reject", "--notes", "sensor fault"])
            .assert()
            .success();
        Command::cargo_bin("spcguard")
            .unwrap()
            .env_remove("SPCGUARD_CONFIG")
            .arg("--config")
            .arg(&path)
            .args(["resolve", &id])
            .assert()
            .success();
    })
    .await
    .unwrap();

    // The daemon's own state saw both actions.
    let incident = state.incidents.get(pending.id).await.unwrap();
    assert_eq!(incident.action_status, ActionStatus::Rejected);
    assert!(incident.resolved);
    assert_eq!(incident.operator_notes.as_deref(), Some("sensor fault"));

    // A rejected decision cannot be approved afterwards.
    let id = pending.id.to_string();
    let output = tokio::task::spawn_blocking(move || {
        Command::cargo_bin("spcguard")
            .unwrap()
            .env_remove("SPCGUARD_CONFIG")
            .arg("--config")
            .arg(&config_path)
            .args(["approve", &id, "--approve"])
            .assert()
            .failure()
            .get_output()
            .stderr
            .clone()
    })
    .await
    .unwrap();
    assert!(String::from_utf8_lossy(&output).contains("cannot approve incident"));
}
