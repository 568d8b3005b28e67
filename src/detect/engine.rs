//! Per-stream detection pipeline.
//!
//! Each (source, parameter) stream gets its own task fed by an mpsc queue,
//! so measurements of one stream are evaluated strictly in arrival order
//! while different streams run concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::analysis::rules::{self, RuleId, Violation};
use crate::analysis::stats::BaselineStats;
use crate::analysis::zones::Side;
use crate::analysis::SpcReport;
use crate::config::{BaselineConfig, Config, SourceConfig};
use crate::detect::escalation::EscalationPolicy;
use crate::detect::incident::{DetectionOutcome, IncidentManager};
use crate::detect::{DetectError, Detection, EngineEvent, EventSender};

const STREAM_QUEUE_DEPTH: usize = 1024;

/// One reading of one parameter on one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub source_id: String,
    pub parameter: String,
    pub value: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub source_id: String,
    pub parameter: String,
}

impl StreamKey {
    pub fn new(source_id: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            parameter: parameter.into(),
        }
    }

    fn of(m: &Measurement) -> Self {
        Self::new(m.source_id.clone(), m.parameter.clone())
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.source_id, self.parameter)
    }
}

// ---------------------------------------------------------------------------
// Stream state
// ---------------------------------------------------------------------------

/// History and last reading of one stream.
#[derive(Debug, Clone)]
pub struct StreamState {
    key: StreamKey,
    history: Vec<f64>,
    last: Option<(f64, DateTime<Utc>)>,
}

impl StreamState {
    pub fn new(key: StreamKey) -> Self {
        Self {
            key,
            history: Vec::new(),
            last: None,
        }
    }

    /// Seed history from persisted measurements, oldest first.
    pub fn with_history(key: StreamKey, history: Vec<f64>) -> Self {
        Self {
            key,
            history,
            last: None,
        }
    }

    pub fn history(&self) -> &[f64] {
        &self.history
    }

    /// Baseline over the last `window` points of history.
    pub fn baseline(&self, window: usize) -> BaselineStats {
        let start = self.history.len().saturating_sub(window);
        BaselineStats::from_sample(&self.history[start..])
    }

    /// Rate of change in units per minute against the previous reading.
    fn rate_of_change(&self, value: f64, at: DateTime<Utc>) -> Option<f64> {
        let (prev, prev_at) = self.last?;
        let millis = (at - prev_at).num_milliseconds();
        if millis <= 0 {
            return None;
        }
        Some((value - prev) / (millis as f64 / 60_000.0))
    }

    /// Append one measurement and return everything it triggers.
    ///
    /// Control rules are judged against the baseline of the points *before*
    /// the new one; the ceiling check is independent of the baseline.
    pub fn observe(
        &mut self,
        m: &Measurement,
        baseline_cfg: &BaselineConfig,
        policy: &EscalationPolicy,
        source: &SourceConfig,
    ) -> Vec<Detection> {
        let prior_len = self.history.len().min(baseline_cfg.window);
        let baseline = self.baseline(baseline_cfg.window);
        let z_score = baseline.z_score(m.value);
        let rate_of_change = self.rate_of_change(m.value, m.timestamp);

        self.history.push(m.value);
        self.last = Some((m.value, m.timestamp));

        let actions = source.actions_for(&m.parameter);
        let mut detections = Vec::new();

        if baseline.sample_count >= baseline_cfg.min_samples && baseline.has_basis() {
            let window = &self.history[self.history.len() - prior_len - 1..];
            for violation in rules::evaluate_at(window, &baseline, window.len() - 1) {
                let decision = policy.decide_violation(&violation, &actions);
                detections.push(Detection {
                    source_id: m.source_id.clone(),
                    incident_type: format!("{}_spc_rule_{}", m.parameter, violation.rule.number()),
                    message: format!(
                        "{} {}: {} on {} side of mean {:.3}",
                        self.key,
                        violation.rule,
                        m.value,
                        violation.side,
                        baseline.mean
                    ),
                    detected_value: m.value,
                    threshold_value: control_limit(&violation, &baseline),
                    decision,
                    z_score,
                    rate_of_change,
                    detected_at: m.timestamp,
                });
            }
        }

        if let Some(max) = source.threshold(&m.parameter) {
            if let Some(decision) = policy.decide_ceiling(m.value, max, &actions) {
                detections.push(Detection {
                    source_id: m.source_id.clone(),
                    incident_type: format!("{}_threshold_{}", m.parameter, decision.action_zone),
                    message: format!(
                        "{} at {:.1}% of ceiling {}",
                        self.key,
                        m.value / max * 100.0,
                        max
                    ),
                    detected_value: m.value,
                    threshold_value: max,
                    decision,
                    z_score,
                    rate_of_change,
                    detected_at: m.timestamp,
                });
            }
        }

        if self.history.len() > baseline_cfg.history_limit {
            let excess = self.history.len() - baseline_cfg.history_limit;
            self.history.drain(..excess);
        }

        detections
    }
}

/// The limit a violation is judged against.
fn control_limit(violation: &Violation, baseline: &BaselineStats) -> f64 {
    let upper = violation.side == Side::Upper;
    match violation.rule {
        RuleId::BeyondThreeSigma => if upper { baseline.ucl3 } else { baseline.lcl3 },
        RuleId::TwoOfThreeBeyondTwoSigma => if upper { baseline.ucl2 } else { baseline.lcl2 },
        RuleId::FourOfFiveBeyondOneSigma => if upper { baseline.ucl1 } else { baseline.lcl1 },
        RuleId::EightOnOneSide => baseline.mean,
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

type Reply = oneshot::Sender<Result<Vec<DetectionOutcome>, DetectError>>;

struct Envelope {
    measurement: Measurement,
    reply: Option<Reply>,
}

#[derive(Clone)]
struct StreamHandle {
    state: Arc<Mutex<StreamState>>,
    tx: mpsc::Sender<Envelope>,
}

/// Routes measurements to their stream tasks.
pub struct Pipeline {
    config: Arc<Config>,
    policy: EscalationPolicy,
    manager: Arc<IncidentManager>,
    events: EventSender,
    streams: RwLock<HashMap<StreamKey, StreamHandle>>,
    seeds: Mutex<HashMap<StreamKey, Vec<f64>>>,
}

impl Pipeline {
    pub fn new(config: Arc<Config>, manager: Arc<IncidentManager>, events: EventSender) -> Self {
        Self {
            policy: EscalationPolicy::new(config.escalation),
            config,
            manager,
            events,
            streams: RwLock::new(HashMap::new()),
            seeds: Mutex::new(HashMap::new()),
        }
    }

    /// Provide persisted history for streams that have not started yet.
    pub async fn seed(&self, seeds: HashMap<StreamKey, Vec<f64>>) {
        let mut pending = self.seeds.lock().await;
        for (key, mut values) in seeds {
            let keep = self.config.baseline.history_limit;
            if values.len() > keep {
                values.drain(..values.len() - keep);
            }
            pending.insert(key, values);
        }
    }

    /// Source config for a measurement. Sources registered at runtime
    /// without static config get defaults.
    async fn source_config(&self, source_id: &str) -> Result<SourceConfig, DetectError> {
        if let Some(source) = self.config.source(source_id) {
            return Ok(source.clone());
        }
        match self.manager.agents().get_by_source(source_id).await {
            Some(agent) => Ok(SourceConfig::new(source_id, agent.agent_type)),
            None => Err(DetectError::not_found("source", source_id)),
        }
    }

    async fn handle(&self, m: &Measurement) -> Result<StreamHandle, DetectError> {
        if !m.value.is_finite() {
            return Err(DetectError::InvalidMeasurement(format!(
                "{}/{}: value {} is not finite",
                m.source_id, m.parameter, m.value
            )));
        }
        let key = StreamKey::of(m);
        if let Some(handle) = self.streams.read().await.get(&key) {
            return Ok(handle.clone());
        }

        let source = self.source_config(&m.source_id).await?;
        let mut streams = self.streams.write().await;
        if let Some(handle) = streams.get(&key) {
            return Ok(handle.clone());
        }

        let seeded = self.seeds.lock().await.remove(&key).unwrap_or_default();
        let state = Arc::new(Mutex::new(StreamState::with_history(key.clone(), seeded)));
        let (tx, rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        let worker = StreamWorker {
            key: key.clone(),
            state: state.clone(),
            source,
            baseline: self.config.baseline.clone(),
            policy: self.policy,
            manager: self.manager.clone(),
            events: self.events.clone(),
        };
        tokio::spawn(worker.run(rx));
        info!(stream = %key, "stream started");

        let handle = StreamHandle { state, tx };
        streams.insert(key, handle.clone());
        Ok(handle)
    }

    /// Queue a measurement without waiting for its evaluation.
    pub async fn ingest(&self, m: Measurement) -> Result<(), DetectError> {
        let handle = self.handle(&m).await?;
        let key = StreamKey::of(&m);
        handle
            .tx
            .send(Envelope {
                measurement: m,
                reply: None,
            })
            .await
            .map_err(|_| DetectError::StreamClosed(key.to_string()))
    }

    /// Queue a measurement and wait for the incidents it produced.
    pub async fn submit(&self, m: Measurement) -> Result<Vec<DetectionOutcome>, DetectError> {
        let handle = self.handle(&m).await?;
        let key = StreamKey::of(&m).to_string();
        let (reply, rx) = oneshot::channel();
        handle
            .tx
            .send(Envelope {
                measurement: m,
                reply: Some(reply),
            })
            .await
            .map_err(|_| DetectError::StreamClosed(key.clone()))?;
        rx.await.map_err(|_| DetectError::StreamClosed(key))?
    }

    /// Control chart report over the current baseline window of a stream.
    pub async fn spc_report(&self, source_id: &str, parameter: &str) -> Result<SpcReport, DetectError> {
        let key = StreamKey::new(source_id, parameter);
        let handle = self
            .streams
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| DetectError::not_found("stream", &key))?;
        let state = handle.state.lock().await;
        let history = state.history();
        let start = history.len().saturating_sub(self.config.baseline.window);
        let limits = self
            .config
            .source(source_id)
            .map(|s| s.limits(parameter))
            .unwrap_or_default();
        Ok(SpcReport::analyze(&history[start..], &limits))
    }

    pub async fn streams(&self) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> = self.streams.read().await.keys().cloned().collect();
        keys.sort_by(|a, b| {
            a.source_id
                .cmp(&b.source_id)
                .then_with(|| a.parameter.cmp(&b.parameter))
        });
        keys
    }
}

struct StreamWorker {
    key: StreamKey,
    state: Arc<Mutex<StreamState>>,
    source: SourceConfig,
    baseline: BaselineConfig,
    policy: EscalationPolicy,
    manager: Arc<IncidentManager>,
    events: EventSender,
}

impl StreamWorker {
    async fn run(self, mut rx: mpsc::Receiver<Envelope>) {
        while let Some(Envelope { measurement, reply }) = rx.recv().await {
            let detections = self
                .state
                .lock()
                .await
                .observe(&measurement, &self.baseline, &self.policy, &self.source);
            self.events.send(EngineEvent::MeasurementRecorded(measurement));

            let mut outcomes = Vec::with_capacity(detections.len());
            let mut failure = None;
            for detection in detections {
                match self.manager.record_detection(detection).await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        warn!(stream = %self.key, error = %e, "detection dropped");
                        failure = Some(e);
                        break;
                    }
                }
            }

            if let Some(reply) = reply {
                let _ = reply.send(match failure {
                    Some(e) => Err(e),
                    None => Ok(outcomes),
                });
            }
        }
        debug!(stream = %self.key, "stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::capability::{CapabilityRating, SpecLimits};
    use crate::config::DedupConfig;
    use crate::detect::agent::AgentRegistry;
    use crate::detect::{ActionStatus, AgentType, SafetyZone};
    use chrono::Duration;
    use crate::detect::event_channel;

    fn reading(value: f64, at: DateTime<Utc>) -> Measurement {
        Measurement {
            source_id: "cnc-01".to_string(),
            parameter: "temperature".to_string(),
            value,
            timestamp: at,
        }
    }

    fn stable(n: usize) -> Vec<f64> {
        (0..n).map(|i| if i % 2 == 0 { 10.0 } else { 10.2 }).collect()
    }

    #[test]
    fn test_spike_against_prior_baseline() {
        let cfg = BaselineConfig::default();
        let policy = EscalationPolicy::default();
        let source = SourceConfig::new("cnc-01", AgentType::Precision);
        let mut state = StreamState::with_history(StreamKey::new("cnc-01", "temperature"), stable(20));

        let detections = state.observe(&reading(20.0, Utc::now()), &cfg, &policy, &source);
        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert_eq!(d.incident_type, "temperature_spc_rule_1");
        assert_eq!(d.decision.action_zone, SafetyZone::Yellow);
        assert_eq!(d.decision.recommended_action, "reduce_thermal_load");
        assert!(d.threshold_value > 10.1 && d.threshold_value < 20.0);
        assert!(d.z_score.unwrap() > 3.0);
        assert_eq!(state.history().len(), 21);
    }

    #[test]
    fn test_rules_wait_for_min_samples() {
        let cfg = BaselineConfig::default();
        let policy = EscalationPolicy::default();
        let source = SourceConfig::new("cnc-01", AgentType::Precision);
        let mut state = StreamState::with_history(StreamKey::new("cnc-01", "temperature"), stable(5));
        assert!(state.observe(&reading(50.0, Utc::now()), &cfg, &policy, &source).is_empty());
    }

    #[test]
    fn test_ceiling_without_baseline() {
        let cfg = BaselineConfig::default();
        let policy = EscalationPolicy::default();
        let source = SourceConfig::new("cnc-01", AgentType::Precision).with_threshold("temperature", 100.0);
        let mut state = StreamState::new(StreamKey::new("cnc-01", "temperature"));

        let detections = state.observe(&reading(97.0, Utc::now()), &cfg, &policy, &source);
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].incident_type, "temperature_threshold_yellow");
        assert_eq!(detections[0].decision.action_status, ActionStatus::PendingApproval);
        assert_eq!(detections[0].threshold_value, 100.0);
        assert_eq!(detections[0].z_score, None);
    }

    #[test]
    fn test_rate_of_change_per_minute() {
        let cfg = BaselineConfig::default();
        let policy = EscalationPolicy::default();
        let source = SourceConfig::new("cnc-01", AgentType::Precision).with_threshold("temperature", 10.0);
        let mut state = StreamState::new(StreamKey::new("cnc-01", "temperature"));
        let t0 = Utc::now();

        state.observe(&reading(4.0, t0), &cfg, &policy, &source);
        let detections = state.observe(&reading(10.0, t0 + Duration::seconds(30)), &cfg, &policy, &source);
        assert_eq!(detections[0].rate_of_change, Some(12.0));
    }

    #[test]
    fn test_history_is_bounded() {
        let cfg = BaselineConfig {
            window: 7,
            min_samples: 3,
            history_limit: 8,
        };
        let policy = EscalationPolicy::default();
        let source = SourceConfig::new("cnc-01", AgentType::Precision);
        let mut state = StreamState::new(StreamKey::new("cnc-01", "temperature"));
        let t0 = Utc::now();
        for (i, v) in stable(20).into_iter().enumerate() {
            state.observe(&reading(v, t0 + Duration::seconds(i as i64)), &cfg, &policy, &source);
        }
        assert_eq!(state.history().len(), 8);
    }

    async fn pipeline(config: Config) -> (Pipeline, Arc<IncidentManager>) {
        let (tx, _rx) = event_channel(1024);
        let agents = Arc::new(AgentRegistry::new(tx.clone()));
        for source in &config.sources {
            agents
                .register(&source.source_id, source.agent_type, vec![], "mqtt", Utc::now())
                .await;
        }
        let manager = Arc::new(IncidentManager::new(DedupConfig::default(), agents, tx.clone()));
        (Pipeline::new(Arc::new(config), manager.clone(), tx), manager)
    }

    fn config_with_ceiling() -> Config {
        Config {
            sources: vec![SourceConfig::new("cnc-01", AgentType::Precision).with_threshold("temperature", 105.0)],
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_submit_creates_and_dedups() {
        let (pipeline, manager) = pipeline(config_with_ceiling()).await;
        let t0 = Utc::now();

        let first = pipeline.submit(reading(106.0, t0)).await.unwrap();
        assert_eq!(first.len(), 1);
        let incident = first[0].created().unwrap();
        assert_eq!(incident.action_zone, SafetyZone::Red);
        assert_eq!(incident.action_status, ActionStatus::AlertOnly);
        assert_eq!(incident.agent_type, Some(AgentType::Precision));

        let second = pipeline.submit(reading(107.0, t0 + Duration::seconds(10))).await.unwrap();
        assert!(matches!(second[0], DetectionOutcome::Suppressed { .. }));
        assert_eq!(manager.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_breach_escalates_past_earlier_band() {
        let config = Config {
            sources: vec![SourceConfig::new("cnc-01", AgentType::Precision).with_threshold("temperature", 100.0)],
            ..Config::default()
        };
        let (pipeline, manager) = pipeline(config).await;
        let t0 = Utc::now();

        let warm = pipeline.submit(reading(90.0, t0)).await.unwrap();
        assert_eq!(warm[0].created().unwrap().action_zone, SafetyZone::Green);

        let breach = pipeline.submit(reading(130.0, t0 + Duration::seconds(10))).await.unwrap();
        let red = breach[0].created().expect("red breach must not be suppressed");
        assert_eq!(red.action_zone, SafetyZone::Red);
        assert_eq!(red.action_status, ActionStatus::AlertOnly);
        assert_eq!(red.recommended_action, "emergency_stop");
        assert_eq!(red.incident_type, "temperature_threshold_red");

        // Repeats within a band are still folded.
        let again = pipeline.submit(reading(125.0, t0 + Duration::seconds(20))).await.unwrap();
        assert_eq!(again[0], DetectionOutcome::Suppressed { existing: red.id });

        let reds = manager
            .snapshot()
            .await
            .into_iter()
            .filter(|i| i.action_zone == SafetyZone::Red)
            .count();
        assert_eq!(reds, 1);
    }

    #[tokio::test]
    async fn test_spc_report_uses_configured_spec_limits() {
        let config = Config {
            sources: vec![SourceConfig::new("coater-4", AgentType::Precision)
                .with_spec_limits("film_thickness", SpecLimits::new(11.0, 9.2))],
            ..Config::default()
        };
        let (pipeline, _) = pipeline(config).await;
        let t0 = Utc::now();
        for (i, v) in stable(30).into_iter().enumerate() {
            pipeline
                .ingest(Measurement {
                    source_id: "coater-4".to_string(),
                    parameter: "film_thickness".to_string(),
                    value: v,
                    timestamp: t0 + Duration::seconds(i as i64),
                })
                .await
                .unwrap();
        }
        // Wait for the queue to drain.
        pipeline
            .submit(Measurement {
                source_id: "coater-4".to_string(),
                parameter: "film_thickness".to_string(),
                value: 10.1,
                timestamp: t0 + Duration::seconds(30),
            })
            .await
            .unwrap();

        let report = pipeline.spc_report("coater-4", "film_thickness").await.unwrap();
        let capability = report.capability.expect("both limits are configured");
        // Mean 10.1 sits 0.9 from either limit with std close to 0.1.
        assert!((capability.cpu - capability.cpl).abs() < 1e-6);
        assert!(capability.cpk > 2.5 && capability.cpk < 3.5, "cpk {}", capability.cpk);
        assert_eq!(capability.rating, CapabilityRating::Excellent);
    }

    #[tokio::test]
    async fn test_unknown_source_rejected() {
        let (pipeline, manager) = pipeline(config_with_ceiling()).await;
        let mut m = reading(200.0, Utc::now());
        m.source_id = "ghost".to_string();
        assert!(matches!(
            pipeline.submit(m).await,
            Err(DetectError::NotFound { kind: "source", .. })
        ));
        assert!(manager.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_non_finite_rejected() {
        let (pipeline, _) = pipeline(config_with_ceiling()).await;
        assert!(matches!(
            pipeline.ingest(reading(f64::NAN, Utc::now())).await,
            Err(DetectError::InvalidMeasurement(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_preserves_order() {
        let (pipeline, _) = pipeline(config_with_ceiling()).await;
        let t0 = Utc::now();
        for (i, v) in stable(30).into_iter().enumerate() {
            pipeline
                .ingest(reading(v, t0 + Duration::seconds(i as i64)))
                .await
                .unwrap();
        }
        // The reply arrives only after everything queued before it.
        let outcomes = pipeline
            .submit(reading(20.0, t0 + Duration::seconds(30)))
            .await
            .unwrap();
        let created: Vec<_> = outcomes.iter().filter_map(|o| o.created()).collect();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].incident_type, "temperature_spc_rule_1");

        let report = pipeline.spc_report("cnc-01", "temperature").await.unwrap();
        assert_eq!(report.baseline.sample_count, 31);
        assert_eq!(pipeline.streams().await, vec![StreamKey::new("cnc-01", "temperature")]);
    }

    #[tokio::test]
    async fn test_seeded_history_is_used() {
        let (pipeline, _) = pipeline(config_with_ceiling()).await;
        let mut seeds = HashMap::new();
        seeds.insert(StreamKey::new("cnc-01", "temperature"), stable(20));
        pipeline.seed(seeds).await;

        let outcomes = pipeline.submit(reading(20.0, Utc::now())).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(pipeline.spc_report("cnc-01", "vibration").await.is_err());
    }
}
