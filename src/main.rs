use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use uuid::Uuid;

use spcguard::analysis::capability::SpecLimits;
use spcguard::analysis::SpcReport;
use spcguard::config::{Config, LoggingConfig};
use spcguard::detect::circuit::SafetyCircuitStatus;
use spcguard::detect::event_channel;
use spcguard::detect::incident::IncidentFilter;
use spcguard::detect::Incident;
use spcguard::storage;

#[derive(Parser)]
#[command(
    name = "spcguard",
    about = "Statistical anomaly detection and safety-circuit escalation",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (overrides SPCGUARD_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + detection pipeline)
    Serve {
        /// Bind address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Offline control chart analysis of a series
    Analyze {
        /// JSON array of numbers, or CSV/plain text with one value per line
        #[arg(long)]
        input: PathBuf,

        /// Upper specification limit
        #[arg(long)]
        usl: Option<f64>,

        /// Lower specification limit
        #[arg(long)]
        lsl: Option<f64>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Safety circuit snapshot from the database
    Status {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List recorded incidents, newest first
    Incidents {
        /// Only unresolved incidents
        #[arg(long)]
        unresolved: bool,

        /// Maximum number of incidents to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Resolve an incident (through the running daemon when there is one)
    Resolve {
        /// Incident id
        id: Uuid,

        /// Operator notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Approve or reject a yellow-zone action awaiting an operator (through
    /// the running daemon when there is one)
    Approve {
        /// Incident id
        id: Uuid,

        /// Approve the recommended action
        #[arg(long)]
        approve: bool,

        /// Reject the recommended action
        #[arg(long)]
        reject: bool,

        /// Operator notes
        #[arg(long)]
        notes: Option<String>,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(
                bind = %config.server.bind,
                sources = config.sources.len(),
                "Starting spcguard daemon"
            );
            spcguard::serve(config).await?;
        }
        Commands::Analyze {
            input,
            usl,
            lsl,
            json,
        } => {
            let values = read_series(&input)?;
            let limits = SpecLimits { usl, lsl };
            let report = SpcReport::analyze(&values, &limits);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Commands::Status { json } => {
            let (incidents, agents) = load_snapshot(&config).await?;
            let status = SafetyCircuitStatus::compute(&incidents, &agents, Utc::now());
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("\nSafety Circuit (last 24h)");
                println!("{:<22} : {}", "Green auto-actions", status.green_actions_24h);
                println!("{:<22} : {}", "Yellow pending", status.yellow_pending);
                println!("{:<22} : {}", "Red alerts", status.red_alerts_24h);
                println!("{:<22} : {}/{}", "Agents active", status.agents_active, status.agents_total);
                match &status.last_incident {
                    Some(i) => println!(
                        "{:<22} : {} {} on {} ({})",
                        "Last open incident", i.severity, i.incident_type, i.source_id, i.id
                    ),
                    None => println!("{:<22} : none", "Last open incident"),
                }
                println!();
            }
        }
        Commands::Incidents { unresolved, limit } => {
            let (incidents, _) = load_snapshot(&config).await?;
            let filter = IncidentFilter {
                resolved: unresolved.then_some(false),
                ..Default::default()
            };
            let shown: Vec<&Incident> = incidents
                .iter()
                .filter(|i| filter.matches(i))
                .take(limit)
                .collect();
            if shown.is_empty() {
                println!("No incidents found.");
            } else {
                println!(
                    "{:<36} | {:<8} | {:<6} | {:<16} | {:<28} | Source",
                    "Id", "Severity", "Zone", "Status", "Type"
                );
                println!(
                    "{:-<36}-|-{:-<8}-|-{:-<6}-|-{:-<16}-|-{:-<28}-|-{:-<12}",
                    "", "", "", "", "", ""
                );
                for i in shown {
                    let status = if i.resolved {
                        "resolved".to_string()
                    } else {
                        i.action_status.to_string()
                    };
                    println!(
                        "{:<36} | {:<8} | {:<6} | {:<16} | {:<28} | {}",
                        i.id.to_string(),
                        i.severity.as_str(),
                        i.action_zone.as_str(),
                        status,
                        i.incident_type,
                        i.source_id
                    );
                }
            }
        }
        Commands::Resolve { id, notes } => {
            let body = json!({ "notes": &notes });
            let incident = match post_to_daemon(&config, &format!("incidents/{id}/resolve"), &body).await? {
                Some(incident) => incident,
                None => {
                    with_manager(&config, |state| async move {
                        Ok(state.incidents.resolve_incident(id, notes, Utc::now()).await?)
                    })
                    .await?
                }
            };
            println!(
                "Incident {} resolved at {}.",
                incident.id,
                incident.resolved_at.unwrap_or_default().to_rfc3339()
            );
        }
        Commands::Approve {
            id,
            approve,
            reject,
            notes,
        } => {
            if approve == reject {
                bail!("exactly one of --approve or --reject is required");
            }
            let body = json!({ "approved": approve, "notes": &notes });
            let incident = match post_to_daemon(&config, &format!("incidents/{id}/approve"), &body).await? {
                Some(incident) => incident,
                None => {
                    with_manager(&config, |state| async move {
                        Ok(state.incidents.approve_incident(id, approve, notes).await?)
                    })
                    .await?
                }
            };
            println!("Incident {} is now {}.", incident.id, incident.action_status);
        }
    }

    Ok(())
}

/// Parse a series: a JSON array of numbers, or text with one value per line
/// (the last comma-separated field is used; non-numeric lines are skipped).
fn read_series(path: &Path) -> Result<Vec<f64>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if content.trim_start().starts_with('[') {
        return serde_json::from_str(&content)
            .with_context(|| format!("{} is not a JSON array of numbers", path.display()));
    }
    let values: Vec<f64> = content
        .lines()
        .filter_map(|line| line.rsplit(',').next())
        .filter_map(|field| field.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .collect();
    if values.is_empty() {
        bail!("no numeric values found in {}", path.display());
    }
    Ok(values)
}

fn print_report(report: &SpcReport) {
    let b = &report.baseline;
    println!("\nControl Chart ({} points)", b.sample_count);
    println!("{:<6} : {:.4}", "Mean", b.mean);
    println!("{:<6} : {:.4}", "Std", b.std);
    println!("{:<6} : {:.4} / {:.4} / {:.4}", "UCL", b.ucl1, b.ucl2, b.ucl3);
    println!("{:<6} : {:.4} / {:.4} / {:.4}", "LCL", b.lcl1, b.lcl2, b.lcl3);

    if report.violations.is_empty() {
        println!("\nNo rule violations.");
    } else {
        println!("\n{:<6} | {:<40} | {:<6} | Severity", "Index", "Rule", "Side");
        println!("{:-<6}-|-{:-<40}-|-{:-<6}-|-{:-<8}", "", "", "", "");
        for v in &report.violations {
            println!(
                "{:<6} | {:<40} | {:<6} | {}",
                v.index,
                v.rule.to_string(),
                v.side.to_string(),
                v.severity
            );
        }
    }

    match &report.capability {
        Some(c) => println!("\nCpk {:.3} ({})", c.cpk, c.rating),
        None => println!("\nCpk: n/a"),
    }
    println!();
}

async fn load_snapshot(config: &Config) -> Result<(Vec<Incident>, Vec<spcguard::detect::Agent>)> {
    let pool = storage::open_pool(&config.storage.db_path)?;
    tokio::task::spawn_blocking(move || -> Result<_> {
        let conn = pool.get()?;
        Ok((storage::load_incidents(&conn, None)?, storage::load_agents(&conn)?))
    })
    .await?
}

/// Base URL of the daemon's API as seen from this host.
fn daemon_url(config: &Config) -> Result<String> {
    let mut addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {:?}", config.server.bind))?;
    if addr.ip().is_unspecified() {
        match addr {
            SocketAddr::V4(_) => addr.set_ip(Ipv4Addr::LOCALHOST.into()),
            SocketAddr::V6(_) => addr.set_ip(Ipv6Addr::LOCALHOST.into()),
        }
    }
    Ok(format!("http://{addr}/api/v1"))
}

/// POST an operator action to the running daemon. `Ok(None)` means no daemon
/// is listening and the caller may act on the database directly.
async fn post_to_daemon(config: &Config, path: &str, body: &Value) -> Result<Option<Incident>> {
    let url = format!("{}/{}", daemon_url(config)?, path);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("failed to build HTTP client")?;

    let response = match client.post(&url).json(body).send().await {
        Ok(response) => response,
        Err(e) if e.is_connect() => {
            tracing::debug!(%url, error = %e, "no daemon listening, using the database directly");
            return Ok(None);
        }
        Err(e) => return Err(e).with_context(|| format!("request to {url} failed")),
    };

    let status = response.status();
    let reply: Value = response
        .json()
        .await
        .with_context(|| format!("daemon at {url} returned invalid JSON"))?;
    if !status.is_success() {
        let message = reply["error"]["message"].as_str().unwrap_or("request failed");
        bail!("{message} ({status})");
    }
    let incident = serde_json::from_value(reply["data"].clone()).context("unexpected daemon reply")?;
    Ok(Some(incident))
}

/// Restore the engine from the database, run one operator action and wait
/// for its changes to be written back. Only for when no daemon is running.
async fn with_manager<F, Fut>(config: &Config, action: F) -> Result<Incident>
where
    F: FnOnce(spcguard::api::state::AppState) -> Fut,
    Fut: std::future::Future<Output = Result<Incident>>,
{
    let pool = storage::open_pool(&config.storage.db_path)?;
    let (events, writer_rx) = event_channel(spcguard::EVENT_BUFFER);
    let state = spcguard::restore_state(Arc::new(config.clone()), pool.clone(), events).await?;
    let writer = storage::spawn_writer(pool, writer_rx);

    // The state holds the only senders; dropping it closes the writer.
    let result = action(state).await;
    writer.await?;
    result
}
