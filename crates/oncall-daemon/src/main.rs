//! On-call daemon
//!
//! `serve` runs the escalation ticker and the notification router until
//! interrupted. The other subcommands are one-shot operations against the
//! same database.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use config::DaemonConfig;
use oncall::audit::AuditLog;
use oncall::clock::{Clock, SharedClock, SystemClock};
use oncall::escalation::{EscalationEngine, EscalationTicker};
use oncall::events::{EventBus, EventFilter, SharedEventBus};
use oncall::resolver::{resolve, ResolverCache, Scope};
use oncall::router::{AdapterRegistry, LogAdapter, NotificationRouter, WebhookAdapter};
use oncall::store::{Channel, Fixture, Priority, SharedStore, Store};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "On-call escalation and notification daemon", long_about = None)]
struct Args {
    /// TOML config file; `ONCALL_*` environment variables override it
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Database path (overrides config and ONCALL_DATABASE)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the escalation ticker and router workers until Ctrl-C
    Serve {
        /// Only log events for this incident
        #[arg(long)]
        incident: Option<String>,
        /// Only log these event types, comma separated
        #[arg(long, value_delimiter = ',')]
        events: Vec<String>,
    },

    /// Import schedules, policies and preferences from a YAML fixture
    Import { path: PathBuf },

    /// Show who is on call for a scheduler or group
    Who {
        #[arg(long, conflicts_with = "group", required_unless_present = "group")]
        scheduler: Option<String>,
        #[arg(long)]
        group: Option<String>,
        /// RFC 3339 instant, defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Create an incident and start its escalation
    Trigger {
        #[arg(long)]
        group: String,
        #[arg(long)]
        policy: Option<String>,
        #[arg(long, default_value = "high")]
        priority: Priority,
        title: String,
    },

    /// Acknowledge an incident
    Ack {
        incident: String,
        #[arg(long)]
        user: String,
    },

    /// Resolve an incident
    Resolve {
        incident: String,
        #[arg(long)]
        user: String,
    },

    /// Run one escalation timeout pass
    Tick,

    /// Print an incident's escalation and delivery history
    Trail {
        incident: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = DaemonConfig::load(args.config.as_deref()).context("Failed to load config")?;
    if let Some(database) = args.database {
        config.database_path = database;
    }
    init_tracing(args.json_logs || config.log_json);

    let store = Store::open(&config.database_path)
        .with_context(|| format!("Failed to open {}", config.database_path.display()))?
        .shared();
    let clock: SharedClock = Arc::new(SystemClock);
    debug!(database = %config.database_path.display(), "Store opened");

    match args.command {
        Command::Serve { incident, events } => {
            let filter = event_filter(incident.as_deref(), &events);
            serve(config, store, clock, filter).await
        }
        Command::Import { path } => {
            let fixture = Fixture::from_path(&path)
                .with_context(|| format!("Failed to read fixture {}", path.display()))?;
            let summary = fixture.import(&store, clock.now()).context("Import failed")?;
            print_json(&summary)
        }
        Command::Who {
            scheduler,
            group,
            at,
        } => {
            let scope = match (scheduler, group) {
                (Some(id), _) => Scope::Scheduler(id),
                (None, Some(id)) => Scope::Group(id),
                (None, None) => anyhow::bail!("either --scheduler or --group is required"),
            };
            let at = at.unwrap_or_else(|| clock.now());
            match resolve(store.as_ref(), &scope, at)? {
                Some(assignment) => print_json(&assignment),
                None => {
                    println!("nobody on call for {} at {}", scope, at);
                    Ok(())
                }
            }
        }
        Command::Trigger {
            group,
            policy,
            priority,
            title,
        } => {
            let engine = EscalationEngine::with_config(store, clock, config.escalation);
            let (incident, outcome) = engine
                .create_incident(&group, policy.as_deref(), &title, priority)
                .context("Failed to create incident")?;
            print_json(&serde_json::json!({ "incident": incident, "outcome": outcome }))
        }
        Command::Ack { incident, user } => {
            let engine = EscalationEngine::with_config(store, clock, config.escalation);
            print_json(&engine.acknowledge(&incident, &user)?)
        }
        Command::Resolve { incident, user } => {
            let engine = EscalationEngine::with_config(store, clock, config.escalation);
            print_json(&engine.resolve_incident(&incident, &user)?)
        }
        Command::Tick => {
            let engine = EscalationEngine::with_config(store, clock, config.escalation);
            print_json(&engine.tick()?)
        }
        Command::Trail { incident, json } => {
            let trail = AuditLog::new(store)
                .incident_trail(&incident)?
                .with_context(|| format!("Incident {} not found", incident))?;
            if json {
                return print_json(&serde_json::json!({
                    "trail": trail,
                    "summary": trail.summary(),
                }));
            }
            println!(
                "{} [{}] {} status={} escalation={}",
                trail.incident.id,
                trail.incident.priority,
                trail.incident.title,
                trail.incident.status,
                trail.incident.escalation_status
            );
            for entry in trail.timeline() {
                println!("  {}  {}", entry.at().to_rfc3339(), entry.describe());
            }
            print_json(&trail.summary())
        }
    }
}

async fn serve(
    config: DaemonConfig,
    store: SharedStore,
    clock: SharedClock,
    filter: EventFilter,
) -> Result<()> {
    let adapters = adapters(&config)?;
    let bus = EventBus::new().shared();
    let cancel = CancellationToken::new();
    let events = tokio::spawn(log_events(Arc::clone(&bus), filter, cancel.clone()));

    let engine = Arc::new(
        EscalationEngine::with_config(Arc::clone(&store), Arc::clone(&clock), config.escalation)
            .with_events(Arc::clone(&bus))
            .with_resolver_cache(Arc::new(ResolverCache::default())),
    );
    let router = Arc::new(
        NotificationRouter::new(store, clock, adapters, config.router).with_events(bus),
    );
    let ticker = EscalationTicker::new(engine, Duration::from_secs(config.tick_interval_secs.max(1)));

    info!(
        database = %config.database_path.display(),
        workers = router.config().worker_count,
        tick_secs = config.tick_interval_secs,
        "On-call daemon starting"
    );
    let ticker_task = tokio::spawn(ticker.run(cancel.clone()));
    let router_task = tokio::spawn(Arc::clone(&router).run(cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    cancel.cancel();

    let (passes, stats, _) = futures::join!(ticker_task, router_task, events);
    let passes = passes.context("Ticker task failed")?;
    let stats = stats.context("Router task failed")?;
    info!(
        passes,
        sent = stats.sent,
        skipped = stats.skipped,
        failed = stats.failed,
        "On-call daemon stopped"
    );
    Ok(())
}

fn adapters(config: &DaemonConfig) -> Result<AdapterRegistry> {
    let mut registry = AdapterRegistry::uniform(Arc::new(LogAdapter));
    let timeout = Duration::from_secs(config.webhooks.timeout_secs.max(1));
    for channel in Channel::all() {
        if let Some(endpoint) = config.webhooks.endpoint(*channel) {
            let adapter = WebhookAdapter::new(endpoint, timeout)
                .with_context(|| format!("Failed to build {} webhook", channel))?;
            info!(channel = %channel, endpoint, "Webhook adapter registered");
            registry.register(*channel, Arc::new(adapter));
        }
    }
    Ok(registry)
}

fn event_filter(incident: Option<&str>, events: &[String]) -> EventFilter {
    let mut filter = EventFilter::new();
    if let Some(incident) = incident {
        filter = filter.incident(incident);
    }
    if !events.is_empty() {
        filter = filter.types(events.iter().map(String::as_str).collect());
    }
    filter
}

async fn log_events(bus: SharedEventBus, filter: EventFilter, cancel: CancellationToken) {
    let mut rx = bus.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) if filter.matches(&event) => info!(
                    event_type = event.event_type(),
                    incident_id = event.incident_id(),
                    "{}",
                    serde_json::to_string(&event).unwrap_or_default()
                ),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "Event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use oncall::events::OnCallEvent;

    fn acked(incident: &str) -> OnCallEvent {
        OnCallEvent::IncidentAcknowledged {
            incident_id: incident.into(),
            user_id: "alice".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_serve_event_filter_args() {
        let args = Args::parse_from([
            "oncall-daemon",
            "serve",
            "--incident",
            "inc-1",
            "--events",
            "incident_acknowledged,incident_resolved",
        ]);
        let Command::Serve { incident, events } = args.command else {
            panic!("expected serve");
        };
        let filter = event_filter(incident.as_deref(), &events);
        assert!(filter.matches(&acked("inc-1")));
        assert!(!filter.matches(&acked("inc-2")));

        let everything = event_filter(None, &[]);
        assert!(everything.matches(&acked("inc-2")));
    }
}
