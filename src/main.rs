//! Command line driver for the lobby client
//!
//! Runs one matchmaking intent against an in-memory session service seeded
//! with sessions, streaming events as they happen.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use lobby_client::config::{AppConfig, MatchmakingConfig};
use lobby_client::types::{
    Attributes, MatchmakingEvent, OrderingPreference, TicketOutcome, BUCKET_ATTRIBUTE,
    PRIVATE_ATTRIBUTE, REGION_ATTRIBUTE,
};
use lobby_client::utils::parse_attributes;
use lobby_client::{InMemorySessionService, Matchmaker};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Lobby Client - find, join or create a multiplayer session
#[derive(Parser)]
#[command(
    name = "lobby-client",
    version,
    about = "Client-side session matchmaking against an in-memory session service"
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Path to configuration file (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Log level override
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    #[arg(short, long, help = "Enable debug mode with verbose logging")]
    debug: bool,

    #[arg(long, help = "Fail instead of creating a session when no candidate can be joined")]
    no_fallback_create: bool,

    #[arg(long, help = "Print events as JSON lines")]
    json: bool,

    #[arg(long, help = "Mark the local player ready once in a session")]
    ready: bool,

    #[arg(long, help = "Validate configuration and exit")]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Action>,
}

#[derive(Subcommand)]
enum Action {
    /// Search, join the best session, or create one
    QuickMatch {
        /// Search filter as key=value, repeatable
        #[arg(short, long = "attr", value_name = "KEY=VALUE")]
        attributes: Vec<String>,

        /// Sessions to seed in the in-memory service before searching
        #[arg(long, default_value_t = 3)]
        seed: u32,

        /// Prefer sessions in this region
        #[arg(long)]
        region: Option<String>,

        /// Leave the session once joined
        #[arg(long)]
        leave: bool,

        /// Print metrics when done
        #[arg(long)]
        metrics: bool,
    },
    /// Create and host a session
    Create {
        /// Session attribute as key=value, repeatable
        #[arg(short, long = "attr", value_name = "KEY=VALUE")]
        attributes: Vec<String>,

        #[arg(long)]
        capacity: Option<u32>,

        /// Hide the session from searches
        #[arg(long)]
        private: bool,

        /// Game server address to publish once the session exists
        #[arg(long, value_name = "HOST:PORT")]
        address: Option<String>,

        #[arg(long)]
        leave: bool,

        #[arg(long)]
        metrics: bool,
    },
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

fn display_banner(config: &AppConfig) {
    info!("Lobby Client");
    info!("   Service: {}", config.service.name);
    info!("   Log level: {}", config.service.log_level);
    info!(
        "   Fallback create: {}",
        config.matchmaking.allow_fallback_create
    );
    info!(
        "   Max search results: {}",
        config.matchmaking.max_search_results
    );
    info!(
        "   Join retries: {} (base backoff {}ms)",
        config.matchmaking.max_network_retries, config.matchmaking.network_retry_backoff_ms
    );
    info!("   Bucket: {}", config.matchmaking.default_bucket);
}

/// Load configuration and apply command line overrides
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::from_env()?,
    };

    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }

    if args.debug {
        config.service.log_level = "debug".to_string();
    }

    if args.no_fallback_create {
        config.matchmaking.allow_fallback_create = false;
    }

    lobby_client::config::validate_config(&config)?;
    Ok(config)
}

fn print_event(event: &MatchmakingEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        MatchmakingEvent::Transition(transition) => println!(
            "[{}] {} -> {} {:?}",
            transition.ticket_id, transition.from, transition.to, transition.reason
        ),
        MatchmakingEvent::Result(result) => match &result.outcome {
            TicketOutcome::InSession(session) => println!(
                "[{}] in session {} ({}/{}) at {}",
                result.ticket_id,
                session.id,
                session.player_count,
                session.capacity,
                session.host_address.as_deref().unwrap_or("unknown host")
            ),
            TicketOutcome::Failed(failure) => {
                println!("[{}] failed: {}", result.ticket_id, failure)
            }
        },
        MatchmakingEvent::RosterChanged(event) => println!(
            "[{}] session {} roster: {} members, {} ready",
            event.ticket_id,
            event.roster.session_id,
            event.roster.len(),
            event.roster.ready_count()
        ),
        MatchmakingEvent::SessionAddressUpdated(event) => println!(
            "[{}] session {} address: {}",
            event.ticket_id, event.session_id, event.address
        ),
        MatchmakingEvent::AllPlayersReady(event) => println!(
            "[{}] all {} players ready in {}",
            event.ticket_id,
            event.roster.len(),
            event.roster.session_id
        ),
    }
    Ok(())
}

/// Print events until the ticket's terminal result
async fn follow_ticket(
    events: &mut mpsc::UnboundedReceiver<MatchmakingEvent>,
    json: bool,
) -> Result<TicketOutcome> {
    while let Some(event) = events.recv().await {
        print_event(&event, json)?;
        if let MatchmakingEvent::Result(result) = event {
            return Ok(result.outcome);
        }
    }
    Err(anyhow!("Event stream closed before the ticket finished"))
}

fn drain_events(events: &mut mpsc::UnboundedReceiver<MatchmakingEvent>, json: bool) -> Result<()> {
    while let Ok(event) = events.try_recv() {
        print_event(&event, json)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args).unwrap_or_else(|e| {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    });

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    display_banner(&config);

    if args.dry_run {
        info!("Dry run completed - configuration is valid");
        return Ok(());
    }

    let action = args.command.unwrap_or(Action::QuickMatch {
        attributes: Vec::new(),
        seed: 3,
        region: None,
        leave: false,
        metrics: false,
    });

    let service = InMemorySessionService::new();
    let backend = Arc::new(service.connect("local-player"));
    let matchmaker = Matchmaker::new(backend, MatchmakingConfig::from(&config.matchmaking))?;
    let (_, mut events) = matchmaker.subscribe_channel();

    let (leave, show_metrics, address) = match action {
        Action::QuickMatch {
            attributes,
            seed,
            region,
            leave,
            metrics,
        } => {
            let filters = parse_attributes(&attributes)?;

            let mut seeded: Attributes = filters.clone();
            seeded
                .entry(BUCKET_ATTRIBUTE.to_string())
                .or_insert_with(|| config.matchmaking.default_bucket.clone().into());
            for index in 0..seed {
                let mut attributes = seeded.clone();
                if let Some(region) = &region {
                    if index % 2 == 0 {
                        attributes.insert(REGION_ATTRIBUTE.to_string(), region.clone().into());
                    }
                }
                let capacity = config.matchmaking.default_capacity;
                service.seed_session(attributes, 1 + index % capacity.max(1), capacity);
            }
            info!("Seeded {} sessions", seed);

            let mut ordering = Vec::new();
            if let Some(region) = region {
                ordering.push(OrderingPreference::RegionFirst(region));
            }
            ordering.push(OrderingPreference::MostPopulated);

            matchmaker
                .start_quick_match_ordered(filters, ordering)
                .await?;
            (leave, metrics, None)
        }
        Action::Create {
            attributes,
            capacity,
            private,
            address,
            leave,
            metrics,
        } => {
            let mut attributes = parse_attributes(&attributes)?;
            if private {
                attributes.insert(PRIVATE_ATTRIBUTE.to_string(), true.into());
            }
            matchmaker.create_session(attributes, capacity).await?;
            (leave, metrics, address)
        }
    };

    let outcome = follow_ticket(&mut events, args.json).await?;

    if let TicketOutcome::InSession(session) = &outcome {
        if let Some(address) = address {
            matchmaker.set_session_address(address).await?;
        }
        if args.ready {
            let roster = matchmaker.set_ready(true).await?;
            info!(
                "Ready in session {} ({}/{} ready)",
                session.id,
                roster.ready_count(),
                roster.len()
            );
        }
        drain_events(&mut events, args.json)?;
    }

    match outcome {
        TicketOutcome::InSession(_) if leave => {
            matchmaker.leave_current_session().await?.wait().await?;
            drain_events(&mut events, args.json)?;
        }
        TicketOutcome::InSession(_) => {}
        TicketOutcome::Failed(failure) => {
            warn!("Matchmaking failed: {}", failure);
            matchmaker.acknowledge_failure().await?;
            drain_events(&mut events, args.json)?;
        }
    }

    if show_metrics {
        print!("{}", matchmaker.metrics().gather_text()?);
    }

    matchmaker.shutdown().await?;
    info!("Lobby client stopped");
    Ok(())
}
