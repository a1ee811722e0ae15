//! serverset - Service Registration, Discovery and Leader Election
//!
//! Operator tooling: configuration scaffolding and validation, plus a
//! simulation of the election protocol against the in-memory
//! coordination service.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use serverset::config::DiscoveryConfig;
use serverset::coordination::{MemoryCoordinator, MemorySession};
use serverset::discovery::{GroupMonitor, ServiceDiscovery, SingletonHandle};
use serverset::error::{Error, Result};
use serverset::instance::{Endpoint, ServiceInstance};
use serverset::state::LeadershipState;

/// Simulated candidates listen on consecutive ports from here
const BASE_PORT: u16 = 9000;
const MAX_CANDIDATES: i64 = 1000;

/// serverset - Service Registration, Discovery and Leader Election
#[derive(Parser)]
#[command(name = "serverset")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "serverset.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "serverset.toml")]
        output: PathBuf,

        /// Server set path
        #[arg(long, default_value = "/serverset/service")]
        path: String,
    },

    /// Validate configuration file
    Validate,

    /// Simulate an election against an in-memory coordination service
    Simulate {
        /// Number of contending processes
        #[arg(
            short = 'n',
            long,
            default_value_t = 3,
            value_parser = clap::value_parser!(u16).range(1..=MAX_CANDIDATES)
        )]
        candidates: u16,

        /// Number of leadership hand-overs to force
        #[arg(short, long, default_value_t = 3)]
        rounds: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Init { output, path } => run_init(output, path),
        Commands::Validate => run_validate(cli.config),
        Commands::Simulate { candidates, rounds } => {
            run_simulate(cli.config, candidates, rounds).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize configuration file
fn run_init(output: PathBuf, path: String) -> Result<()> {
    let config_content = format!(
        r#"# serverset Configuration
# Generated configuration file

[discovery]
serverset_path = "{path}"
candidate_prefix = "singleton_candidate_"
member_prefix = "member_"

[coordination]
session_timeout_ms = 4000
operation_timeout_ms = 5000

# Without credentials every created node is world-writable.
# [coordination.credentials]
# user = "service"
# secret = "changeme"

[retry]
initial_backoff_ms = 100
max_backoff_ms = 10000
max_attempts = 5

[logging]
level = "info"
"#
    );

    // Refuse to write something we could not load back
    DiscoveryConfig::from_str(&config_content)?;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to set the server set path and credentials.");
    println!("Then check it with: serverset --config {} validate", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match DiscoveryConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Server Set Path: {}", config.discovery.serverset_path);
            println!("  Member Prefix: {}", config.discovery.member_prefix);
            println!("  Candidate Prefix: {}", config.discovery.candidate_prefix);
            println!("  Session Timeout: {:?}", config.session_timeout());
            println!("  Operation Timeout: {:?}", config.operation_timeout());
            println!(
                "  Retry: {} attempts, {}ms..{}ms backoff",
                config.retry.max_attempts,
                config.retry.initial_backoff_ms,
                config.retry.max_backoff_ms
            );
            match config.credentials() {
                Some(credentials) => println!("  ACL: creator-only (digest user {})", credentials.user),
                None => println!("  ACL: open (no credentials configured)"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// One simulated process
struct Contender {
    name: String,
    instance: ServiceInstance,
    session: Arc<MemorySession>,
    handle: SingletonHandle,
}

/// Run candidates and a monitor against an in-memory service, forcing
/// leadership hand-overs by alternately resigning and expiring the leader
async fn run_simulate(config_path: PathBuf, candidates: u16, rounds: usize) -> Result<()> {
    let config = if config_path.exists() {
        DiscoveryConfig::from_file(&config_path)?
    } else {
        tracing::info!(
            "{} not found; simulating with default settings",
            config_path.display()
        );
        DiscoveryConfig::new("/serverset/simulation")
    };
    let settle = config.operation_timeout() * 2;
    let server = MemoryCoordinator::new();

    let observer = ServiceDiscovery::new(Arc::new(server.connect()), &config)?;
    let monitor = observer.group_monitor();
    monitor.start()?;

    let mut contenders = Vec::with_capacity(candidates as usize);
    for i in 0..candidates {
        let session = Arc::new(server.connect());
        let discovery = ServiceDiscovery::new(session.clone(), &config)?;
        let name = format!("candidate-{}", i);
        let instance = ServiceInstance::new(Endpoint::new(name.clone(), BASE_PORT + i));

        let label = name.clone();
        let handle = discovery
            .singleton_service()
            .lead(&instance, move |state: &LeadershipState| {
                println!("  {} -> {}", label, state);
            })
            .await?;
        contenders.push(Contender {
            name,
            instance,
            session,
            handle,
        });
    }

    let simulation = async {
        for round in 1..=rounds {
            let leader = await_leader(&contenders, settle).await?;
            let published = await_published(&monitor, &contenders[leader], settle).await?;
            println!(
                "Round {}: {} leads; server set publishes {:?}",
                round, contenders[leader].name, published
            );

            if round % 2 == 1 || contenders.len() == 1 {
                println!("Round {}: {} resigns", round, contenders[leader].name);
                let resigned = contenders.remove(leader);
                resigned.handle.close().await;
            } else {
                println!("Round {}: {} loses its session", round, contenders[leader].name);
                contenders[leader].session.expire_and_renew();
            }

            if contenders.is_empty() {
                println!("No candidates left");
                break;
            }
        }

        if !contenders.is_empty() {
            let leader = await_leader(&contenders, settle).await?;
            println!("Final leader: {}", contenders[leader].name);
        }
        Ok::<_, Error>(())
    };

    let outcome = tokio::select! {
        result = simulation => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            Ok(())
        }
    };

    for contender in &contenders {
        contender.handle.close().await;
    }
    monitor.close().await;
    outcome
}

/// Wait until exactly one contender leads and every other one knows it
async fn await_leader(contenders: &[Contender], timeout: Duration) -> Result<usize> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let states: Vec<LeadershipState> = contenders.iter().map(|c| c.handle.state()).collect();
        let leaders: Vec<usize> = (0..states.len()).filter(|&i| states[i].is_leader()).collect();
        let settled = states
            .iter()
            .all(|s| s.is_leader() || s.leader().is_some());

        if leaders.len() == 1 && settled {
            return Ok(leaders[0]);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::CoordinationUnavailable(format!(
                "no single leader within {:?}",
                timeout
            )));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the monitor shows only the leader's endpoint
async fn await_published(
    monitor: &GroupMonitor,
    leader: &Contender,
    timeout: Duration,
) -> Result<Vec<String>> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let published = monitor.get();
        if published == [leader.instance.clone()] {
            return Ok(published
                .iter()
                .map(|instance| instance.service_endpoint.to_string())
                .collect());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::CoordinationUnavailable(format!(
                "server set did not converge on {} within {:?}",
                leader.name, timeout
            )));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
