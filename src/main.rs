//! RouteMQ - clustered MQTT v3.1.1 broker
//!
//! Usage:
//!   routemq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>       Configuration file path
//!   -b, --bind <ADDR>         Bind address (default: 0.0.0.0:1883)
//!   -w, --workers <N>         Number of dispatch workers (default: CPU count)
//!   --cluster-bind <ADDR>     Cluster listener address (enables clustering)
//!   --node-id <ID>            Cluster node identity (default: hostname)
//!   -l, --log-level           Log level (error, warn, info, debug, trace)
//!   -h, --help                Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use routemq::acl::AclProvider;
use routemq::admin::AdminServer;
use routemq::auth::AuthProvider;
use routemq::broker::Broker;
use routemq::config::Config;
use routemq::delivery::LogSink;
use routemq::hooks::CompositeAuthorizer;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// RouteMQ - clustered MQTT broker
#[derive(Parser, Debug)]
#[command(name = "routemq")]
#[command(author = "RouteMQ Contributors")]
#[command(version)]
#[command(about = "Clustered MQTT v3.1.1 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Number of dispatch workers (0 = auto)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Cluster listener address; enables clustering
    #[arg(long)]
    cluster_bind: Option<SocketAddr>,

    /// Cluster node identity
    #[arg(long)]
    node_id: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Defaults, then file, then ROUTEMQ__* env overrides
    let mut config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    }
    .unwrap_or_else(|e| {
        eprintln!("Error loading configuration: {}", e);
        std::process::exit(1);
    });

    // CLI overrides config, RUST_LOG overrides both
    let level = args
        .log_level
        .map(|l| l.as_str().to_string())
        .unwrap_or_else(|| config.log.level.to_lowercase());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(workers) = args.workers {
        config.server.workers = workers;
    }
    if let Some(cluster_bind) = args.cluster_bind {
        config.cluster.enabled = true;
        config.cluster.bind = cluster_bind;
    }
    if let Some(node_id) = args.node_id {
        config.cluster.node_id = Some(node_id);
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let broker_config = config.broker_config();

    info!("Starting RouteMQ MQTT Broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    info!("  Workers: {}", broker_config.workers);
    info!("  Max connections: {}", broker_config.max_connections);
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);

    if config.auth.enabled {
        info!(
            "  Authentication: enabled ({} users configured)",
            config.auth.users.len()
        );
    } else {
        info!("  Authentication: disabled");
    }
    if config.acl.enabled {
        info!("  ACL: enabled ({} roles configured)", config.acl.roles.len());
    } else {
        info!("  ACL: disabled");
    }
    if config.cluster.enabled {
        info!(
            "  Cluster: enabled (node={}, bind={}, {} peers)",
            broker_config.node_id,
            config.cluster.bind,
            config.cluster.peers.len()
        );
    } else {
        info!("  Cluster: disabled");
    }

    // Auth first, then ACL
    let auth_provider = Arc::new(AuthProvider::new(&config.auth));
    let acl_provider = Arc::new(AclProvider::new(&config.acl, auth_provider.clone()));
    let authorizer = Arc::new(
        CompositeAuthorizer::new()
            .with(auth_provider)
            .with(acl_provider),
    );

    let broker = Broker::with_hooks(broker_config, authorizer, Arc::new(LogSink));

    if config.http.enabled {
        info!("  Admin API: enabled (http://{})", config.http.bind);
        let admin = AdminServer::new(broker.clone(), config.http.bind);
        tokio::spawn(async move {
            if let Err(e) = admin.run().await {
                error!("Admin server error: {}", e);
            }
        });
    } else {
        info!("  Admin API: disabled");
    }

    let runner = broker.clone();
    tokio::select! {
        result = runner.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C");
            broker.shutdown().await;
        }
    }

    Ok(())
}
