//! Command line client for a persistent MQTT session

use courier_mqtt::auth::{Authenticator, HttpAuthenticator, StaticAuthenticator};
use courier_mqtt::config::CourierConfig;
use courier_mqtt::event::{CourierEvent, CourierEventKind, EventHandler};
use courier_mqtt::message::QoS;
use courier_mqtt::observability::{init_default_logging, MetricsCollector};
use courier_mqtt::session::SessionManager;
use courier_mqtt::store::{open_database, temporary_database};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Persistent-session MQTT client")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, subscribe to the configured topics and print incoming messages
    Run,
    /// Publish a single message and wait for the broker to accept it
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long, default_value_t = 1)]
        qos: u8,
        #[arg(short, long)]
        message: String,
        /// Seconds to wait for the connection and the acknowledgement
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting courier v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_client(config).await,
        Commands::Publish {
            topic,
            qos,
            message,
            wait_secs,
        } => publish_once(config, &topic, qos, message, Duration::from_secs(wait_secs)).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> CliResult<CourierConfig> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(CourierConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["courier.toml", "config/courier.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(CourierConfig::load_from_file(&path)?);
                }
            }
            Err("No configuration file found. Provide one with -c/--config or create courier.toml".into())
        }
    }
}

fn build_authenticator(config: &CourierConfig) -> CliResult<Arc<dyn Authenticator>> {
    Ok(match &config.auth.http {
        Some(http) => Arc::new(HttpAuthenticator::new(&config.client.id, http)?),
        None => Arc::new(StaticAuthenticator::from_config(config)?),
    })
}

/// Forwards every event kind to a channel the command waits on
struct EventForwarder(mpsc::UnboundedSender<CourierEventKind>);

impl EventHandler for EventForwarder {
    fn on_event(&self, event: &CourierEvent) {
        let _ = self.0.send(event.kind.clone());
    }
}

fn build_session(
    config: &CourierConfig,
) -> CliResult<(SessionManager, mpsc::UnboundedReceiver<CourierEventKind>)> {
    let db = match &config.persistence.path {
        Some(path) => open_database(path)?,
        None => temporary_database()?,
    };
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let session = SessionManager::builder(build_authenticator(config)?)
        .config(config.session_config())
        .transport_settings(config.transport_settings())
        .database(db)
        .event_handler(Arc::new(EventForwarder(events_tx)))
        .build()?;
    Ok((session, events_rx))
}

async fn run_client(config: CourierConfig) -> CliResult<()> {
    info!("Client starting with id: {}", config.client.id);

    let (session, mut events) = build_session(&config)?;
    let collector = Arc::new(MetricsCollector::new());
    session.add_event_handler(collector.clone());

    session.connect();
    session.subscribe(config.initial_subscriptions())?;

    let mut stream = session.receive_bytes("#")?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Client is running, waiting for messages");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            message = stream.recv_with_topic() => match message {
                Some((topic, payload)) => {
                    println!("{topic}\t{}", String::from_utf8_lossy(&payload));
                }
                None => {
                    warn!("Message stream closed");
                    break;
                }
            },
            Some(kind) = events.recv() => {
                if let CourierEventKind::AuthFailure { error, .. } = kind {
                    warn!(error = %error, "Authentication failed");
                }
            }
        }
    }

    stream.cancel();
    session.disconnect();
    session.sync().await;

    let snapshot = collector.snapshot();
    info!(
        received = snapshot.messages.messages_received,
        connections = snapshot.connection.connections_established,
        "Session summary"
    );
    Ok(())
}

async fn publish_once(
    config: CourierConfig,
    topic: &str,
    qos: u8,
    message: String,
    wait: Duration,
) -> CliResult<()> {
    let qos = QoS::try_from(qos).map_err(|_| format!("invalid QoS level: {qos}"))?;
    let (session, mut events) = build_session(&config)?;

    session.connect();
    let connected = timeout(wait, async {
        while let Some(kind) = events.recv().await {
            if matches!(kind, CourierEventKind::ConnectionSuccess { .. }) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    if !connected {
        session.disconnect();
        return Err("Timed out waiting for the broker connection".into());
    }

    session.publish_bytes(topic, message.into_bytes(), qos)?;

    let outcome = timeout(wait, async {
        while let Some(kind) = events.recv().await {
            match kind {
                CourierEventKind::MessageSendSuccess { .. } => return Ok(()),
                CourierEventKind::MessageSendFailure { error, .. } => return Err(error),
                _ => {}
            }
        }
        Err("event stream closed".to_string())
    })
    .await;

    session.disconnect();
    session.sync().await;

    match outcome {
        Ok(Ok(())) => {
            info!(topic = %topic, "Message published");
            Ok(())
        }
        Ok(Err(e)) => Err(format!("Publish failed: {e}").into()),
        Err(_) => Err("Timed out waiting for the publish acknowledgement".into()),
    }
}

fn handle_config_command(config: &CourierConfig, show: bool) -> CliResult<()> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
