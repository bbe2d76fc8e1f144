use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mq_bridge::config::{self, BridgeConfig};
use mq_bridge::diagnostics::{log_troubleshooting_tips, Role};
use mq_bridge::transport::{AmqpTransport, InMemoryBroker, Transport};
use mq_bridge::{
    AsyncListener, BridgeError, ConnectionManager, Producer, ShutdownCoordinator, SyncConsumer,
};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "mq-bridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Send and receive messages on a broker queue")]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, env = "MQ_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    /// Use an in-process broker instead of AMQP
    #[arg(long)]
    in_memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send numbered test messages
    Produce {
        /// Number of messages (defaults to message_count from the configuration)
        #[arg(short = 'n', long)]
        count: Option<u32>,
    },
    /// Drain the queue, or take up to --count messages
    Consume {
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// Per-receive timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },
    /// Process messages as they arrive until interrupted
    Listen,
    /// Send numbered messages and drain them again on the same connection
    RoundTrip {
        #[arg(short = 'n', long)]
        count: Option<u32>,
    },
    /// Write a configuration file with default values
    InitConfig {
        #[arg(default_value = config::CONFIG_FILE_NAME)]
        path: PathBuf,
    },
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        let exit_code = match e.downcast_ref::<BridgeError>() {
            Some(BridgeError::ConnectionError { .. }) => 2,
            Some(_) => 3,
            None => 1,
        };
        std::process::exit(exit_code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::InitConfig { path } = &cli.command {
        return config::create_default_config_file(path);
    }

    let config = config::load_config(cli.config.as_deref())?;
    let transport: Arc<dyn Transport> = if cli.in_memory {
        info!("Using in-memory broker");
        Arc::new(InMemoryBroker::new())
    } else {
        Arc::new(AmqpTransport::new())
    };

    match cli.command {
        Commands::Produce { count } => {
            produce(&config, transport, count.unwrap_or(config.message_count)).await
        }
        Commands::Consume { count, timeout_ms } => {
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.receive_timeout());
            consume(&config, transport, count, timeout).await
        }
        Commands::Listen => listen(&config, transport).await,
        Commands::RoundTrip { count } => {
            round_trip(&config, transport, count.unwrap_or(config.message_count)).await
        }
        Commands::InitConfig { .. } => Ok(()),
    }
}

async fn connect(
    config: &BridgeConfig,
    transport: Arc<dyn Transport>,
    role: Role,
) -> Result<Arc<ConnectionManager>> {
    let manager = Arc::new(ConnectionManager::new(config.connection.clone(), transport));
    if let Err(e) = manager.connect().await {
        log_troubleshooting_tips(&config.connection, &config.queue, role);
        return Err(e.into());
    }
    Ok(manager)
}

async fn produce(config: &BridgeConfig, transport: Arc<dyn Transport>, count: u32) -> Result<()> {
    let manager = connect(config, transport, Role::Producer).await?;
    let coordinator = ShutdownCoordinator::new(manager.clone(), None);
    coordinator.install_stop_signal();

    let mut producer = Producer::new(manager);
    let outcome = tokio::select! {
        result = async {
            producer.initialize(&config.queue).await?;
            producer.send_batch(count).await
        } => Some(result),
        _ = coordinator.stop_requested() => None,
    };

    if let Err(e) = producer.close().await {
        warn!("{}", e);
    }
    coordinator.shutdown().await;

    let Some(outcome) = outcome else {
        info!("Interrupted after {} of {} messages", producer.sent_count(), count);
        return Ok(());
    };
    let summary = outcome.context("Producing messages failed")?;
    info!(
        "Produced {} messages to {} in {} ms",
        summary.count,
        config.queue,
        summary.elapsed.as_millis()
    );
    Ok(())
}

async fn consume(
    config: &BridgeConfig,
    transport: Arc<dyn Transport>,
    count: Option<u64>,
    timeout: Duration,
) -> Result<()> {
    let manager = connect(config, transport, Role::Consumer).await?;
    let coordinator = ShutdownCoordinator::new(manager.clone(), None);
    coordinator.install_stop_signal();

    let mut consumer = SyncConsumer::new(manager);
    let outcome = tokio::select! {
        result = async {
            consumer.initialize(&config.queue).await?;
            match count {
                Some(n) => consumer.receive_exactly(n, timeout).await,
                None => consumer.drain_until_timeout(timeout).await,
            }
        } => Some(result),
        _ = coordinator.stop_requested() => None,
    };

    if let Err(e) = consumer.close().await {
        warn!("{}", e);
    }
    coordinator.shutdown().await;

    let Some(outcome) = outcome else {
        info!("Interrupted while consuming from {}", config.queue);
        return Ok(());
    };
    let summary = outcome.context("Consuming messages failed")?;
    if let Some(cause) = &summary.interrupted {
        warn!("Stopped after {} messages: {}", summary.received, cause);
    }
    if summary.received == 0 {
        info!("No messages in queue {}", config.queue);
    }
    Ok(())
}

async fn listen(config: &BridgeConfig, transport: Arc<dyn Transport>) -> Result<()> {
    let manager = connect(config, transport, Role::Listener).await?;
    let listener = Arc::new(AsyncListener::new(config.queue.clone()));
    let coordinator = ShutdownCoordinator::new(manager.clone(), Some(listener.clone()));

    if let Err(e) = listener.initialize(&manager).await {
        coordinator.shutdown().await;
        return Err(e).context("Could not start the message listener");
    }
    coordinator.install_signal_handler();
    info!("Listening on {}. Press Ctrl+C to stop.", config.queue);

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;
    loop {
        tokio::select! {
            _ = coordinator.wait_closed() => break,
            _ = status.tick() => {
                info!("Still listening, {} messages processed", listener.message_count());
            }
        }
    }
    Ok(())
}

async fn round_trip(config: &BridgeConfig, transport: Arc<dyn Transport>, count: u32) -> Result<()> {
    let manager = connect(config, transport, Role::Producer).await?;
    let coordinator = ShutdownCoordinator::new(manager.clone(), None);
    coordinator.install_stop_signal();

    let mut producer = Producer::new(manager.clone());
    let mut consumer = SyncConsumer::new(manager);
    let outcome = tokio::select! {
        result = async {
            producer.initialize(&config.queue).await?;
            consumer.initialize(&config.queue).await?;
            producer.send_batch(count).await?;
            consumer.drain_until_timeout(config.receive_timeout()).await
        } => Some(result),
        _ = coordinator.stop_requested() => None,
    };

    if let Err(e) = producer.close().await {
        warn!("{}", e);
    }
    if let Err(e) = consumer.close().await {
        warn!("{}", e);
    }
    coordinator.shutdown().await;

    let Some(outcome) = outcome else {
        info!("Interrupted after sending {} of {} messages", producer.sent_count(), count);
        return Ok(());
    };
    let summary = outcome.context("Round trip failed")?;
    info!("Sent {} and received {} messages", count, summary.received);
    Ok(())
}
