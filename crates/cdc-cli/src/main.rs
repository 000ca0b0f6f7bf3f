use anyhow::Context;
use cdc_config::{AppConfig, LoggingConfig};
use cdc_core::{read_event_lines, ClaimProcessor, Publisher, SessionCoordinator};
use cdc_kafka_connector::{KafkaConsumerGroup, KafkaProducer};
use cdc_opensearch_destination::OpenSearchIndex;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "cdc-cli")]
#[command(about = "CDC event indexer and bootstrap publisher", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume CDC events and index them, rejoining the group after every session
    Index {
        /// Path to configuration directory
        #[arg(short, long, default_value = "config")]
        config_dir: String,
    },

    /// Publish line-delimited events to the topic
    Publish {
        /// Path to configuration directory
        #[arg(short, long, default_value = "config")]
        config_dir: String,

        /// Events file, overrides producer.input_path
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Validate configuration files
    Validate {
        /// Path to configuration directory
        #[arg(short, long, default_value = "config")]
        config_dir: String,
    },
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let level = match logging.level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if logging.json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

async fn consume_and_index_events(app_config: AppConfig) -> anyhow::Result<()> {
    let index = OpenSearchIndex::new(app_config.opensearch.clone())
        .context("failed to init opensearch client")?;
    let group = KafkaConsumerGroup::new(app_config.kafka.clone())
        .context("failed to create consumer group")?;

    let processor = ClaimProcessor::new(Arc::new(index), app_config.opensearch.index.clone());
    let coordinator = SessionCoordinator::new(Arc::new(group), processor);

    info!(
        "Indexing '{}' into '{}' as group '{}'",
        app_config.kafka.topic, app_config.opensearch.index, app_config.kafka.group_id
    );
    coordinator
        .run()
        .await
        .context("failed to consume and index events")?;
    Ok(())
}

async fn publish_events(app_config: AppConfig, input: Option<PathBuf>) -> anyhow::Result<()> {
    let input = input.unwrap_or(app_config.producer.input_path);
    let events = read_event_lines(&input)
        .await
        .with_context(|| format!("failed to read stream input events from {}", input.display()))?;

    let producer = KafkaProducer::new(&app_config.kafka)?;
    let publisher = Publisher::new(Arc::new(producer), app_config.kafka.topic.clone());

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down async producer due to interrupt");
            signal.cancel();
        }
    });

    let summary = publisher
        .run(events, cancel)
        .await
        .context("failed to publish events to kafka")?;

    println!(
        "Published {} of {} events{}",
        summary.accepted,
        summary.total,
        if summary.cancelled { " (interrupted)" } else { "" }
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Index { config_dir } => {
            let app_config = AppConfig::load(&config_dir)?;
            init_tracing(&app_config.logging)?;
            info!("Starting CDC indexer with config directory: {}", config_dir);

            consume_and_index_events(app_config).await?;
        }

        Commands::Publish { config_dir, input } => {
            let app_config = AppConfig::load(&config_dir)?;
            init_tracing(&app_config.logging)?;

            publish_events(app_config, input).await?;
        }

        Commands::Validate { config_dir } => {
            let app_config = AppConfig::load(&config_dir)?;

            println!("✓ Configuration is valid\n");
            print!("{}", serde_yaml::to_string(&app_config)?);
        }
    }

    Ok(())
}
