//! Image-task worker entry point

use imagetask_worker::config::{ClassifierSection, WorkerConfig};
use imagetask_worker::dispatcher::WorkerLifecycle;
use imagetask_worker::executor::openai::{OpenAiImageExecutor, OpenAiImageExecutorConfig};
use imagetask_worker::executor::ImageExecutor;
use imagetask_worker::idempotency::{
    IdempotencyStore, InMemoryIdempotencyStore, SqliteIdempotencyStore,
};
use imagetask_worker::llm::providers::{OpenAiConfig, OpenAiProvider};
use imagetask_worker::observability::{health::HealthServer, init_default_logging, metrics::metrics};
use imagetask_worker::protocol::ImageTaskRequest;
use imagetask_worker::resolution::{index_request, resolve, FallbackClassifier};
use imagetask_worker::storage::{ImageStore, LocalImageStore};
use imagetask_worker::transport::mqtt::MqttClient;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::{signal, time::sleep};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "imagetask-worker")]
#[command(about = "Idempotent image-task dispatch worker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume requests until SIGINT/SIGTERM
    Run {
        /// Keep idempotency records in memory instead of SQLite
        #[arg(long)]
        ephemeral: bool,
    },
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Resolve a request JSON file and print the operation descriptor
    Resolve {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 && std::env::var("LOG_LEVEL").is_err() {
        let level = if cli.verbose > 1 { "trace" } else { "debug" };
        std::env::set_var("LOG_LEVEL", level);
    }
    init_default_logging();

    info!(
        "Starting imagetask-worker v{}",
        env!("CARGO_PKG_VERSION")
    );

    let result = match cli.command {
        Commands::Resolve { file } => handle_resolve_command(&file),
        Commands::Run { ephemeral } => match load_configuration(&cli.config) {
            Ok(config) => run_worker(config, ephemeral).await,
            Err(e) => Err(e),
        },
        Commands::Config { show } => match load_configuration(&cli.config) {
            Ok(config) => handle_config_command(config, show),
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<WorkerConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(WorkerConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["worker.toml", "config/worker.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(WorkerConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config or create worker.toml".into())
        }
    }
}

async fn run_worker(config: WorkerConfig, ephemeral: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Worker starting with ID: {}", config.worker.id);

    let collector = metrics();
    collector.set_worker_state("initializing");

    let mut worker = build_worker(config.clone(), ephemeral)?;

    let health_port = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let health_server = Arc::new(HealthServer::new(config.worker.id.clone(), health_port));
    let health_server_clone = health_server.clone();

    tokio::spawn(async move {
        if let Err(e) = health_server_clone.start().await {
            error!("Health server error: {}", e);
        }
    });

    worker.set_health_server(health_server.clone());
    worker.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!(
        topic = %config.mqtt.request_topic,
        "Worker is running and waiting for requests"
    );

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = monitor_connection_health(&worker) => {
            error!("MQTT connection permanently lost, shutting down worker...");
            health_server.set_mqtt_connected(false);
        }
    }

    info!("Application shutdown initiated");
    if let Err(e) = worker.shutdown().await {
        error!("Error during shutdown: {}", e);
        collector.set_worker_state("error");
        return Err(e.into());
    }

    Ok(())
}

/// Builds the idempotency store named by configuration
struct IdempotencyFactory;

impl IdempotencyFactory {
    fn create_store(
        config: &WorkerConfig,
        ephemeral: bool,
    ) -> Result<Arc<dyn IdempotencyStore>, Box<dyn std::error::Error>> {
        if ephemeral {
            warn!("Using in-memory idempotency store; duplicates are only detected until restart");
            return Ok(Arc::new(InMemoryIdempotencyStore::new()));
        }

        if let Some(parent) = config.idempotency.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!(path = %config.idempotency.path.display(), "Opening idempotency store");
        Ok(Arc::new(SqliteIdempotencyStore::open(&config.idempotency.path)?))
    }
}

/// Builds the image executor and result store
struct ExecutorFactory;

impl ExecutorFactory {
    fn create_executor(
        config: &WorkerConfig,
    ) -> Result<Arc<dyn ImageExecutor>, Box<dyn std::error::Error>> {
        let executor = OpenAiImageExecutor::new(OpenAiImageExecutorConfig {
            api_key: config.get_executor_api_key()?,
            base_url: config.executor.base_url.clone(),
            model: config.executor.image_model.clone(),
            size: config.executor.size.clone(),
            timeout: Duration::from_secs(config.executor.timeout_secs),
            style_transfer_url: config.executor.style_transfer_url.clone(),
        })?;
        Ok(Arc::new(executor))
    }

    fn create_store(config: &WorkerConfig) -> Arc<dyn ImageStore> {
        Arc::new(LocalImageStore::new(
            config.storage.root.clone(),
            config.storage.prefix.clone(),
        ))
    }
}

/// Builds the optional fallback classifier
struct ClassifierFactory;

impl ClassifierFactory {
    fn create_classifier(
        config: &WorkerConfig,
    ) -> Result<Option<FallbackClassifier>, Box<dyn std::error::Error>> {
        let (Some(section), Some(api_key)) = (&config.classifier, config.get_classifier_api_key())
        else {
            return Ok(None);
        };

        match section.provider.as_str() {
            "openai" => {
                let provider = OpenAiProvider::new(Self::openai_config(section, api_key?))?;
                info!(model = %section.model, "Fallback classifier enabled");
                Ok(Some(
                    FallbackClassifier::new(Arc::new(provider), section.model.clone())
                        .with_temperature(section.temperature),
                ))
            }
            provider => Err(format!("Unsupported classifier provider: {provider}").into()),
        }
    }

    fn openai_config(section: &ClassifierSection, api_key: String) -> OpenAiConfig {
        let mut openai = OpenAiConfig {
            api_key,
            ..Default::default()
        };
        if let Some(base_url) = &section.base_url {
            openai.base_url = base_url.clone();
        }
        openai
    }
}

/// Wire the worker with its injected dependencies
fn build_worker(
    config: WorkerConfig,
    ephemeral: bool,
) -> Result<WorkerLifecycle<MqttClient>, Box<dyn std::error::Error>> {
    let transport = MqttClient::new(
        &config.worker.id,
        config.mqtt.clone(),
        u16::try_from(config.worker.concurrency).unwrap_or(u16::MAX),
    )?;
    let idempotency = IdempotencyFactory::create_store(&config, ephemeral)?;
    let executor = ExecutorFactory::create_executor(&config)?;
    let image_store = ExecutorFactory::create_store(&config);
    let classifier = ClassifierFactory::create_classifier(&config)?;

    let mut worker = WorkerLifecycle::new(config, transport, idempotency, executor, image_store);
    if let Some(classifier) = classifier {
        worker = worker.with_classifier(classifier);
    }
    Ok(worker)
}

fn handle_config_command(config: WorkerConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

/// Print the descriptor the rule cascade produces, without the classifier
fn handle_resolve_command(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let payload = std::fs::read(file)?;
    let request = ImageTaskRequest::from_slice(&payload)?;
    let index = index_request(&request);
    let descriptor = resolve(&request, &index)?;

    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(())
}

/// Resolves once the transport has given up reconnecting
async fn monitor_connection_health<T>(worker: &WorkerLifecycle<T>)
where
    T: imagetask_worker::transport::Transport,
{
    loop {
        if worker.is_permanently_disconnected() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
}
