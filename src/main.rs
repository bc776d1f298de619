use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use dxgate::banner::{BannerInfo, print_banner, print_summary, stage_line};
use dxgate::config::ServiceConfig;
use dxgate::engine::fanout::FanOutEngine;
use dxgate::engine::{DiagnosisRequest, Engine};
use dxgate::events::EventBus;
use dxgate::history::sqlite::SqliteHistory;
use dxgate::history::{DiagnosisLog, spawn_recorder};
use dxgate::ingest::store::DiskStore;
use dxgate::ingest::{ImageIngestor, MimeType};
use dxgate::preprocess::Preprocessor;
use dxgate::present::present;
use dxgate::server::{self, AppState};

#[derive(Parser)]
#[command(
    name = "dxgate",
    version,
    about = "Fan a medical image out to several classifiers, get one ranked diagnosis."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file
    #[arg(short, long, env = "DXGATE_CONFIG", default_value = "dxgate.toml", global = true)]
    config: PathBuf,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server
    Serve {
        /// Address to listen on, overrides the config file
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Validate the configuration and load every stage
    Check,
    /// Diagnose one image file and print the result as JSON
    Diagnose {
        /// PNG or JPEG file
        image: PathBuf,

        /// Run only this stage (repeatable)
        #[arg(short, long = "stage")]
        stages: Vec<String>,

        /// MIME type, guessed from the extension when omitted
        #[arg(long)]
        mime: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut config = ServiceConfig::load(&cli.config)?;

    match cli.command {
        Command::Check => check(&config),
        Command::Diagnose {
            image,
            stages,
            mime,
        } => diagnose(&config, image, stages, mime).await,
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
                config.validate()?;
            }
            serve(config).await
        }
    }
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_engine(config: &ServiceConfig) -> anyhow::Result<FanOutEngine> {
    let registry = Arc::new(config.build_registry()?);
    let preprocessor = Preprocessor::new(config.preprocess.clone())?;
    let ingestor = ImageIngestor::new(config.ingest.max_upload_bytes);
    let mut engine = FanOutEngine::new(ingestor, preprocessor, registry);
    if let Some(dir) = &config.ingest.persist_dir {
        engine = engine.with_store(Arc::new(DiskStore::new(config.base_dir.join(dir))));
    }
    Ok(engine)
}

fn check(config: &ServiceConfig) -> anyhow::Result<()> {
    let engine = build_engine(config)?;
    for stage in engine.registry().descriptions() {
        println!("{}", stage_line(&stage));
    }
    println!("configuration ok: {} stage(s)", engine.registry().len());
    Ok(())
}

async fn diagnose(
    config: &ServiceConfig,
    image: PathBuf,
    stages: Vec<String>,
    mime: Option<String>,
) -> anyhow::Result<()> {
    let mime = match mime {
        Some(mime) => mime,
        None => match MimeType::from_path(&image) {
            Some(mime) => mime.as_str().to_string(),
            None => bail!(
                "cannot tell the image type of {}, pass --mime",
                image.display()
            ),
        },
    };
    let bytes = tokio::fs::read(&image)
        .await
        .with_context(|| format!("failed to read {}", image.display()))?;

    let mut request = DiagnosisRequest::new(bytes, mime);
    if !stages.is_empty() {
        request = request.with_stages(stages);
    }

    let engine = build_engine(config)?;
    let cancel = CancellationToken::new();
    // Ctrl+C cancels the request, not the process
    let result = tokio::select! {
        result = engine.diagnose(request, cancel.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            bail!("interrupted");
        }
    };

    println!("{}", present(&result).to_json_pretty()?);
    Ok(())
}

async fn serve(config: ServiceConfig) -> anyhow::Result<()> {
    let engine = build_engine(&config)?;
    let catalog = engine.registry().descriptions();

    let history_path = config.history_path();
    let history: Arc<dyn DiagnosisLog> =
        Arc::new(SqliteHistory::open(&history_path, config.history.max_entries)?);
    let bus = Arc::new(EventBus::default());
    let recorder = spawn_recorder(bus.subscribe(), Arc::clone(&history));
    let engine = engine.with_events(Arc::clone(&bus));

    let shutdown = CancellationToken::new();
    let state = AppState::new(Arc::new(engine), catalog.clone(), shutdown.clone())
        .with_history(history);
    let app = server::router(state.clone(), config.ingest.max_upload_bytes);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let history_label = if history_path == ":memory:" {
        "ephemeral"
    } else {
        &history_path
    };
    let persist_dir = config
        .ingest
        .persist_dir
        .as_ref()
        .map(|dir| config.base_dir.join(dir).display().to_string());
    print_banner(&BannerInfo {
        bind: &addr.to_string(),
        max_upload_bytes: config.ingest.max_upload_bytes,
        history: history_label,
        persist_dir: persist_dir.as_deref(),
        stages: &catalog,
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("shutting down");
                    shutdown.cancel();
                }
                Err(e) => tracing::warn!(error = %e, "cannot listen for Ctrl+C"),
            }
        }
    });

    server::serve(listener, app, shutdown).await?;

    // Last sender gone: the recorder drains and exits
    let (served, failed) = state.counts();
    drop(state);
    drop(bus);
    if let Err(e) = recorder.await {
        tracing::warn!(error = %e, "history recorder stopped abnormally");
    }

    print_summary(served, failed);
    Ok(())
}
