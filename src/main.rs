use clap::Parser;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use harambee_core::adapters::PostgresDonationRepository;
use harambee_core::cli::{Cli, Commands, DbCommands};
use harambee_core::config::Config;
use harambee_core::mpesa::MpesaClient;
use harambee_core::ports::LogNotifier;
use harambee_core::services::{DonationEngine, EngineSettings};
use harambee_core::{create_app, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Db(DbCommands::Migrate) => {
            let pool = connect(&config).await?;
            run_migrations(&pool).await?;
            Ok(())
        }
        Commands::Config => validate_config(config).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let pool = connect(&config).await?;
    run_migrations(&pool).await?;

    let engine = build_engine(&config, pool);
    let app = create_app(AppState {
        engine: Arc::new(engine),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

fn build_engine(config: &Config, pool: PgPool) -> DonationEngine {
    let gateway = if config.mpesa.mock_mode {
        tracing::warn!("M-Pesa mock mode enabled: no live provider calls will be made");
        None
    } else {
        tracing::info!("M-Pesa client initialized for {}", config.mpesa.base_url);
        Some(Arc::new(MpesaClient::new(config.mpesa.clone())))
    };

    DonationEngine::new(
        Arc::new(PostgresDonationRepository::new(pool)),
        Arc::new(LogNotifier),
        gateway,
        EngineSettings::from_config(&config.mpesa),
    )
}

async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    Ok(pool)
}

async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    let migrator = Migrator::new(Path::new("./migrations")).await?;
    migrator.run(pool).await?;
    tracing::info!("database migrations completed");
    Ok(())
}

async fn validate_config(config: Config) -> anyhow::Result<()> {
    println!("server port:       {}", config.server_port);
    println!("provider base URL: {}", config.mpesa.base_url);
    println!("callback URL:      {}", config.mpesa.callback_url);
    println!("timeout URL:       {}", config.mpesa.timeout_url);
    println!("mock mode:         {}", config.mpesa.mock_mode);
    println!("stale after:       {}s", config.mpesa.stale_after_secs);

    if config.mpesa.mock_mode {
        println!("mock mode is on, skipping credential check");
        return Ok(());
    }

    let client = MpesaClient::new(config.mpesa);
    match client.access_token().await {
        Ok(token) => {
            let preview: String = token.chars().take(10).collect();
            println!("credential check:  OK (token {preview}...)");
            Ok(())
        }
        Err(err) => anyhow::bail!("credential check failed: {err}"),
    }
}
