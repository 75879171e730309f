use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod db;
mod metrics;
mod models;
mod scoring;

use scoring::ModelBundle;

#[derive(Parser)]
#[command(name = "bank-clients-api")]
#[command(about = "Decision-support backend for the bank clients dashboard", long_about = None)]
struct Cli {
    /// Path to the fitted model artifact file
    #[arg(long, global = true, env = "MODEL_ARTIFACTS", default_value = "artifacts/models.json")]
    artifacts: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a small realistic client sample with precomputed predictions
    Seed,
    /// Import the reference client dataset from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Run the HTTP API
    Serve {
        #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:8000")]
        bind: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set to a Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let bundle = ModelBundle::load(&cli.artifacts)?;
            db::seed(&pool, &bundle).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let bundle = ModelBundle::load(&cli.artifacts)?;
            let inserted = db::import_csv(&pool, &bundle, &csv).await?;
            println!("Inserted {inserted} clients from {}.", csv.display());
        }
        Commands::Serve { bind } => {
            let bundle = ModelBundle::load(&cli.artifacts)?;
            let state = api::AppState::new(pool, bundle);
            let app = api::router(state);

            let listener = tokio::net::TcpListener::bind(bind)
                .await
                .with_context(|| format!("failed to bind {bind}"))?;
            info!("listening on http://{bind}");
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
