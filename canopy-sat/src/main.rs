//! canopy-sat - Satellite Biomass Estimation Service
//!
//! HTTP service that orchestrates remote-sensing extraction jobs and turns
//! their output into persisted biomass/carbon estimates for monitoring
//! plots.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use canopy_common::config::{resolve_database_path, TomlConfig};
use canopy_sat::config::SatConfig;
use canopy_sat::AppState;

#[derive(Debug, Parser)]
#[command(name = "canopy-sat", about = "Satellite biomass estimation service")]
struct Args {
    /// HTTP listen port
    #[arg(long, env = "CANOPY_SAT_PORT", default_value_t = 5730)]
    port: u16,

    /// SQLite database path (overrides CANOPY_DATABASE and the config file)
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Starting canopy-sat (Satellite Biomass Estimation) service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let toml_config = TomlConfig::load()?;

    let db_path = resolve_database_path(args.database.as_deref(), &toml_config);
    info!("Database: {}", db_path.display());

    let db_pool = canopy_common::db::init_database(&db_path).await?;
    info!("Database connection established");

    let config = SatConfig::resolve(&db_pool, &toml_config).await?;
    info!("AppEEARS base URL: {}", config.base_url);

    let state = AppState::new(db_pool, config);
    let app = canopy_sat::build_router(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", args.port)).await?;
    info!("Listening on http://127.0.0.1:{}", args.port);
    info!("Health check: http://127.0.0.1:{}/health", args.port);

    axum::serve(listener, app).await?;

    Ok(())
}
