use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use caetrack::{
    auth::jwt::JwtService, config::AppConfig, db, routes, s3::build_client, state::AppState,
    storage::S3Storage,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "api",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        s3_bucket = %config.s3_bucket,
        "loaded caetrack configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let s3_client = build_client(&config).await?;
    let storage = Arc::new(S3Storage::new(s3_client, config.s3_bucket.clone()));
    let jwt = JwtService::from_config(&config)?;

    let bind_addr = format!("{}:{}", config.server_host, config.server_port);
    let state = AppState::new(pool, config, storage, jwt);
    let router = routes::create_router(state);

    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!(address = %bind_addr, "caetrack API listening");
    axum::serve(listener, router).await?;

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
