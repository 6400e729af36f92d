use anyhow::{Context, Result};
use apartment_axum::ServerConfig;
use apartment_sqlx::{SqlxOptions, KEY_DSN};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("APARTMENT_LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let snapshot = apartment_server::load_config().snapshot();
    let dsn = snapshot
        .get_string(KEY_DSN)
        .context("no database configured: set DSN or APARTMENT__DB__DSN")?;

    let pool = apartment_sqlx::connect(&dsn, &SqlxOptions::from_snapshot(&snapshot)).await?;
    let server = ServerConfig::from_snapshot(&snapshot);

    apartment_server::build(pool.clone(), &snapshot)
        .listen(&server)
        .await?;

    pool.shutdown().await;
    Ok(())
}
