//! Routes and wiring for the apartment HTTP service.

use apartment_axum::{ApartmentApp, ApartmentAxumError, Tenanted};
use apartment_core::{
    ApartmentConfig, ApartmentConfigSnapshot, BrokerConfig, Connection, ConnectionBroker, Pool,
    Statement, Value,
};
use axum::routing::get;
use axum::Json;
use serde::Serialize;

pub const ENV_PREFIX: &str = "APARTMENT__";

#[derive(Debug, Serialize)]
pub struct TenantInfo {
    pub tenant: String,
    pub request_token: String,
    /// Schema the bound connection reports as current.
    pub database: Option<String>,
}

async fn current_tenant<P: Pool>(
    conn: Tenanted<P>,
) -> Result<Json<TenantInfo>, ApartmentAxumError> {
    let rows = conn.query(&Statement::new("SELECT DATABASE()")).await?;
    let database = rows
        .first()
        .and_then(|row| row.get_index(0))
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(Json(TenantInfo {
        tenant: conn.tenant().to_string(),
        request_token: conn.token().to_string(),
        database,
    }))
}

async fn ping<P: Pool>(conn: Tenanted<P>) -> Result<&'static str, ApartmentAxumError> {
    conn.lock().await?.ping().await?;
    Ok("pong")
}

async fn health() -> &'static str {
    "ok"
}

/// Load configuration from the process environment; `DSN` is accepted as a
/// fallback for `db.dsn`.
pub fn load_config() -> ApartmentConfig {
    let mut config = ApartmentConfig::from_env(ENV_PREFIX);
    if let Ok(dsn) = std::env::var("DSN") {
        config.set_default(apartment_sqlx::KEY_DSN, dsn);
    }
    config
}

pub fn build<P: Pool>(pool: P, snapshot: &ApartmentConfigSnapshot) -> ApartmentApp<P> {
    let broker = ConnectionBroker::with_config(pool, BrokerConfig::from_snapshot(snapshot));
    tracing::info!(config = ?broker.config(), "broker ready");
    ApartmentApp::new(broker)
        .route("/health", get(health))
        .tenant_route("/tenant", get(current_tenant::<P>))
        .tenant_route("/tenant/ping", get(ping::<P>))
}
