//! apartment-axum: Axum adapter for apartment.
//!
//! Puts the broker's bind/run/release lifecycle around axum routes and hands
//! handlers the bound connection.
//!
//! ```rust,no_run
//! use apartment_axum::{ApartmentApp, ServerConfig, Tenanted};
//! use apartment_core::{ConnectionBroker, MemoryPool, Statement, Value};
//! use axum::routing::get;
//!
//! async fn current_tenant(conn: Tenanted<MemoryPool>) -> Result<String, apartment_axum::ApartmentAxumError> {
//!     let rows = conn.query(&Statement::new("SELECT DATABASE()")).await?;
//!     Ok(rows
//!         .first()
//!         .and_then(|row| row.get_index(0))
//!         .and_then(Value::as_str)
//!         .unwrap_or_default()
//!         .to_string())
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let app = ApartmentApp::new(ConnectionBroker::new(MemoryPool::new(10)))
//!     .tenant_route("/tenant", get(current_tenant));
//! app.listen(&ServerConfig::default()).await
//! # }
//! ```

pub mod app;
pub mod config;
mod error;
pub mod extract;
pub mod middleware;

pub use app::{serve, ApartmentApp, BrokerState};
pub use config::ServerConfig;
pub use error::{ApartmentAxumError, ErrorKind};
pub use extract::{Scope, Tenanted};
pub use middleware::{bind_tenant, HeaderMetadata};
