//! apartment-core: request-affine tenant connection binding.
//!
//! Every inbound request gets exactly one database connection, switched to
//! the request's tenant, registered under a fresh [`RequestToken`] and handed
//! back to the pool exactly once when the request ends. Code anywhere in the
//! request's call graph reaches that same connection through
//! [`ConnectionBroker::extract_connection`] and the request's
//! [`RequestContext`].
//!
//! ```rust
//! use std::collections::HashMap;
//! use apartment_core::{ConnectionBroker, MemoryPool, RequestContext, Statement};
//!
//! # tokio_test_block(async {
//! let broker = ConnectionBroker::new(MemoryPool::new(4));
//! let broker = &broker;
//! let headers = HashMap::from([("tenant-id".to_string(), "acme".to_string())]);
//!
//! let rows = broker
//!     .bind_and_run(&RequestContext::background(), &headers, |ctx| async move {
//!         let conn = broker.extract_connection(&ctx)?;
//!         conn.query(&Statement::new("SELECT DATABASE()")).await
//!     })
//!     .await
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(rows[0].get("DATABASE()").and_then(|v| v.as_str()), Some("acme"));
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f);
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod conn;
pub mod context;
pub mod errors;
pub mod schema;
pub mod tenant;
pub mod token;

#[cfg(feature = "memory")]
pub mod memory;

pub use broker::{BoundConnection, ConnectionBroker};
pub use config::{ApartmentConfig, ApartmentConfigSnapshot, BrokerConfig};
pub use conn::{Connection, ExecOutcome, Pool, Prepared, Row, Statement, Transaction, Value};
pub use context::{RequestContext, RequestScope};
pub use errors::{BrokerError, BrokerResult};
pub use schema::SchemaSwitch;
pub use tenant::{
    HeaderTenantResolver, RequestMetadata, Tenant, TenantPolicy, TenantRejection,
    TenantResolver,
};
pub use token::RequestToken;

#[cfg(feature = "memory")]
pub use memory::{ExecutedStatement, MemoryConnection, MemoryPool, PoolStats};
