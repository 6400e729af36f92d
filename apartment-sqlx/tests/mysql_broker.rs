//! Runs against a live MySQL server when `APARTMENT_TEST_MYSQL_DSN` is set;
//! otherwise every test returns early.

use std::collections::HashMap;

use apartment_core::{BrokerError, ConnectionBroker, RequestContext, Statement, Value};
use apartment_sqlx::{connect, SqlxOptions, SqlxPool};

async fn broker() -> Option<ConnectionBroker<SqlxPool>> {
    let dsn = std::env::var("APARTMENT_TEST_MYSQL_DSN").ok()?;
    let options = SqlxOptions {
        max_connections: 2,
        ..SqlxOptions::default()
    };
    let pool = connect(&dsn, &options).await.unwrap();
    Some(ConnectionBroker::new(pool))
}

fn headers(tenant: &str) -> HashMap<String, String> {
    HashMap::from([("tenant-id".to_string(), tenant.to_string())])
}

#[tokio::test]
async fn switches_to_tenant_schema() {
    let Some(broker) = broker().await else {
        return;
    };
    let broker = &broker;

    let current = broker
        .bind_and_run(
            &RequestContext::background(),
            &headers("information_schema"),
            |ctx| async move {
                let conn = broker.extract_connection(&ctx)?;
                let rows = conn
                    .query(&Statement::new("SELECT DATABASE(), ?").bind("echo"))
                    .await?;
                anyhow::Ok(rows[0].values.clone())
            },
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(current[0], Value::Text("information_schema".to_string()));
    assert_eq!(current[1], Value::Text("echo".to_string()));
    assert_eq!(broker.bound_count(), 0);
}

#[tokio::test]
async fn unknown_schema_fails_the_switch() {
    let Some(broker) = broker().await else {
        return;
    };

    let result = broker
        .bind_and_run(
            &RequestContext::background(),
            &headers("apartment_no_such_schema"),
            |_| async {},
        )
        .await;

    assert!(matches!(result, Err(BrokerError::TenantSwitchFailed { .. })));
    broker.pool().inner().acquire().await.unwrap();
}
