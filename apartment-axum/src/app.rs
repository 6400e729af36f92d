use std::future::IntoFuture;
use std::sync::Arc;

use apartment_core::{ConnectionBroker, Pool};
use axum::routing::MethodRouter;
use axum::{middleware, Router};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::middleware::bind_tenant;
use crate::ServerConfig;

pub type BrokerState<P> = Arc<ConnectionBroker<P>>;

/// Router builder around one shared broker.
///
/// Routes added with [`ApartmentApp::tenant_route`] run behind
/// [`bind_tenant`]; routes added with [`ApartmentApp::route`] do not (health
/// checks and the like).
pub struct ApartmentApp<P: Pool> {
    pub broker: BrokerState<P>,
    tenant_routes: Option<Router<BrokerState<P>>>,
    public_routes: Router<BrokerState<P>>,
}

impl<P: Pool> ApartmentApp<P> {
    pub fn new(broker: ConnectionBroker<P>) -> Self {
        Self::from_shared(Arc::new(broker))
    }

    pub fn from_shared(broker: BrokerState<P>) -> Self {
        Self {
            broker,
            tenant_routes: None,
            public_routes: Router::new(),
        }
    }

    pub fn tenant_route(mut self, path: &str, route: MethodRouter<BrokerState<P>>) -> Self {
        let routes = self.tenant_routes.take().unwrap_or_default();
        self.tenant_routes = Some(routes.route(path, route));
        self
    }

    pub fn route(mut self, path: &str, route: MethodRouter<BrokerState<P>>) -> Self {
        self.public_routes = self.public_routes.route(path, route);
        self
    }

    /// The finished router: tenant binding on tenant routes, tracing and
    /// `x-request-id` on everything.
    pub fn into_router(self) -> Router {
        let mut routes = self.public_routes;
        // `route_layer` refuses a router without routes.
        if let Some(tenant_routes) = self.tenant_routes {
            routes = routes.merge(tenant_routes.route_layer(middleware::from_fn_with_state(
                Arc::clone(&self.broker),
                bind_tenant::<P>,
            )));
        }
        routes
            .with_state(self.broker)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id()),
            )
    }

    pub async fn listen(self, config: &ServerConfig) -> anyhow::Result<()> {
        serve(self.into_router(), config).await
    }
}

/// Serve `router` until SIGINT/SIGTERM, then give in-flight requests
/// `config.shutdown_grace` to finish.
pub async fn serve(router: Router, config: &ServerConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.addr()).await?;
    info!(addr = %listener.local_addr()?, "listening");

    let draining = Arc::new(Notify::new());
    let server = axum::serve(listener, router)
        .with_graceful_shutdown({
            let draining = Arc::clone(&draining);
            async move {
                shutdown_signal().await;
                info!("shutdown signal received; draining requests");
                draining.notify_one();
            }
        })
        .into_future();

    let grace = async {
        draining.notified().await;
        tokio::time::sleep(config.shutdown_grace).await;
    };

    tokio::select! {
        served = server => served?,
        _ = grace => warn!(grace = ?config.shutdown_grace, "grace period elapsed; abandoning in-flight requests"),
    }
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
