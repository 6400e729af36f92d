use std::sync::Arc;

use apartment_core::{ConnectionBroker, Pool, RequestContext, RequestMetadata};
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::ApartmentAxumError;

/// Request headers seen as tenant-resolution metadata.
pub struct HeaderMetadata<'a>(pub &'a HeaderMap);

impl RequestMetadata for HeaderMetadata<'_> {
    fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Binds a tenant connection around the rest of the stack.
///
/// Use with [`axum::middleware::from_fn_with_state`]. The derived
/// [`RequestContext`] is stored in the request extensions, where the
/// [`Scope`](crate::Scope) and [`Tenanted`](crate::Tenanted) extractors find
/// it. A context already present in the extensions (for example one carrying
/// a deadline) is used as the parent.
pub async fn bind_tenant<P: Pool>(
    State(broker): State<Arc<ConnectionBroker<P>>>,
    req: Request,
    next: Next,
) -> Response {
    let tenant = match broker.resolve_tenant(&HeaderMetadata(req.headers())) {
        Ok(tenant) => tenant,
        Err(err) => return ApartmentAxumError::from(err).into_response(),
    };
    let parent = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_default();

    let result = broker
        .run_for_tenant(&parent, tenant, |ctx| async move {
            let mut req = req;
            req.extensions_mut().insert(ctx);
            next.run(req).await
        })
        .await;

    match result {
        Ok(res) => res,
        Err(err) => ApartmentAxumError::from(err).into_response(),
    }
}
