use std::convert::Infallible;
use std::ops::Deref;
use std::sync::Arc;

use apartment_core::{BoundConnection, ConnectionBroker, Pool, RequestContext};
use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;

use crate::ApartmentAxumError;

fn context_of(parts: &Parts) -> RequestContext {
    parts
        .extensions
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_default()
}

/// The request's [`RequestContext`]; a background context when the tenant
/// middleware did not run for this route.
#[derive(Debug, Clone)]
pub struct Scope(pub RequestContext);

impl<S> FromRequestParts<S> for Scope
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Scope(context_of(parts)))
    }
}

/// The connection bound to the current request.
///
/// Rejects with a `GeneralError` response when the route is not behind the
/// tenant middleware.
pub struct Tenanted<P: Pool> {
    pub ctx: RequestContext,
    pub conn: BoundConnection<P::Conn>,
}

impl<P, S> FromRequestParts<S> for Tenanted<P>
where
    P: Pool,
    Arc<ConnectionBroker<P>>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApartmentAxumError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let broker = Arc::<ConnectionBroker<P>>::from_ref(state);
        let ctx = context_of(parts);
        let conn = broker.extract_connection(&ctx)?;
        Ok(Self { ctx, conn })
    }
}

impl<P: Pool> Deref for Tenanted<P> {
    type Target = BoundConnection<P::Conn>;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}
