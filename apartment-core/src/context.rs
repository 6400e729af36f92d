//! Explicit, execution-scoped request state.
//!
//! A [`RequestContext`] is passed by reference through every call that needs
//! the request's connection. It is immutable; binding a connection produces a
//! derived context rather than mutating the caller's.

use std::time::Duration;

use tokio::time::Instant;

use crate::tenant::Tenant;
use crate::token::RequestToken;

/// The part of a context that exists only while a connection is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestScope {
    pub token: RequestToken,
    pub tenant: Tenant,
}

/// Value carrier for one request's call graph.
///
/// Cancellation follows the usual async Rust rule: dropping the future that
/// holds the context cancels the work. The optional deadline bounds the
/// broker's waits on the pool and on the schema switch.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    scope: Option<RequestScope>,
}

impl RequestContext {
    /// A context that was never routed through the broker.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn scope(&self) -> Option<&RequestScope> {
        self.scope.as_ref()
    }

    pub fn request_token(&self) -> Option<RequestToken> {
        self.scope.as_ref().map(|s| s.token)
    }

    pub fn tenant(&self) -> Option<&Tenant> {
        self.scope.as_ref().map(|s| &s.tenant)
    }

    pub(crate) fn bound(&self, scope: RequestScope) -> Self {
        Self {
            deadline: self.deadline,
            scope: Some(scope),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_has_no_scope() {
        let ctx = RequestContext::background();
        assert!(ctx.scope().is_none());
        assert!(ctx.request_token().is_none());
        assert!(ctx.deadline().is_none());
    }

    #[tokio::test]
    async fn deadlines_only_tighten() {
        let ctx = RequestContext::background().with_timeout(Duration::from_secs(10));
        let first = ctx.deadline().unwrap();
        let ctx = ctx.with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.deadline(), Some(first));
        let ctx = ctx.with_timeout(Duration::from_secs(1));
        assert!(ctx.deadline().unwrap() < first);
    }

    #[test]
    fn bound_context_keeps_deadline() {
        let deadline = Instant::now() + Duration::from_secs(5);
        let ctx = RequestContext::background().with_deadline(deadline);
        let scope = RequestScope {
            token: RequestToken::new(),
            tenant: Tenant::new("acme").unwrap(),
        };
        let bound = ctx.bound(scope.clone());
        assert_eq!(bound.deadline(), Some(deadline));
        assert_eq!(bound.tenant().map(Tenant::as_str), Some("acme"));
        assert_eq!(bound.request_token(), Some(scope.token));
        assert!(ctx.scope().is_none());
    }
}
