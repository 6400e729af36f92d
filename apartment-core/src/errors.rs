use thiserror::Error;

use crate::tenant::{Tenant, TenantRejection};
use crate::token::RequestToken;

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Conditions the broker reports to its caller.
///
/// None of them is retried by the broker. Transports decide how each one is
/// presented (see [`BrokerError::is_client_fault`]).
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The request carried no tenant.
    #[error("no tenant found")]
    TenantMissing,

    /// The request named a tenant that failed validation.
    #[error("tenant {tenant} rejected: {reason}")]
    TenantRejected {
        tenant: Tenant,
        reason: TenantRejection,
    },

    /// The pool could not lend a connection (exhausted, connect error or
    /// the request deadline passed while waiting).
    #[error("failed to open new connection for tenant {tenant}")]
    ConnectionAcquisitionFailed {
        tenant: Tenant,
        #[source]
        source: anyhow::Error,
    },

    /// The schema switch failed or did not finish in time.
    #[error("failed to change the tenant to {tenant}")]
    TenantSwitchFailed {
        tenant: Tenant,
        #[source]
        source: anyhow::Error,
    },

    /// The context was never routed through the broker.
    #[error("no request bound for the context")]
    NoRequestBound,

    /// The context's request has no live connection (not bound yet, or
    /// already released).
    #[error("no connection bound for request {0}")]
    NoConnectionBound(RequestToken),
}

impl BrokerError {
    /// Client-input faults; everything else is a server fault.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            BrokerError::TenantMissing | BrokerError::TenantRejected { .. }
        )
    }

    /// Registry consistency faults: the lookup ran outside a bound request.
    pub fn is_unbound(&self) -> bool {
        matches!(
            self,
            BrokerError::NoRequestBound | BrokerError::NoConnectionBound(_)
        )
    }

    /// The tenant the failed request was for, when one was resolved.
    pub fn tenant(&self) -> Option<&Tenant> {
        match self {
            BrokerError::TenantRejected { tenant, .. }
            | BrokerError::ConnectionAcquisitionFailed { tenant, .. }
            | BrokerError::TenantSwitchFailed { tenant, .. } => Some(tenant),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn classifies_faults() {
        assert!(BrokerError::TenantMissing.is_client_fault());
        assert!(BrokerError::NoRequestBound.is_unbound());
        assert!(!BrokerError::NoRequestBound.is_client_fault());

        let err = BrokerError::TenantSwitchFailed {
            tenant: Tenant::new("acme").unwrap(),
            source: anyhow::anyhow!("Unknown database 'acme'"),
        };
        assert!(!err.is_client_fault());
        assert_eq!(err.tenant().map(Tenant::as_str), Some("acme"));
        assert_eq!(err.to_string(), "failed to change the tenant to acme");
        assert_eq!(err.source().unwrap().to_string(), "Unknown database 'acme'");
    }
}
